use anyhow::{bail, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::types::RespValue;
use super::MAX_REPLY_DEPTH;

/// Incremental RESP parser and encoder.
///
/// The decoder consumes nothing until a complete frame is available, so a
/// frame split across reads is resumed on the next call. Inline commands
/// (a bare line of whitespace-separated words) are accepted and surfaced
/// as an array frame, the same shape multibulk requests take.
#[derive(Debug, Default, Clone)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }
            if !matches!(src[0], b'+' | b'-' | b':' | b'$' | b'*') {
                match decode_inline(src)? {
                    InlineLine::NeedMore => return Ok(None),
                    InlineLine::Blank => continue,
                    InlineLine::Frame(frame) => return Ok(Some(frame)),
                }
            }
            let mut pos = 0usize;
            return match parse_value(&src[..], &mut pos, 0)? {
                Some(frame) => {
                    src.advance(pos);
                    Ok(Some(frame))
                }
                None => Ok(None),
            };
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<()> {
        write_value(&item, dst);
        Ok(())
    }
}

enum InlineLine {
    NeedMore,
    Blank,
    Frame(RespValue),
}

fn decode_inline(src: &mut BytesMut) -> Result<InlineLine> {
    let lf = match src.iter().position(|&b| b == b'\n') {
        Some(pos) => pos,
        None => return Ok(InlineLine::NeedMore),
    };
    let line = src.split_to(lf + 1);
    let mut body = &line[..lf];
    if body.last() == Some(&b'\r') {
        body = &body[..body.len() - 1];
    }
    let parts: Vec<RespValue> = body
        .split(|b| b.is_ascii_whitespace())
        .filter(|field| !field.is_empty())
        .map(|field| RespValue::BulkString(Bytes::copy_from_slice(field)))
        .collect();
    if parts.is_empty() {
        return Ok(InlineLine::Blank);
    }
    Ok(InlineLine::Frame(RespValue::Array(parts)))
}

fn parse_value(src: &[u8], pos: &mut usize, depth: usize) -> Result<Option<RespValue>> {
    if depth > MAX_REPLY_DEPTH {
        bail!("reply nesting exceeds maximum depth {}", MAX_REPLY_DEPTH);
    }
    if *pos >= src.len() {
        return Ok(None);
    }
    let start = *pos;
    let prefix = src[*pos];
    *pos += 1;

    match prefix {
        b'+' => match read_line(src, pos) {
            Some(line) => Ok(Some(RespValue::SimpleString(Bytes::copy_from_slice(line)))),
            None => {
                *pos = start;
                Ok(None)
            }
        },
        b'-' => match read_line(src, pos) {
            Some(line) => Ok(Some(RespValue::Error(Bytes::copy_from_slice(line)))),
            None => {
                *pos = start;
                Ok(None)
            }
        },
        b':' => {
            let line = match read_line(src, pos) {
                Some(line) => line,
                None => {
                    *pos = start;
                    return Ok(None);
                }
            };
            match btoi::btoi::<i64>(line) {
                Ok(value) => Ok(Some(RespValue::Integer(value))),
                Err(_) => bail!("invalid integer frame"),
            }
        }
        b'$' => parse_bulk_string(src, pos, start),
        b'*' => parse_array(src, pos, start, depth),
        _ => bail!("unsupported RESP prefix '{}'", prefix as char),
    }
}

fn parse_bulk_string(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<RespValue>> {
    let line = match read_line(src, pos) {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "bulk string")?;
    if len == -1 {
        return Ok(Some(RespValue::NullBulk));
    }
    if len < 0 {
        bail!("invalid bulk string length {len}");
    }
    let len = len as usize;
    if *pos + len + 2 > src.len() {
        *pos = start;
        return Ok(None);
    }
    if &src[*pos + len..*pos + len + 2] != b"\r\n" {
        bail!("bulk string payload is not CRLF terminated");
    }
    let data = Bytes::copy_from_slice(&src[*pos..*pos + len]);
    *pos += len + 2;
    Ok(Some(RespValue::BulkString(data)))
}

fn parse_array(src: &[u8], pos: &mut usize, start: usize, depth: usize) -> Result<Option<RespValue>> {
    let line = match read_line(src, pos) {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "array")?;
    if len == -1 {
        return Ok(Some(RespValue::NullArray));
    }
    if len < 0 {
        bail!("invalid array length {len}");
    }
    let mut values = Vec::with_capacity(len as usize);
    for _ in 0..len {
        match parse_value(src, pos, depth + 1)? {
            Some(value) => values.push(value),
            None => {
                *pos = start;
                return Ok(None);
            }
        }
    }
    Ok(Some(RespValue::Array(values)))
}

fn parse_length(line: &[u8], kind: &str) -> Result<isize> {
    match btoi::btoi::<isize>(line) {
        Ok(len) => Ok(len),
        Err(_) => bail!("invalid {kind} length"),
    }
}

fn read_line<'a>(src: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let mut idx = *pos;
    while idx + 1 < src.len() {
        if src[idx] == b'\r' && src[idx + 1] == b'\n' {
            let line = &src[*pos..idx];
            *pos = idx + 2;
            return Some(line);
        }
        idx += 1;
    }
    None
}

fn write_value(value: &RespValue, dst: &mut BytesMut) {
    match value {
        RespValue::SimpleString(data) => {
            dst.extend_from_slice(b"+");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::Error(data) => {
            dst.extend_from_slice(b"-");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(value) => {
            dst.extend_from_slice(b":");
            dst.extend_from_slice(value.to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::BulkString(data) => {
            dst.extend_from_slice(b"$");
            dst.extend_from_slice(data.len().to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::NullBulk => dst.extend_from_slice(b"$-1\r\n"),
        RespValue::Array(values) => {
            dst.extend_from_slice(b"*");
            dst.extend_from_slice(values.len().to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
            for value in values {
                write_value(value, dst);
            }
        }
        RespValue::NullArray => dst.extend_from_slice(b"*-1\r\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Result<Vec<RespValue>> {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    #[test]
    fn parses_multibulk_request() {
        let frames = decode_all(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n").unwrap();
        assert_eq!(
            frames,
            vec![RespValue::Array(vec![
                RespValue::bulk("GET"),
                RespValue::bulk("foo"),
            ])]
        );
    }

    #[test]
    fn parses_nested_and_nil_elements() {
        let frames = decode_all(b"*3\r\n$2\r\nok\r\n$-1\r\n*1\r\n:7\r\n").unwrap();
        assert_eq!(
            frames,
            vec![RespValue::Array(vec![
                RespValue::bulk("ok"),
                RespValue::NullBulk,
                RespValue::Array(vec![RespValue::Integer(7)]),
            ])]
        );
    }

    #[test]
    fn incomplete_frame_consumes_nothing() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nfo"[..]);
        let before = buf.len();
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), before);

        buf.extend_from_slice(b"o\r\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            RespValue::Array(vec![RespValue::bulk("GET"), RespValue::bulk("foo")])
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn parses_inline_command() {
        let frames = decode_all(b"PING\r\nECHO hi\n").unwrap();
        assert_eq!(
            frames,
            vec![
                RespValue::Array(vec![RespValue::bulk("PING")]),
                RespValue::Array(vec![RespValue::bulk("ECHO"), RespValue::bulk("hi")]),
            ]
        );
    }

    #[test]
    fn blank_inline_line_is_skipped() {
        let frames = decode_all(b"\r\n+OK\r\n").unwrap();
        assert_eq!(frames, vec![RespValue::ok()]);
    }

    #[test]
    fn rejects_negative_multibulk_length() {
        assert!(decode_all(b"*-10\r\n").is_err());
    }

    #[test]
    fn rejects_non_numeric_bulk_length() {
        assert!(decode_all(b"$blabla\r\n").is_err());
    }

    #[test]
    fn rejects_unterminated_bulk_payload() {
        assert!(decode_all(b"$3\r\nfooz\r\n").is_err());
    }

    #[test]
    fn rejects_excessive_nesting() {
        let mut input = Vec::new();
        for _ in 0..(MAX_REPLY_DEPTH + 2) {
            input.extend_from_slice(b"*1\r\n");
        }
        input.extend_from_slice(b":1\r\n");
        assert!(decode_all(&input).is_err());
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let samples = vec![
            RespValue::ok(),
            RespValue::error("MOVED 15495 127.0.0.1:7002"),
            RespValue::Integer(-42),
            RespValue::bulk("payload"),
            RespValue::NullBulk,
            RespValue::NullArray,
            RespValue::Array(vec![
                RespValue::bulk("VA"),
                RespValue::NullBulk,
                RespValue::Array(vec![RespValue::Integer(0)]),
            ]),
        ];
        let mut codec = RespCodec;
        for sample in samples {
            let mut buf = BytesMut::new();
            codec.encode(sample.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, sample);
            assert!(buf.is_empty());
        }
    }
}
