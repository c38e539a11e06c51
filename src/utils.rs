use rand::Rng;

/// Compute CRC16 (XMODEM) hash over the provided bytes.
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Extract the hashable portion of a key.
///
/// If the key contains `{X}` with non-empty `X`, only `X` takes part in
/// slot hashing, so that related keys can be pinned to the same slot.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(begin) = key.iter().position(|&b| b == b'{') {
        if let Some(offset) = key[begin + 1..].iter().position(|&b| b == b'}') {
            if offset > 0 {
                let start = begin + 1;
                return &key[start..start + offset];
            }
        }
    }
    key
}

/// Map a key to its cluster slot.
pub fn key_hash_slot(key: &[u8], slot_count: u16) -> u16 {
    crc16(hash_tag(key)) % slot_count
}

/// Generate a lowercase hex run id, used for the persisted proxy id.
pub fn random_hex_id(len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}
