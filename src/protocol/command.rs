use std::fmt;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use hashbrown::HashMap;
use once_cell::sync::Lazy;

use super::types::RespValue;

/// One client command, decoded into its argument vector.
#[derive(Clone)]
pub struct RedisCommand {
    parts: Vec<Bytes>,
}

impl RedisCommand {
    pub fn new(parts: Vec<Bytes>) -> Result<Self> {
        if parts.is_empty() {
            bail!("command must contain at least one argument");
        }
        Ok(Self { parts })
    }

    pub fn from_resp(value: RespValue) -> Result<Self> {
        match value {
            RespValue::Array(values) => {
                let mut parts = Vec::with_capacity(values.len());
                for value in values {
                    match value {
                        RespValue::BulkString(data) | RespValue::SimpleString(data) => {
                            parts.push(data)
                        }
                        RespValue::Integer(int) => {
                            parts.push(Bytes::from(int.to_string().into_bytes()))
                        }
                        other => bail!("invalid command argument frame {:?}", other),
                    }
                }
                Self::new(parts)
            }
            other => Err(anyhow!("command must be an array frame, got {:?}", other)),
        }
    }

    pub fn to_resp(&self) -> RespValue {
        RespValue::Array(
            self.parts
                .iter()
                .cloned()
                .map(RespValue::BulkString)
                .collect(),
        )
    }

    pub fn name(&self) -> &[u8] {
        self.parts.first().map(|b| b.as_ref()).unwrap_or(&[])
    }

    pub fn args(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn arg_count(&self) -> usize {
        self.parts.len()
    }
}

impl fmt::Debug for RedisCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self
            .parts
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();
        f.debug_tuple("RedisCommand").field(&args.join(" ")).finish()
    }
}

/// How a command's reply is synthesized from its fan-out children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalesce {
    /// DEL / EXISTS: sum the integer replies.
    IntegerSum,
    /// MSET: every child must answer +OK.
    StatusAll,
    /// MGET: concatenate the first element of every child array.
    ArrayGather,
}

impl Coalesce {
    pub fn combine(self, children: Vec<RespValue>) -> RespValue {
        match self {
            Coalesce::IntegerSum => {
                let mut sum = 0i64;
                for reply in children {
                    match reply {
                        RespValue::Integer(value) => sum += value,
                        RespValue::Error(_) => return reply,
                        _ => return unexpected_reply_type(),
                    }
                }
                RespValue::Integer(sum)
            }
            Coalesce::StatusAll => {
                for reply in children {
                    match reply {
                        RespValue::SimpleString(ref status) => {
                            if !status.eq_ignore_ascii_case(b"OK") {
                                return reply;
                            }
                        }
                        RespValue::Error(_) => return reply,
                        _ => return unexpected_reply_type(),
                    }
                }
                RespValue::ok()
            }
            Coalesce::ArrayGather => {
                for reply in &children {
                    match reply {
                        RespValue::Array(elements) if !elements.is_empty() => {}
                        RespValue::Error(_) => return reply.clone(),
                        _ => return unexpected_reply_type(),
                    }
                }
                let gathered = children
                    .into_iter()
                    .map(|reply| match reply {
                        RespValue::Array(mut elements) => elements.swap_remove(0),
                        _ => unreachable!("validated above"),
                    })
                    .collect();
                RespValue::Array(gathered)
            }
        }
    }
}

fn unexpected_reply_type() -> RespValue {
    RespValue::error("ERR unexpected reply type from backend")
}

/// Where a command's keys live inside the argument vector.
#[derive(Debug, Clone, Copy)]
pub enum KeySpec {
    /// No key at all.
    None,
    /// Keys at fixed positions: `first`, then every `step` arguments up to
    /// `last` (`-1` meaning the final argument).
    Positional { first: usize, last: i32, step: usize },
    /// EVAL-style: a numkeys count lives at `at`, keys follow it.
    Numkeys { at: usize },
}

#[derive(Debug, Clone, Copy)]
pub enum CommandHandler {
    /// Route by first key to the owning shard.
    Forward,
    /// Split one child per key and merge replies.
    Fanout(Coalesce),
    /// Answered by the proxy itself, no backend involved.
    Local(LocalCommand),
    /// Refused with a "not supported" error.
    NotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalCommand {
    Ping,
    Echo,
    Select,
    Auth,
    Time,
    ReadOnly,
    ReadWrite,
    Wait,
    Command,
    Shutdown,
    Slowlog,
    Debug,
    Config,
    Client,
    Latency,
    Monitor,
    Proxy,
    Info,
}

pub struct CommandDescriptor {
    pub name: &'static str,
    /// Positive means exact argument count, negative means a minimum.
    pub arity: i32,
    pub keys: KeySpec,
    pub handler: CommandHandler,
}

impl CommandDescriptor {
    pub fn check_arity(&self, argc: usize) -> bool {
        if self.arity >= 0 {
            argc == self.arity as usize
        } else {
            argc >= (-self.arity) as usize
        }
    }

    /// The key a single-shard command routes by.
    pub fn first_key<'a>(&self, command: &'a RedisCommand) -> Result<&'a Bytes> {
        match self.keys {
            KeySpec::None => bail!("no key specified for '{}'", self.name),
            KeySpec::Positional { first, .. } => command
                .args()
                .get(first)
                .ok_or_else(|| anyhow!("no key specified for '{}'", self.name)),
            KeySpec::Numkeys { at } => {
                let count = command
                    .args()
                    .get(at)
                    .and_then(|raw| btoi::btoi::<i64>(raw).ok())
                    .ok_or_else(|| anyhow!("invalid numkeys for '{}'", self.name))?;
                if count < 1 {
                    bail!("'{}' with no keys cannot be routed", self.name);
                }
                command
                    .args()
                    .get(at + 1)
                    .ok_or_else(|| anyhow!("no key specified for '{}'", self.name))
            }
        }
    }

    /// Expand a multi-key command into its per-key children, in key order.
    ///
    /// Every child keeps the parent's command name with a single key (plus
    /// the key's trailing arguments when the key step is larger than one),
    /// so `MGET a b` becomes `MGET a` and `MGET b`.
    pub fn fanout_children(&self, command: &RedisCommand) -> Result<Vec<RedisCommand>> {
        let (first, step) = match self.keys {
            KeySpec::Positional { first, last: -1, step } => (first, step),
            _ => bail!("'{}' is not a fan-out command", self.name),
        };
        let argc = command.arg_count();
        if argc <= first || (argc - first) % step != 0 {
            bail!("wrong number of arguments for '{}' command", self.name);
        }
        let name = command.args()[0].clone();
        let mut children = Vec::with_capacity((argc - first) / step);
        let mut idx = first;
        while idx < argc {
            let mut parts = Vec::with_capacity(1 + step);
            parts.push(name.clone());
            parts.extend(command.args()[idx..idx + step].iter().cloned());
            children.push(RedisCommand::new(parts)?);
            idx += step;
        }
        Ok(children)
    }
}

const KEY1: KeySpec = KeySpec::Positional { first: 1, last: 1, step: 1 };
const KEY2: KeySpec = KeySpec::Positional { first: 2, last: 2, step: 1 };
const MULTI1: KeySpec = KeySpec::Positional { first: 1, last: -1, step: 1 };
const MULTI2: KeySpec = KeySpec::Positional { first: 1, last: -1, step: 2 };
const NUMKEYS2: KeySpec = KeySpec::Numkeys { at: 2 };
const NOKEY: KeySpec = KeySpec::None;

macro_rules! cmd {
    ($name:literal, $arity:literal, $keys:expr, $handler:expr) => {
        CommandDescriptor {
            name: $name,
            arity: $arity,
            keys: $keys,
            handler: $handler,
        }
    };
}

use CommandHandler::{Fanout, Forward, Local, NotSupported};

/// The whole command surface: forwarded, fan-out, local, and refused.
pub static COMMAND_TABLE: &[CommandDescriptor] = &[
    // strings / bitmaps
    cmd!("get", 2, KEY1, Forward),
    cmd!("set", -3, KEY1, Forward),
    cmd!("setnx", 3, KEY1, Forward),
    cmd!("setex", 4, KEY1, Forward),
    cmd!("psetex", 4, KEY1, Forward),
    cmd!("append", 3, KEY1, Forward),
    cmd!("strlen", 2, KEY1, Forward),
    cmd!("setbit", 4, KEY1, Forward),
    cmd!("getbit", 3, KEY1, Forward),
    cmd!("bitfield", -2, KEY1, Forward),
    cmd!("setrange", 4, KEY1, Forward),
    cmd!("getrange", 4, KEY1, Forward),
    cmd!("substr", 4, KEY1, Forward),
    cmd!("incr", 2, KEY1, Forward),
    cmd!("decr", 2, KEY1, Forward),
    cmd!("incrby", 3, KEY1, Forward),
    cmd!("decrby", 3, KEY1, Forward),
    cmd!("incrbyfloat", 3, KEY1, Forward),
    cmd!("getset", 3, KEY1, Forward),
    cmd!("bitcount", -2, KEY1, Forward),
    cmd!("bitpos", -3, KEY1, Forward),
    // lists
    cmd!("rpush", -3, KEY1, Forward),
    cmd!("lpush", -3, KEY1, Forward),
    cmd!("rpushx", 3, KEY1, Forward),
    cmd!("lpushx", 3, KEY1, Forward),
    cmd!("linsert", 5, KEY1, Forward),
    cmd!("rpop", 2, KEY1, Forward),
    cmd!("lpop", 2, KEY1, Forward),
    cmd!("llen", 2, KEY1, Forward),
    cmd!("lindex", 3, KEY1, Forward),
    cmd!("lset", 4, KEY1, Forward),
    cmd!("lrange", 4, KEY1, Forward),
    cmd!("ltrim", 4, KEY1, Forward),
    cmd!("lrem", 4, KEY1, Forward),
    cmd!("rpoplpush", 3, KEY1, Forward),
    // sets
    cmd!("sadd", -3, KEY1, Forward),
    cmd!("srem", -3, KEY1, Forward),
    cmd!("smove", 4, KEY1, Forward),
    cmd!("sismember", 3, KEY1, Forward),
    cmd!("scard", 2, KEY1, Forward),
    cmd!("spop", -2, KEY1, Forward),
    cmd!("srandmember", -2, KEY1, Forward),
    cmd!("sinter", -2, KEY1, Forward),
    cmd!("sinterstore", -3, KEY1, Forward),
    cmd!("sunion", -2, KEY1, Forward),
    cmd!("sunionstore", -3, KEY1, Forward),
    cmd!("sdiff", -2, KEY1, Forward),
    cmd!("sdiffstore", -3, KEY1, Forward),
    cmd!("smembers", 2, KEY1, Forward),
    cmd!("sscan", -3, KEY1, Forward),
    // sorted sets
    cmd!("zadd", -4, KEY1, Forward),
    cmd!("zincrby", 4, KEY1, Forward),
    cmd!("zrem", -3, KEY1, Forward),
    cmd!("zremrangebyscore", 4, KEY1, Forward),
    cmd!("zremrangebyrank", 4, KEY1, Forward),
    cmd!("zremrangebylex", 4, KEY1, Forward),
    cmd!("zunionstore", -4, NUMKEYS2, Forward),
    cmd!("zinterstore", -4, NUMKEYS2, Forward),
    cmd!("zrange", -4, KEY1, Forward),
    cmd!("zrangebyscore", -4, KEY1, Forward),
    cmd!("zrevrangebyscore", -4, KEY1, Forward),
    cmd!("zrangebylex", -4, KEY1, Forward),
    cmd!("zrevrangebylex", -4, KEY1, Forward),
    cmd!("zcount", 4, KEY1, Forward),
    cmd!("zlexcount", 4, KEY1, Forward),
    cmd!("zrevrange", -4, KEY1, Forward),
    cmd!("zcard", 2, KEY1, Forward),
    cmd!("zscore", 3, KEY1, Forward),
    cmd!("zrank", 3, KEY1, Forward),
    cmd!("zrevrank", 3, KEY1, Forward),
    cmd!("zscan", -3, KEY1, Forward),
    // hashes
    cmd!("hset", 4, KEY1, Forward),
    cmd!("hsetnx", 4, KEY1, Forward),
    cmd!("hget", 3, KEY1, Forward),
    cmd!("hmset", -4, KEY1, Forward),
    cmd!("hmget", -3, KEY1, Forward),
    cmd!("hincrby", 4, KEY1, Forward),
    cmd!("hincrbyfloat", 4, KEY1, Forward),
    cmd!("hdel", -3, KEY1, Forward),
    cmd!("hlen", 2, KEY1, Forward),
    cmd!("hstrlen", 3, KEY1, Forward),
    cmd!("hkeys", 2, KEY1, Forward),
    cmd!("hvals", 2, KEY1, Forward),
    cmd!("hgetall", 2, KEY1, Forward),
    cmd!("hexists", 3, KEY1, Forward),
    cmd!("hscan", -3, KEY1, Forward),
    // keyspace
    cmd!("expire", 3, KEY1, Forward),
    cmd!("expireat", 3, KEY1, Forward),
    cmd!("pexpire", 3, KEY1, Forward),
    cmd!("pexpireat", 3, KEY1, Forward),
    cmd!("type", 2, KEY1, Forward),
    cmd!("sort", -2, KEY1, Forward),
    cmd!("ttl", 2, KEY1, Forward),
    cmd!("touch", -2, KEY1, Forward),
    cmd!("pttl", 2, KEY1, Forward),
    cmd!("persist", 2, KEY1, Forward),
    cmd!("dump", 2, KEY1, Forward),
    cmd!("object", 3, KEY2, Forward),
    // scripting
    cmd!("eval", -3, NUMKEYS2, Forward),
    cmd!("evalsha", -3, NUMKEYS2, Forward),
    // geo
    cmd!("geoadd", -5, KEY1, Forward),
    cmd!("georadius", -6, KEY1, Forward),
    cmd!("georadiusbymember", -5, KEY1, Forward),
    cmd!("geohash", -2, KEY1, Forward),
    cmd!("geopos", -2, KEY1, Forward),
    cmd!("geodist", -4, KEY1, Forward),
    // hyperloglog
    cmd!("pfadd", -2, KEY1, Forward),
    cmd!("pfcount", -2, KEY1, Forward),
    cmd!("pfmerge", -2, KEY1, Forward),
    // multi-key fan-out
    cmd!("del", -2, MULTI1, Fanout(Coalesce::IntegerSum)),
    cmd!("unlink", -2, MULTI1, Fanout(Coalesce::IntegerSum)),
    cmd!("exists", -2, MULTI1, Fanout(Coalesce::IntegerSum)),
    cmd!("mget", -2, MULTI1, Fanout(Coalesce::ArrayGather)),
    cmd!("mset", -3, MULTI2, Fanout(Coalesce::StatusAll)),
    // answered locally
    cmd!("select", 2, NOKEY, Local(LocalCommand::Select)),
    cmd!("ping", -1, NOKEY, Local(LocalCommand::Ping)),
    cmd!("echo", 2, NOKEY, Local(LocalCommand::Echo)),
    cmd!("auth", 2, NOKEY, Local(LocalCommand::Auth)),
    cmd!("readonly", 1, NOKEY, Local(LocalCommand::ReadOnly)),
    cmd!("readwrite", 1, NOKEY, Local(LocalCommand::ReadWrite)),
    cmd!("time", 1, NOKEY, Local(LocalCommand::Time)),
    cmd!("wait", 3, NOKEY, Local(LocalCommand::Wait)),
    cmd!("command", -1, NOKEY, Local(LocalCommand::Command)),
    cmd!("shutdown", -1, NOKEY, Local(LocalCommand::Shutdown)),
    cmd!("slowlog", -2, NOKEY, Local(LocalCommand::Slowlog)),
    cmd!("debug", -1, NOKEY, Local(LocalCommand::Debug)),
    cmd!("config", -2, NOKEY, Local(LocalCommand::Config)),
    cmd!("client", -2, NOKEY, Local(LocalCommand::Client)),
    cmd!("latency", -2, NOKEY, Local(LocalCommand::Latency)),
    cmd!("monitor", 1, NOKEY, Local(LocalCommand::Monitor)),
    cmd!("proxy", -2, NOKEY, Local(LocalCommand::Proxy)),
    cmd!("info", -1, NOKEY, Local(LocalCommand::Info)),
    // refused
    cmd!("keys", 2, NOKEY, NotSupported),
    cmd!("move", 3, NOKEY, NotSupported),
    cmd!("randomkey", 1, NOKEY, NotSupported),
    cmd!("scan", -2, NOKEY, NotSupported),
    cmd!("dbsize", 1, NOKEY, NotSupported),
    cmd!("rename", 3, NOKEY, NotSupported),
    cmd!("renamenx", 3, NOKEY, NotSupported),
    cmd!("bitop", -4, NOKEY, NotSupported),
    cmd!("msetnx", -3, NOKEY, NotSupported),
    cmd!("migrate", -6, NOKEY, NotSupported),
    cmd!("asking", 1, NOKEY, NotSupported),
    cmd!("restore", -4, NOKEY, NotSupported),
    cmd!("restore-asking", -4, NOKEY, NotSupported),
    cmd!("brpop", -3, NOKEY, NotSupported),
    cmd!("brpoplpush", 4, NOKEY, NotSupported),
    cmd!("blpop", -3, NOKEY, NotSupported),
    cmd!("subscribe", -2, NOKEY, NotSupported),
    cmd!("unsubscribe", -1, NOKEY, NotSupported),
    cmd!("psubscribe", -2, NOKEY, NotSupported),
    cmd!("punsubscribe", -1, NOKEY, NotSupported),
    cmd!("publish", 3, NOKEY, NotSupported),
    cmd!("pubsub", -2, NOKEY, NotSupported),
    cmd!("multi", 1, NOKEY, NotSupported),
    cmd!("exec", 1, NOKEY, NotSupported),
    cmd!("discard", 1, NOKEY, NotSupported),
    cmd!("watch", -2, NOKEY, NotSupported),
    cmd!("unwatch", 1, NOKEY, NotSupported),
    cmd!("script", -2, NOKEY, NotSupported),
    cmd!("save", 1, NOKEY, NotSupported),
    cmd!("bgsave", -1, NOKEY, NotSupported),
    cmd!("bgrewriteaof", 1, NOKEY, NotSupported),
    cmd!("flushdb", 1, NOKEY, NotSupported),
    cmd!("flushall", 1, NOKEY, NotSupported),
    cmd!("sync", 1, NOKEY, NotSupported),
    cmd!("psync", 3, NOKEY, NotSupported),
    cmd!("replconf", -1, NOKEY, NotSupported),
    cmd!("lastsave", 1, NOKEY, NotSupported),
    cmd!("slaveof", 3, NOKEY, NotSupported),
    cmd!("cluster", -2, NOKEY, NotSupported),
    cmd!("role", 1, NOKEY, NotSupported),
    cmd!("pfdebug", -3, NOKEY, NotSupported),
    cmd!("pfselftest", 1, NOKEY, NotSupported),
];

static COMMAND_INDEX: Lazy<HashMap<&'static str, &'static CommandDescriptor>> = Lazy::new(|| {
    let mut index = HashMap::with_capacity(COMMAND_TABLE.len());
    for descriptor in COMMAND_TABLE {
        index.insert(descriptor.name, descriptor);
    }
    index
});

/// Look a command up by name, case-insensitively.
pub fn lookup_command(name: &[u8]) -> Option<&'static CommandDescriptor> {
    if name.is_empty() || name.len() > 32 {
        return None;
    }
    let mut lower = [0u8; 32];
    for (i, byte) in name.iter().enumerate() {
        lower[i] = byte.to_ascii_lowercase();
    }
    let lowered = std::str::from_utf8(&lower[..name.len()]).ok()?;
    COMMAND_INDEX.get(lowered).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(parts: &[&str]) -> RedisCommand {
        RedisCommand::new(
            parts
                .iter()
                .map(|p| Bytes::copy_from_slice(p.as_bytes()))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert!(matches!(
            lookup_command(b"GeT").unwrap().handler,
            CommandHandler::Forward
        ));
        assert!(matches!(
            lookup_command(b"MGET").unwrap().handler,
            CommandHandler::Fanout(Coalesce::ArrayGather)
        ));
        assert!(lookup_command(b"nosuchcmd").is_none());
    }

    #[test]
    fn arity_rules() {
        let get = lookup_command(b"get").unwrap();
        assert!(get.check_arity(2));
        assert!(!get.check_arity(3));

        let set = lookup_command(b"set").unwrap();
        assert!(set.check_arity(3));
        assert!(set.check_arity(5));
        assert!(!set.check_arity(2));
    }

    #[test]
    fn first_key_positional() {
        let get = lookup_command(b"get").unwrap();
        let cmd = command(&["GET", "foo"]);
        assert_eq!(get.first_key(&cmd).unwrap().as_ref(), b"foo");

        let object = lookup_command(b"object").unwrap();
        let cmd = command(&["OBJECT", "ENCODING", "foo"]);
        assert_eq!(object.first_key(&cmd).unwrap().as_ref(), b"foo");
    }

    #[test]
    fn first_key_numkeys() {
        let eval = lookup_command(b"eval").unwrap();
        let cmd = command(&["EVAL", "return 1", "2", "k1", "k2"]);
        assert_eq!(eval.first_key(&cmd).unwrap().as_ref(), b"k1");

        let zero_keys = command(&["EVAL", "return 1", "0"]);
        assert!(eval.first_key(&zero_keys).is_err());
    }

    #[test]
    fn fanout_children_single_step() {
        let del = lookup_command(b"del").unwrap();
        let cmd = command(&["DEL", "k1", "k2", "k3"]);
        let children = del.fanout_children(&cmd).unwrap();
        assert_eq!(children.len(), 3);
        assert_eq!(children[0].args()[0].as_ref(), b"DEL");
        assert_eq!(children[1].args()[1].as_ref(), b"k2");
        assert_eq!(children[2].arg_count(), 2);
    }

    #[test]
    fn fanout_children_pairs() {
        let mset = lookup_command(b"mset").unwrap();
        let cmd = command(&["MSET", "a", "1", "b", "2"]);
        let children = mset.fanout_children(&cmd).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].args()[1].as_ref(), b"a");
        assert_eq!(children[0].args()[2].as_ref(), b"1");
        assert_eq!(children[1].args()[1].as_ref(), b"b");

        let odd = command(&["MSET", "a", "1", "b"]);
        assert!(mset.fanout_children(&odd).is_err());
    }

    #[test]
    fn coalesce_sum_and_error_shortcut() {
        let merged = Coalesce::IntegerSum.combine(vec![
            RespValue::Integer(1),
            RespValue::Integer(0),
            RespValue::Integer(1),
        ]);
        assert_eq!(merged, RespValue::Integer(2));

        let merged = Coalesce::IntegerSum.combine(vec![
            RespValue::Integer(1),
            RespValue::error("ERR something"),
            RespValue::Integer(1),
        ]);
        assert_eq!(merged, RespValue::error("ERR something"));

        let merged = Coalesce::IntegerSum.combine(vec![RespValue::ok()]);
        assert!(merged.is_error());
    }

    #[test]
    fn coalesce_status_propagates_first_non_ok() {
        let merged =
            Coalesce::StatusAll.combine(vec![RespValue::ok(), RespValue::ok()]);
        assert_eq!(merged, RespValue::ok());

        let merged = Coalesce::StatusAll.combine(vec![
            RespValue::ok(),
            RespValue::simple("QUEUED"),
        ]);
        assert_eq!(merged, RespValue::simple("QUEUED"));

        let merged = Coalesce::StatusAll.combine(vec![RespValue::Integer(1)]);
        assert!(merged.is_error());
    }

    #[test]
    fn coalesce_gather_preserves_cardinality() {
        let merged = Coalesce::ArrayGather.combine(vec![
            RespValue::Array(vec![RespValue::bulk("VA")]),
            RespValue::Array(vec![RespValue::NullBulk]),
        ]);
        assert_eq!(
            merged,
            RespValue::Array(vec![RespValue::bulk("VA"), RespValue::NullBulk])
        );

        let merged = Coalesce::ArrayGather.combine(vec![
            RespValue::Array(vec![RespValue::bulk("VA")]),
            RespValue::error("ERR boom"),
        ]);
        assert_eq!(merged, RespValue::error("ERR boom"));

        let merged = Coalesce::ArrayGather.combine(vec![RespValue::Array(vec![])]);
        assert!(merged.is_error());
    }
}
