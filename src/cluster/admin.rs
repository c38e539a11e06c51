use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::backend::{Instance, InstanceError};
use crate::cluster::ProxyState;
use crate::protocol::{LocalCommand, RedisCommand, RespValue};

/// Answer a command that never touches a backend.
pub async fn handle_local(
    state: &Arc<ProxyState>,
    local: LocalCommand,
    command: &RedisCommand,
) -> RespValue {
    match local {
        LocalCommand::Ping => match command.args().get(1) {
            None => RespValue::simple("PONG"),
            Some(message) => RespValue::BulkString(message.clone()),
        },
        LocalCommand::Echo => RespValue::BulkString(command.args()[1].clone()),
        LocalCommand::Select => match btoi::btoi::<i64>(&command.args()[1]) {
            Ok(0) => RespValue::ok(),
            Ok(_) => RespValue::error("ERR only select 0 is allowed"),
            Err(_) => RespValue::error("ERR invalid DB index"),
        },
        LocalCommand::Auth => {
            RespValue::error("ERR Client sent AUTH, but no password is set")
        }
        LocalCommand::Time => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            RespValue::Array(vec![
                RespValue::bulk(now.as_secs().to_string()),
                RespValue::bulk(now.subsec_micros().to_string()),
            ])
        }
        LocalCommand::ReadOnly | LocalCommand::ReadWrite | LocalCommand::Monitor => {
            RespValue::ok()
        }
        LocalCommand::Wait => RespValue::Integer(0),
        LocalCommand::Command => RespValue::Array(Vec::new()),
        LocalCommand::Shutdown => {
            state.request_shutdown();
            RespValue::ok()
        }
        LocalCommand::Slowlog => slowlog_command(command),
        LocalCommand::Debug => RespValue::ok(),
        LocalCommand::Config => config_command(state, command),
        LocalCommand::Client => client_command(command),
        LocalCommand::Latency => latency_command(command),
        LocalCommand::Proxy => proxy_command(state, command).await,
        LocalCommand::Info => info_command(state, command),
    }
}

fn slowlog_command(command: &RedisCommand) -> RespValue {
    match lowered(command.args().get(1)).as_slice() {
        b"get" => RespValue::Array(Vec::new()),
        b"len" => RespValue::Integer(0),
        b"reset" => RespValue::ok(),
        _ => RespValue::error("ERR unknown SLOWLOG subcommand"),
    }
}

fn config_command(state: &Arc<ProxyState>, command: &RedisCommand) -> RespValue {
    match lowered(command.args().get(1)).as_slice() {
        b"get" => RespValue::Array(Vec::new()),
        b"set" => RespValue::ok(),
        b"rewrite" => {
            state.schedule_save();
            RespValue::ok()
        }
        _ => RespValue::error("ERR unknown CONFIG subcommand"),
    }
}

fn client_command(command: &RedisCommand) -> RespValue {
    match lowered(command.args().get(1)).as_slice() {
        b"setname" => RespValue::ok(),
        b"getname" => RespValue::NullBulk,
        b"list" => RespValue::bulk(""),
        _ => RespValue::ok(),
    }
}

fn latency_command(command: &RedisCommand) -> RespValue {
    match lowered(command.args().get(1)).as_slice() {
        b"reset" => RespValue::Integer(0),
        _ => RespValue::Array(Vec::new()),
    }
}

/// PROXY INSTANCES | INSTANCE | ROUTER | FLUSHCONFIG | SET auth-pass.
async fn proxy_command(state: &Arc<ProxyState>, command: &RedisCommand) -> RespValue {
    let args = command.args();
    match lowered(args.get(1)).as_slice() {
        b"instances" if args.len() == 2 => {
            let mut instances = state.registry.all();
            instances.sort_by(|a, b| a.name().cmp(b.name()));
            RespValue::Array(instances.iter().map(instance_reply).collect())
        }
        b"instance" if args.len() == 4 => {
            match lookup_instance(state, &args[2], &args[3]) {
                Some(instance) => instance_reply(&instance),
                None => RespValue::error("ERR no such backend instance"),
            }
        }
        b"router" if args.len() == 4 || args.len() == 5 => {
            let host = match std::str::from_utf8(&args[2]) {
                Ok(host) => host,
                Err(_) => return RespValue::error("ERR invalid host"),
            };
            let port = match btoi::btoi::<u16>(&args[3]) {
                Ok(port) => port,
                Err(_) => return RespValue::error("ERR Invalid port number"),
            };
            let poolsize = match args.get(4) {
                Some(raw) => match btoi::btoi::<i64>(raw) {
                    Ok(poolsize) if poolsize > 0 => poolsize as usize,
                    _ => return RespValue::error("ERR poolsize must be 1 or greater"),
                },
                None => state.registry.default_poolsize(),
            };
            match state.registry.create(host, port, poolsize, None).await {
                Ok(_) => {
                    state.schedule_save();
                    RespValue::ok()
                }
                Err(err) => RespValue::error(format!("ERR {}", creation_error(&err))),
            }
        }
        b"flushconfig" if args.len() == 2 => {
            state.schedule_save();
            RespValue::ok()
        }
        b"set" if args.len() == 6 && lowered(args.get(2)).as_slice() == b"auth-pass" => {
            match lookup_instance(state, &args[3], &args[4]) {
                Some(instance) => {
                    let password = if args[5].is_empty() {
                        None
                    } else {
                        Some(args[5].clone())
                    };
                    instance.set_auth_pass(password);
                    state.schedule_save();
                    RespValue::ok()
                }
                None => RespValue::error("ERR no such backend instance"),
            }
        }
        b"instances" | b"instance" | b"router" | b"flushconfig" | b"set" => RespValue::error(
            format!(
                "ERR wrong number of arguments for 'proxy {}'",
                String::from_utf8_lossy(&lowered(args.get(1)))
            ),
        ),
        other => RespValue::error(format!(
            "ERR unknown proxy subcommand '{}'",
            String::from_utf8_lossy(other)
        )),
    }
}

fn lookup_instance(
    state: &Arc<ProxyState>,
    host: &Bytes,
    port: &Bytes,
) -> Option<Arc<Instance>> {
    let host = std::str::from_utf8(host).ok()?;
    let port = btoi::btoi::<u16>(port).ok()?;
    state.registry.get(&format!("{host}:{port}"))
}

fn creation_error(err: &InstanceError) -> &'static str {
    match err {
        InstanceError::Duplicate(_) => "Duplicated backend instance",
        InstanceError::InvalidPort(_) | InstanceError::InvalidAddress(_) => "Invalid port number",
        InstanceError::InvalidPoolSize => "poolsize must be 1 or greater",
        InstanceError::ResolveFailed(_) => "Can't resolve backend instance hostname",
    }
}

/// Field/value pairs describing one instance, `PROXY INSTANCES` style.
fn instance_reply(instance: &Arc<Instance>) -> RespValue {
    let pending: Vec<RespValue> = instance
        .pending_per_link()
        .into_iter()
        .map(|count| RespValue::Integer(count as i64))
        .collect();
    RespValue::Array(vec![
        RespValue::bulk("name"),
        RespValue::bulk(instance.name()),
        RespValue::bulk("ip"),
        RespValue::bulk(instance.ip().to_string()),
        RespValue::bulk("port"),
        RespValue::Integer(instance.port() as i64),
        RespValue::bulk("slots"),
        RespValue::Integer(instance.slots_num() as i64),
        RespValue::bulk("link-poolsize"),
        RespValue::Integer(instance.poolsize() as i64),
        RespValue::bulk("link-pending-commands"),
        RespValue::Array(pending),
    ])
}

/// INFO [section]; only the proxy-specific sections exist here.
fn info_command(state: &Arc<ProxyState>, command: &RedisCommand) -> RespValue {
    let section = command
        .args()
        .get(1)
        .map(|raw| raw.to_ascii_lowercase())
        .unwrap_or_else(|| b"default".to_vec());
    let all = matches!(section.as_slice(), b"default" | b"all" | b"everything");

    let mut info = String::new();
    if all || section == b"server" {
        info.push_str(&format!(
            "# Server\r\nproxy_id:{}\r\ntcp_port:{}\r\n",
            state.myid, state.port
        ));
    }
    if all || section == b"proxy" {
        if !info.is_empty() {
            info.push_str("\r\n");
        }
        let mut instances = state.registry.all();
        instances.sort_by(|a, b| a.name().cmp(b.name()));
        info.push_str(&format!(
            "# Proxy\r\nproxy_redis_instances:{}\r\n",
            instances.len()
        ));
        for (index, instance) in instances.iter().enumerate() {
            info.push_str(&format!(
                "master{}:name={},address={}:{},slots={}\r\n",
                index,
                instance.name(),
                instance.ip(),
                instance.port(),
                instance.slots_num()
            ));
        }
    }
    RespValue::bulk(info)
}

fn lowered(arg: Option<&Bytes>) -> Vec<u8> {
    arg.map(|raw| raw.to_ascii_lowercase()).unwrap_or_default()
}
