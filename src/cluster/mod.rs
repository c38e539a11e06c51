pub mod admin;
pub mod fetcher;
pub mod nodes;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::FuturesOrdered;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::backend::{
    connection_error_reply, Instance, InstanceRegistry, LinkSender, SlotTable,
};
use crate::config::{AuthPassConfig, ConfigManager, ProxyConfig, RouterConfig, RUN_ID_LEN};
use crate::metrics;
use crate::protocol::{
    lookup_command, CommandHandler, RedisCommand, RespCodec, RespValue, SLOT_COUNT,
};
use crate::utils::{key_hash_slot, random_hex_id};
use crate::{DEFAULT_REDIRECT_MAX_LIMIT, DEFAULT_UPDATE_SLOTS_MIN_LIMIT};

/// Cap on concurrently dispatched commands per client connection.
const PIPELINE_LIMIT: usize = 128;

/// Sequential identifier for client connections; also the pool striping
/// key, so one client always reaches the same link of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the routing core operates on, grouped in one place and
/// shared by the connection handlers, the topology fetcher, and the
/// config writer.
pub struct ProxyState {
    pub myid: String,
    pub port: u16,
    pub registry: InstanceRegistry,
    pub slots: SlotTable,
    pub redirect_max_limit: u32,
    pub update_slots_min_limit: Duration,
    last_refresh: Mutex<Option<Instant>>,
    fetch_trigger: mpsc::UnboundedSender<()>,
    save_trigger: mpsc::UnboundedSender<()>,
    shutdown: Notify,
}

impl ProxyState {
    /// Ask the topology fetcher for a refresh; rate limiting happens on
    /// the consuming side.
    pub fn schedule_refresh(&self) {
        let _ = self.fetch_trigger.send(());
    }

    /// Ask the config writer to persist the current state.
    pub fn schedule_save(&self) {
        let _ = self.save_trigger.send(());
    }

    pub(crate) fn refresh_due(&self) -> bool {
        let mut guard = self.last_refresh.lock();
        match *guard {
            Some(last) if last.elapsed() < self.update_slots_min_limit => false,
            _ => {
                *guard = Some(Instant::now());
                true
            }
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }

    #[cfg(test)]
    pub(crate) async fn for_tests(default_poolsize: usize) -> Arc<Self> {
        let (fetch_trigger, _fetch_rx) = mpsc::unbounded_channel();
        let (save_trigger, _save_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            myid: random_hex_id(RUN_ID_LEN),
            port: crate::DEFAULT_PORT,
            registry: InstanceRegistry::new(default_poolsize),
            slots: SlotTable::new(),
            redirect_max_limit: DEFAULT_REDIRECT_MAX_LIMIT,
            update_slots_min_limit: DEFAULT_UPDATE_SLOTS_MIN_LIMIT,
            last_refresh: Mutex::new(None),
            fetch_trigger,
            save_trigger,
            shutdown: Notify::new(),
        })
    }
}

/// The proxy front: accepts client connections and funnels every command
/// through the routing core.
#[derive(Clone)]
pub struct ClusterProxy {
    state: Arc<ProxyState>,
}

impl ClusterProxy {
    /// Build the proxy from its configuration: register the configured
    /// routers, pin every slot to a random one so forwarding works before
    /// the first topology refresh, and start the fetcher and the config
    /// writer.
    pub async fn bootstrap(
        config: &ProxyConfig,
        manager: ConfigManager,
        port: u16,
    ) -> Result<Self> {
        config.ensure_valid()?;

        let (fetch_trigger, fetch_rx) = mpsc::unbounded_channel();
        let (save_trigger, save_rx) = mpsc::unbounded_channel();
        let generated_id = config.myid.is_none();
        let myid = config
            .myid
            .clone()
            .unwrap_or_else(|| random_hex_id(RUN_ID_LEN));

        let state = Arc::new(ProxyState {
            myid,
            port,
            registry: InstanceRegistry::new(crate::DEFAULT_POOLSIZE),
            slots: SlotTable::new(),
            redirect_max_limit: DEFAULT_REDIRECT_MAX_LIMIT,
            update_slots_min_limit: DEFAULT_UPDATE_SLOTS_MIN_LIMIT,
            last_refresh: Mutex::new(None),
            fetch_trigger,
            save_trigger,
            shutdown: Notify::new(),
        });

        for router in &config.routers {
            let auth = config
                .auth_for(&router.host, router.port)
                .map(|password| Bytes::copy_from_slice(password.as_bytes()));
            state
                .registry
                .create(&router.host, router.port, router.poolsize, auth)
                .await
                .with_context(|| {
                    format!("failed to register router {}:{}", router.host, router.port)
                })?;
        }
        state.slots.bootstrap_random(&state.registry.all());

        // Log the persisted id to make debugging across restarts simpler.
        info!(myid = %state.myid, "proxy id");

        fetcher::spawn(state.clone(), fetch_rx);
        spawn_config_writer(state.clone(), manager, save_rx);
        if generated_id {
            state.schedule_save();
        }
        state.schedule_refresh();

        Ok(Self { state })
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let proxy = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = proxy.handle_connection(socket).await {
                            debug!(client = %peer, error = %err, "client connection closed with error");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "failed to accept client connection"),
            }
        }
    }

    /// Serve one client: commands are dispatched as soon as they parse,
    /// up to the pipeline limit, and replies flush strictly in submission
    /// order no matter how the backends interleave.
    pub async fn handle_connection(&self, socket: TcpStream) -> Result<()> {
        socket.set_nodelay(true).context("failed to set TCP_NODELAY")?;
        metrics::front_conn_open();
        let result = self.connection_loop(socket).await;
        metrics::front_conn_close();
        result
    }

    async fn connection_loop(&self, socket: TcpStream) -> Result<()> {
        let client_id = ClientId::new();
        let (mut sink, stream) = Framed::new(socket, RespCodec).split();
        let mut stream = stream.fuse();
        let mut pending: FuturesOrdered<BoxFuture<'static, RespValue>> = FuturesOrdered::new();
        let mut inflight = 0usize;
        let mut stream_closed = false;

        loop {
            tokio::select! {
                Some(reply) = pending.next(), if inflight > 0 => {
                    inflight -= 1;
                    if reply.is_error() {
                        metrics::global_error_incr();
                    }
                    sink.send(reply).await?;
                }
                frame = stream.next(), if !stream_closed && inflight < PIPELINE_LIMIT => {
                    match frame {
                        Some(Ok(frame)) => {
                            pending.push_back(prepare(self.state.clone(), client_id, frame));
                            inflight += 1;
                        }
                        Some(Err(err)) => {
                            metrics::global_error_incr();
                            let _ = sink
                                .send(RespValue::error(format!("ERR Protocol error: {err}")))
                                .await;
                            return Err(err);
                        }
                        None => stream_closed = true,
                    }
                }
                else => {
                    if stream_closed && inflight == 0 {
                        break;
                    }
                }
            }
        }

        while let Some(reply) = pending.next().await {
            sink.send(reply).await?;
        }
        sink.close().await?;
        Ok(())
    }
}

fn prepare(
    state: Arc<ProxyState>,
    client_id: ClientId,
    frame: RespValue,
) -> BoxFuture<'static, RespValue> {
    Box::pin(async move {
        match RedisCommand::from_resp(frame) {
            Ok(command) => dispatch(state, client_id, command).await,
            Err(err) => RespValue::error(format!("ERR {err}")),
        }
    })
}

/// Route one command to its handler class.
pub async fn dispatch(
    state: Arc<ProxyState>,
    client_id: ClientId,
    command: RedisCommand,
) -> RespValue {
    let descriptor = match lookup_command(command.name()) {
        Some(descriptor) => descriptor,
        None => {
            return RespValue::error(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(command.name())
            ))
        }
    };
    if !descriptor.check_arity(command.arg_count()) {
        return RespValue::error(format!(
            "ERR wrong number of arguments for '{}' command",
            descriptor.name
        ));
    }

    match descriptor.handler {
        CommandHandler::Local(local) => admin::handle_local(&state, local, &command).await,
        CommandHandler::NotSupported => RespValue::error(format!(
            "ERR not supported command '{}'",
            descriptor.name
        )),
        CommandHandler::Forward => {
            let key = match descriptor.first_key(&command) {
                Ok(key) => key.clone(),
                Err(err) => return RespValue::error(format!("ERR {err}")),
            };
            dispatch_keyed(&state, client_id, command, key).await
        }
        CommandHandler::Fanout(coalesce) => {
            let children = match descriptor.fanout_children(&command) {
                Ok(children) => children,
                Err(err) => return RespValue::error(format!("ERR {err}")),
            };
            let mut tasks: FuturesOrdered<_> = children
                .into_iter()
                .map(|child| {
                    let state = state.clone();
                    async move {
                        let key = child.args()[1].clone();
                        dispatch_keyed(&state, client_id, child, key).await
                    }
                })
                .collect();
            let mut replies = Vec::with_capacity(tasks.len());
            while let Some(reply) = tasks.next().await {
                replies.push(reply);
            }
            coalesce.combine(replies)
        }
    }
}

/// Forward one single-key command, following MOVED and ASK redirections
/// up to the configured bound.
async fn dispatch_keyed(
    state: &Arc<ProxyState>,
    client_id: ClientId,
    command: RedisCommand,
    key: Bytes,
) -> RespValue {
    let slot = key_hash_slot(&key, SLOT_COUNT);
    let mut target: Option<Arc<Instance>> = None;
    let mut asking = false;
    let mut redirects = 0u32;

    loop {
        let instance = match &target {
            Some(instance) => instance.clone(),
            None => state
                .slots
                .get(slot)
                .expect("slot table is fully assigned after bootstrap"),
        };
        let link = instance.link(client_id.as_u64());
        let reply = send_on_link(&link, &command, asking).await;

        match parse_redirect(&reply) {
            Some(redirect) if redirects < state.redirect_max_limit => {
                redirects += 1;
                let addr = match &redirect {
                    Redirect::Moved { addr, .. } | Redirect::Ask { addr } => addr.clone(),
                };
                if matches!(redirect, Redirect::Moved { .. }) {
                    metrics::redirection("moved");
                    state.schedule_refresh();
                } else {
                    metrics::redirection("ask");
                }
                match state.registry.get_or_create(&addr).await {
                    Ok(instance) => {
                        asking = matches!(redirect, Redirect::Ask { .. });
                        target = Some(instance);
                    }
                    Err(err) => return RespValue::error(format!("ERR {err}")),
                }
            }
            _ => return reply,
        }
    }
}

/// Submit on a link; an ASK hop sends ASKING first on the same link, its
/// reply consumed by a no-op FIFO slot.
async fn send_on_link(link: &LinkSender, command: &RedisCommand, asking: bool) -> RespValue {
    if asking && link.submit_no_reply(asking_command()).await.is_err() {
        return connection_error_reply();
    }
    match link.request(command.to_resp()).await {
        Ok(receiver) => receiver.await.unwrap_or_else(|_| connection_error_reply()),
        Err(_) => connection_error_reply(),
    }
}

fn asking_command() -> RespValue {
    RespValue::Array(vec![RespValue::BulkString(Bytes::from_static(b"ASKING"))])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Redirect {
    Moved { slot: u16, addr: String },
    Ask { addr: String },
}

/// Classify a backend error reply as a redirection, case-insensitively.
pub(crate) fn parse_redirect(reply: &RespValue) -> Option<Redirect> {
    let RespValue::Error(data) = reply else {
        return None;
    };
    let text = std::str::from_utf8(data).ok()?;
    let mut parts = text.split_whitespace();
    let kind = parts.next()?;
    if kind.eq_ignore_ascii_case("MOVED") {
        let slot = parts.next()?.parse::<u16>().ok()?;
        let addr = parts.next()?.to_string();
        (slot < SLOT_COUNT).then_some(Redirect::Moved { slot, addr })
    } else if kind.eq_ignore_ascii_case("ASK") {
        let _slot = parts.next()?;
        let addr = parts.next()?.to_string();
        Some(Redirect::Ask { addr })
    } else {
        None
    }
}

fn spawn_config_writer(
    state: Arc<ProxyState>,
    manager: ConfigManager,
    mut trigger: mpsc::UnboundedReceiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while trigger.recv().await.is_some() {
            // Collapse bursts of triggers into one rewrite.
            while trigger.try_recv().is_ok() {}
            let snapshot = snapshot_config(&state);
            match manager.rewrite(&snapshot).await {
                Ok(()) => debug!(path = %manager.path().display(), "proxy configuration saved"),
                Err(err) => {
                    warn!(error = %err, "failed to persist the proxy configuration")
                }
            }
        }
    })
}

/// The configuration the proxy would need to come back up as it is now.
fn snapshot_config(state: &ProxyState) -> ProxyConfig {
    let mut instances = state.registry.all();
    instances.sort_by(|a, b| a.name().cmp(b.name()));

    let mut routers = Vec::with_capacity(instances.len());
    let mut auth_passes = Vec::new();
    for instance in instances {
        routers.push(RouterConfig {
            host: instance.ip().to_string(),
            port: instance.port(),
            poolsize: instance.poolsize(),
        });
        if let Some(password) = instance.auth_pass() {
            auth_passes.push(AuthPassConfig {
                host: instance.ip().to_string(),
                port: instance.port(),
                password: String::from_utf8_lossy(&password).into_owned(),
            });
        }
    }
    ProxyConfig {
        port: Some(state.port),
        myid: Some(state.myid.clone()),
        routers,
        auth_passes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_moved_redirect() {
        let reply = RespValue::error("MOVED 15495 127.0.0.1:7002");
        assert_eq!(
            parse_redirect(&reply),
            Some(Redirect::Moved {
                slot: 15495,
                addr: "127.0.0.1:7002".to_string()
            })
        );
    }

    #[test]
    fn parse_redirect_is_case_insensitive() {
        let reply = RespValue::error("moved 42 10.0.0.1:7000");
        assert!(matches!(
            parse_redirect(&reply),
            Some(Redirect::Moved { slot: 42, .. })
        ));
        let reply = RespValue::error("Ask 8000 127.0.0.1:7003");
        assert_eq!(
            parse_redirect(&reply),
            Some(Redirect::Ask {
                addr: "127.0.0.1:7003".to_string()
            })
        );
    }

    #[test]
    fn ordinary_errors_are_not_redirects() {
        assert_eq!(parse_redirect(&RespValue::error("ERR something")), None);
        assert_eq!(parse_redirect(&RespValue::ok()), None);
        assert_eq!(
            parse_redirect(&RespValue::error("MOVED 99999 127.0.0.1:7002")),
            None
        );
        // MOVEDX must not match the MOVED prefix.
        assert_eq!(
            parse_redirect(&RespValue::error("MOVEDX 42 127.0.0.1:7002")),
            None
        );
    }

    #[tokio::test]
    async fn dispatch_refuses_unknown_unsupported_and_bad_arity() {
        let state = ProxyState::for_tests(1).await;

        let reply = dispatch(
            state.clone(),
            ClientId::new(),
            RedisCommand::new(vec![Bytes::from_static(b"FROBNICATE")]).unwrap(),
        )
        .await;
        assert_eq!(reply, RespValue::error("ERR unknown command 'FROBNICATE'"));

        let reply = dispatch(
            state.clone(),
            ClientId::new(),
            RedisCommand::new(vec![
                Bytes::from_static(b"KEYS"),
                Bytes::from_static(b"*"),
            ])
            .unwrap(),
        )
        .await;
        assert_eq!(reply, RespValue::error("ERR not supported command 'keys'"));

        let reply = dispatch(
            state,
            ClientId::new(),
            RedisCommand::new(vec![
                Bytes::from_static(b"GET"),
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
            ])
            .unwrap(),
        )
        .await;
        assert_eq!(
            reply,
            RespValue::error("ERR wrong number of arguments for 'get' command")
        );
    }
}
