use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use rand::seq::IteratorRandom;
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::link::{BackendLink, LinkSender};

/// Minimum delay between reconnection attempts for one link.
pub const RECONNECT_PERIOD: Duration = Duration::from_secs(1);

/// Why an instance could not be registered.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("cannot resolve backend host {0}")]
    ResolveFailed(String),
    #[error("backend {0} is already registered")]
    Duplicate(String),
    #[error("invalid backend address {0}")]
    InvalidAddress(String),
    #[error("invalid port in backend address {0}")]
    InvalidPort(String),
    #[error("pool size must be 1 or greater")]
    InvalidPoolSize,
}

/// One shard address with its pool of pipelined links.
///
/// `slots_num` mirrors how many slot-table entries point at this
/// instance; only the slot table mutator updates it.
pub struct Instance {
    name: Arc<str>,
    ip: IpAddr,
    port: u16,
    auth_pass: RwLock<Option<Bytes>>,
    pool: Vec<Mutex<BackendLink>>,
    slots_num: AtomicUsize,
}

impl Instance {
    fn new(ip: IpAddr, port: u16, poolsize: usize, auth_pass: Option<Bytes>) -> Arc<Self> {
        let name: Arc<str> = format!("{ip}:{port}").into();
        let pool = (0..poolsize)
            .map(|index| Mutex::new(spawn_link(&name, ip, port, index, auth_pass.clone())))
            .collect();
        Arc::new(Self {
            name,
            ip,
            port,
            auth_pass: RwLock::new(auth_pass),
            pool,
            slots_num: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn poolsize(&self) -> usize {
        self.pool.len()
    }

    pub fn slots_num(&self) -> usize {
        self.slots_num.load(Ordering::Relaxed)
    }

    pub(crate) fn incr_slots(&self) {
        self.slots_num.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decr_slots(&self) {
        let previous = self.slots_num.fetch_sub(1, Ordering::Relaxed);
        assert!(previous > 0, "slots_num underflow on instance {}", self.name);
    }

    pub fn auth_pass(&self) -> Option<Bytes> {
        self.auth_pass.read().clone()
    }

    /// Update the password used by links created from now on.
    pub fn set_auth_pass(&self, password: Option<Bytes>) {
        *self.auth_pass.write() = password;
    }

    /// Pick the link serving this client, reviving it first when it has
    /// died and the per-link reconnect throttle allows.
    pub fn link(&self, client_id: u64) -> LinkSender {
        let index = (client_id % self.pool.len() as u64) as usize;
        let mut slot = self.pool[index].lock();
        if slot.is_closed() && slot.connected_at().elapsed() >= RECONNECT_PERIOD {
            info!(backend = %self.name, link = index, "reconnecting backend link");
            *slot = spawn_link(&self.name, self.ip, self.port, index, self.auth_pass());
        }
        slot.sender()
    }

    /// Queue depth of every pool link, in pool order.
    pub fn pending_per_link(&self) -> Vec<usize> {
        self.pool
            .iter()
            .map(|slot| slot.lock().pending_requests())
            .collect()
    }
}

fn spawn_link(
    name: &str,
    ip: IpAddr,
    port: u16,
    index: usize,
    auth_pass: Option<Bytes>,
) -> BackendLink {
    BackendLink::connect(
        format!("{name}-{index}"),
        format!("{ip}:{port}"),
        auth_pass,
    )
}

/// All registered instances, keyed by canonical `ip:port` name.
pub struct InstanceRegistry {
    default_poolsize: usize,
    inner: RwLock<HashMap<String, Arc<Instance>>>,
}

impl InstanceRegistry {
    pub fn new(default_poolsize: usize) -> Self {
        Self {
            default_poolsize: default_poolsize.max(1),
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_poolsize(&self) -> usize {
        self.default_poolsize
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Instance>> {
        self.inner.read().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Instance>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn random(&self) -> Option<Arc<Instance>> {
        let guard = self.inner.read();
        guard.values().choose(&mut rand::thread_rng()).cloned()
    }

    /// Register a new instance. Host names are resolved up front so the
    /// hot path never touches DNS.
    pub async fn create(
        &self,
        host: &str,
        port: u16,
        poolsize: usize,
        auth_pass: Option<Bytes>,
    ) -> Result<Arc<Instance>, InstanceError> {
        if poolsize == 0 {
            return Err(InstanceError::InvalidPoolSize);
        }
        let ip = resolve_host(host, port).await?;
        let name = format!("{ip}:{port}");
        let mut guard = self.inner.write();
        if guard.contains_key(&name) {
            return Err(InstanceError::Duplicate(name));
        }
        let instance = Instance::new(ip, port, poolsize, auth_pass);
        guard.insert(name.clone(), instance.clone());
        drop(guard);
        info!(instance = %name, poolsize, "registered backend instance");
        Ok(instance)
    }

    /// Resolve `host:port` to a registered instance, creating it with the
    /// default pool size when unknown. Used by redirections and topology
    /// refreshes.
    pub async fn get_or_create(&self, addr: &str) -> Result<Arc<Instance>, InstanceError> {
        let (host, port) = split_addr(addr)?;
        let ip = resolve_host(host, port).await?;
        let name = format!("{ip}:{port}");
        if let Some(instance) = self.get(&name) {
            return Ok(instance);
        }
        match self.create(host, port, self.default_poolsize, None).await {
            Ok(instance) => Ok(instance),
            // Lost a race with a concurrent creation; take the winner.
            Err(InstanceError::Duplicate(_)) => Ok(self
                .get(&name)
                .expect("duplicate registration implies presence")),
            Err(err) => Err(err),
        }
    }

    /// Drop every instance that no longer owns any slot. Links close
    /// lazily once their in-flight replies have drained.
    pub fn remove_unused(&self) -> usize {
        let mut guard = self.inner.write();
        let before = guard.len();
        guard.retain(|name, instance| {
            if instance.slots_num() == 0 {
                info!(instance = %name, "releasing backend instance without slots");
                false
            } else {
                true
            }
        });
        before - guard.len()
    }
}

pub(crate) fn split_addr(addr: &str) -> Result<(&str, u16), InstanceError> {
    let (host, port_str) = addr
        .rsplit_once(':')
        .ok_or_else(|| InstanceError::InvalidAddress(addr.to_string()))?;
    if host.is_empty() {
        return Err(InstanceError::InvalidAddress(addr.to_string()));
    }
    let port = port_str
        .parse::<u16>()
        .map_err(|_| InstanceError::InvalidPort(addr.to_string()))?;
    Ok((host, port))
}

async fn resolve_host(host: &str, port: u16) -> Result<IpAddr, InstanceError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    match tokio::net::lookup_host((host, port)).await {
        Ok(mut addrs) => addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| InstanceError::ResolveFailed(host.to_string())),
        Err(err) => {
            warn!(host, error = %err, "backend host resolution failed");
            Err(InstanceError::ResolveFailed(host.to_string()))
        }
    }
}
