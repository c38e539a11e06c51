use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::metrics;
use crate::protocol::{RespCodec, RespValue};

/// Advisory cap on queued plus in-flight requests per link.
pub const MAX_PENDING_REQUESTS: usize = 10_000;

const SUBMIT_CHANNEL_CAPACITY: usize = 1024;

/// Canned reply delivered to every request caught on a failing link.
pub fn connection_error_reply() -> RespValue {
    RespValue::Error(Bytes::from_static(b"ERR backend connection lost"))
}

pub struct LinkRequest {
    command: RespValue,
    respond_to: Option<oneshot::Sender<RespValue>>,
}

struct Inflight {
    respond_to: Option<oneshot::Sender<RespValue>>,
    counted: bool,
}

/// One pipelined connection to a backend.
///
/// The connection is owned by a spawned task; this handle only carries the
/// submission channel. Requests are written in submission order and the
/// N-th reply parsed off the socket resolves the N-th submitted responder.
/// When the handle is dropped while replies are still owed, the task keeps
/// reading until the last expected reply has been consumed.
pub struct BackendLink {
    name: Arc<str>,
    tx: mpsc::Sender<LinkRequest>,
    pending: Arc<AtomicUsize>,
    connected_at: Instant,
}

impl BackendLink {
    pub fn connect(name: impl Into<Arc<str>>, addr: String, auth: Option<Bytes>) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel(SUBMIT_CHANNEL_CAPACITY);
        let pending = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_link(name.clone(), addr, auth, rx, pending.clone()));
        Self {
            name,
            tx,
            pending,
            connected_at: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the owning task has terminated (error or clean close).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn sender(&self) -> LinkSender {
        LinkSender {
            name: self.name.clone(),
            tx: self.tx.clone(),
            pending: self.pending.clone(),
        }
    }
}

/// Cheap clonable submission handle for one link.
#[derive(Clone)]
pub struct LinkSender {
    name: Arc<str>,
    tx: mpsc::Sender<LinkRequest>,
    pending: Arc<AtomicUsize>,
}

impl LinkSender {
    /// Submit a request and receive the responder for its reply.
    pub async fn request(&self, command: RespValue) -> Result<oneshot::Receiver<RespValue>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(command, Some(reply_tx)).await?;
        Ok(reply_rx)
    }

    /// Submit a request whose reply is consumed and discarded (ASKING,
    /// handshake-style traffic). The request still occupies a FIFO slot.
    pub async fn submit_no_reply(&self, command: RespValue) -> Result<()> {
        self.submit(command, None).await
    }

    async fn submit(
        &self,
        command: RespValue,
        respond_to: Option<oneshot::Sender<RespValue>>,
    ) -> Result<()> {
        if self.pending.fetch_add(1, Ordering::Relaxed) >= MAX_PENDING_REQUESTS {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            bail!("too many pending requests on backend link {}", self.name);
        }
        if self
            .tx
            .send(LinkRequest {
                command,
                respond_to,
            })
            .await
            .is_err()
        {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(anyhow!("backend link {} is down", self.name));
        }
        Ok(())
    }
}

async fn run_link(
    name: Arc<str>,
    addr: String,
    auth: Option<Bytes>,
    mut rx: mpsc::Receiver<LinkRequest>,
    pending: Arc<AtomicUsize>,
) {
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(backend = %name, error = %err, "failed to connect backend link");
            metrics::backend_error(&name);
            drain_channel(&mut rx, &pending);
            return;
        }
    };
    if let Err(err) = stream.set_nodelay(true) {
        warn!(backend = %name, error = %err, "failed to set TCP_NODELAY");
    }
    debug!(backend = %name, "backend link connected");

    let mut framed = Framed::new(stream, RespCodec);
    let mut inflight: VecDeque<Inflight> = VecDeque::new();

    if handshake(&mut framed, &name, auth, &mut inflight).await.is_err() {
        fail_link(&name, inflight, &mut rx, &pending);
        return;
    }

    let mut draining = false;
    loop {
        tokio::select! {
            request = rx.recv(), if !draining => {
                match request {
                    Some(request) => {
                        if let Err(err) = write_batch(&mut framed, &mut rx, request, &mut inflight).await {
                            warn!(backend = %name, error = %err, "backend link write failed");
                            break;
                        }
                    }
                    None => {
                        // Handle dropped: lazy close once the last owed
                        // reply has been read.
                        draining = true;
                        if inflight.is_empty() {
                            debug!(backend = %name, "backend link closed");
                            return;
                        }
                    }
                }
            }
            reply = framed.next() => {
                match reply {
                    Some(Ok(value)) => {
                        match inflight.pop_front() {
                            Some(entry) => deliver(entry, value, &pending),
                            None => {
                                warn!(backend = %name, "reply arrived with no pending request");
                                break;
                            }
                        }
                        if draining && inflight.is_empty() {
                            debug!(backend = %name, "backend link closed");
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(backend = %name, error = %err, "backend protocol error");
                        break;
                    }
                    None => {
                        warn!(backend = %name, "backend closed the connection");
                        break;
                    }
                }
            }
        }
    }

    fail_link(&name, inflight, &mut rx, &pending);
}

/// AUTH (when configured) then CLIENT SETNAME, so operators can spot proxy
/// links in CLIENT LIST on the backends. Replies land on no-op FIFO slots.
async fn handshake(
    framed: &mut Framed<TcpStream, RespCodec>,
    name: &str,
    auth: Option<Bytes>,
    inflight: &mut VecDeque<Inflight>,
) -> Result<()> {
    if let Some(password) = auth {
        inflight.push_back(Inflight {
            respond_to: None,
            counted: false,
        });
        framed
            .feed(RespValue::Array(vec![
                RespValue::BulkString(Bytes::from_static(b"AUTH")),
                RespValue::BulkString(password),
            ]))
            .await?;
    }
    inflight.push_back(Inflight {
        respond_to: None,
        counted: false,
    });
    framed
        .feed(RespValue::Array(vec![
            RespValue::BulkString(Bytes::from_static(b"CLIENT")),
            RespValue::BulkString(Bytes::from_static(b"SETNAME")),
            RespValue::bulk(format!("proxy-{name}")),
        ]))
        .await?;
    framed.flush().await?;
    Ok(())
}

/// Write the received request plus everything else already queued, then
/// flush once. Responders enter the FIFO before their bytes are written,
/// which is what keeps reply delivery aligned with write order.
async fn write_batch(
    framed: &mut Framed<TcpStream, RespCodec>,
    rx: &mut mpsc::Receiver<LinkRequest>,
    first: LinkRequest,
    inflight: &mut VecDeque<Inflight>,
) -> Result<()> {
    let mut request = first;
    loop {
        inflight.push_back(Inflight {
            respond_to: request.respond_to,
            counted: true,
        });
        framed.feed(request.command).await?;
        match rx.try_recv() {
            Ok(next) => request = next,
            Err(_) => break,
        }
    }
    framed.flush().await?;
    Ok(())
}

fn deliver(entry: Inflight, value: RespValue, pending: &AtomicUsize) {
    if entry.counted {
        pending.fetch_sub(1, Ordering::Relaxed);
    }
    if let Some(tx) = entry.respond_to {
        // A dropped receiver means the client went away; the reply is
        // dropped on the floor, never delivered elsewhere.
        let _ = tx.send(value);
    }
}

fn fail_link(
    name: &str,
    mut inflight: VecDeque<Inflight>,
    rx: &mut mpsc::Receiver<LinkRequest>,
    pending: &AtomicUsize,
) {
    metrics::backend_error(name);
    for entry in inflight.drain(..) {
        deliver(entry, connection_error_reply(), pending);
    }
    drain_channel(rx, pending);
    debug!(backend = %name, "backend link closed after error");
}

fn drain_channel(rx: &mut mpsc::Receiver<LinkRequest>, pending: &AtomicUsize) {
    rx.close();
    while let Ok(request) = rx.try_recv() {
        deliver(
            Inflight {
                respond_to: request.respond_to,
                counted: true,
            },
            connection_error_reply(),
            pending,
        );
    }
}
