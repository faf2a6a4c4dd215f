//! The single-reactor multiplexer.
//!
//! There is no raw `epoll`/`kqueue` facility here: one Tokio task (the
//! "reactor task") owns the [`Registry`] and is its only writer, so no lock
//! is needed since no other task ever observes these structures directly;
//! the guarantee is reproduced via message-passing instead of shared memory.
//! Every accepted socket gets its own spawned connection task that performs
//! the handshake read locally (stateless parsing only) and then asks the
//! reactor task to make the registry-dependent decision over a `oneshot`
//! reply channel, the same pattern used elsewhere in this crate for a
//! central task answering individual requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Socket, TcpKeepalive, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::codec::{gga_checksum_valid, gga_position};
use crate::config::CasterConfig;
use crate::connection::{ConnId, ConnIdGenerator, ConnState};
use crate::error::CasterError;
use crate::handshake::{parse_request, ParsedRequest, PublisherRequest, SubscriberRequest};
use crate::registry::Registry;

/// Messages sent from connection tasks to the reactor task. Every variant
/// corresponds to one registry-dependent decision the reactor task alone
/// is allowed to make.
enum ReactorMsg {
    RegisterPublisher {
        conn_id: ConnId,
        req: PublisherRequest,
        reply: oneshot::Sender<Result<(), CasterError>>,
    },
    AttachSubscriber {
        conn_id: ConnId,
        name: String,
        auth: Option<(String, String)>,
        position: Option<(f64, f64)>,
        sender: mpsc::Sender<Arc<[u8]>>,
        reply: oneshot::Sender<SubscriberOutcome>,
    },
    Forward {
        publisher_id: ConnId,
        data: Arc<[u8]>,
    },
    SourceTable {
        reply: oneshot::Sender<String>,
    },
    Disconnect {
        conn_id: ConnId,
    },
}

/// Outcome of a subscriber attach attempt, already folding in the `auto`
/// nearest-mount resolution and the no-`Authorization`-header source-table
/// carve-out. `Rejected` carries the specific [`CasterError`] so the
/// connection task can pick the matching status line.
enum SubscriberOutcome {
    Attached(String),
    SourceTable(String),
    Rejected(CasterError),
}

/// A running caster instance. Dropping this without calling [`stop`] leaves
/// the reactor task running in the background; call `stop` for an orderly
/// shutdown.
///
/// [`stop`]: CasterHandle::stop
pub struct CasterHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl CasterHandle {
    /// The address the listener actually bound to (useful when the
    /// configured port was `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Idempotent orderly shutdown: stop accepting, close every publisher
    /// and subscriber, close the listener, and join the reactor task.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "reactor task did not join cleanly");
        }
    }
}

/// Entry point for the caster reactor.
pub struct Caster;

impl Caster {
    /// Bind the listener and hand control of the reactor loop to a
    /// dedicated background task, returning immediately with a handle.
    /// Must be called from within a Tokio runtime.
    pub fn start(cfg: CasterConfig) -> Result<CasterHandle, CasterError> {
        let listener = bind_listener(&cfg)?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let ids = Arc::new(ConnIdGenerator::new());
        let cfg = Arc::new(cfg);

        info!(addr = %local_addr, "ntrip caster listening");

        let join = tokio::spawn(reactor_loop(listener, cfg, ids, msg_tx, msg_rx, shutdown_rx));

        Ok(CasterHandle { shutdown: shutdown_tx, join, local_addr })
    }
}

/// Build the listening socket with the configured backlog via `socket2`,
/// since `TcpListener::bind` does not expose one.
fn bind_listener(cfg: &CasterConfig) -> Result<TcpListener, CasterError> {
    let addr: SocketAddr = cfg
        .bind_addr()
        .parse()
        .map_err(|e| CasterError::Parse(format!("invalid bind address: {e}")))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(cfg.backlog as i32)?;

    TcpListener::from_std(socket.into()).map_err(CasterError::from)
}

/// Apply the keepalive parameters required of every accepted connection
/// (idle 30s, interval 5s, count 3).
fn apply_keepalive(stream: &TcpStream, cfg: &CasterConfig) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(cfg.keepalive_idle())
        .with_interval(cfg.keepalive_interval())
        .with_retries(cfg.keepalive_retries());
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

async fn reactor_loop(
    listener: TcpListener,
    cfg: Arc<CasterConfig>,
    ids: Arc<ConnIdGenerator>,
    msg_tx: mpsc::UnboundedSender<ReactorMsg>,
    mut msg_rx: mpsc::UnboundedReceiver<ReactorMsg>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut registry = Registry::new();
    let mut roles: HashMap<ConnId, ConnState> = HashMap::new();
    let mut conn_tasks: HashMap<ConnId, AbortHandle> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let conn_id = ids.next();
                        if let Err(e) = apply_keepalive(&stream, &cfg) {
                            warn!(%conn_id, error = %e, "failed to configure TCP keepalive");
                        }
                        roles.insert(conn_id, ConnState::Accepted);
                        debug!(%conn_id, %peer, "accepted connection");

                        let task_cfg = cfg.clone();
                        let task_tx = msg_tx.clone();
                        let handle = tokio::spawn(async move {
                            run_connection(conn_id, stream, task_cfg, task_tx).await;
                        });
                        conn_tasks.insert(conn_id, handle.abort_handle());
                    },
                    Err(e) => error!(error = %e, "accept failed"),
                }
            }

            msg = msg_rx.recv() => {
                let Some(msg) = msg else { break };
                handle_msg(&mut registry, &mut roles, &mut conn_tasks, msg);
            }
        }
    }

    for (_, handle) in conn_tasks.drain() {
        handle.abort();
    }
    info!(mounts = registry.mount_count(), "ntrip caster reactor stopped");
}

fn handle_msg(
    registry: &mut Registry,
    roles: &mut HashMap<ConnId, ConnState>,
    conn_tasks: &mut HashMap<ConnId, AbortHandle>,
    msg: ReactorMsg,
) {
    match msg {
        ReactorMsg::RegisterPublisher { conn_id, req, reply } => {
            let name = req.name.clone();
            let result = registry.add_mount(
                req.name,
                req.username,
                req.password,
                req.position,
                req.advertisement,
                conn_id,
            );
            match &result {
                Ok(()) => {
                    info!(%conn_id, mount = %name, "publisher registered");
                    roles.insert(conn_id, ConnState::Publisher(name));
                },
                Err(e) => warn!(%conn_id, mount = %name, error = %e, "publisher registration rejected"),
            }
            let _ = reply.send(result);
        },

        ReactorMsg::AttachSubscriber { conn_id, name, auth, position, sender, reply } => {
            let outcome = attach_subscriber(registry, conn_id, &name, auth, position, sender);
            match &outcome {
                SubscriberOutcome::Attached(resolved) => {
                    roles.insert(conn_id, ConnState::Subscriber(resolved.clone()));
                    info!(%conn_id, mount = %resolved, "subscriber attached");
                },
                SubscriberOutcome::Rejected(e) => {
                    debug!(%conn_id, mount = %name, error = %e, "subscriber rejected");
                },
                SubscriberOutcome::SourceTable(_) => {
                    debug!(%conn_id, mount = %name, "unknown mount with no credentials, serving source table");
                },
            }
            let _ = reply.send(outcome);
        },

        ReactorMsg::Forward { publisher_id, data } => {
            if let Some(ConnState::Publisher(name)) = roles.get(&publisher_id) {
                if let Some(mount) = registry.get(name) {
                    for (sub_id, sender) in mount.subscribers.iter() {
                        match sender.try_send(data.clone()) {
                            Ok(()) => {},
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                warn!(publisher = %publisher_id, subscriber = %sub_id, "subscriber channel full, dropping slice");
                            },
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                debug!(publisher = %publisher_id, subscriber = %sub_id, "subscriber channel already closed");
                            },
                        }
                    }
                }
            }
        },

        ReactorMsg::SourceTable { reply } => {
            let _ = reply.send(registry.source_table_text());
        },

        ReactorMsg::Disconnect { conn_id } => {
            conn_tasks.remove(&conn_id);
            match roles.remove(&conn_id) {
                Some(ConnState::Publisher(name)) => {
                    if let Some(mount) = registry.remove_mount(conn_id) {
                        info!(%conn_id, mount = %name, subscribers = mount.subscribers.len(), "publisher disconnected, mount torn down");
                        for sub_id in mount.subscribers.keys() {
                            roles.remove(sub_id);
                            conn_tasks.remove(sub_id);
                        }
                    }
                },
                Some(ConnState::Subscriber(name)) => {
                    registry.detach_subscriber(conn_id);
                    debug!(%conn_id, mount = %name, "subscriber disconnected");
                },
                Some(ConnState::Accepted) | None => {},
            }
        },
    }
}

/// The registry-dependent half of subscriber handshake handling: resolves
/// `auto` to a concrete mount, then authenticates, folding in the
/// source-table carve-out for a missing mount with no `Authorization`
/// header at all.
fn attach_subscriber(
    registry: &mut Registry,
    conn_id: ConnId,
    name: &str,
    auth: Option<(String, String)>,
    position: Option<(f64, f64)>,
    sender: mpsc::Sender<Arc<[u8]>>,
) -> SubscriberOutcome {
    let resolved = if name == "auto" {
        let Some(pos) = position else {
            return SubscriberOutcome::Rejected(CasterError::MissingPosition);
        };
        match registry.nearest(pos) {
            Some(n) => n.to_string(),
            None => return SubscriberOutcome::Rejected(CasterError::NoCandidate),
        }
    } else {
        name.to_string()
    };

    let Some((user, pass)) = auth else {
        return if registry.get(&resolved).is_none() {
            SubscriberOutcome::SourceTable(registry.source_table_text())
        } else {
            SubscriberOutcome::Rejected(CasterError::Auth)
        };
    };

    match registry.attach_subscriber(&resolved, &user, &pass, conn_id, sender) {
        Ok(()) => SubscriberOutcome::Attached(resolved),
        Err(e) => SubscriberOutcome::Rejected(e),
    }
}

async fn run_connection(
    conn_id: ConnId,
    mut stream: TcpStream,
    cfg: Arc<CasterConfig>,
    tx: mpsc::UnboundedSender<ReactorMsg>,
) {
    let mut buf = vec![0u8; cfg.read_buffer_size];
    let n = match stream.read(&mut buf).await {
        Ok(0) => {
            debug!(%conn_id, "peer closed before sending a request");
            return;
        },
        Ok(n) => n,
        Err(e) => {
            debug!(%conn_id, error = %e, "handshake read error");
            return;
        },
    };
    buf.truncate(n);

    match parse_request(&buf) {
        Ok(ParsedRequest::Publisher(req)) => handle_publisher(conn_id, stream, req, cfg, tx).await,
        Ok(ParsedRequest::Subscriber(req)) => handle_subscriber(conn_id, stream, req, cfg, tx).await,
        Ok(ParsedRequest::SourceTable) => handle_source_table(stream, cfg, tx).await,
        Err(e) => {
            debug!(%conn_id, error = %e, "malformed handshake, rejecting");
            let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n").await;
        },
    }
}

async fn handle_publisher(
    conn_id: ConnId,
    mut stream: TcpStream,
    mut req: PublisherRequest,
    cfg: Arc<CasterConfig>,
    tx: mpsc::UnboundedSender<ReactorMsg>,
) {
    let name = req.name.clone();
    let trailing = std::mem::take(&mut req.trailing);

    let (reply_tx, reply_rx) = oneshot::channel();
    if tx.send(ReactorMsg::RegisterPublisher { conn_id, req, reply: reply_tx }).is_err() {
        return;
    }

    match reply_rx.await {
        Ok(Ok(())) => {},
        Ok(Err(_)) => {
            let _ = stream.write_all(b"ERROR - Bad Password\r\n").await;
            return;
        },
        Err(_) => return,
    }

    if stream.write_all(b"HTTP/1.1 200 OK\r\n").await.is_err() {
        let _ = tx.send(ReactorMsg::Disconnect { conn_id });
        return;
    }

    info!(%conn_id, mount = %name, "publisher streaming");

    if !trailing.is_empty()
        && tx
            .send(ReactorMsg::Forward { publisher_id: conn_id, data: Arc::from(trailing) })
            .is_err()
    {
        return;
    }

    let mut buf = vec![0u8; cfg.read_buffer_size];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data: Arc<[u8]> = Arc::from(&buf[..n]);
                if tx.send(ReactorMsg::Forward { publisher_id: conn_id, data }).is_err() {
                    break;
                }
            },
        }
    }

    debug!(%conn_id, mount = %name, "publisher socket closed");
    let _ = tx.send(ReactorMsg::Disconnect { conn_id });
}

async fn handle_subscriber(
    conn_id: ConnId,
    mut stream: TcpStream,
    req: SubscriberRequest,
    cfg: Arc<CasterConfig>,
    tx: mpsc::UnboundedSender<ReactorMsg>,
) {
    if req.name == "auto" && req.position.is_none() {
        let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n").await;
        return;
    }

    let (sender, receiver) = mpsc::channel::<Arc<[u8]>>(cfg.subscriber_channel_capacity);
    let (reply_tx, reply_rx) = oneshot::channel();
    let sent = tx.send(ReactorMsg::AttachSubscriber {
        conn_id,
        name: req.name.clone(),
        auth: req.auth,
        position: req.position,
        sender,
        reply: reply_tx,
    });
    if sent.is_err() {
        return;
    }

    let Ok(outcome) = reply_rx.await else { return };

    match outcome {
        SubscriberOutcome::Attached(mount) => {
            let status: &[u8] = if req.legacy { b"ICY 200 OK\r\n" } else { b"HTTP/1.1 200 OK\r\n" };
            if stream.write_all(status).await.is_err() {
                let _ = tx.send(ReactorMsg::Disconnect { conn_id });
                return;
            }
            info!(%conn_id, mount = %mount, "subscriber streaming");
            forward_to_subscriber(conn_id, stream, receiver, tx).await;
        },
        SubscriberOutcome::SourceTable(text) => {
            write_source_table(&mut stream, &cfg, &text).await;
        },
        SubscriberOutcome::Rejected(err) => {
            let status: &[u8] = match err {
                CasterError::MissingPosition => b"HTTP/1.1 400 Bad Request\r\n",
                CasterError::NoCandidate => b"HTTP/1.1 503 Service Unavailable\r\n",
                _ => b"HTTP/1.1 401 Unauthorized\r\n",
            };
            let _ = stream.write_all(status).await;
        },
    }
}

/// Drives one subscriber's data phase: write forwarded fan-out chunks as
/// they arrive, while also reading the socket for advisory GGA uplinks.
/// Either side closing ends the connection and reports the disconnect to
/// the reactor.
async fn forward_to_subscriber(
    conn_id: ConnId,
    stream: TcpStream,
    mut receiver: mpsc::Receiver<Arc<[u8]>>,
    tx: mpsc::UnboundedSender<ReactorMsg>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            chunk = receiver.recv() => {
                match chunk {
                    Some(data) => {
                        if write_half.write_all(&data).await.is_err() {
                            break;
                        }
                    },
                    None => break,
                }
            },
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => log_gga_uplink(conn_id, &buf[..n]),
                }
            },
        }
    }

    let _ = tx.send(ReactorMsg::Disconnect { conn_id });
}

/// Advisory-only: verify and log any `$GPGGA`/`$GNGGA` sentence a
/// subscriber streams uplink. Never migrates the subscriber: an
/// already-connected `auto` subscriber stays on its resolved mount.
fn log_gga_uplink(conn_id: ConnId, data: &[u8]) {
    let Ok(text) = std::str::from_utf8(data) else { return };
    for line in text.split_terminator("\r\n") {
        if !(line.starts_with("$GPGGA,") || line.starts_with("$GNGGA,")) {
            continue;
        }
        match gga_checksum_valid(line) {
            Ok(true) => match gga_position(line) {
                Ok((lat, lon)) => debug!(%conn_id, lat, lon, "subscriber GGA uplink (advisory)"),
                Err(e) => debug!(%conn_id, error = %e, "GGA uplink position parse failed"),
            },
            Ok(false) => warn!(%conn_id, "GGA uplink checksum mismatch, discarding"),
            Err(e) => debug!(%conn_id, error = %e, "GGA uplink malformed"),
        }
    }
}

async fn handle_source_table(mut stream: TcpStream, cfg: Arc<CasterConfig>, tx: mpsc::UnboundedSender<ReactorMsg>) {
    let (reply_tx, reply_rx) = oneshot::channel();
    if tx.send(ReactorMsg::SourceTable { reply: reply_tx }).is_err() {
        return;
    }
    let Ok(text) = reply_rx.await else { return };
    write_source_table(&mut stream, &cfg, &text).await;
}

/// Source-table wire format, verbatim down to field order and line endings.
async fn write_source_table(stream: &mut TcpStream, cfg: &CasterConfig, text: &str) {
    let now = chrono::Local::now().format("%m/%d/%y %H:%M:%S %Z");
    let body = format!(
        "SOURCETABLE 200 OK\r\nServer: {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nDate: {now}\r\n\r\n{text}ENDSOURCETABLE\r\n",
        cfg.agent,
        text.len(),
    );
    if let Err(e) = stream.write_all(body.as_bytes()).await {
        warn!(error = %e, "failed to send source table");
    }
}
