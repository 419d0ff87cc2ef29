//! Server endpoint: accept loop, lifecycle, node-level operations.

pub mod conn;
pub mod dispatch;
pub mod event_loop;

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::cluster::context::{ClusterContext, ContextError};
use crate::cluster::hub::{ReplicationHub, RouteError};
use crate::cluster::map::{LogMap, ReplicatedMap};
use crate::core::{ChannelId, ConnId, DEFAULT_CHANNEL, ErrorCode, ErrorPayload, ReplicatedChange};
use crate::net::frame::FrameWriter;
use crate::net::proto::{Envelope, NodeMessage, encode_envelope};
use crate::net::session::{ConnRole, HandlerFactory};

use self::conn::{ConnShared, ConnectionGuard, run_connection};
use self::dispatch::NodeDispatcher;
use self::event_loop::{EventLoop, LoopEvent, LoopGone, LoopHandle};

pub use self::event_loop::LoopHandle as EventLoopHandle;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("failed to bind listening port: {0}")]
    Bind(#[source] std::io::Error),
    #[error("failed to start acceptor: {0}")]
    Accept(#[source] std::io::Error),
    #[error("endpoint already started")]
    AlreadyStarted,
    #[error("endpoint is not listening")]
    NotListening,
    #[error("failed to connect to peer {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("connection limit reached")]
    Overloaded,
    #[error("unknown channel id {0}")]
    UnknownChannel(ChannelId),
    #[error("replication hub is closed")]
    HubClosed,
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("event loop is gone")]
    LoopGone,
}

impl From<LoopGone> for EndpointError {
    fn from(_: LoopGone) -> Self {
        EndpointError::LoopGone
    }
}

impl From<RouteError> for EndpointError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::UnknownChannel(id) => EndpointError::UnknownChannel(id),
            RouteError::Closed => EndpointError::HubClosed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointState {
    Created,
    Starting,
    Listening,
    Stopping,
    Closed,
}

/// One node's server: owns the event loop, the acceptor, and through the
/// loop the replication hub and channel table.
///
/// Lifecycle: `Created → Starting → Listening → Stopping → Closed`. Close is
/// idempotent and tears down in order: channel provider, event loop,
/// connections.
pub struct ServerEndpoint {
    cluster: Arc<ClusterContext>,
    state: EndpointState,
    event_loop: Option<EventLoop>,
    acceptor: Option<AcceptorHandle>,
    bound_port: Option<u16>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    next_conn_id: Arc<AtomicU64>,
}

struct AcceptorHandle {
    join: JoinHandle<()>,
}

impl ServerEndpoint {
    pub fn new(cluster: Arc<ClusterContext>) -> Self {
        Self {
            cluster,
            state: EndpointState::Created,
            event_loop: None,
            acceptor: None,
            bound_port: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            next_conn_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    /// Realized listening port once `Listening`.
    pub fn port(&self) -> Option<u16> {
        self.bound_port
    }

    /// Bring the node up and return the realized listening port (`port` 0
    /// requests an ephemeral one). A bind failure is fatal and synchronous.
    pub fn start(&mut self, port: u16) -> Result<u16, EndpointError> {
        if self.state != EndpointState::Created {
            return Err(EndpointError::AlreadyStarted);
        }
        self.state = EndpointState::Starting;

        let host = match self.cluster.host_id() {
            Ok(host) => host,
            Err(err) => {
                self.state = EndpointState::Created;
                return Err(err.into());
            }
        };

        let mut hub = ReplicationHub::new(
            host,
            self.cluster.transport().clone(),
            self.cluster.limits().clone(),
        );
        hub.create_channel(DEFAULT_CHANNEL, Box::new(LogMap::new()));
        let event_loop = EventLoop::spawn(hub);

        // The dispatch delegate for every handshaken connection combines the
        // channel table (via the loop), the hub, and this node's identity.
        let tree = match self.cluster.tree() {
            Ok(tree) => tree,
            Err(err) => {
                self.state = EndpointState::Created;
                return Err(err.into());
            }
        };
        let loop_handle = event_loop.handle();
        let factory_handle = loop_handle.clone();
        let factory: HandlerFactory = Arc::new(move |_details, conn| {
            Box::new(NodeDispatcher::new(
                Arc::clone(&tree),
                factory_handle.clone(),
                conn,
            ))
        });
        self.cluster.install_handler_factory(factory);

        let listener = match TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => listener,
            Err(err) => {
                self.state = EndpointState::Created;
                return Err(EndpointError::Bind(err));
            }
        };
        let realized = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(err) => {
                self.state = EndpointState::Created;
                return Err(EndpointError::Bind(err));
            }
        };

        let runtime = AcceptorRuntime {
            shared: ConnShared {
                cluster: Arc::clone(&self.cluster),
                loop_handle,
                shutdown: Arc::clone(&self.shutdown),
            },
            active: Arc::clone(&self.active),
            next_conn_id: Arc::clone(&self.next_conn_id),
        };
        let join = match std::thread::Builder::new()
            .name("arbor-accept".into())
            .spawn(move || run_accept_loop(listener, runtime))
        {
            Ok(join) => join,
            Err(err) => {
                self.state = EndpointState::Created;
                return Err(EndpointError::Accept(err));
            }
        };

        self.event_loop = Some(event_loop);
        self.acceptor = Some(AcceptorHandle { join });
        self.bound_port = Some(realized);
        self.state = EndpointState::Listening;
        tracing::info!(port = realized, host = %host, "endpoint listening");
        Ok(realized)
    }

    /// Open a replication connection to another cluster node.
    pub fn connect_peer(&self, addr: &str) -> Result<ConnId, EndpointError> {
        if self.state != EndpointState::Listening {
            return Err(EndpointError::NotListening);
        }
        let event_loop = self.event_loop.as_ref().ok_or(EndpointError::NotListening)?;
        let stream = TcpStream::connect(addr).map_err(|source| EndpointError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        let guard = ConnectionGuard::try_acquire(&self.active, self.cluster.limits().max_connections)
            .ok_or(EndpointError::Overloaded)?;
        let conn_id = self.allocate_conn_id();
        let shared = ConnShared {
            cluster: Arc::clone(&self.cluster),
            loop_handle: event_loop.handle(),
            shutdown: Arc::clone(&self.shutdown),
        };
        let _ = std::thread::Builder::new()
            .name(format!("arbor-conn-{}", conn_id.get()))
            .spawn(move || run_connection(stream, ConnRole::Initiated, shared, conn_id, Some(guard)));
        Ok(conn_id)
    }

    /// Provision a channel with its replicated map before traffic may
    /// reference it. Idempotent per id.
    pub fn create_channel(
        &self,
        id: ChannelId,
        map: Box<dyn ReplicatedMap>,
    ) -> Result<(), EndpointError> {
        self.loop_handle()?.request(|respond| LoopEvent::CreateChannel {
            channel: id,
            map,
            respond,
        })?;
        Ok(())
    }

    /// Record a locally produced change and fan it out to peers.
    pub fn publish(&self, id: ChannelId, payload: Bytes) -> Result<ReplicatedChange, EndpointError> {
        let result = self.loop_handle()?.request(|respond| LoopEvent::PublishLocal {
            channel: id,
            payload,
            respond,
        })?;
        Ok(result?)
    }

    /// Current state of a channel's replicated map.
    pub fn map_snapshot(&self, id: ChannelId) -> Result<Vec<ReplicatedChange>, EndpointError> {
        let snapshot = self
            .loop_handle()?
            .request(|respond| LoopEvent::Snapshot { channel: id, respond })?;
        snapshot.ok_or(EndpointError::UnknownChannel(id))
    }

    pub fn stop(&mut self) {
        self.close();
    }

    /// Idempotent teardown: channel provider first (queued replication
    /// writes drain, new ones are rejected), then the event loop, which
    /// closes every connection.
    pub fn close(&mut self) {
        if matches!(self.state, EndpointState::Closed) {
            return;
        }
        self.state = EndpointState::Stopping;

        if let Some(event_loop) = &self.event_loop {
            let _ = event_loop
                .handle()
                .request(|respond| LoopEvent::CloseProvider { respond });
        }

        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join.join();
        }
        if let Some(mut event_loop) = self.event_loop.take() {
            event_loop.stop();
        }

        self.state = EndpointState::Closed;
        tracing::info!("endpoint closed");
    }

    fn loop_handle(&self) -> Result<LoopHandle, EndpointError> {
        match self.state {
            EndpointState::Listening | EndpointState::Stopping => {}
            _ => return Err(EndpointError::NotListening),
        }
        self.event_loop
            .as_ref()
            .map(|event_loop| event_loop.handle())
            .ok_or(EndpointError::NotListening)
    }

    fn allocate_conn_id(&self) -> ConnId {
        ConnId::new(self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl Drop for ServerEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

struct AcceptorRuntime {
    shared: ConnShared,
    active: Arc<AtomicUsize>,
    next_conn_id: Arc<AtomicU64>,
}

fn run_accept_loop(listener: TcpListener, runtime: AcceptorRuntime) {
    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!("acceptor failed to set nonblocking: {err}");
        return;
    }
    let limits = runtime.shared.cluster.limits().clone();
    let retry = Duration::from_millis(limits.accept_retry_ms);

    loop {
        if runtime.shared.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                let _ = stream.set_nonblocking(false);
                match ConnectionGuard::try_acquire(&runtime.active, limits.max_connections) {
                    Some(guard) => {
                        let conn_id =
                            ConnId::new(runtime.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1);
                        let shared = runtime.shared.clone();
                        tracing::debug!(conn = %conn_id, %addr, "accepted connection");
                        let _ = std::thread::Builder::new()
                            .name(format!("arbor-conn-{}", conn_id.get()))
                            .spawn(move || {
                                run_connection(
                                    stream,
                                    ConnRole::Accepted,
                                    shared,
                                    conn_id,
                                    Some(guard),
                                )
                            });
                    }
                    None => {
                        tracing::warn!(%addr, "connection limit reached; rejecting");
                        send_overloaded(stream, &runtime.shared);
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(retry);
            }
            Err(err) => {
                tracing::warn!("accept error: {err}");
                std::thread::sleep(retry);
            }
        }
    }
}

/// Best effort: the peer has not sniffed us, so answer in the node default
/// wire and drop the socket.
fn send_overloaded(stream: TcpStream, shared: &ConnShared) {
    let _ = stream.set_nodelay(true);
    let payload = ErrorPayload::new(ErrorCode::Overloaded, "connection limit reached", true);
    let envelope = Envelope::new(NodeMessage::Error(payload));
    if let Ok(body) = encode_envelope(&envelope, shared.cluster.default_wire()) {
        let mut writer = FrameWriter::new(stream, shared.cluster.limits().max_frame_bytes);
        let _ = writer.write_frame(&body);
    }
}
