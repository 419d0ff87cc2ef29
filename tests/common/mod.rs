//! Shared wire-level test client and node fixtures.

use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor::cluster::ClusterContext;
use arbor::core::HostId;
use arbor::net::frame::{FrameError, FrameReader, encode_frame};
use arbor::net::proto::{Envelope, Header, NodeMessage, decode_envelope, encode_envelope};
use arbor::net::wire::WireFormat;
use arbor::tree::MemoryTree;
use arbor::{Limits, ServerEndpoint, TransportConfig};

pub const TEST_MAX_FRAME: usize = 4 * 1024 * 1024;

/// Start a node with default timings on an ephemeral port.
pub fn start_node(host: u8) -> (ServerEndpoint, u16, Arc<MemoryTree>) {
    start_node_with(host, |builder| builder)
}

/// Start a node, letting the test adjust the context builder.
pub fn start_node_with(
    host: u8,
    configure: impl FnOnce(arbor::ClusterContextBuilder) -> arbor::ClusterContextBuilder,
) -> (ServerEndpoint, u16, Arc<MemoryTree>) {
    let tree = Arc::new(MemoryTree::new(HostId::new(host).unwrap()));
    let builder = ClusterContext::builder().name(format!("node-{host}@test"));
    let cluster = Arc::new(configure(builder).build().unwrap());
    cluster.bind_tree(tree.clone()).unwrap();
    let mut endpoint = ServerEndpoint::new(cluster);
    let port = endpoint.start(0).unwrap();
    (endpoint, port, tree)
}

/// Short heartbeat timings for liveness tests.
pub fn fast_transport(interval_ms: u64) -> TransportConfig {
    TransportConfig {
        heartbeat_interval_ms: interval_ms,
        ..TransportConfig::default()
    }
}

pub fn small_limits(max_connections: usize) -> Limits {
    Limits {
        max_connections,
        ..Limits::default()
    }
}

/// Poll until `check` passes or the deadline expires.
pub fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

/// Raw wire client: writes the format marker itself and speaks framed
/// envelopes in one format.
pub struct TestClient {
    writer: TcpStream,
    reader: FrameReader<TcpStream>,
    wire: WireFormat,
}

impl TestClient {
    pub fn connect(port: u16, wire: WireFormat) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_nodelay(true).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut writer = stream.try_clone().unwrap();
        writer.write_all(&wire.marker()).unwrap();
        let reader = FrameReader::new(stream, TEST_MAX_FRAME);
        Self {
            writer,
            reader,
            wire,
        }
    }

    /// Connect without a valid marker; used for sniffing-failure tests.
    pub fn connect_raw(port: u16, first_bytes: &[u8]) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut writer = stream.try_clone().unwrap();
        writer.write_all(first_bytes).unwrap();
        stream
    }

    pub fn send(&mut self, message: NodeMessage) {
        let body = encode_envelope(&Envelope::new(message), self.wire).unwrap();
        let frame = encode_frame(&body, TEST_MAX_FRAME).unwrap();
        self.writer.write_all(&frame).unwrap();
    }

    /// Next frame, or `None` on a clean close.
    pub fn recv(&mut self) -> Option<NodeMessage> {
        match self.reader.read_next() {
            Ok(Some(body)) => Some(decode_envelope(&body, self.wire).unwrap().message),
            Ok(None) => None,
            Err(FrameError::Io(err)) => panic!("read failed: {err}"),
            Err(err) => panic!("frame error: {err}"),
        }
    }

    /// Next non-heartbeat frame, or `None` on a clean close.
    pub fn recv_business(&mut self) -> Option<NodeMessage> {
        loop {
            match self.recv() {
                Some(NodeMessage::Heartbeat(_)) => continue,
                other => return other,
            }
        }
    }

    /// Perform the header handshake and return the node's reply header.
    pub fn handshake(&mut self, name: &str, host_id: Option<HostId>) -> Header {
        self.send(NodeMessage::Header(Header {
            session_name: name.to_string(),
            host_id,
            wire: None,
            security_token: None,
            heartbeat_ms: None,
            nonce: 1,
        }));
        match self.recv_business() {
            Some(NodeMessage::Header(header)) => header,
            other => panic!("expected HEADER reply, got {other:?}"),
        }
    }
}
