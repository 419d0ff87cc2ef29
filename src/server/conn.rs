//! Per-connection threads.
//!
//! Each socket gets a reader thread (sniffing, then blocking frame reads)
//! and a session thread (handshake state machine, dispatch, outbound drain,
//! heartbeats, throughput samples). The session thread is the only writer
//! of its socket; everything else reaches it through the publisher queue.

use std::io::{Cursor, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;

use crate::cluster::context::ClusterContext;
use crate::core::{ConnId, ErrorCode, ErrorPayload};
use crate::net::frame::{FRAME_HEADER_LEN, FrameError, FrameReader, FrameWriter};
use crate::net::heartbeat::{HeartbeatDecision, HeartbeatTracker, now_ms};
use crate::net::proto::{NodeMessage, ProtoEncodeError, decode_envelope, encode_envelope, Envelope};
use crate::net::session::{ConnPhase, ConnRole, ConnectionPipeline, PipelineAction};
use crate::net::stats::{CloseReason, ThroughputSample};
use crate::net::wire::{Sniff, SniffingDecoder, WireFormat};

use super::event_loop::{LoopEvent, LoopHandle};

/// Everything a connection needs from the node, cloneable per accept.
#[derive(Clone)]
pub(crate) struct ConnShared {
    pub cluster: Arc<ClusterContext>,
    pub loop_handle: LoopHandle,
    pub shutdown: Arc<AtomicBool>,
}

/// Slot in the node-wide connection cap, released on drop.
pub(crate) struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub(crate) fn try_acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let mut current = active.load(Ordering::Acquire);
        loop {
            if current >= max {
                return None;
            }
            match active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Self {
                        active: Arc::clone(active),
                    });
                }
                Err(next) => current = next,
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "active connection counter underflow");
    }
}

enum ReaderEvent {
    Wire(WireFormat),
    Frame(Vec<u8>),
    Eof,
    Failed(ReaderFailure),
}

enum ReaderFailure {
    /// Peer closed before enough bytes arrived to classify the stream.
    UnclassifiedEof,
    Unrecognized { at: usize, byte: u8 },
    Frame(FrameError),
    Io(std::io::Error),
}

impl ReaderFailure {
    fn close_reason(self) -> CloseReason {
        match self {
            ReaderFailure::UnclassifiedEof => CloseReason::Protocol(ErrorPayload::new(
                ErrorCode::MalformedPayload,
                "connection closed before the format marker completed",
                false,
            )),
            ReaderFailure::Unrecognized { at, byte } => CloseReason::Protocol(ErrorPayload::new(
                ErrorCode::MalformedPayload,
                format!("unclassifiable format marker: byte {byte:#04x} at offset {at}"),
                false,
            )),
            ReaderFailure::Frame(FrameError::Io(err)) => CloseReason::Io(err.to_string()),
            ReaderFailure::Frame(err) => match err.as_error_payload() {
                Some(payload) => CloseReason::Protocol(payload),
                None => CloseReason::Io(err.to_string()),
            },
            ReaderFailure::Io(err) => CloseReason::Io(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
enum WriteFailure {
    #[error("encode: {0}")]
    Encode(#[from] ProtoEncodeError),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
}

/// Run one connection to completion. Spawns the reader thread and drives the
/// session loop on the current thread.
pub(crate) fn run_connection(
    stream: TcpStream,
    role: ConnRole,
    shared: ConnShared,
    conn_id: ConnId,
    _guard: Option<ConnectionGuard>,
) {
    let observer = shared.cluster.observer();
    if let Ok(addr) = stream.peer_addr() {
        observer.on_peer_resolved(&addr.ip().to_string(), addr.port());
    }

    let (publisher, queue) = crate::net::publisher_pair();
    let mut pipeline = match shared
        .cluster
        .build_pipeline(role, conn_id, publisher.clone())
    {
        Ok(pipeline) => pipeline,
        Err(err) => {
            tracing::warn!(conn = %conn_id, "connection setup failed: {err}");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    };

    if shared
        .loop_handle
        .send(LoopEvent::ConnOpened {
            conn: conn_id,
            publisher: publisher.clone(),
        })
        .is_err()
    {
        let _ = stream.shutdown(Shutdown::Both);
        return;
    }

    let reason = match connection_io(&stream, role, &shared, conn_id, &mut pipeline, queue) {
        Ok(reason) => reason,
        Err(err) => CloseReason::Io(err.to_string()),
    };

    pipeline.mark_closed();
    publisher.close();
    let _ = shared.loop_handle.send(LoopEvent::ConnClosed { conn: conn_id });
    let _ = stream.shutdown(Shutdown::Both);
    observer.on_connection_closed(&reason);
    tracing::debug!(conn = %conn_id, %reason, "connection finished");
}

/// Wire the reader thread and writer, then run the session loop.
fn connection_io(
    stream: &TcpStream,
    role: ConnRole,
    shared: &ConnShared,
    conn_id: ConnId,
    pipeline: &mut ConnectionPipeline,
    queue: crate::net::PublisherQueue,
) -> std::io::Result<CloseReason> {
    stream.set_nodelay(true)?;
    let limits = shared.cluster.limits().clone();
    let read_bytes = Arc::new(AtomicU64::new(0));

    let reader_stream = stream.try_clone()?;
    let (inbound_tx, inbound_rx) = unbounded();
    let reader_counter = Arc::clone(&read_bytes);
    let max_frame_bytes = limits.max_frame_bytes;
    let reader = std::thread::Builder::new()
        .name(format!("arbor-read-{}", conn_id.get()))
        .spawn(move || run_reader(reader_stream, role, inbound_tx, max_frame_bytes, reader_counter))?;

    let mut writer_stream = stream.try_clone()?;
    if role == ConnRole::Initiated {
        writer_stream.write_all(&shared.cluster.default_wire().marker())?;
    }
    let writer = FrameWriter::new(writer_stream, limits.max_frame_bytes);

    let reason = session_loop(
        SessionLoop {
            conn_id,
            role,
            shared,
            pipeline,
            queue,
            inbound_rx,
            writer,
            read_bytes,
        },
        &limits,
    );

    // Unblock the reader before joining it.
    let _ = stream.shutdown(Shutdown::Both);
    let _ = reader.join();
    Ok(reason)
}

struct SessionLoop<'a> {
    conn_id: ConnId,
    role: ConnRole,
    shared: &'a ConnShared,
    pipeline: &'a mut ConnectionPipeline,
    queue: crate::net::PublisherQueue,
    inbound_rx: Receiver<ReaderEvent>,
    writer: FrameWriter<TcpStream>,
    read_bytes: Arc<AtomicU64>,
}

fn session_loop(mut io: SessionLoop<'_>, limits: &crate::core::Limits) -> CloseReason {
    let mut wire = match io.role {
        ConnRole::Accepted => None,
        ConnRole::Initiated => Some(io.shared.cluster.default_wire()),
    };
    let interval_ms = io.shared.cluster.transport().heartbeat_interval_ms;
    let mut heartbeat =
        HeartbeatTracker::new(interval_ms, io.pipeline.ctx().heartbeat_timeout_ms(), now_ms());
    let mut pending_out: Vec<NodeMessage> = Vec::new();
    let mut session_ready = false;

    let mut written_bytes: u64 = 0;
    let mut polls: u64 = 0;
    let mut last_sample_ms = now_ms();
    let mut last_read_total: u64 = 0;
    let mut last_written_total: u64 = 0;

    if io.role == ConnRole::Initiated {
        let actions = io.pipeline.begin_handshake();
        if let Some(reason) = apply_actions(&mut io, actions, &mut wire, &mut heartbeat, &mut written_bytes)
        {
            return reason;
        }
    }

    loop {
        if io.shared.shutdown.load(Ordering::Relaxed) {
            return drain_and_finish(&mut io, wire, &mut heartbeat, &mut written_bytes);
        }

        let tick = crossbeam::channel::after(Duration::from_millis(limits.tick_ms));
        let mut actions: Vec<PipelineAction> = Vec::new();
        let mut close: Option<CloseReason> = None;

        crossbeam::select! {
            recv(io.inbound_rx) -> event => match event {
                Err(_) => close = Some(CloseReason::Io("reader thread stopped".into())),
                Ok(ReaderEvent::Wire(format)) => {
                    wire = Some(format);
                    actions = io.pipeline.on_wire_classified(format);
                }
                Ok(ReaderEvent::Frame(body)) => {
                    heartbeat.note_recv(now_ms());
                    match wire {
                        Some(format) => match decode_envelope(&body, format) {
                            Ok(envelope) => actions = io.pipeline.on_message(envelope.message),
                            Err(err) => {
                                actions = vec![PipelineAction::Close {
                                    error: Some(err.as_error_payload()),
                                }];
                            }
                        },
                        None => {
                            close = Some(CloseReason::Io(
                                "frame arrived before wire classification".into(),
                            ));
                        }
                    }
                }
                Ok(ReaderEvent::Eof) => close = Some(CloseReason::PeerClosed),
                Ok(ReaderEvent::Failed(failure)) => close = Some(failure.close_reason()),
            },
            recv(io.queue.receiver()) -> message => match message {
                Ok(message) => match wire {
                    Some(format) => match write_out(&mut io.writer, format, &message) {
                        Ok(n) => {
                            written_bytes += n as u64;
                            heartbeat.note_send(now_ms());
                        }
                        Err(err) => close = Some(CloseReason::Io(err.to_string())),
                    },
                    // Nothing can be serialized before the format is known.
                    None => pending_out.push(message),
                },
                Err(_) => close = Some(CloseReason::ShuttingDown),
            },
            recv(tick) -> _ => {}
        }
        polls += 1;

        if close.is_none()
            && let Some(reason) =
                apply_actions(&mut io, actions, &mut wire, &mut heartbeat, &mut written_bytes)
        {
            close = Some(reason);
        }
        if let Some(reason) = close {
            return reason;
        }

        // Handshake just completed: adopt the negotiated timeout, flush any
        // frames queued before the format was known, and tell the loop when
        // the session belongs to a cluster peer.
        if !session_ready && io.pipeline.phase() == ConnPhase::Dispatching {
            session_ready = true;
            heartbeat.set_timeout(io.pipeline.ctx().heartbeat_timeout_ms());
            if let Some(host) = io.pipeline.ctx().session().and_then(|s| s.host_id) {
                let _ = io.shared.loop_handle.send(LoopEvent::PeerBound {
                    conn: io.conn_id,
                    host,
                });
            }
        }
        if let Some(format) = wire
            && !pending_out.is_empty()
        {
            for message in std::mem::take(&mut pending_out) {
                if let Err(err) = write_out(&mut io.writer, format, &message) {
                    return CloseReason::Io(err.to_string());
                }
                heartbeat.note_send(now_ms());
            }
        }

        match heartbeat.poll(now_ms()) {
            Some(HeartbeatDecision::Close { idle_ms }) => {
                return CloseReason::HeartbeatExpired { idle_ms };
            }
            Some(HeartbeatDecision::Send(hb)) => {
                if session_ready && let Some(format) = wire {
                    match write_out(&mut io.writer, format, &NodeMessage::Heartbeat(hb)) {
                        Ok(n) => {
                            written_bytes += n as u64;
                            heartbeat.note_send(now_ms());
                        }
                        Err(err) => return CloseReason::Io(err.to_string()),
                    }
                }
            }
            None => {}
        }

        let now = now_ms();
        let elapsed = now.saturating_sub(last_sample_ms);
        if elapsed >= limits.stats_interval_ms && elapsed > 0 {
            let read_total = io.read_bytes.load(Ordering::Relaxed);
            let sample = ThroughputSample {
                write_bps: (written_bytes - last_written_total) * 1_000 / elapsed,
                read_bps: (read_total - last_read_total) * 1_000 / elapsed,
                polls_per_sec: polls * 1_000 / elapsed,
            };
            io.pipeline.ctx().observer().on_throughput_sample(&sample);
            last_sample_ms = now;
            last_read_total = read_total;
            last_written_total = written_bytes;
            polls = 0;
        }

        if io.queue.is_closed() {
            return drain_and_finish(&mut io, wire, &mut heartbeat, &mut written_bytes);
        }
    }
}

/// Execute pipeline actions; a returned reason ends the session.
fn apply_actions(
    io: &mut SessionLoop<'_>,
    actions: Vec<PipelineAction>,
    wire: &mut Option<WireFormat>,
    heartbeat: &mut HeartbeatTracker,
    written_bytes: &mut u64,
) -> Option<CloseReason> {
    // A handshake may have re-bound the wire format; adopt it before
    // serializing replies.
    if let Some(format) = io.pipeline.ctx().wire() {
        *wire = Some(format);
    }
    for action in actions {
        match action {
            PipelineAction::Send(message) => {
                let Some(format) = *wire else {
                    return Some(CloseReason::Io("send before wire classification".into()));
                };
                match write_out(&mut io.writer, format, &message) {
                    Ok(n) => {
                        *written_bytes += n as u64;
                        heartbeat.note_send(now_ms());
                    }
                    Err(err) => return Some(CloseReason::Io(err.to_string())),
                }
            }
            PipelineAction::Close { error } => {
                if let Some(payload) = &error
                    && let Some(format) = *wire
                {
                    let _ = write_out(
                        &mut io.writer,
                        format,
                        &NodeMessage::Error(payload.clone()),
                    );
                }
                return Some(match error {
                    Some(payload) => CloseReason::Protocol(payload),
                    None => CloseReason::PeerClosed,
                });
            }
        }
    }
    None
}

/// Close has begun: queued outbound frames drain, then the socket goes down.
fn drain_and_finish(
    io: &mut SessionLoop<'_>,
    wire: Option<WireFormat>,
    heartbeat: &mut HeartbeatTracker,
    written_bytes: &mut u64,
) -> CloseReason {
    if let Some(format) = wire {
        for message in io.queue.drain() {
            match write_out(&mut io.writer, format, &message) {
                Ok(n) => {
                    *written_bytes += n as u64;
                    heartbeat.note_send(now_ms());
                }
                Err(_) => break,
            }
        }
    }
    CloseReason::ShuttingDown
}

fn write_out(
    writer: &mut FrameWriter<TcpStream>,
    wire: WireFormat,
    message: &NodeMessage,
) -> Result<usize, WriteFailure> {
    let body = encode_envelope(&Envelope::new(message.clone()), wire)?;
    Ok(writer.write_frame(&body)?)
}

fn run_reader(
    stream: TcpStream,
    role: ConnRole,
    tx: Sender<ReaderEvent>,
    max_frame_bytes: usize,
    read_bytes: Arc<AtomicU64>,
) {
    let leftover = match role {
        ConnRole::Accepted => match sniff_stream(&stream, &read_bytes) {
            Ok((format, leftover)) => {
                if tx.send(ReaderEvent::Wire(format)).is_err() {
                    return;
                }
                leftover
            }
            Err(failure) => {
                let _ = tx.send(ReaderEvent::Failed(failure));
                return;
            }
        },
        ConnRole::Initiated => Vec::new(),
    };

    let mut reader = FrameReader::new(Cursor::new(leftover).chain(stream), max_frame_bytes);
    loop {
        match reader.read_next() {
            Ok(Some(body)) => {
                read_bytes.fetch_add((body.len() + FRAME_HEADER_LEN) as u64, Ordering::Relaxed);
                if tx.send(ReaderEvent::Frame(body)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = tx.send(ReaderEvent::Eof);
                return;
            }
            Err(err) => {
                let _ = tx.send(ReaderEvent::Failed(ReaderFailure::Frame(err)));
                return;
            }
        }
    }
}

/// Read until the format marker classifies. Returns the format and any bytes
/// that arrived beyond the marker, untouched.
fn sniff_stream(
    mut stream: &TcpStream,
    read_bytes: &AtomicU64,
) -> Result<(WireFormat, Vec<u8>), ReaderFailure> {
    let mut sniffer = SniffingDecoder::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => return Err(ReaderFailure::UnclassifiedEof),
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(ReaderFailure::Io(err)),
        };
        read_bytes.fetch_add(n as u64, Ordering::Relaxed);
        match sniffer.feed(&chunk[..n]) {
            Sniff::NeedMoreData => continue,
            Sniff::Classified { format } => return Ok((format, sniffer.into_remainder())),
            Sniff::Unrecognized { at, byte } => {
                return Err(ReaderFailure::Unrecognized { at, byte });
            }
        }
    }
}
