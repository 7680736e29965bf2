use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, span, trace, warn, Level};
use uuid::Uuid;

use crate::config::MessengerConfig;
use crate::connection::ConnectionState;
use crate::delay_queue::DelayedDelivery;
use crate::frame::{self, features, MessageFooter, MessageHeader, Tag};
use crate::handshake;
use crate::message::{prio, Message};
use crate::messenger::{Messenger, Policy};
use crate::node_addr::NodeAddr;
use crate::safe_converter::SafeCast;
use crate::throttle::ThrottleToken;

pub(crate) const PAGE_SIZE: usize = 4096;

/// Randomized initial sequence numbers are capped at 2^31 so they stay far from wrap.
const SEQ_MASK: u64 = 0x7fff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Accepting,
    Connecting,
    Open,
    Standby,
    Wait,
    Closing,
    Closed,
}

/// Reader-side socket handle: one half of the stream plus the abort signal that
///  `shutdown_socket` fires.
pub(crate) struct ReaderIo {
    pub half: OwnedReadHalf,
    pub abort: watch::Receiver<bool>,
}

/// Writer-side socket handle.
pub(crate) struct WriterIo {
    pub half: OwnedWriteHalf,
    pub abort: watch::Receiver<bool>,
}

pub(crate) enum ReaderInit {
    /// Server side: run the accept handshake on this freshly accepted socket first.
    Accept(TcpStream),
    /// Client side: the connect handshake already succeeded, start reading.
    Open(ReaderIo),
}

/// All mutable pipe state guarded by the pipe lock.
pub(crate) struct PipeCore {
    pub state: PipeState,
    pub policy: Policy,
    pub peer_addr: NodeAddr,
    pub peer_type: u32,

    pub connect_seq: u32,
    pub peer_global_seq: u32,
    pub out_seq: u64,
    pub in_seq: u64,
    pub in_seq_acked: u64,

    pub out_q: BTreeMap<i16, VecDeque<Message>>,
    pub sent: VecDeque<Message>,

    pub keepalive: bool,
    pub close_on_empty: bool,
    pub backoff: Duration,

    pub session_security: Option<crate::auth::SessionSecurity>,
    pub conn_id: u64,
    pub connection: Arc<ConnectionState>,
    pub delay_queue: Option<Arc<DelayedDelivery>>,

    pub reader_running: bool,
    pub writer_running: bool,
    pub reader_handle: Option<JoinHandle<()>>,
    pub writer_handle: Option<JoinHandle<()>>,

    /// Socket halves handed from the handshake to the worker that will own them.
    pub pending_writer: Option<WriterIo>,

    abort_tx: Option<watch::Sender<bool>>,
}

impl PipeCore {
    pub fn is_queued(&self) -> bool {
        self.out_q.values().any(|q| !q.is_empty())
    }

    pub fn queue_message(&mut self, msg: Message) {
        self.out_q.entry(msg.priority).or_default().push_back(msg);
    }

    /// Head of the highest-priority non-empty bucket; ties within a bucket drain in
    ///  insertion order.
    pub fn next_outgoing(&mut self) -> Option<Message> {
        loop {
            let (&priority, queue) = self.out_q.iter_mut().next_back()?;
            match queue.pop_front() {
                Some(m) => return Some(m),
                None => {
                    self.out_q.remove(&priority);
                }
            }
        }
    }

    /// Trim the acknowledged prefix off `sent`. Returns true when the pipe should stop
    ///  because the last pending ack arrived and `close_on_empty` is set.
    pub fn handle_ack(&mut self, seq: u64) -> bool {
        trace!("got ack seq {}", seq);
        while let Some(m) = self.sent.front() {
            if m.seq() > seq {
                break;
            }
            trace!("ack {} covers {:?}", seq, m);
            self.sent.pop_front();
        }
        self.sent.is_empty() && self.close_on_empty
    }

    /// Move everything awaiting an ack back to the head of the highest-priority bucket,
    ///  rolling `out_seq` back so the writer reassigns the exact same sequence numbers.
    pub fn requeue_sent(&mut self) {
        if self.sent.is_empty() {
            return;
        }
        let rq = self.out_q.entry(prio::HIGHEST).or_default();
        while let Some(m) = self.sent.pop_back() {
            trace!("requeueing {:?} for resend", m);
            rq.push_front(m);
            self.out_seq -= 1;
        }
    }

    /// Drop requeued messages the peer has already seen (their assigned seq is in
    ///  `(0, seq]`), advancing `out_seq` past each so numbering stays contiguous.
    pub fn discard_requeued_up_to(&mut self, seq: u64) {
        let Some(rq) = self.out_q.get_mut(&prio::HIGHEST) else {
            return;
        };
        while let Some(m) = rq.front() {
            if m.seq() == 0 || m.seq() > seq {
                break;
            }
            trace!("peer already acked {:?}, discarding", m);
            rq.pop_front();
            self.out_seq += 1;
        }
        if rq.is_empty() {
            self.out_q.remove(&prio::HIGHEST);
        }
    }

    pub fn discard_out_queue(&mut self) {
        self.sent.clear();
        self.out_q.clear();
    }

    pub fn randomize_out_seq(&mut self) {
        if self.connection.has_feature(features::MSG_AUTH) {
            // unpredictable sequence numbers so signed CRCs are not guessable
            self.out_seq = rand::thread_rng().gen::<u64>() & SEQ_MASK;
            trace!("randomized out_seq to {}", self.out_seq);
        } else {
            self.out_seq = 0;
        }
    }

    /// Install a fresh abort channel for the next socket generation. Receivers of the
    ///  previous generation observe the sender drop and abort.
    pub fn new_abort(&mut self) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.abort_tx = Some(tx);
        rx
    }

    /// Wake any worker blocked on this pipe's socket.
    pub fn shutdown_socket(&mut self) {
        if let Some(tx) = &self.abort_tx {
            let _ = tx.send(true);
        }
    }
}

/// A per-peer bidirectional connection: handshake, framing, sequencing, reconnect.
///
/// Owned by the messenger registry while registered; runs one reader and one writer task.
pub struct Pipe {
    pub(crate) msgr: Weak<Messenger>,
    pub(crate) config: Arc<MessengerConfig>,
    pub(crate) core: Mutex<PipeCore>,
    pub(crate) cond: Notify,
    pub(crate) state_closed: AtomicBool,
}

impl Pipe {
    pub(crate) fn new(
        msgr: &Arc<Messenger>,
        state: PipeState,
        policy: Policy,
        peer_addr: NodeAddr,
        peer_type: u32,
    ) -> Arc<Pipe> {
        let connection = Arc::new(ConnectionState::new(peer_addr, peer_type));
        let pipe = Arc::new(Pipe {
            msgr: Arc::downgrade(msgr),
            config: msgr.config().clone(),
            core: Mutex::new(PipeCore {
                state,
                policy,
                peer_addr,
                peer_type,
                connect_seq: 0,
                peer_global_seq: 0,
                out_seq: 0,
                in_seq: 0,
                in_seq_acked: 0,
                out_q: BTreeMap::new(),
                sent: VecDeque::new(),
                keepalive: false,
                close_on_empty: false,
                backoff: Duration::ZERO,
                session_security: None,
                conn_id: msgr.next_conn_id(),
                connection: connection.clone(),
                delay_queue: None,
                reader_running: false,
                writer_running: false,
                reader_handle: None,
                writer_handle: None,
                pending_writer: None,
                abort_tx: None,
            }),
            cond: Notify::new(),
            state_closed: AtomicBool::new(false),
        });
        connection.set_pipe(&pipe);
        pipe
    }

    pub(crate) async fn peer_addr(&self) -> NodeAddr {
        self.core.lock().await.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.state_closed.load(Ordering::Acquire)
    }

    pub(crate) async fn connection(&self) -> Arc<ConnectionState> {
        self.core.lock().await.connection.clone()
    }

    pub(crate) fn start_reader(self: &Arc<Self>, core: &mut PipeCore, init: ReaderInit) {
        assert!(!core.reader_running);
        core.reader_running = true;
        let pipe = self.clone();
        core.reader_handle = Some(tokio::spawn(async move { pipe.run_reader(init).await }));
    }

    pub(crate) fn start_writer(self: &Arc<Self>, core: &mut PipeCore) {
        assert!(!core.writer_running);
        core.writer_running = true;
        let pipe = self.clone();
        core.writer_handle = Some(tokio::spawn(async move { pipe.run_writer().await }));
    }

    pub(crate) async fn queue_message(&self, msg: Message) {
        let mut core = self.core.lock().await;
        trace!("queueing {:?} for {:?}", msg, core.peer_addr);
        core.queue_message(msg);
        self.cond.notify_waiters();
    }

    pub(crate) async fn send_keepalive(&self) {
        let mut core = self.core.lock().await;
        core.keepalive = true;
        self.cond.notify_waiters();
    }

    pub(crate) async fn set_close_on_empty(&self) {
        let mut core = self.core.lock().await;
        core.close_on_empty = true;
        self.cond.notify_waiters();
    }

    pub(crate) fn stop_locked(&self, core: &mut PipeCore) {
        debug!("stopping pipe to {:?}", core.peer_addr);
        core.state = PipeState::Closed;
        self.state_closed.store(true, Ordering::Release);
        self.cond.notify_waiters();
        core.shutdown_socket();
    }

    pub(crate) async fn stop(&self) {
        let mut core = self.core.lock().await;
        if core.state != PipeState::Closed {
            self.stop_locked(&mut core);
        }
    }

    /// Discard the peer's entire session: queued and in-flight messages in both directions
    ///  are dropped, counters reinitialize, the application hears `on_remote_reset`.
    pub(crate) async fn was_session_reset_locked(&self, core: &mut PipeCore) {
        debug!("session with {:?} was reset", core.peer_addr);
        if let Some(msgr) = self.msgr.upgrade() {
            msgr.dispatcher().discard_inbound(core.conn_id).await;
        }
        if let Some(delay) = &core.delay_queue {
            delay.discard();
        }
        core.discard_out_queue();

        if let Some(msgr) = self.msgr.upgrade() {
            msgr.dispatcher().on_remote_reset(core.connection.clone()).await;
        }

        core.randomize_out_seq();
        core.in_seq = 0;
        core.connect_seq = 0;
    }

    /// Transition after a transport error. Terminal for lossy pipes; otherwise requeues
    ///  unacknowledged messages and moves to STANDBY/CONNECTING, with doubling backoff while
    ///  already CONNECTING.
    pub(crate) async fn fault(self: &Arc<Self>, core: MutexGuard<'_, PipeCore>, onread: bool) {
        let mut core = core;
        self.cond.notify_waiters();

        if onread && core.state == PipeState::Connecting {
            trace!("fault on read while connecting, reader shutting down");
            return;
        }
        if matches!(core.state, PipeState::Closed | PipeState::Closing) {
            trace!("fault on closed/closing pipe, nothing to do");
            return;
        }

        core.shutdown_socket();

        if core.policy.lossy && core.state != PipeState::Connecting {
            debug!("fault on lossy channel to {:?}, failing permanently", core.peer_addr);
            self.terminal_fault(core).await;
            return;
        }

        // inbound messages parked for injection are delivered before the state changes
        if let Some(delay) = core.delay_queue.clone() {
            delay.flush().await;
        }

        core.requeue_sent();

        if core.policy.standby && !core.is_queued() {
            debug!("fault with nothing to send, going to standby");
            core.state = PipeState::Standby;
            return;
        }

        if core.state != PipeState::Connecting {
            if core.policy.server {
                debug!("fault, server, going to standby");
                core.state = PipeState::Standby;
            } else {
                debug!("fault, initiating reconnect to {:?}", core.peer_addr);
                core.connect_seq += 1;
                core.state = PipeState::Connecting;
            }
            core.backoff = Duration::ZERO;
        } else if core.backoff.is_zero() {
            core.backoff = next_backoff(Duration::ZERO, &self.config);
        } else {
            let wait = core.backoff;
            debug!("connect fault, waiting {:?} before retrying", wait);
            let notified = self.cond.notified();
            drop(core);
            let _ = tokio::time::timeout(wait, notified).await;

            let mut core = self.core.lock().await;
            core.backoff = next_backoff(wait, &self.config);
        }
    }

    /// Terminal teardown: stop, unregister, drop all queues, detach the connection and tell
    ///  the application. Used for lossy faults and non-retriable handshake failures.
    pub(crate) async fn terminal_fault(self: &Arc<Self>, core: MutexGuard<'_, PipeCore>) {
        let mut core = core;
        self.stop_locked(&mut core);

        let delay = core.delay_queue.clone();
        let connection = core.connection.clone();
        let conn_id = core.conn_id;
        core.discard_out_queue();
        drop(core);

        if let Some(msgr) = self.msgr.upgrade() {
            msgr.inject_internal_delay().await;
            msgr.unregister_pipe(self).await;
            msgr.dispatcher().discard_inbound(conn_id).await;
            if let Some(delay) = delay {
                delay.discard();
            }
            connection.clear_pipe(self);
            msgr.dispatcher().on_reset(connection).await;
        }
    }

    /// Create the delayed-delivery queue if delay injection is configured for this peer type.
    pub(crate) async fn maybe_start_delay_queue(self: &Arc<Self>) {
        let Some(msgr) = self.msgr.upgrade() else {
            return;
        };
        let mut core = self.core.lock().await;
        if core.delay_queue.is_none()
            && self.config.inject_delay_peer_types.contains(&core.peer_type)
        {
            debug!("setting up a delay queue for {:?}", core.peer_addr);
            core.delay_queue = Some(DelayedDelivery::spawn(
                msgr.dispatcher().clone(),
                core.conn_id,
            ));
        }
    }

    fn unlock_maybe_reap(self: &Arc<Self>, mut core: MutexGuard<'_, PipeCore>) {
        if !core.reader_running && !core.writer_running {
            core.shutdown_socket();
            drop(core);
            if let Some(msgr) = self.msgr.upgrade() {
                msgr.queue_reap(self.clone());
            }
        }
    }

    // ----------------------------------- reader ------------------------------------------

    pub(crate) async fn run_reader(self: Arc<Self>, init: ReaderInit) {
        let mut io: Option<ReaderIo> = match init {
            ReaderInit::Accept(stream) => handshake::accept(&self, stream).await,
            ReaderInit::Open(io) => Some(io),
        };

        loop {
            // a fired (or replaced) abort means this socket generation is dead; release the
            // half so the peer observes the close even while this worker idles
            if let Some(rio) = &io {
                if *rio.abort.borrow() || rio.abort.has_changed().is_err() {
                    io = None;
                }
            }

            let mut core = self.core.lock().await;
            match core.state {
                PipeState::Closed | PipeState::Connecting => break,
                PipeState::Standby => {
                    trace!("reader sleeping during standby");
                    let notified = self.cond.notified();
                    drop(core);
                    notified.await;
                    continue;
                }
                _ => {}
            }

            let Some(rio) = io.as_mut() else {
                // no socket although the pipe believes it is live
                self.fault(core, true).await;
                continue;
            };

            let connection = core.connection.clone();
            let delay_queue = core.delay_queue.clone();
            let session_security = core.session_security.clone();
            let policy = core.policy.clone();
            let conn_id = core.conn_id;
            drop(core);

            let mut tag_buf = [0u8; 1];
            if let Err(e) = self.read_wire(rio, &mut tag_buf).await {
                debug!("reader couldn't read tag: {}", e);
                io = None;
                let core = self.core.lock().await;
                self.fault(core, true).await;
                continue;
            }

            let tag = match frame::tag_from_byte(tag_buf[0]) {
                Ok(tag) => tag,
                Err(e) => {
                    warn!("reader got bad tag: {}", e);
                    io = None;
                    let core = self.core.lock().await;
                    self.fault(core, true).await;
                    continue;
                }
            };

            match tag {
                Tag::Keepalive => {
                    trace!("reader got KEEPALIVE");
                }
                Tag::Ack => {
                    let mut seq_buf = [0u8; 8];
                    let result = self.read_wire(rio, &mut seq_buf).await;
                    let mut core = self.core.lock().await;
                    match result {
                        Err(e) => {
                            debug!("reader couldn't read ack seq: {}", e);
                            io = None;
                            self.fault(core, true).await;
                        }
                        Ok(()) if core.state != PipeState::Closed => {
                            if core.handle_ack(u64::from_le_bytes(seq_buf)) {
                                debug!("got last ack with close_on_empty, closing");
                                self.stop_locked(&mut core);
                            }
                        }
                        Ok(()) => {}
                    }
                }
                Tag::Msg => {
                    let correlation_id = Uuid::new_v4();
                    let span = span!(Level::TRACE, "message_received", ?correlation_id);
                    let _entered = span.enter();

                    let result = self
                        .read_message(rio, &connection, &policy, session_security.as_ref())
                        .await;
                    let mut core = self.core.lock().await;
                    match result {
                        Err(e) => {
                            debug!("reader failed to read message: {}", e);
                            io = None;
                            self.fault(core, true).await;
                        }
                        Ok(None) => {
                            // aborted message: throttles released, nothing to deliver
                        }
                        Ok(Some(m)) => {
                            if matches!(core.state, PipeState::Closed | PipeState::Connecting) {
                                trace!("dropping {:?} read during teardown", m);
                                continue;
                            }
                            if m.seq() <= core.in_seq {
                                debug!(
                                    "reader got old message {} <= {}, discarding duplicate",
                                    m.seq(),
                                    core.in_seq
                                );
                                continue;
                            }
                            core.in_seq = m.seq();
                            // wake the writer so it can ack
                            self.cond.notify_waiters();

                            trace!("reader got {:?}", m);
                            // delivered while the lock is held so wire order is dispatch order
                            self.deliver(delay_queue.as_deref(), conn_id, m).await;
                        }
                    }
                }
                Tag::Close => {
                    debug!("reader got CLOSE");
                    let mut core = self.core.lock().await;
                    if core.state == PipeState::Closing {
                        core.state = PipeState::Closed;
                        self.state_closed.store(true, Ordering::Release);
                    } else {
                        core.state = PipeState::Closing;
                    }
                    self.cond.notify_waiters();
                    break;
                }
                other => {
                    warn!("reader got unexpected tag {:?} in open state", other);
                    io = None;
                    let core = self.core.lock().await;
                    self.fault(core, true).await;
                }
            }
        }

        let mut core = self.core.lock().await;
        core.reader_running = false;
        trace!("reader done");
        self.unlock_maybe_reap(core);
    }

    async fn deliver(&self, delay_queue: Option<&DelayedDelivery>, conn_id: u64, m: Message) {
        let Some(msgr) = self.msgr.upgrade() else {
            return;
        };
        if let Some(delay) = delay_queue {
            let mut release = Instant::now();
            let draw: f64 = rand::thread_rng().gen();
            if draw < self.config.inject_delay_probability {
                let max = self.config.inject_delay_max.as_secs_f64();
                release += Duration::from_secs_f64(max * rand::thread_rng().gen::<f64>());
            }
            delay.queue(release, m);
        } else {
            msgr.dispatcher().on_message(conn_id, m).await;
        }
    }

    /// Read one message body off the wire. `Ok(None)` is an aborted message (not a fault).
    async fn read_message(
        &self,
        rio: &mut ReaderIo,
        connection: &Arc<ConnectionState>,
        policy: &Policy,
        session_security: Option<&crate::auth::SessionSecurity>,
    ) -> anyhow::Result<Option<Message>> {
        let recv_stamp = Instant::now();

        let header = if connection.has_feature(features::NOSRCADDR) {
            let mut buf = vec![0u8; MessageHeader::SERIALIZED_LEN];
            self.read_wire(rio, &mut buf).await?;
            MessageHeader::try_deser(&mut &buf[..])?
        } else {
            let mut buf = vec![0u8; MessageHeader::SERIALIZED_LEN_LEGACY];
            self.read_wire(rio, &mut buf).await?;
            MessageHeader::try_deser_legacy(&mut &buf[..])?
        };
        trace!(
            "reader got envelope type={} seq={} front={} middle={} data={} off={}",
            header.msg_type,
            header.seq,
            header.front_len,
            header.middle_len,
            header.data_len,
            header.data_off
        );

        // policy throttles span the message's lifetime; the dispatch throttle comes last
        // because it is guaranteed to drain
        let mut throttle_tokens: Vec<Arc<ThrottleToken>> = Vec::new();
        if let Some(throttle) = &policy.throttler_messages {
            throttle_tokens.push(Arc::new(throttle.acquire(1).await));
        }
        let message_size = header.message_size();
        if message_size > 0 {
            if let Some(throttle) = &policy.throttler_bytes {
                throttle_tokens.push(Arc::new(throttle.acquire(message_size).await));
            }
            if let Some(msgr) = self.msgr.upgrade() {
                if let Some(throttle) = msgr.dispatch_throttle() {
                    throttle_tokens.push(Arc::new(throttle.acquire(message_size).await));
                }
            }
        }
        let throttle_stamp = Instant::now();

        let front = self.read_region(rio, header.front_len.safe_cast()).await?;
        let middle = self.read_region(rio, header.middle_len.safe_cast()).await?;

        let data_len: usize = header.data_len.safe_cast();
        let data = if data_len > 0 {
            if let Some(mut rx) = connection.take_rx_buffer(header.tid) {
                trace!("reading data into pre-registered rx buffer for tid {}", header.tid);
                if rx.len() < data_len {
                    rx.resize(data_len, 0);
                }
                self.read_wire(rio, &mut rx[..data_len]).await?;
                rx.truncate(data_len);
                rx.freeze()
            } else {
                let mut buf = BytesMut::zeroed(data_len);
                let mut pos = 0;
                for chunk in aligned_chunk_sizes(data_len, header.data_off.safe_cast()) {
                    self.read_wire(rio, &mut buf[pos..pos + chunk]).await?;
                    pos += chunk;
                }
                buf.freeze()
            }
        } else {
            Bytes::new()
        };

        let footer = if connection.has_feature(features::MSG_AUTH) {
            let mut buf = [0u8; MessageFooter::SERIALIZED_LEN];
            self.read_wire(rio, &mut buf).await?;
            MessageFooter::try_deser(&mut &buf[..])?
        } else {
            let mut buf = [0u8; MessageFooter::SERIALIZED_LEN_LEGACY];
            self.read_wire(rio, &mut buf).await?;
            MessageFooter::try_deser_legacy(&mut &buf[..])?
        };

        if !footer.is_complete() {
            debug!(
                "reader got {}+{}+{} byte message, aborted by sender",
                header.front_len, header.middle_len, header.data_len
            );
            return Ok(None);
        }

        if !self.config.nocrc && footer.flags & frame::FOOTER_FLAG_NOCRC == 0 {
            if frame::crc32c(&front) != footer.front_crc {
                bail!("front checksum mismatch");
            }
            if frame::crc32c(&middle) != footer.middle_crc {
                bail!("middle checksum mismatch");
            }
            if frame::crc32c(&data) != footer.data_crc {
                bail!("data checksum mismatch");
            }
        }

        if let Some(security) = session_security {
            if connection.has_feature(features::MSG_AUTH)
                && !security.check_signature(&header, &footer)
            {
                bail!("message signature check failed");
            }
        }

        let mut m = Message::from_wire(&header, front, middle, data);
        m.recv_stamp = Some(recv_stamp);
        m.throttle_stamp = Some(throttle_stamp);
        m.recv_complete_stamp = Some(Instant::now());
        m.throttle_tokens = throttle_tokens;
        Ok(Some(m))
    }

    async fn read_region(&self, rio: &mut ReaderIo, len: usize) -> anyhow::Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = BytesMut::zeroed(len);
        self.read_wire(rio, &mut buf).await?;
        Ok(buf.freeze())
    }

    async fn read_wire(&self, rio: &mut ReaderIo, buf: &mut [u8]) -> anyhow::Result<()> {
        maybe_inject_socket_failure(&self.config)?;
        read_exact_abortable(&mut rio.half, &mut rio.abort, self.config.tcp_read_timeout, buf).await
    }

    // ----------------------------------- writer ------------------------------------------

    pub(crate) async fn run_writer(self: Arc<Self>) {
        let mut io: Option<WriterIo> = None;

        loop {
            if let Some(wio) = &io {
                if *wio.abort.borrow() || wio.abort.has_changed().is_err() {
                    io = None;
                }
            }

            let mut core = self.core.lock().await;
            trace!("writer: state = {:?}", core.state);

            if core.state == PipeState::Closed {
                break;
            }

            if core.state == PipeState::Standby && core.is_queued() && !core.policy.server {
                core.connect_seq += 1;
                core.state = PipeState::Connecting;
            }

            if core.state == PipeState::Connecting {
                assert!(!core.policy.server, "a server pipe never initiates a connect");
                io = handshake::connect(&self, core).await;
                continue;
            }

            if core.state == PipeState::Closing {
                debug!("writer writing CLOSE tag");
                core.state = PipeState::Closed;
                self.state_closed.store(true, Ordering::Release);
                drop(core);
                if let Some(wio) = io.as_mut() {
                    // best effort; the pipe is closing either way
                    let _ = wio.half.write_all(&[Tag::Close.into()]).await;
                }
                continue;
            }

            if core.state == PipeState::Open
                && (core.is_queued() || core.in_seq > core.in_seq_acked)
            {
                if io.is_none() {
                    io = core.pending_writer.take();
                }
                let Some(wio) = io.as_mut() else {
                    self.fault(core, false).await;
                    continue;
                };

                if core.keepalive {
                    drop(core);
                    let result = self.write_wire(wio, &[Tag::Keepalive.into()]).await;
                    core = self.core.lock().await;
                    if let Err(e) = result {
                        debug!("writer couldn't write keepalive: {}", e);
                        io = None;
                        self.fault(core, false).await;
                        continue;
                    }
                    core.keepalive = false;
                }

                if core.in_seq > core.in_seq_acked {
                    let send_seq = core.in_seq;
                    drop(core);
                    let mut buf = BytesMut::with_capacity(9);
                    buf.extend_from_slice(&[Tag::Ack.into()]);
                    buf.extend_from_slice(&send_seq.to_le_bytes());
                    let result = self.write_wire(wio, &buf).await;
                    core = self.core.lock().await;
                    if let Err(e) = result {
                        debug!("writer couldn't write ack: {}", e);
                        io = None;
                        self.fault(core, false).await;
                        continue;
                    }
                    core.in_seq_acked = send_seq;
                }

                if let Some(mut m) = core.next_outgoing() {
                    core.out_seq += 1;
                    m.seq = core.out_seq;
                    if !core.policy.lossy || core.close_on_empty {
                        core.sent.push_back(m.clone());
                    }

                    let buf = self.encode_message(&m, &core);
                    drop(core);
                    trace!("writer sending {:?}", m);
                    let result = self.write_wire(wio, &buf).await;
                    core = self.core.lock().await;
                    if let Err(e) = result {
                        debug!("writer error sending {:?}: {}", m, e);
                        io = None;
                        self.fault(core, false).await;
                    }
                }
                continue;
            }

            if core.sent.is_empty() && !core.is_queued() && core.close_on_empty {
                debug!("writer out and sent queues empty, closing");
                self.stop_locked(&mut core);
                continue;
            }

            trace!("writer sleeping");
            let notified = self.cond.notified();
            drop(core);
            notified.await;
        }

        let mut core = self.core.lock().await;
        core.writer_running = false;
        trace!("writer done");
        self.unlock_maybe_reap(core);
    }

    /// Serialize tag + envelope + payload + footer into one contiguous write.
    fn encode_message(&self, m: &Message, core: &PipeCore) -> Bytes {
        let header = m.header();
        let mut footer = MessageFooter {
            flags: frame::FOOTER_FLAG_COMPLETE,
            ..Default::default()
        };
        if self.config.nocrc {
            footer.flags |= frame::FOOTER_FLAG_NOCRC;
        } else {
            footer.front_crc = frame::crc32c(&m.front);
            footer.middle_crc = frame::crc32c(&m.middle);
            footer.data_crc = frame::crc32c(&m.data);
        }
        if let Some(security) = &core.session_security {
            security.sign(&header, &mut footer);
        }

        let mut buf = BytesMut::with_capacity(
            1 + MessageHeader::SERIALIZED_LEN_LEGACY + m.payload_len() + MessageFooter::SERIALIZED_LEN,
        );
        buf.extend_from_slice(&[Tag::Msg.into()]);

        if core.connection.has_feature(features::NOSRCADDR) {
            header.ser(&mut buf);
        } else {
            let my_addr = self
                .msgr
                .upgrade()
                .map(|m| m.my_addr())
                .unwrap_or(core.peer_addr);
            header.ser_legacy(&my_addr, &mut buf);
        }

        buf.extend_from_slice(&m.front);
        buf.extend_from_slice(&m.middle);
        buf.extend_from_slice(&m.data);

        if core.connection.has_feature(features::MSG_AUTH) {
            footer.ser(&mut buf);
        } else {
            footer.ser_legacy(&mut buf);
        }
        buf.freeze()
    }

    async fn write_wire(&self, wio: &mut WriterIo, buf: &[u8]) -> anyhow::Result<()> {
        maybe_inject_socket_failure(&self.config)?;
        write_all_abortable(&mut wio.half, &mut wio.abort, buf).await
    }
}

/// Doubling backoff clamped to the configured maximum.
pub(crate) fn next_backoff(current: Duration, config: &MessengerConfig) -> Duration {
    if current.is_zero() {
        config.initial_backoff
    } else {
        (current * 2).min(config.max_backoff)
    }
}

/// Chunk sizes for a fresh data buffer: the first chunk ends at a page boundary relative to
///  `data_off`, the middle covers whole pages, the tail takes the rest.
pub(crate) fn aligned_chunk_sizes(len: usize, off: usize) -> Vec<usize> {
    let mut chunks = Vec::new();
    let mut left = len;
    let misalignment = off % PAGE_SIZE;
    if misalignment != 0 {
        let head = (PAGE_SIZE - misalignment).min(left);
        chunks.push(head);
        left -= head;
    }
    let middle = left - left % PAGE_SIZE;
    if middle > 0 {
        chunks.push(middle);
        left -= middle;
    }
    if left > 0 {
        chunks.push(left);
    }
    chunks
}

pub(crate) fn maybe_inject_socket_failure(config: &MessengerConfig) -> anyhow::Result<()> {
    if config.inject_socket_failures > 0
        && rand::thread_rng().gen_range(0..config.inject_socket_failures) == 0
    {
        warn!("injecting socket failure");
        bail!("injected socket failure");
    }
    Ok(())
}

async fn abort_signalled(abort: &mut watch::Receiver<bool>) {
    // a dropped sender means the socket generation was replaced: abort as well
    let _ = abort.wait_for(|shut| *shut).await;
}

pub(crate) async fn read_exact_abortable<R: AsyncRead + Unpin>(
    reader: &mut R,
    abort: &mut watch::Receiver<bool>,
    timeout: Duration,
    buf: &mut [u8],
) -> anyhow::Result<()> {
    tokio::select! {
        result = tokio::time::timeout(timeout, reader.read_exact(buf)) => {
            match result {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => bail!("read timed out after {:?}", timeout),
            }
        }
        _ = abort_signalled(abort) => bail!("socket was shut down"),
    }
}

pub(crate) async fn write_all_abortable<W: AsyncWrite + Unpin>(
    writer: &mut W,
    abort: &mut watch::Receiver<bool>,
    buf: &[u8],
) -> anyhow::Result<()> {
    tokio::select! {
        result = writer.write_all(buf) => result.map_err(|e| e.into()),
        _ = abort_signalled(abort) => bail!("socket was shut down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;

    fn test_core(policy: Policy) -> PipeCore {
        let peer_addr = NodeAddr::localhost(6800, 1);
        PipeCore {
            state: PipeState::Open,
            policy,
            peer_addr,
            peer_type: 0,
            connect_seq: 0,
            peer_global_seq: 0,
            out_seq: 0,
            in_seq: 0,
            in_seq_acked: 0,
            out_q: BTreeMap::new(),
            sent: VecDeque::new(),
            keepalive: false,
            close_on_empty: false,
            backoff: Duration::ZERO,
            session_security: None,
            conn_id: 1,
            connection: Arc::new(ConnectionState::new(peer_addr, 0)),
            delay_queue: None,
            reader_running: false,
            writer_running: false,
            reader_handle: None,
            writer_handle: None,
            pending_writer: None,
            abort_tx: None,
        }
    }

    fn msg_with_seq(seq: u64, priority: i16) -> Message {
        let mut m = Message::new(1, Bytes::from(seq.to_le_bytes().to_vec())).with_priority(priority);
        m.seq = seq;
        m
    }

    #[rstest]
    #[case::ack_none(vec![5, 6, 7], 4, vec![5, 6, 7], false)]
    #[case::ack_prefix(vec![5, 6, 7], 6, vec![7], false)]
    #[case::ack_all(vec![5, 6, 7], 7, vec![], false)]
    #[case::ack_past_end(vec![5, 6, 7], 99, vec![], false)]
    #[case::ack_empty(vec![], 3, vec![], false)]
    fn test_handle_ack(
        #[case] sent: Vec<u64>,
        #[case] ack: u64,
        #[case] expected_remaining: Vec<u64>,
        #[case] expected_stop: bool,
    ) {
        let mut core = test_core(Policy::lossless_client());
        for seq in sent {
            core.sent.push_back(msg_with_seq(seq, prio::DEFAULT));
        }

        let stop = core.handle_ack(ack);
        assert_eq!(stop, expected_stop);
        let remaining: Vec<u64> = core.sent.iter().map(|m| m.seq()).collect();
        assert_eq!(remaining, expected_remaining);
    }

    #[test]
    fn test_handle_ack_close_on_empty() {
        let mut core = test_core(Policy::lossless_client());
        core.close_on_empty = true;
        core.sent.push_back(msg_with_seq(3, prio::DEFAULT));

        assert!(!core.handle_ack(2));
        assert!(core.handle_ack(3));
    }

    #[test]
    fn test_next_outgoing_priority_order() {
        let mut core = test_core(Policy::lossless_client());
        core.queue_message(msg_with_seq(1, prio::LOW));
        core.queue_message(msg_with_seq(2, prio::HIGH));
        core.queue_message(msg_with_seq(3, prio::HIGH));
        core.queue_message(msg_with_seq(4, prio::DEFAULT));

        let drained: Vec<u64> = std::iter::from_fn(|| core.next_outgoing())
            .map(|m| m.seq())
            .collect();
        // highest priority first, insertion order within a bucket
        assert_eq!(drained, vec![2, 3, 4, 1]);
        assert!(!core.is_queued());
    }

    #[test]
    fn test_requeue_sent_preserves_order_and_seq() {
        let mut core = test_core(Policy::lossless_client());
        core.out_seq = 44;
        for seq in [42, 43, 44] {
            core.sent.push_back(msg_with_seq(seq, prio::DEFAULT));
        }
        core.queue_message(msg_with_seq(0, prio::DEFAULT));

        core.requeue_sent();

        assert_eq!(core.out_seq, 41);
        assert!(core.sent.is_empty());

        // the writer reassigns the exact original sequence numbers, before new messages
        let mut reassigned = Vec::new();
        while let Some(mut m) = core.next_outgoing() {
            core.out_seq += 1;
            m.seq = core.out_seq;
            reassigned.push(m.seq());
        }
        assert_eq!(reassigned, vec![42, 43, 44, 45]);
    }

    #[rstest]
    #[case::none_acked(40, vec![41, 42, 43], 3)]
    #[case::some_acked(41, vec![42, 43], 3)]
    #[case::all_acked(43, vec![], 3)]
    #[case::past_end(99, vec![], 3)]
    fn test_discard_requeued_up_to(
        #[case] acked: u64,
        #[case] expected_remaining: Vec<u64>,
        #[case] count: u64,
    ) {
        let mut core = test_core(Policy::lossless_client());
        core.out_seq = 40 + count;
        for seq in 41..=40 + count {
            core.sent.push_back(msg_with_seq(seq, prio::DEFAULT));
        }
        core.requeue_sent();
        assert_eq!(core.out_seq, 40);

        core.discard_requeued_up_to(acked);

        let remaining: Vec<u64> = core
            .out_q
            .get(&prio::HIGHEST)
            .map(|q| q.iter().map(|m| m.seq()).collect())
            .unwrap_or_default();
        assert_eq!(remaining, expected_remaining);
        // out_seq advanced once per discarded message
        assert_eq!(core.out_seq, 40 + (count - expected_remaining.len() as u64));
    }

    #[test]
    fn test_discard_requeued_stops_at_unassigned() {
        let mut core = test_core(Policy::lossless_client());
        core.out_q
            .entry(prio::HIGHEST)
            .or_default()
            .push_back(msg_with_seq(0, prio::HIGHEST));

        core.discard_requeued_up_to(10);
        assert_eq!(core.out_q.get(&prio::HIGHEST).unwrap().len(), 1);
        assert_eq!(core.out_seq, 0);
    }

    #[test]
    fn test_randomize_out_seq() {
        let mut core = test_core(Policy::lossless_client());

        core.randomize_out_seq();
        assert_eq!(core.out_seq, 0);

        core.connection.set_features(features::MSG_AUTH);
        core.randomize_out_seq();
        assert!(core.out_seq <= SEQ_MASK);
    }

    #[rstest]
    #[case::initial(Duration::ZERO, Duration::from_millis(200))]
    #[case::doubling(Duration::from_millis(200), Duration::from_millis(400))]
    #[case::near_clamp(Duration::from_secs(10), Duration::from_secs(15))]
    #[case::clamped(Duration::from_secs(15), Duration::from_secs(15))]
    fn test_next_backoff(#[case] current: Duration, #[case] expected: Duration) {
        let config = MessengerConfig::default();
        assert_eq!(next_backoff(current, &config), expected);
    }

    #[test]
    fn test_backoff_sequence_is_doubling_and_clamped() {
        let config = MessengerConfig::default();
        let mut backoff = Duration::ZERO;
        let mut waits = Vec::new();
        for _ in 0..10 {
            backoff = next_backoff(backoff, &config);
            waits.push(backoff);
        }
        for pair in waits.windows(2) {
            assert!(pair[1] == pair[0] * 2 || pair[1] == config.max_backoff);
        }
        assert_eq!(*waits.last().unwrap(), config.max_backoff);
    }

    #[rstest]
    #[case::empty(0, 0, vec![])]
    #[case::aligned_small(100, 0, vec![100])]
    #[case::aligned_pages(8192, 0, vec![8192])]
    #[case::aligned_pages_and_tail(8300, 0, vec![8192, 108])]
    #[case::misaligned_head(100, 4090, vec![6, 94])]
    #[case::misaligned_all(10000, 100, vec![3996, 4096, 1908])]
    fn test_aligned_chunk_sizes(#[case] len: usize, #[case] off: usize, #[case] expected: Vec<usize>) {
        let chunks = aligned_chunk_sizes(len, off);
        assert_eq!(chunks, expected);
        assert_eq!(chunks.iter().sum::<usize>(), len);
    }
}
