use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use anyhow::bail;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::accepter::Accepter;
use crate::auth::AuthProvider;
use crate::config::MessengerConfig;
use crate::dispatcher::MessageDispatcher;
use crate::frame::features;
use crate::message::Message;
use crate::node_addr::NodeAddr;
use crate::pipe::{Pipe, PipeState, ReaderInit};
use crate::throttle::Throttle;

/// Per-peer-type session policy: who reconnects, what survives a fault, which features are
///  table stakes, and how inbound bytes/messages are throttled.
#[derive(Clone)]
pub struct Policy {
    /// Faults are terminal; queued messages are dropped instead of resent.
    pub lossy: bool,
    /// Never initiate a connection to this peer; on fault, park in STANDBY until the peer
    ///  comes back.
    pub server: bool,
    /// Detect peer restarts and discard the stale session (RESETSESSION handling).
    pub resetcheck: bool,
    /// On fault with nothing queued, park in STANDBY instead of reconnecting.
    pub standby: bool,
    /// This peer type is part of the cluster itself (signature requirements differ).
    pub cluster: bool,
    pub features_supported: u64,
    pub features_required: u64,
    pub throttler_bytes: Option<Arc<Throttle>>,
    pub throttler_messages: Option<Arc<Throttle>>,
}

impl Policy {
    fn base(lossy: bool, server: bool, resetcheck: bool, standby: bool) -> Policy {
        Policy {
            lossy,
            server,
            resetcheck,
            standby,
            cluster: false,
            features_supported: features::ALL,
            features_required: 0,
            throttler_bytes: None,
            throttler_messages: None,
        }
    }

    /// Server end of a stateful session: survives faults in STANDBY, detects peer resets.
    pub fn stateful_server() -> Policy {
        Policy::base(false, true, true, true)
    }

    /// Server end that keeps no session state; every fault drops the session.
    pub fn stateless_server() -> Policy {
        Policy::base(true, true, false, false)
    }

    /// Symmetric peers (both sides may connect); reliable with standby.
    pub fn lossless_peer() -> Policy {
        Policy::base(false, false, true, true)
    }

    /// Client that tolerates message loss; faults are terminal.
    pub fn lossy_client() -> Policy {
        Policy::base(true, false, false, false)
    }

    /// Client with reliable delivery; reconnects on fault.
    pub fn lossless_client() -> Policy {
        Policy::base(false, false, true, false)
    }

    pub fn with_features_required(mut self, features_required: u64) -> Policy {
        self.features_required = features_required;
        self
    }

    pub fn with_features_supported(mut self, features_supported: u64) -> Policy {
        self.features_supported = features_supported;
        self
    }

    pub fn with_cluster(mut self) -> Policy {
        self.cluster = true;
        self
    }

    pub fn with_byte_throttle(mut self, throttle: Arc<Throttle>) -> Policy {
        self.throttler_bytes = Some(throttle);
        self
    }

    pub fn with_message_throttle(mut self, throttle: Arc<Throttle>) -> Policy {
        self.throttler_messages = Some(throttle);
        self
    }
}

/// The peer map and the accepting set, guarded by the registry lock (which orders before any
///  pipe lock).
pub(crate) struct Registry {
    pipes: FxHashMap<NodeAddr, Arc<Pipe>>,
    accepting: Vec<Arc<Pipe>>,
}

impl Registry {
    pub fn lookup(&self, addr: &NodeAddr) -> Option<Arc<Pipe>> {
        self.pipes.get(addr).cloned()
    }

    pub fn register(&mut self, addr: NodeAddr, pipe: Arc<Pipe>) {
        trace!("registering pipe for {:?}", addr);
        let previous = self.pipes.insert(addr, pipe);
        debug_assert!(previous.is_none(), "registered a second pipe for one peer");
    }

    /// Remove `pipe` from the map if it is still the one registered for `addr`.
    pub fn unregister(&mut self, addr: &NodeAddr, pipe: &Arc<Pipe>) {
        if let Some(registered) = self.pipes.get(addr) {
            if Arc::ptr_eq(registered, pipe) {
                trace!("unregistering pipe for {:?}", addr);
                self.pipes.remove(addr);
            }
        }
        self.remove_accepting(pipe);
    }

    pub fn add_accepting(&mut self, pipe: Arc<Pipe>) {
        self.accepting.push(pipe);
    }

    pub fn accept_done(&mut self, pipe: &Arc<Pipe>) {
        self.remove_accepting(pipe);
    }

    fn remove_accepting(&mut self, pipe: &Arc<Pipe>) {
        self.accepting.retain(|p| !Arc::ptr_eq(p, pipe));
    }

    fn drain_all(&mut self) -> Vec<Arc<Pipe>> {
        let mut all: Vec<Arc<Pipe>> = self.pipes.drain().map(|(_, p)| p).collect();
        all.extend(self.accepting.drain(..));
        all
    }
}

/// Process-wide registry tying pipes, policies and the accepter together: at most one pipe
///  per peer address, global connect-attempt ordering, and the application-facing entry
///  points for sending.
pub struct Messenger {
    config: Arc<MessengerConfig>,
    host_type: u32,
    nonce: u32,
    dispatcher: Arc<dyn MessageDispatcher>,
    auth: Arc<dyn AuthProvider>,

    my_addr: StdRwLock<NodeAddr>,
    need_addr: AtomicBool,

    global_seq: StdMutex<u32>,
    conn_id_counter: AtomicU64,

    policies: StdRwLock<PolicyMap>,
    dispatch_throttle: StdRwLock<Option<Arc<Throttle>>>,

    registry: Mutex<Registry>,
    accepter: StdMutex<Option<Arc<Accepter>>>,

    reap_tx: mpsc::UnboundedSender<Arc<Pipe>>,
    reaper: StdMutex<Option<JoinHandle<()>>>,

    stopping: AtomicBool,
}

struct PolicyMap {
    default_policy: Policy,
    by_type: FxHashMap<u32, Policy>,
}

impl Messenger {
    /// NB: spawns the reaper task, so this must run inside a tokio runtime.
    pub fn new(
        config: MessengerConfig,
        host_type: u32,
        dispatcher: Arc<dyn MessageDispatcher>,
        auth: Arc<dyn AuthProvider>,
    ) -> anyhow::Result<Arc<Messenger>> {
        config.validate()?;

        let nonce: u32 = rand::thread_rng().gen();
        let blank: SocketAddr = if config.bind_ipv6 {
            "[::]:0".parse().expect("literal address")
        } else {
            "0.0.0.0:0".parse().expect("literal address")
        };

        let (reap_tx, reap_rx) = mpsc::unbounded_channel();

        let msgr = Arc::new(Messenger {
            config: Arc::new(config),
            host_type,
            nonce,
            dispatcher,
            auth,
            my_addr: StdRwLock::new(NodeAddr::new(blank, nonce)),
            need_addr: AtomicBool::new(true),
            global_seq: StdMutex::new(0),
            conn_id_counter: AtomicU64::new(1),
            policies: StdRwLock::new(PolicyMap {
                default_policy: Policy::lossless_peer(),
                by_type: FxHashMap::default(),
            }),
            dispatch_throttle: StdRwLock::new(None),
            registry: Mutex::new(Registry {
                pipes: FxHashMap::default(),
                accepting: Vec::new(),
            }),
            accepter: StdMutex::new(None),
            reap_tx,
            reaper: StdMutex::new(None),
            stopping: AtomicBool::new(false),
        });

        let reaper = tokio::spawn(Self::reaper_loop(Arc::downgrade(&msgr), reap_rx));
        *msgr.reaper.lock().unwrap() = Some(reaper);

        Ok(msgr)
    }

    // ------------------------------------ configuration ----------------------------------

    pub fn set_default_policy(&self, policy: Policy) {
        self.policies.write().unwrap().default_policy = policy;
    }

    pub fn set_policy(&self, peer_type: u32, policy: Policy) {
        self.policies.write().unwrap().by_type.insert(peer_type, policy);
    }

    pub(crate) fn get_policy(&self, peer_type: u32) -> Policy {
        let policies = self.policies.read().unwrap();
        policies
            .by_type
            .get(&peer_type)
            .unwrap_or(&policies.default_policy)
            .clone()
    }

    /// Bound on the total bytes of received messages awaiting dispatch, shared by all pipes.
    pub fn set_dispatch_throttle(&self, throttle: Arc<Throttle>) {
        *self.dispatch_throttle.write().unwrap() = Some(throttle);
    }

    pub(crate) fn dispatch_throttle(&self) -> Option<Arc<Throttle>> {
        self.dispatch_throttle.read().unwrap().clone()
    }

    pub(crate) fn config(&self) -> &Arc<MessengerConfig> {
        &self.config
    }

    pub(crate) fn host_type(&self) -> u32 {
        self.host_type
    }

    pub(crate) fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    pub(crate) fn dispatcher(&self) -> &Arc<dyn MessageDispatcher> {
        &self.dispatcher
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    // ------------------------------------ addressing --------------------------------------

    pub fn my_addr(&self) -> NodeAddr {
        *self.my_addr.read().unwrap()
    }

    /// Called by the accepter once the listening socket is bound.
    pub(crate) fn set_bound_addr(&self, addr: SocketAddr) {
        let mut my_addr = self.my_addr.write().unwrap();
        *my_addr = NodeAddr::new(addr, self.nonce);
        self.need_addr.store(addr.ip().is_unspecified(), Ordering::Release);
        info!("bound, my address is {:?}", *my_addr);
    }

    /// A peer told us which address it sees us under; adopt the IP if we don't know ours.
    pub(crate) fn learned_addr(&self, observed: NodeAddr) {
        if self.need_addr.swap(false, Ordering::AcqRel) {
            let mut my_addr = self.my_addr.write().unwrap();
            let updated = NodeAddr::new(
                SocketAddr::new(observed.socket_addr.ip(), my_addr.port()),
                self.nonce,
            );
            info!("learned my address: {:?}", updated);
            *my_addr = updated;
        }
    }

    pub(crate) fn unlearn_addr(&self) {
        self.need_addr.store(true, Ordering::Release);
    }

    // ------------------------------------ lifecycle ---------------------------------------

    /// Bind the accepter. `None` binds the configured wildcard and scans the configured port
    ///  range. Returns the effective address (with this process' nonce).
    pub async fn bind(self: &Arc<Self>, bind_addr: Option<SocketAddr>) -> anyhow::Result<NodeAddr> {
        let bind_addr = bind_addr.unwrap_or_else(|| {
            if self.config.bind_ipv6 {
                "[::]:0".parse().expect("literal address")
            } else {
                "0.0.0.0:0".parse().expect("literal address")
            }
        });

        let accepter = Accepter::new(self);
        let addr = accepter.bind(bind_addr, 0, 0).await?;
        *self.accepter.lock().unwrap() = Some(accepter);
        Ok(addr)
    }

    /// Start accepting incoming connections (requires a prior [`Messenger::bind`]).
    pub fn start(&self) -> anyhow::Result<()> {
        let accepter = self.accepter.lock().unwrap().clone();
        match accepter {
            Some(accepter) => {
                accepter.start();
                Ok(())
            }
            None => bail!("start() without bind()"),
        }
    }

    /// Tear down the listener and bind anew on a different port, avoiding the old one.
    pub async fn rebind(&self, avoid_port: u16) -> anyhow::Result<NodeAddr> {
        let accepter = self.accepter.lock().unwrap().clone();
        match accepter {
            Some(accepter) => accepter.rebind(avoid_port).await,
            None => bail!("rebind() without bind()"),
        }
    }

    /// Stop the accepter, close every pipe and stop dispatching. Terminal.
    pub async fn shutdown(&self) {
        debug!("messenger shutting down");
        self.stopping.store(true, Ordering::Release);

        let accepter = self.accepter.lock().unwrap().take();
        if let Some(accepter) = accepter {
            accepter.stop().await;
        }

        let pipes = self.registry.lock().await.drain_all();
        for pipe in pipes {
            pipe.stop().await;
        }
    }

    // ------------------------------------ sending -----------------------------------------

    /// Queue a message for `to`, creating a connecting pipe if none is registered. Delivery
    ///  follows the policy for `peer_type`: reliable policies retry across reconnects, lossy
    ///  ones drop on fault.
    pub async fn submit_message(
        self: &Arc<Self>,
        to: NodeAddr,
        peer_type: u32,
        mut msg: Message,
    ) -> anyhow::Result<()> {
        if self.is_stopping() {
            bail!("messenger is shutting down");
        }
        msg.src = self.nonce as u64;

        let mut registry = self.registry.lock().await;
        if let Some(pipe) = registry.lookup(&to) {
            if !pipe.is_closed() {
                drop(registry);
                pipe.queue_message(msg).await;
                return Ok(());
            }
            // a closed pipe that has not been reaped yet; replace it
            registry.unregister(&to, &pipe);
        }

        let policy = self.get_policy(peer_type);
        if policy.server {
            bail!("policy for peer type {} is server-side, refusing to connect out", peer_type);
        }

        debug!("creating connecting pipe to {:?}", to);
        let pipe = Pipe::new(self, PipeState::Connecting, policy, to, peer_type);
        {
            let mut core = pipe.core.lock().await;
            core.queue_message(msg);
            pipe.start_writer(&mut core);
        }
        registry.register(to, pipe);
        Ok(())
    }

    /// Ask the pipe to `to` to emit a keepalive ahead of queued messages.
    pub async fn send_keepalive(&self, to: NodeAddr) -> anyhow::Result<()> {
        let registry = self.registry.lock().await;
        match registry.lookup(&to) {
            Some(pipe) => {
                drop(registry);
                pipe.send_keepalive().await;
                Ok(())
            }
            None => bail!("no pipe for {:?}", to),
        }
    }

    /// Drop the session with `to` immediately: queued messages are discarded and the
    ///  application hears `on_reset`.
    pub async fn mark_down(&self, to: NodeAddr) {
        let mut registry = self.registry.lock().await;
        if let Some(pipe) = registry.lookup(&to) {
            registry.unregister(&to, &pipe);
            drop(registry);

            let connection = pipe.connection().await;
            pipe.stop().await;
            connection.clear_pipe(&pipe);
            self.dispatcher.on_reset(connection).await;
        }
    }

    /// Let the pipe to `to` drain its queues and acks, then close cleanly.
    pub async fn mark_down_on_empty(&self, to: NodeAddr) {
        let registry = self.registry.lock().await;
        if let Some(pipe) = registry.lookup(&to) {
            drop(registry);
            pipe.set_close_on_empty().await;
        }
    }

    // ------------------------------------ internals ---------------------------------------

    pub(crate) async fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().await
    }

    pub(crate) async fn unregister_pipe(&self, pipe: &Arc<Pipe>) {
        let addr = pipe.peer_addr().await;
        let mut registry = self.registry.lock().await;
        registry.unregister(&addr, pipe);
    }

    /// Issue a connect-attempt ordinal strictly greater than anything issued before and at
    ///  least `min`.
    pub(crate) fn issue_global_seq(&self, min: u32) -> u32 {
        let mut global_seq = self.global_seq.lock().unwrap();
        if min > *global_seq {
            *global_seq = min;
        }
        *global_seq += 1;
        *global_seq
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.conn_id_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Accepter handoff: wrap a fresh inbound socket in an ACCEPTING pipe whose reader runs
    ///  the server handshake.
    pub(crate) async fn add_accept_pipe(self: &Arc<Self>, stream: TcpStream) {
        let peer_stub = match stream.peer_addr() {
            Ok(addr) => NodeAddr::new(addr, 0),
            Err(e) => {
                warn!("accepted socket has no peer address ({}), dropping", e);
                return;
            }
        };
        let policy = self.policies.read().unwrap().default_policy.clone();
        let pipe = Pipe::new(self, PipeState::Accepting, policy, peer_stub, 0);

        let mut registry = self.registry.lock().await;
        registry.add_accepting(pipe.clone());
        let mut core = pipe.core.lock().await;
        pipe.start_reader(&mut core, ReaderInit::Accept(stream));
    }

    pub(crate) fn queue_reap(&self, pipe: Arc<Pipe>) {
        // the reaper joins worker handles outside any pipe lock
        let _ = self.reap_tx.send(pipe);
    }

    pub(crate) async fn inject_internal_delay(&self) {
        if let Some(delay) = self.config.inject_internal_delay {
            debug!("injecting internal delay of {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn reaper_loop(
        msgr: std::sync::Weak<Messenger>,
        mut reap_rx: mpsc::UnboundedReceiver<Arc<Pipe>>,
    ) {
        while let Some(pipe) = reap_rx.recv().await {
            trace!("reaping pipe");
            if let Some(msgr) = msgr.upgrade() {
                msgr.unregister_pipe(&pipe).await;
            }

            let (reader, writer, delay_worker) = {
                let mut core = pipe.core.lock().await;
                debug_assert_eq!(core.state, PipeState::Closed);
                core.discard_out_queue();
                let delay_worker = core.delay_queue.take().and_then(|delay| {
                    delay.discard();
                    delay.stop();
                    delay.take_worker()
                });
                (core.reader_handle.take(), core.writer_handle.take(), delay_worker)
            };
            for handle in [reader, writer, delay_worker].into_iter().flatten() {
                let _ = handle.await;
            }
            trace!("reaped pipe");
        }
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.lock().unwrap().take() {
            reaper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NullAuth;
    use crate::connection::ConnectionState;
    use crate::dispatcher::MockMessageDispatcher;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::runtime::Builder;

    fn test_messenger() -> Arc<Messenger> {
        Messenger::new(
            MessengerConfig::default(),
            0,
            Arc::new(MockMessageDispatcher::new()),
            Arc::new(NullAuth),
        )
        .unwrap()
    }

    #[test]
    fn test_global_seq_is_strictly_increasing() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let msgr = test_messenger();
            let mut previous = 0;
            for _ in 0..100 {
                let issued = msgr.issue_global_seq(0);
                assert!(issued > previous);
                previous = issued;
            }
        });
    }

    #[test]
    fn test_global_seq_honors_minimum() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let msgr = test_messenger();
            let issued = msgr.issue_global_seq(1000);
            assert!(issued > 1000);
            assert!(msgr.issue_global_seq(10) > issued);
        });
    }

    #[test]
    fn test_policy_lookup_falls_back_to_default() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let msgr = test_messenger();
            msgr.set_default_policy(Policy::lossy_client());
            msgr.set_policy(7, Policy::stateful_server());

            assert!(msgr.get_policy(3).lossy);
            assert!(msgr.get_policy(7).server);
        });
    }

    #[test]
    fn test_learned_addr_keeps_port_and_nonce() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let msgr = test_messenger();
            msgr.set_bound_addr("0.0.0.0:6800".parse().unwrap());
            assert!(msgr.my_addr().is_blank_ip());

            let nonce = msgr.my_addr().nonce;
            msgr.learned_addr(NodeAddr::new("192.168.1.5:9999".parse().unwrap(), 0));

            let learned = msgr.my_addr();
            assert_eq!(learned.socket_addr, "192.168.1.5:6800".parse().unwrap());
            assert_eq!(learned.nonce, nonce);

            // only the first peer teaches us our address
            msgr.learned_addr(NodeAddr::new("10.0.0.1:1".parse().unwrap(), 0));
            assert_eq!(msgr.my_addr().socket_addr, "192.168.1.5:6800".parse().unwrap());
        });
    }

    #[derive(Default)]
    struct Collector {
        messages: Mutex<Vec<Message>>,
        resets: AtomicUsize,
    }

    #[async_trait]
    impl crate::dispatcher::MessageDispatcher for Collector {
        async fn on_accept(&self, _connection: Arc<ConnectionState>) {}
        async fn on_connect(&self, _connection: Arc<ConnectionState>) {}
        async fn on_reset(&self, _connection: Arc<ConnectionState>) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_remote_reset(&self, _connection: Arc<ConnectionState>) {}
        async fn on_message(&self, _conn_id: u64, msg: Message) {
            self.messages.lock().await.push(msg);
        }
        async fn discard_inbound(&self, _conn_id: u64) {}
    }

    async fn wait_for_count(collector: &Collector, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            if collector.messages.lock().await.len() >= expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} messages",
                expected
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// A reliable pipe whose socket dies mid-session reconnects and resumes: the peer sees a
    ///  single continuous stream with no duplicates and no gaps.
    #[test]
    fn test_reconnect_resumes_stream() {
        let rt = Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build().unwrap();
        rt.block_on(async {
            let mut server_config = MessengerConfig::default();
            server_config.bind_port_min = 39990;
            server_config.bind_port_max = 40040;

            let server_events = Arc::new(Collector::default());
            let server = Messenger::new(server_config, 1, server_events.clone(), Arc::new(NullAuth)).unwrap();
            server.set_policy(2, Policy::stateful_server());
            server.bind(Some("127.0.0.1:0".parse().unwrap())).await.unwrap();
            server.start().unwrap();
            let server_addr = server.my_addr();

            let client_events = Arc::new(Collector::default());
            let client =
                Messenger::new(MessengerConfig::default(), 2, client_events.clone(), Arc::new(NullAuth)).unwrap();
            client.set_policy(1, Policy::lossless_client());

            for i in 1u8..=3 {
                client
                    .submit_message(server_addr, 1, Message::new(1, Bytes::from(vec![i])))
                    .await.unwrap();
            }
            wait_for_count(&server_events, 3).await;

            // sever the socket under the client's feet; the session must survive
            let pipe = client.registry().await.lookup(&server_addr).unwrap();
            pipe.core.lock().await.shutdown_socket();

            for i in 4u8..=6 {
                client
                    .submit_message(server_addr, 1, Message::new(1, Bytes::from(vec![i])))
                    .await.unwrap();
            }
            wait_for_count(&server_events, 6).await;

            // exactly once, in order, strictly increasing seq across the reconnect
            tokio::time::sleep(Duration::from_millis(200)).await;
            let received = server_events.messages.lock().await;
            let payloads: Vec<u8> = received.iter().map(|m| m.front[0]).collect();
            assert_eq!(payloads, vec![1, 2, 3, 4, 5, 6]);
            for pair in received.windows(2) {
                assert!(pair[0].seq() < pair[1].seq());
            }
            drop(received);

            assert_eq!(client_events.resets.load(Ordering::SeqCst), 0);

            client.shutdown().await;
            server.shutdown().await;
        });
    }

    #[test]
    fn test_registry_identity_unregister() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let msgr = test_messenger();
            let addr = NodeAddr::localhost(6800, 1);
            let first = Pipe::new(&msgr, PipeState::Connecting, Policy::lossless_client(), addr, 0);
            let second = Pipe::new(&msgr, PipeState::Connecting, Policy::lossless_client(), addr, 0);

            let mut registry = msgr.registry().await;
            registry.register(addr, first.clone());

            // unregistering a different pipe for the same address is a no-op
            registry.unregister(&addr, &second);
            assert!(registry.lookup(&addr).is_some());

            registry.unregister(&addr, &first);
            assert!(registry.lookup(&addr).is_none());
        });
    }
}
