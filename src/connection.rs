use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, Weak};

use bytes::BytesMut;
use rustc_hash::FxHashMap;

use crate::node_addr::NodeAddr;
use crate::pipe::Pipe;

/// The peer-facing handle shared between a pipe and the application.
///
/// It outlives any individual socket: across reconnects and pipe replacements the same
///  `ConnectionState` keeps carrying the negotiated features and the application's
///  pre-registered receive buffers. The back-pointer to the owning pipe is weak and cleared
///  when a lossy pipe fails, breaking the cycle before the pipe is reaped.
pub struct ConnectionState {
    peer_addr: Mutex<NodeAddr>,
    peer_type: AtomicU32,
    features: AtomicU64,
    failed: AtomicBool,
    pipe: Mutex<Weak<Pipe>>,
    rx_buffers: Mutex<FxHashMap<u64, BytesMut>>,
}

impl ConnectionState {
    pub(crate) fn new(peer_addr: NodeAddr, peer_type: u32) -> ConnectionState {
        ConnectionState {
            peer_addr: Mutex::new(peer_addr),
            peer_type: AtomicU32::new(peer_type),
            features: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            pipe: Mutex::new(Weak::new()),
            rx_buffers: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn peer_addr(&self) -> NodeAddr {
        *self.peer_addr.lock().unwrap()
    }

    pub(crate) fn set_peer_addr(&self, addr: NodeAddr) {
        *self.peer_addr.lock().unwrap() = addr;
    }

    pub fn peer_type(&self) -> u32 {
        self.peer_type.load(Ordering::Relaxed)
    }

    pub(crate) fn set_peer_type(&self, peer_type: u32) {
        self.peer_type.store(peer_type, Ordering::Relaxed);
    }

    /// The feature set negotiated with the peer (intersection of both supported sets).
    pub fn features(&self) -> u64 {
        self.features.load(Ordering::Acquire)
    }

    pub fn has_feature(&self, feature: u64) -> bool {
        self.features() & feature != 0
    }

    pub(crate) fn set_features(&self, features: u64) {
        self.features.store(features, Ordering::Release);
    }

    /// True once a lossy pipe failed; messages submitted afterwards are dropped.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn set_pipe(&self, pipe: &std::sync::Arc<Pipe>) {
        *self.pipe.lock().unwrap() = std::sync::Arc::downgrade(pipe);
    }

    /// Detach from `pipe` if it is still the current owner, marking the connection failed.
    pub(crate) fn clear_pipe(&self, pipe: &Pipe) {
        let mut guard = self.pipe.lock().unwrap();
        if let Some(current) = guard.upgrade() {
            if std::ptr::eq(current.as_ref(), pipe) {
                *guard = Weak::new();
                self.failed.store(true, Ordering::Release);
            }
        }
    }

    pub(crate) fn pipe(&self) -> Option<std::sync::Arc<Pipe>> {
        self.pipe.lock().unwrap().upgrade()
    }

    /// Pre-register a receive buffer for a transaction id. The next inbound message with this
    ///  tid has its data region read into the buffer instead of a fresh allocation.
    pub fn post_rx_buffer(&self, tid: u64, buf: BytesMut) {
        self.rx_buffers.lock().unwrap().insert(tid, buf);
    }

    pub fn revoke_rx_buffer(&self, tid: u64) {
        self.rx_buffers.lock().unwrap().remove(&tid);
    }

    pub(crate) fn take_rx_buffer(&self, tid: u64) -> Option<BytesMut> {
        self.rx_buffers.lock().unwrap().remove(&tid)
    }
}
