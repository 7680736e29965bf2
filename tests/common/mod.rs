use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clustermsg::{ConnectionState, Message, MessageDispatcher};
use tokio::sync::Mutex;

/// Dispatcher that records everything for assertions.
#[derive(Default)]
pub struct CollectingDispatcher {
    pub messages: Mutex<Vec<Message>>,
    pub accepts: AtomicUsize,
    pub connects: AtomicUsize,
    pub resets: AtomicUsize,
    pub remote_resets: AtomicUsize,
    pub connections: Mutex<Vec<Arc<ConnectionState>>>,
}

impl CollectingDispatcher {
    pub fn new() -> Arc<CollectingDispatcher> {
        Arc::new(CollectingDispatcher::default())
    }

    pub async fn message_count(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageDispatcher for CollectingDispatcher {
    async fn on_accept(&self, connection: Arc<ConnectionState>) {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        self.connections.lock().await.push(connection);
    }

    async fn on_connect(&self, connection: Arc<ConnectionState>) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connections.lock().await.push(connection);
    }

    async fn on_reset(&self, _connection: Arc<ConnectionState>) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_remote_reset(&self, _connection: Arc<ConnectionState>) {
        self.remote_resets.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_message(&self, _conn_id: u64, msg: Message) {
        self.messages.lock().await.push(msg);
    }

    async fn discard_inbound(&self, _conn_id: u64) {}
}

/// Poll `probe` until it returns true or the deadline passes.
pub async fn wait_until<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        if probe().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
