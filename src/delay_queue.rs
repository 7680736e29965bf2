use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::dispatcher::MessageDispatcher;
use crate::message::Message;

/// Fault-injection buffer that defers delivery of inbound messages by a per-message interval.
///
/// Purely a test affordance: pipes only get one when delay injection is configured for their
///  peer type. Messages keep their throttle units while parked here, so injected delay also
///  exercises back-pressure.
pub(crate) struct DelayedDelivery {
    dispatcher: Arc<dyn MessageDispatcher>,
    conn_id: AtomicU64,
    queue: Mutex<VecDeque<(Instant, Message)>>,
    notify: Notify,
    stopped: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DelayedDelivery {
    pub fn spawn(dispatcher: Arc<dyn MessageDispatcher>, conn_id: u64) -> Arc<DelayedDelivery> {
        let delay = Arc::new(DelayedDelivery {
            dispatcher,
            conn_id: AtomicU64::new(conn_id),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            stopped: AtomicBool::new(false),
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn({
            let delay = delay.clone();
            async move { delay.run().await }
        });
        *delay.worker.lock().unwrap() = Some(handle);
        delay
    }

    /// The inbound stream id changes when a pipe adopts a replaced pipe's queues.
    pub fn set_conn_id(&self, conn_id: u64) {
        self.conn_id.store(conn_id, Ordering::Relaxed);
    }

    pub fn queue(&self, release: Instant, msg: Message) {
        trace!("delaying {:?} until {:?}", msg, release);
        self.queue.lock().unwrap().push_back((release, msg));
        self.notify.notify_waiters();
    }

    /// Drop everything still parked. Throttle units come back via the messages' tokens.
    pub fn discard(&self) {
        let dropped = self.queue.lock().unwrap().drain(..).count();
        if dropped > 0 {
            debug!("discarding {} delayed messages", dropped);
        }
        self.notify.notify_waiters();
    }

    /// Deliver everything still parked immediately, preserving order.
    pub async fn flush(&self) {
        let drained: Vec<Message> = {
            let mut queue = self.queue.lock().unwrap();
            queue.drain(..).map(|(_, m)| m).collect()
        };
        let conn_id = self.conn_id.load(Ordering::Relaxed);
        for msg in drained {
            self.dispatcher.on_message(conn_id, msg).await;
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().unwrap().take()
    }

    async fn run(&self) {
        trace!("delayed delivery starting");
        loop {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }

            let next_release = {
                let queue = self.queue.lock().unwrap();
                queue.front().map(|(release, _)| *release)
            };

            match next_release {
                None => {
                    let notified = self.notify.notified();
                    if self.stopped.load(Ordering::Acquire) {
                        break;
                    }
                    // re-check after registering as a waiter: a queue() may have slipped in
                    if self.queue.lock().unwrap().front().is_some() {
                        continue;
                    }
                    notified.await;
                }
                Some(release) if release > Instant::now() => {
                    let notified = self.notify.notified();
                    tokio::select! {
                        _ = tokio::time::sleep_until(release.into()) => {}
                        _ = notified => {}
                    }
                }
                Some(_) => {
                    let msg = self.queue.lock().unwrap().pop_front().map(|(_, m)| m);
                    if let Some(msg) = msg {
                        trace!("releasing delayed {:?}", msg);
                        self.dispatcher
                            .on_message(self.conn_id.load(Ordering::Relaxed), msg)
                            .await;
                    }
                }
            }
        }
        trace!("delayed delivery stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MockMessageDispatcher;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::runtime::Builder;

    fn test_message(tag: u8) -> Message {
        Message::new(1, Bytes::from(vec![tag]))
    }

    #[test]
    fn test_deferred_release() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async move {
            let mut dispatcher = MockMessageDispatcher::new();
            dispatcher.expect_on_message()
                .times(1)
                .withf(|conn_id, msg| *conn_id == 7 && msg.front.as_ref() == [1])
                .return_const(());

            let delay = DelayedDelivery::spawn(Arc::new(dispatcher), 7);
            delay.queue(Instant::now() + Duration::from_millis(100), test_message(1));

            // paused clock: sleep drives time forward past the release point
            tokio::time::sleep(Duration::from_millis(200)).await;

            delay.stop();
            delay.take_worker().unwrap().await.unwrap();
        });
    }

    #[test]
    fn test_discard_drops_everything() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async move {
            let mut dispatcher = MockMessageDispatcher::new();
            dispatcher.expect_on_message().never();

            let delay = DelayedDelivery::spawn(Arc::new(dispatcher), 7);
            delay.queue(Instant::now() + Duration::from_secs(60), test_message(1));
            delay.queue(Instant::now() + Duration::from_secs(60), test_message(2));
            delay.discard();

            tokio::time::sleep(Duration::from_secs(120)).await;

            delay.stop();
            delay.take_worker().unwrap().await.unwrap();
        });
    }

    #[test]
    fn test_flush_delivers_in_order() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async move {
            let mut seq = mockall::Sequence::new();
            let mut dispatcher = MockMessageDispatcher::new();
            for expected in [1u8, 2] {
                dispatcher.expect_on_message()
                    .times(1)
                    .in_sequence(&mut seq)
                    .withf(move |_, msg| msg.front.as_ref() == [expected])
                    .return_const(());
            }

            let delay = DelayedDelivery::spawn(Arc::new(dispatcher), 7);
            delay.queue(Instant::now() + Duration::from_secs(60), test_message(1));
            delay.queue(Instant::now() + Duration::from_secs(60), test_message(2));
            delay.flush().await;

            delay.stop();
            delay.take_worker().unwrap().await.unwrap();
        });
    }
}
