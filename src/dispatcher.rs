use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::connection::ConnectionState;
use crate::message::Message;

/// The application-facing sink for everything a messenger produces.
///
/// Implementations are expected to hand work off quickly (e.g. into a per-priority dispatch
///  queue); calling back into the messenger from inside these methods can deadlock against
///  the pipe that is delivering.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    /// An incoming session was accepted and is now OPEN.
    async fn on_accept(&self, connection: Arc<ConnectionState>);

    /// An outgoing session completed its handshake and is now OPEN.
    async fn on_connect(&self, connection: Arc<ConnectionState>);

    /// The session failed terminally (lossy fault or mark-down); queued messages were dropped.
    async fn on_reset(&self, connection: Arc<ConnectionState>);

    /// The peer discarded the shared session; all in-flight state for it is gone.
    async fn on_remote_reset(&self, connection: Arc<ConnectionState>);

    /// A message arrived, in order and de-duplicated. `conn_id` identifies the inbound stream
    ///  for later [`MessageDispatcher::discard_inbound`] calls.
    async fn on_message(&self, conn_id: u64, msg: Message);

    /// Drop everything queued but not yet dispatched for the given inbound stream.
    async fn discard_inbound(&self, conn_id: u64);
}
