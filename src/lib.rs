//! Point-to-point, message-oriented transport for interconnecting the nodes of a distributed
//!  storage cluster.
//!
//! The unit of communication is a typed, variable-sized *message* with up to three payload
//!  regions; the unit of connectivity is the per-peer **pipe**: a bidirectional, ordered
//!  TCP-backed session whose lifecycle is governed by a handshake protocol, and whose failure
//!  path can transparently re-establish the socket while preserving exactly-once, in-order
//!  delivery at the message level (for reliable policies).
//!
//! ## Design goals
//!
//! * Messages, not byte streams: the caller hands over complete messages with a type, a
//!   priority and up to three payload regions (`front`, `middle`, bulk `data`)
//! * At most one pipe per peer at any time; simultaneous connection attempts from both sides
//!   are arbitrated deterministically by comparing peer addresses
//! * Reliable or lossy per *policy*, chosen by peer type: reliable pipes requeue unacked
//!   messages across reconnects, lossy pipes drop everything on the first fault
//! * Sessions survive sockets: a reconnect (or an accepted replacement connection) adopts the
//!   previous socket's queues, sequence counters and negotiated state
//! * Back-pressure through counted byte/message throttles per policy plus a global
//!   dispatch-bytes throttle; throttle units are held for a message's queued lifetime
//! * Per-message CRC-32C integrity and optional per-message signing with a session key
//!   negotiated by a pluggable authorization protocol
//!
//! ## Wire protocol
//!
//! Both sides start with the 13-byte ASCII banner, followed by fixed-size little-endian
//!  address records (`family u16 | port u16 | addr 16 bytes | nonce u32`). The accepting side
//!  sends its own address plus the peer's socket-observed address (a peer behind ambiguous
//!  addressing learns its external identity this way).
//!
//! The connecting side then loops sending a `connect` record:
//!
//! ```ascii
//! features u64 | host_type u32 | global_seq u32 | connect_seq u32 |
//! protocol_version u32 | authorizer_protocol u32 | authorizer_len u32 | flags u8
//! ```
//!
//! and reading a `connect_reply`:
//!
//! ```ascii
//! tag u8 | features u64 | global_seq u32 | connect_seq u32 |
//! protocol_version u32 | authorizer_len u32 | flags u8
//! ```
//!
//! until the reply is `READY` (or `SEQ`, which additionally exchanges the peers' acked
//!  sequence numbers so a resumed session retransmits exactly the unseen suffix). The other
//!  reply tags drive feature/version rejection, authorization retry, session reset, and
//!  connect-race arbitration (`WAIT`).
//!
//! In the open state, single-byte tags frame the stream: `MSG` carries an envelope
//!  (seq/tid/type/priority/region lengths, CRC-32C protected), the payload regions, and a
//!  footer with per-region CRCs and an optional signature; `ACK` carries a 64-bit cumulative
//!  acknowledgement; `KEEPALIVE` and `CLOSE` do what their names say.
//!
//! ## Concurrency model
//!
//! Everything runs as tokio tasks: per pipe one reader and one writer (plus an optional
//!  delayed-delivery task for fault injection), one accept loop, and one reaper that joins
//!  finished workers. A pipe's mutable state lives behind a single async mutex; workers drop
//!  it around socket I/O. The registry lock orders strictly before any pipe lock.

pub mod accepter;
pub mod auth;
pub mod config;
pub mod connection;
pub mod delay_queue;
pub mod dispatcher;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod messenger;
pub mod node_addr;
pub mod pipe;
pub mod safe_converter;
pub mod throttle;

pub use auth::{AuthCheck, AuthProvider, Authorizer, NullAuth, SessionSecurity};
pub use config::MessengerConfig;
pub use connection::ConnectionState;
pub use dispatcher::MessageDispatcher;
pub use frame::features;
pub use message::{prio, Message};
pub use messenger::{Messenger, Policy};
pub use node_addr::NodeAddr;
pub use throttle::Throttle;
