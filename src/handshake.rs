use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{watch, MutexGuard};
use tracing::{debug, trace, warn};

use crate::auth::SessionSecurity;
use crate::config::MessengerConfig;
use crate::frame::{
    self, features, ConnectRecord, ConnectReply, Tag, BANNER, CONNECT_FLAG_LOSSY, PROTOCOL_VERSION,
};
use crate::node_addr::NodeAddr;
use crate::pipe::{
    read_exact_abortable, write_all_abortable, Pipe, PipeCore, PipeState, ReaderInit, ReaderIo,
    WriterIo,
};
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// Upper bound for authorizer payloads; anything bigger is a protocol violation.
const MAX_AUTHORIZER_LEN: u32 = 1024 * 1024;

/// What the accepting side does about an already-registered pipe for the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExistingAction {
    /// The peer's global_seq is stale; it must retry with at least this one.
    RetryGlobal { global_seq: u32 },
    /// The peer's connect_seq is stale; it must retry with this one.
    RetrySession { connect_seq: u32 },
    /// Connect race lost by the incoming attempt: the peer waits for our outgoing pipe.
    Wait,
    /// We hold no usable session state; the peer must restart from connect_seq 0.
    ResetSession,
    /// The incoming attempt wins; the existing pipe is stopped and its queues adopted.
    Replace { reset_session: bool },
    /// The existing pipe is in a state this exchange must never meet.
    ProtocolViolation,
}

/// Pure arbitration between an incoming connect record and an existing registered pipe.
pub(crate) struct ExistingSnapshot {
    pub state: PipeState,
    pub connect_seq: u32,
    pub peer_global_seq: u32,
    pub lossy: bool,
    pub server: bool,
}

pub(crate) fn resolve_existing(
    connect: &ConnectRecord,
    existing: &ExistingSnapshot,
    resetcheck: bool,
    peer_addr: &NodeAddr,
    my_addr: &NodeAddr,
) -> ExistingAction {
    if connect.global_seq < existing.peer_global_seq {
        return ExistingAction::RetryGlobal {
            global_seq: existing.peer_global_seq,
        };
    }

    if existing.lossy {
        // lossy sessions carry nothing worth arbitrating over
        return ExistingAction::Replace { reset_session: true };
    }

    if connect.connect_seq == 0 && existing.connect_seq > 0 {
        // peer reset, then reconnected
        return ExistingAction::Replace {
            reset_session: resetcheck,
        };
    }

    if connect.connect_seq < existing.connect_seq {
        // old attempt, or the peer missed our READY
        return ExistingAction::RetrySession {
            connect_seq: existing.connect_seq + 1,
        };
    }

    if connect.connect_seq == existing.connect_seq {
        if matches!(existing.state, PipeState::Open | PipeState::Standby) {
            // the session already opened; the peer should bump its connect_seq and retry -
            // this is not a race to resolve here
            return ExistingAction::RetrySession {
                connect_seq: existing.connect_seq + 1,
            };
        }

        // connect race
        if peer_addr < my_addr || existing.server {
            // incoming wins
            if !matches!(existing.state, PipeState::Connecting | PipeState::Wait) {
                return ExistingAction::ProtocolViolation;
            }
            return ExistingAction::Replace { reset_session: false };
        } else {
            // our outgoing attempt wins
            if existing.state != PipeState::Connecting {
                return ExistingAction::ProtocolViolation;
            }
            return ExistingAction::Wait;
        }
    }

    // connect.connect_seq > existing.connect_seq
    if resetcheck && existing.connect_seq == 0 {
        // we reset, and the peer is trying to continue a session we no longer have
        return ExistingAction::ResetSession;
    }
    ExistingAction::Replace { reset_session: false }
}

async fn read_hs<R: AsyncRead + Unpin>(
    stream: &mut R,
    abort: &mut watch::Receiver<bool>,
    config: &MessengerConfig,
    buf: &mut [u8],
) -> anyhow::Result<()> {
    crate::pipe::maybe_inject_socket_failure(config)?;
    read_exact_abortable(stream, abort, config.tcp_read_timeout, buf).await
}

async fn write_hs<W: AsyncWrite + Unpin>(
    stream: &mut W,
    abort: &mut watch::Receiver<bool>,
    config: &MessengerConfig,
    buf: &[u8],
) -> anyhow::Result<()> {
    crate::pipe::maybe_inject_socket_failure(config)?;
    write_all_abortable(stream, abort, buf).await
}

async fn read_banner<R: AsyncRead + Unpin>(
    stream: &mut R,
    abort: &mut watch::Receiver<bool>,
    config: &MessengerConfig,
) -> anyhow::Result<()> {
    let mut banner = [0u8; BANNER.len()];
    read_hs(stream, abort, config, &mut banner).await?;
    if &banner != BANNER {
        bail!("peer sent bad banner {:?}", banner);
    }
    Ok(())
}

async fn read_addr<R: AsyncRead + Unpin>(
    stream: &mut R,
    abort: &mut watch::Receiver<bool>,
    config: &MessengerConfig,
) -> anyhow::Result<NodeAddr> {
    let mut buf = [0u8; NodeAddr::SERIALIZED_LEN];
    read_hs(stream, abort, config, &mut buf).await?;
    NodeAddr::try_deser(&mut &buf[..])
}

fn set_socket_options(stream: &TcpStream, config: &MessengerConfig) {
    if config.tcp_nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("couldn't disable Nagle: {}", e);
        }
    }
}

// --------------------------------------- server ------------------------------------------

/// Server-side handshake, run as the first act of the reader task on an accepted socket.
///
/// Returns the reader's socket half on success; on failure the pipe has already transitioned
///  per its policy and queue state.
pub(crate) async fn accept(pipe: &Arc<Pipe>, mut stream: TcpStream) -> Option<ReaderIo> {
    let Some(msgr) = pipe.msgr.upgrade() else {
        return None;
    };
    let config = pipe.config.clone();
    debug!("accepting connection from {:?}", stream.peer_addr().ok());

    set_socket_options(&stream, &config);

    let mut abort = pipe.core.lock().await.new_abort();
    let my_addr = msgr.my_addr();

    let mut replaced = false;

    // banner, my address, and the peer's address as this socket sees it
    let handshake_intro = async {
        let peer_socket_addr = stream.peer_addr()?;

        let mut intro = BytesMut::new();
        intro.extend_from_slice(BANNER);
        my_addr.ser(&mut intro);
        NodeAddr::new(peer_socket_addr, 0).ser(&mut intro);
        write_hs(&mut stream, &mut abort, &config, &intro).await?;

        read_banner(&mut stream, &mut abort, &config).await?;
        let claimed = read_addr(&mut stream, &mut abort, &config).await?;

        let peer_addr = if claimed.is_blank_ip() {
            // peer apparently doesn't know what ip it has; figure it out for it
            let patched = claimed.with_observed_ip(peer_socket_addr.ip());
            debug!("peer addr {:?} is really {:?}", claimed, patched);
            patched
        } else {
            claimed
        };
        anyhow::Ok(peer_addr)
    };
    let peer_addr = match handshake_intro.await {
        Ok(addr) => addr,
        Err(e) => {
            debug!("accept failed during banner/address exchange: {}", e);
            return accept_fail(pipe, replaced).await;
        }
    };
    debug!("accept: peer addr is {:?}", peer_addr);

    {
        let mut core = pipe.core.lock().await;
        core.peer_addr = peer_addr;
        core.connection.set_peer_addr(peer_addr);
    }

    let mut reply_tag: Option<Tag> = None;
    let mut adopted_in_seq: u64 = 0;

    let (reply, auth_reply) = loop {
        if msgr.is_stopping() {
            return accept_shutdown(pipe).await;
        }

        let mut record_buf = [0u8; ConnectRecord::SERIALIZED_LEN];
        if let Err(e) = read_hs(&mut stream, &mut abort, &config, &mut record_buf).await {
            debug!("accept couldn't read connect record: {}", e);
            return accept_fail(pipe, replaced).await;
        }
        let connect = match ConnectRecord::try_deser(&mut &record_buf[..]) {
            Ok(c) => c,
            Err(e) => {
                debug!("accept got malformed connect record: {}", e);
                return accept_fail(pipe, replaced).await;
            }
        };

        if connect.authorizer_len > MAX_AUTHORIZER_LEN {
            warn!("accept got oversized authorizer ({} bytes)", connect.authorizer_len);
            return accept_fail(pipe, replaced).await;
        }
        let mut authorizer = vec![0u8; connect.authorizer_len.safe_cast()];
        if !authorizer.is_empty() {
            if let Err(e) = read_hs(&mut stream, &mut abort, &config, &mut authorizer).await {
                debug!("accept couldn't read authorizer: {}", e);
                return accept_fail(pipe, replaced).await;
            }
        }

        trace!(
            "accept got peer connect_seq {} global_seq {}",
            connect.connect_seq,
            connect.global_seq
        );

        let mut policy = msgr.get_policy(connect.host_type);
        {
            let mut core = pipe.core.lock().await;
            core.peer_type = connect.host_type;
            core.connection.set_peer_type(connect.host_type);
        }

        let mut reply = ConnectReply::for_protocol_version(PROTOCOL_VERSION);

        if connect.protocol_version != PROTOCOL_VERSION {
            debug!(
                "accept protocol version mismatch: mine {}, theirs {}",
                PROTOCOL_VERSION, connect.protocol_version
            );
            reply.tag = Tag::BadProtoVer.into();
            if write_reply(&mut stream, &mut abort, &config, &reply, &[]).await.is_err() {
                return accept_fail(pipe, replaced).await;
            }
            continue;
        }

        if connect.authorizer_protocol != 0 && signatures_required(&config, &policy) {
            debug!("authenticated peer, requiring message signatures");
            policy.features_required |= features::MSG_AUTH;
        }

        let feat_missing = policy.features_required & !connect.features;
        if feat_missing != 0 {
            debug!("peer missing required features {:#x}", feat_missing);
            reply.tag = Tag::Features.into();
            reply.features = policy.features_required;
            if write_reply(&mut stream, &mut abort, &config, &reply, &[]).await.is_err() {
                return accept_fail(pipe, replaced).await;
            }
            continue;
        }

        let check = msgr
            .auth()
            .verify_authorizer(connect.host_type, connect.authorizer_protocol, &authorizer);
        if !check.valid {
            debug!("accept got bad authorizer");
            reply.tag = Tag::BadAuthorizer.into();
            reply.authorizer_len = check.reply.len().prechecked_cast();
            if write_reply(&mut stream, &mut abort, &config, &reply, &check.reply).await.is_err() {
                return accept_fail(pipe, replaced).await;
            }
            continue;
        }

        {
            let mut core = pipe.core.lock().await;
            core.policy = policy.clone();
        }

        // registry decision; lock order is registry -> pipe
        let mut registry = msgr.registry().await;
        if msgr.is_stopping() {
            return accept_shutdown(pipe).await;
        }

        let existing = registry.lookup(&peer_addr);
        if let Some(existing) = existing {
            let mut ex = existing.core.lock().await;
            let snapshot = ExistingSnapshot {
                state: ex.state,
                connect_seq: ex.connect_seq,
                peer_global_seq: ex.peer_global_seq,
                lossy: ex.policy.lossy,
                server: ex.policy.server,
            };
            let action = resolve_existing(&connect, &snapshot, policy.resetcheck, &peer_addr, &my_addr);
            debug!(
                "accept: existing pipe (cseq {}, pgs {}, {:?}) -> {:?}",
                snapshot.connect_seq, snapshot.peer_global_seq, snapshot.state, action
            );

            match action {
                ExistingAction::RetryGlobal { global_seq } => {
                    drop(ex);
                    drop(registry);
                    reply.tag = Tag::RetryGlobal.into();
                    reply.global_seq = global_seq;
                    if write_reply(&mut stream, &mut abort, &config, &reply, &[]).await.is_err() {
                        return accept_fail(pipe, replaced).await;
                    }
                    continue;
                }
                ExistingAction::RetrySession { connect_seq } => {
                    drop(ex);
                    drop(registry);
                    reply.tag = Tag::RetrySession.into();
                    reply.connect_seq = connect_seq;
                    if write_reply(&mut stream, &mut abort, &config, &reply, &[]).await.is_err() {
                        return accept_fail(pipe, replaced).await;
                    }
                    continue;
                }
                ExistingAction::Wait => {
                    // make sure our outgoing attempt follows through
                    ex.keepalive = true;
                    existing.cond.notify_waiters();
                    drop(ex);
                    drop(registry);
                    reply.tag = Tag::Wait.into();
                    if write_reply(&mut stream, &mut abort, &config, &reply, &[]).await.is_err() {
                        return accept_fail(pipe, replaced).await;
                    }
                    continue;
                }
                ExistingAction::ResetSession => {
                    drop(ex);
                    drop(registry);
                    reply.tag = Tag::ResetSession.into();
                    if write_reply(&mut stream, &mut abort, &config, &reply, &[]).await.is_err() {
                        return accept_fail(pipe, replaced).await;
                    }
                    continue;
                }
                ExistingAction::ProtocolViolation => {
                    warn!(
                        "accept race met existing pipe in state {:?}, dropping the attempt",
                        snapshot.state
                    );
                    drop(ex);
                    drop(registry);
                    return accept_fail(pipe, replaced).await;
                }
                ExistingAction::Replace { reset_session } => {
                    if reset_session {
                        existing.was_session_reset_locked(&mut ex).await;
                    }
                    if connect.features & features::RECONNECT_SEQ != 0 {
                        reply_tag = Some(Tag::Seq);
                    }

                    debug!("accept replacing existing pipe to {:?}", peer_addr);
                    existing.stop_locked(&mut ex);
                    registry.unregister(&peer_addr, &existing);
                    replaced = true;

                    if !ex.policy.lossy {
                        // our pipe is not registered yet, so taking its lock after the
                        // existing pipe's cannot deadlock
                        let mut core = pipe.core.lock().await;

                        // adopt the peer-facing connection handle
                        core.connection = ex.connection.clone();
                        core.connection.set_pipe(pipe);
                        core.session_security = ex.session_security.clone();

                        // flush any delayed messages into the dispatch queue first
                        if let Some(delay) = ex.delay_queue.clone() {
                            delay.flush().await;
                        }

                        // steal the inbound stream identity and position
                        std::mem::swap(&mut core.conn_id, &mut ex.conn_id);
                        core.in_seq = ex.in_seq;
                        core.in_seq_acked = ex.in_seq;
                        adopted_in_seq = ex.in_seq;

                        // steal the outbound queues; unacked messages come first
                        ex.requeue_sent();
                        core.out_seq = ex.out_seq;
                        for (priority, mut queue) in std::mem::take(&mut ex.out_q) {
                            let ours = core.out_q.entry(priority).or_default();
                            queue.extend(ours.drain(..));
                            *ours = queue;
                        }
                        trace!(
                            "accept re-queued on out_seq {} in_seq {}",
                            core.out_seq,
                            core.in_seq
                        );
                    }
                    drop(ex);

                    // open while still holding the registry lock, so nobody can slip a
                    // pipe for this peer in between the unregister and our registration
                    let Some(reply) = open_session(
                        pipe,
                        &msgr,
                        &mut registry,
                        &connect,
                        &policy,
                        reply_tag,
                        replaced,
                        check.session_key,
                        check.reply.len().prechecked_cast(),
                        peer_addr,
                    )
                    .await
                    else {
                        drop(registry);
                        return accept_shutdown(pipe).await;
                    };
                    break (reply, check.reply);
                }
            }
        } else if policy.resetcheck && connect.connect_seq > 0 {
            // we have no session state, but the peer is trying to continue one
            drop(registry);
            debug!(
                "accept: peer sent connect_seq {} but we have no session, sending RESETSESSION",
                connect.connect_seq
            );
            reply.tag = Tag::ResetSession.into();
            if write_reply(&mut stream, &mut abort, &config, &reply, &[]).await.is_err() {
                return accept_fail(pipe, replaced).await;
            }
            continue;
        } else {
            debug!("accept: new session");
            let Some(reply) = open_session(
                pipe,
                &msgr,
                &mut registry,
                &connect,
                &policy,
                reply_tag,
                replaced,
                check.session_key,
                check.reply.len().prechecked_cast(),
                peer_addr,
            )
            .await
            else {
                drop(registry);
                return accept_shutdown(pipe).await;
            };
            break (reply, check.reply);
        }
    };

    if write_reply(&mut stream, &mut abort, &config, &reply, &auth_reply).await.is_err() {
        debug!("accept couldn't write ready reply");
        return accept_fail_registered(pipe, replaced).await;
    }

    let mut newly_acked_seq: u64 = 0;
    if reply_tag == Some(Tag::Seq) {
        if write_hs(&mut stream, &mut abort, &config, &adopted_in_seq.to_le_bytes()).await.is_err() {
            debug!("accept write error on in_seq");
            return accept_fail_registered(pipe, replaced).await;
        }
        let mut buf = [0u8; 8];
        if read_hs(&mut stream, &mut abort, &config, &mut buf).await.is_err() {
            debug!("accept read error on peer's acked seq");
            return accept_fail_registered(pipe, replaced).await;
        }
        newly_acked_seq = u64::from_le_bytes(buf);
    }

    let (read_half, write_half) = stream.into_split();

    let mut core = pipe.core.lock().await;
    core.pending_writer = Some(WriterIo {
        half: write_half,
        abort: abort.clone(),
    });
    core.discard_requeued_up_to(newly_acked_seq);
    if core.state != PipeState::Closed {
        pipe.start_writer(&mut core);
    }
    drop(core);

    pipe.maybe_start_delay_queue().await;
    msgr.dispatcher().on_accept(pipe.connection().await).await;
    debug!("accept done");

    Some(ReaderIo {
        half: read_half,
        abort,
    })
}

/// Finish the server-side handshake: adopt the negotiated parameters, move to OPEN and
///  register. Runs under the registry lock so the decision and the registration are atomic.
#[allow(clippy::too_many_arguments)]
async fn open_session(
    pipe: &Arc<Pipe>,
    msgr: &Arc<crate::messenger::Messenger>,
    registry: &mut crate::messenger::Registry,
    connect: &ConnectRecord,
    policy: &crate::messenger::Policy,
    reply_tag: Option<Tag>,
    replaced: bool,
    session_key: Option<Bytes>,
    auth_reply_len: u32,
    peer_addr: NodeAddr,
) -> Option<ConnectReply> {
    let mut core = pipe.core.lock().await;
    if core.state == PipeState::Closed {
        // stopped while the handshake was in flight; a closed pipe never reopens
        return None;
    }

    core.connect_seq = connect.connect_seq + 1;
    core.peer_global_seq = connect.global_seq;
    core.state = PipeState::Open;
    core.policy = policy.clone();

    let mut reply = ConnectReply::for_protocol_version(PROTOCOL_VERSION);
    reply.tag = reply_tag.unwrap_or(Tag::Ready).into();
    reply.features = policy.features_supported;
    reply.global_seq = msgr.issue_global_seq(0);
    reply.connect_seq = core.connect_seq;
    reply.authorizer_len = auth_reply_len;
    if policy.lossy {
        reply.flags |= CONNECT_FLAG_LOSSY;
    }

    core.connection.set_features(reply.features & connect.features);
    debug!(
        "accept success, connect_seq {}, features {:#x}",
        core.connect_seq,
        core.connection.features()
    );

    if !replaced {
        core.randomize_out_seq();
    }
    core.session_security = session_security_for(&core, session_key);

    registry.register(peer_addr, pipe.clone());
    registry.accept_done(pipe);
    Some(reply)
}

fn signatures_required(config: &MessengerConfig, policy: &crate::messenger::Policy) -> bool {
    config.require_signatures
        || (policy.cluster && config.cluster_require_signatures)
        || (!policy.cluster && config.service_require_signatures)
}

fn session_security_for(core: &PipeCore, session_key: Option<Bytes>) -> Option<SessionSecurity> {
    match session_key {
        Some(key) if core.connection.has_feature(features::MSG_AUTH) => {
            Some(SessionSecurity::new(key))
        }
        _ => None,
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(
    stream: &mut W,
    abort: &mut watch::Receiver<bool>,
    config: &MessengerConfig,
    reply: &ConnectReply,
    auth_reply: &[u8],
) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(ConnectReply::SERIALIZED_LEN + auth_reply.len());
    reply.ser(&mut buf);
    buf.extend_from_slice(auth_reply);
    write_hs(stream, abort, config, &buf).await
}

async fn accept_fail_registered(pipe: &Arc<Pipe>, replaced: bool) -> Option<ReaderIo> {
    if let Some(msgr) = pipe.msgr.upgrade() {
        msgr.inject_internal_delay().await;
    }
    accept_fail(pipe, replaced).await
}

/// Shared accept failure path: where the pipe goes depends on whether it holds adopted work.
async fn accept_fail(pipe: &Arc<Pipe>, replaced: bool) -> Option<ReaderIo> {
    let mut core = pipe.core.lock().await;
    if core.state == PipeState::Closed {
        return None;
    }

    let queued = core.is_queued();
    if queued {
        core.state = if core.policy.server {
            PipeState::Standby
        } else {
            PipeState::Connecting
        };
    } else if replaced {
        core.state = PipeState::Standby;
    } else {
        pipe.stop_locked(&mut core);
    }

    pipe.fault(core, false).await;

    if queued || replaced {
        let mut core = pipe.core.lock().await;
        if !core.writer_running && core.state != PipeState::Closed {
            pipe.start_writer(&mut core);
        }
    }
    None
}

async fn accept_shutdown(pipe: &Arc<Pipe>) -> Option<ReaderIo> {
    if let Some(msgr) = pipe.msgr.upgrade() {
        msgr.inject_internal_delay().await;
    }
    let mut core = pipe.core.lock().await;
    pipe.stop_locked(&mut core);
    None
}

// --------------------------------------- client ------------------------------------------

/// Client-side handshake, run from the writer while the pipe is CONNECTING. Takes the pipe
///  lock by value and drops it around all socket I/O. Returns the writer's socket half on
///  success.
pub(crate) async fn connect(pipe: &Arc<Pipe>, core: MutexGuard<'_, PipeCore>) -> Option<WriterIo> {
    let mut core = core;
    let Some(msgr) = pipe.msgr.upgrade() else {
        pipe.stop_locked(&mut core);
        return None;
    };
    let config = pipe.config.clone();

    debug!("connect to {:?}, cseq {}", core.peer_addr, core.connect_seq);

    let mut cseq = core.connect_seq;
    let mut gseq = msgr.issue_global_seq(0);

    // stop the previous reader; a fresh one is started once the session opens
    let reader_handle = core.reader_handle.take();
    pipe.cond.notify_waiters();

    let peer_addr = core.peer_addr;
    let peer_type = core.peer_type;
    let policy = core.policy.clone();
    let connection = core.connection.clone();
    let mut abort = core.new_abort();
    drop(core);

    if let Some(handle) = reader_handle {
        let _ = handle.await;
    }

    // socket setup and banner / address exchange
    let setup = async {
        let socket = if peer_addr.socket_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if config.tcp_rcvbuf > 0 {
            socket.set_recv_buffer_size(config.tcp_rcvbuf.prechecked_cast())?;
        }

        trace!("connecting socket to {:?}", peer_addr);
        let mut stream = tokio::select! {
            result = socket.connect(peer_addr.socket_addr) => result?,
            _ = wait_abort(&mut abort) => bail!("socket was shut down"),
        };
        set_socket_options(&stream, &config);

        read_banner(&mut stream, &mut abort, &config).await?;
        write_hs(&mut stream, &mut abort, &config, BANNER).await?;

        let claimed_peer = read_addr(&mut stream, &mut abort, &config).await?;
        let my_addr_observed = read_addr(&mut stream, &mut abort, &config).await?;

        if claimed_peer != peer_addr {
            if claimed_peer.is_blank_ip()
                && claimed_peer.port() == peer_addr.port()
                && claimed_peer.nonce == peer_addr.nonce
            {
                debug!(
                    "peer claims to be {:?} not {:?} - presumably the same node",
                    claimed_peer, peer_addr
                );
            } else {
                bail!(
                    "peer claims to be {:?}, not {:?} - wrong node",
                    claimed_peer,
                    peer_addr
                );
            }
        }

        trace!("peer sees my address as {:?}", my_addr_observed);
        msgr.learned_addr(my_addr_observed);

        let mut addr_buf = BytesMut::new();
        msgr.my_addr().ser(&mut addr_buf);
        write_hs(&mut stream, &mut abort, &config, &addr_buf).await?;
        anyhow::Ok(stream)
    };
    let mut stream = match setup.await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("connect setup to {:?} failed: {}", peer_addr, e);
            return connect_fault(pipe, &msgr).await;
        }
    };

    let mut got_bad_auth = false;
    loop {
        let authorizer = msgr.auth().get_authorizer(peer_type, got_bad_auth);

        let record = ConnectRecord {
            features: policy.features_supported,
            host_type: msgr.host_type(),
            global_seq: gseq,
            connect_seq: cseq,
            protocol_version: PROTOCOL_VERSION,
            authorizer_protocol: authorizer.as_ref().map(|a| a.protocol).unwrap_or(0),
            authorizer_len: authorizer
                .as_ref()
                .map(|a| a.bytes.len().prechecked_cast())
                .unwrap_or(0),
            // fyi only: the server decides
            flags: if policy.lossy { CONNECT_FLAG_LOSSY } else { 0 },
        };

        trace!("connect sending gseq {} cseq {}", gseq, cseq);
        let mut buf = BytesMut::with_capacity(
            ConnectRecord::SERIALIZED_LEN
                + authorizer.as_ref().map(|a| a.bytes.len()).unwrap_or(0),
        );
        record.ser(&mut buf);
        if let Some(a) = &authorizer {
            buf.extend_from_slice(&a.bytes);
        }
        if let Err(e) = write_hs(&mut stream, &mut abort, &config, &buf).await {
            debug!("connect couldn't write connect record: {}", e);
            return connect_fault(pipe, &msgr).await;
        }

        let mut reply_buf = [0u8; ConnectReply::SERIALIZED_LEN];
        if let Err(e) = read_hs(&mut stream, &mut abort, &config, &mut reply_buf).await {
            debug!("connect couldn't read reply: {}", e);
            return connect_fault(pipe, &msgr).await;
        }
        let reply = match ConnectReply::try_deser(&mut &reply_buf[..]) {
            Ok(r) => r,
            Err(e) => {
                debug!("connect got malformed reply: {}", e);
                return connect_fault(pipe, &msgr).await;
            }
        };
        trace!(
            "connect got reply tag {} connect_seq {} global_seq {}",
            reply.tag,
            reply.connect_seq,
            reply.global_seq
        );

        if reply.authorizer_len > MAX_AUTHORIZER_LEN {
            debug!("connect got oversized authorizer reply");
            return connect_fault(pipe, &msgr).await;
        }
        let mut auth_reply = vec![0u8; reply.authorizer_len.safe_cast()];
        if !auth_reply.is_empty() {
            if let Err(e) = read_hs(&mut stream, &mut abort, &config, &mut auth_reply).await {
                debug!("connect couldn't read authorizer reply: {}", e);
                return connect_fault(pipe, &msgr).await;
            }
        }
        if let Some(a) = &authorizer {
            if !msgr.auth().verify_reply(a, &auth_reply) {
                warn!("failed verifying authorizer reply");
                return connect_fault(pipe, &msgr).await;
            }
        }

        msgr.inject_internal_delay().await;

        let mut core = pipe.core.lock().await;
        if core.state != PipeState::Connecting {
            debug!("connect interrupted, no longer connecting");
            return None;
        }

        let tag = match frame::tag_from_byte(reply.tag) {
            Ok(tag) => tag,
            Err(e) => {
                debug!("connect: {}", e);
                pipe.fault(core, false).await;
                return None;
            }
        };

        match tag {
            Tag::Features => {
                warn!(
                    "connect feature mismatch: my {:#x} < peer required {:#x}",
                    policy.features_supported, reply.features
                );
                pipe.terminal_fault(core).await;
                return None;
            }
            Tag::BadProtoVer => {
                warn!(
                    "connect protocol version mismatch: my {} != peer {}",
                    PROTOCOL_VERSION, reply.protocol_version
                );
                pipe.terminal_fault(core).await;
                return None;
            }
            Tag::BadAuthorizer => {
                debug!("connect got BADAUTHORIZER");
                if got_bad_auth {
                    warn!("authorizer rejected twice, giving up");
                    pipe.terminal_fault(core).await;
                    return None;
                }
                got_bad_auth = true;
                drop(core);
                // retry with a fresh authorizer
            }
            Tag::ResetSession => {
                debug!("connect got RESETSESSION");
                pipe.was_session_reset_locked(&mut core).await;
                cseq = 0;
                drop(core);
            }
            Tag::RetryGlobal => {
                gseq = msgr.issue_global_seq(reply.global_seq);
                debug!("connect got RETRY_GLOBAL {}, choosing new {}", reply.global_seq, gseq);
                drop(core);
            }
            Tag::RetrySession => {
                if reply.connect_seq <= cseq {
                    warn!(
                        "connect got RETRY_SESSION with non-advancing cseq {} <= {}",
                        reply.connect_seq, cseq
                    );
                    pipe.fault(core, false).await;
                    return None;
                }
                debug!("connect got RETRY_SESSION {} -> {}", cseq, reply.connect_seq);
                cseq = reply.connect_seq;
                core.connect_seq = cseq;
                drop(core);
            }
            Tag::Wait => {
                debug!("connect got WAIT (connection race)");
                core.state = PipeState::Wait;
                return None;
            }
            Tag::Ready | Tag::Seq => {
                let feat_missing = policy.features_required & !reply.features;
                if feat_missing != 0 {
                    warn!("peer missing required features {:#x}", feat_missing);
                    pipe.terminal_fault(core).await;
                    return None;
                }

                if tag == Tag::Seq {
                    // SEQ must only arrive when we advertised the feature
                    debug_assert!(
                        policy.features_supported & features::RECONNECT_SEQ != 0,
                        "peer sent SEQ without negotiated reconnect-seq support"
                    );
                    let mut buf = [0u8; 8];
                    if read_hs(&mut stream, &mut abort, &config, &mut buf).await.is_err() {
                        debug!("connect read error on peer's acked seq");
                        pipe.fault(core, false).await;
                        return None;
                    }
                    let newly_acked_seq = u64::from_le_bytes(buf);
                    trace!("connect got acked seq {}", newly_acked_seq);
                    if core.handle_ack(newly_acked_seq) {
                        pipe.stop_locked(&mut core);
                        return None;
                    }
                    let in_seq = core.in_seq;
                    if write_hs(&mut stream, &mut abort, &config, &in_seq.to_le_bytes())
                        .await
                        .is_err()
                    {
                        debug!("connect write error on in_seq");
                        pipe.fault(core, false).await;
                        return None;
                    }
                }

                core.peer_global_seq = reply.global_seq;
                core.policy.lossy = reply.flags & CONNECT_FLAG_LOSSY != 0;
                core.state = PipeState::Open;
                core.connect_seq = cseq + 1;
                debug_assert_eq!(core.connect_seq, reply.connect_seq);
                core.backoff = Duration::ZERO;
                connection.set_features(reply.features & policy.features_supported);

                core.session_security = session_security_for(
                    &core,
                    authorizer.and_then(|a| a.session_key),
                );

                debug!(
                    "connect success, connect_seq {}, lossy {}, features {:#x}",
                    core.connect_seq,
                    core.policy.lossy,
                    connection.features()
                );

                let (read_half, write_half) = stream.into_split();
                pipe.start_reader(
                    &mut core,
                    ReaderInit::Open(ReaderIo {
                        half: read_half,
                        abort: abort.clone(),
                    }),
                );
                drop(core);

                pipe.maybe_start_delay_queue().await;
                msgr.dispatcher().on_connect(connection).await;

                return Some(WriterIo {
                    half: write_half,
                    abort,
                });
            }
            other => {
                debug!("connect got unexpected tag {:?}", other);
                pipe.fault(core, false).await;
                return None;
            }
        }
    }
}

async fn wait_abort(abort: &mut watch::Receiver<bool>) {
    let _ = abort.wait_for(|shut| *shut).await;
}

async fn connect_fault(pipe: &Arc<Pipe>, msgr: &Arc<crate::messenger::Messenger>) -> Option<WriterIo> {
    msgr.inject_internal_delay().await;
    let core = pipe.core.lock().await;
    if core.state == PipeState::Connecting {
        pipe.fault(core, false).await;
    } else {
        debug!("connect fault, but no longer connecting");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn connect_record(global_seq: u32, connect_seq: u32) -> ConnectRecord {
        ConnectRecord {
            features: features::ALL,
            host_type: 0,
            global_seq,
            connect_seq,
            protocol_version: PROTOCOL_VERSION,
            authorizer_protocol: 0,
            authorizer_len: 0,
            flags: 0,
        }
    }

    fn existing(state: PipeState, connect_seq: u32, peer_global_seq: u32) -> ExistingSnapshot {
        ExistingSnapshot {
            state,
            connect_seq,
            peer_global_seq,
            lossy: false,
            server: false,
        }
    }

    const LOW: &str = "10.0.0.1:6800";
    const HIGH: &str = "10.0.0.2:6800";

    fn addr(s: &str) -> NodeAddr {
        NodeAddr::new(s.parse().unwrap(), 0)
    }

    #[rstest]
    #[case::stale_global_seq(
        connect_record(3, 5), existing(PipeState::Open, 5, 7), false, HIGH, LOW,
        ExistingAction::RetryGlobal { global_seq: 7 })]
    #[case::peer_reset(
        connect_record(9, 0), existing(PipeState::Open, 4, 7), false, HIGH, LOW,
        ExistingAction::Replace { reset_session: false })]
    #[case::peer_reset_with_resetcheck(
        connect_record(9, 0), existing(PipeState::Open, 4, 7), true, HIGH, LOW,
        ExistingAction::Replace { reset_session: true })]
    #[case::stale_connect_seq(
        connect_record(9, 2), existing(PipeState::Open, 4, 7), false, HIGH, LOW,
        ExistingAction::RetrySession { connect_seq: 5 })]
    #[case::equal_cseq_existing_open(
        connect_record(9, 4), existing(PipeState::Open, 4, 7), false, HIGH, LOW,
        ExistingAction::RetrySession { connect_seq: 5 })]
    #[case::equal_cseq_existing_standby(
        connect_record(9, 4), existing(PipeState::Standby, 4, 7), false, HIGH, LOW,
        ExistingAction::RetrySession { connect_seq: 5 })]
    // A (10.0.0.1) and B (10.0.0.2) connect simultaneously with cseq 0. On B's side the
    // incoming peer (A) sorts lower, so A's incoming attempt wins there; on A's side the
    // incoming peer (B) sorts higher, so A keeps its own outgoing attempt and B waits.
    #[case::race_incoming_wins(
        connect_record(9, 0), existing(PipeState::Connecting, 0, 7), false, LOW, HIGH,
        ExistingAction::Replace { reset_session: false })]
    #[case::race_outgoing_wins(
        connect_record(9, 0), existing(PipeState::Connecting, 0, 7), false, HIGH, LOW,
        ExistingAction::Wait)]
    #[case::race_server_policy_forces_replace(
        connect_record(9, 0),
        ExistingSnapshot { state: PipeState::Wait, connect_seq: 0, peer_global_seq: 7, lossy: false, server: true },
        false, HIGH, LOW,
        ExistingAction::Replace { reset_session: false })]
    #[case::race_bad_state_incoming(
        connect_record(9, 0), existing(PipeState::Accepting, 0, 7), false, LOW, HIGH,
        ExistingAction::ProtocolViolation)]
    #[case::race_bad_state_outgoing(
        connect_record(9, 0), existing(PipeState::Wait, 0, 7), false, HIGH, LOW,
        ExistingAction::ProtocolViolation)]
    #[case::reconnect(
        connect_record(9, 6), existing(PipeState::Standby, 4, 7), false, HIGH, LOW,
        ExistingAction::Replace { reset_session: false })]
    #[case::reconnect_after_our_reset(
        connect_record(9, 6), existing(PipeState::Standby, 0, 7), true, HIGH, LOW,
        ExistingAction::ResetSession)]
    #[case::lossy_always_replaces(
        connect_record(9, 3),
        ExistingSnapshot { state: PipeState::Open, connect_seq: 3, peer_global_seq: 7, lossy: true, server: false },
        false, HIGH, LOW,
        ExistingAction::Replace { reset_session: true })]
    fn test_resolve_existing(
        #[case] connect: ConnectRecord,
        #[case] existing: ExistingSnapshot,
        #[case] resetcheck: bool,
        #[case] peer: &str,
        #[case] mine: &str,
        #[case] expected: ExistingAction,
    ) {
        let actual = resolve_existing(&connect, &existing, resetcheck, &addr(peer), &addr(mine));
        assert_eq!(actual, expected);
    }

    /// Property: for any address pair, exactly one side replies WAIT in a symmetric race.
    #[rstest]
    #[case(LOW, HIGH)]
    #[case(HIGH, LOW)]
    fn test_race_is_antisymmetric(#[case] a: &str, #[case] b: &str) {
        let connect = connect_record(9, 0);
        let ex = existing(PipeState::Connecting, 0, 7);

        let at_a = resolve_existing(&connect, &ex, false, &addr(b), &addr(a));
        let at_b = resolve_existing(&connect, &ex, false, &addr(a), &addr(b));

        let waits = [&at_a, &at_b]
            .iter()
            .filter(|action| ***action == ExistingAction::Wait)
            .count();
        let replaces = [&at_a, &at_b]
            .iter()
            .filter(|action| matches!(***action, ExistingAction::Replace { .. }))
            .count();
        assert_eq!(waits, 1);
        assert_eq!(replaces, 1);
    }
}
