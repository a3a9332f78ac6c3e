//! Tunnel negotiation driver.
//!
//! Runs the per-phase handshake machines over the shared socket state.
//! Handlers here never touch the reactor directly; they mutate state and
//! return owner events plus deferred [`Action`]s, exactly like all other
//! socket phase logic.

use std::io;

use reactor::{NetEvent, Readiness};
use tracing::{debug, trace};

use crate::error::{ProxyError, SocketError};
use crate::socket::{Action, Fill, OwnerEvent, Phase, ProxyKind, SocketState};

mod http;
mod socks;

use self::socks::Parsed;

/// Read chunk while negotiating. Replies are tiny; HTTP headers are the
/// only multi-read case.
const NEGOTIATE_CHUNK: usize = 1024;

/// Dispatches a readiness event that arrived in a tunnel phase.
pub(crate) fn on_event(st: &mut SocketState, ev: NetEvent) -> (Option<OwnerEvent>, Vec<Action>) {
    match ev.readiness {
        Readiness::Writable => {
            if st.phase == Phase::ProxyTcpConnect {
                return match st.pending_error() {
                    None => {
                        st.touch();
                        begin_negotiation(st)
                    }
                    Some(kind) => fail(st, SocketError::Io(io::Error::from(kind))),
                };
            }
            // The owner's writable interest survives the handshake; replay
            // it once the stream is theirs.
            st.replay_writable = true;
            match st.drain_queue() {
                Ok(_) => (None, Vec::new()),
                Err(e) => {
                    debug!(error = %e, "handshake frame lost mid-flight");
                    fail(st, ProxyError::SendFailed.into())
                }
            }
        }
        Readiness::Readable => match pull_replies(st) {
            Ok(eof) => {
                let out = advance(st);
                if out.0.is_none() && eof && !is_settled(st.phase) {
                    return fail(st, ProxyError::ReceiveFailed.into());
                }
                out
            }
            Err(p) => fail(st, p.into()),
        },
        Readiness::Closed => {
            if st.phase == Phase::ProxyTcpConnect {
                let kind = ev
                    .error
                    .or_else(|| st.pending_error())
                    .unwrap_or(io::ErrorKind::ConnectionRefused);
                return fail(st, SocketError::Io(io::Error::from(kind)));
            }
            // A reply may already sit in the buffer; give it one last look.
            let out = advance(st);
            if out.0.is_some() || is_settled(st.phase) {
                return out;
            }
            fail(st, ProxyError::ReceiveFailed.into())
        }
        Readiness::AcceptReady => (None, Vec::new()),
    }
}

/// Continues a SOCKS4 handshake once the resolver reported back.
pub(crate) fn on_resolved(st: &mut SocketState) -> (Option<OwnerEvent>, Vec<Action>) {
    match st.resolve_result.take() {
        Some(Ok(ip)) => {
            trace!(%ip, "target resolved, sending SOCKS4 request");
            if let Some(t) = st.target.as_mut() {
                t.ip = Some(ip);
            }
            begin_negotiation(st)
        }
        _ => fail(st, ProxyError::ResolveFailed.into()),
    }
}

/// Sends the opening frame of the configured tunnel protocol.
fn begin_negotiation(st: &mut SocketState) -> (Option<OwnerEvent>, Vec<Action>) {
    let (Some(setup), Some(target)) = (st.setup.clone(), st.target.clone()) else {
        return fail(st, SocketError::NotOpen);
    };
    let cmd = if st.bind_mode {
        socks::CMD_BIND
    } else {
        socks::CMD_CONNECT
    };
    match setup.kind {
        ProxyKind::Socks4 => match target.ip {
            Some(ip) => send_then(
                st,
                &socks::socks4_request(cmd, ip, target.port, setup.user.as_deref()),
                socks4_wait_phase(st.bind_mode),
            ),
            None => {
                st.phase = Phase::ResolveTarget;
                (
                    None,
                    vec![Action::Resolve {
                        host: target.host.clone(),
                    }],
                )
            }
        },
        ProxyKind::Socks4A => match target.ip {
            // A known address skips the proxy-side lookup.
            Some(ip) => send_then(
                st,
                &socks::socks4_request(cmd, ip, target.port, setup.user.as_deref()),
                socks4_wait_phase(st.bind_mode),
            ),
            None => send_then(
                st,
                &socks::socks4a_request(cmd, &target.host, target.port, setup.user.as_deref()),
                socks4_wait_phase(st.bind_mode),
            ),
        },
        ProxyKind::Socks5 => send_then(
            st,
            &socks::socks5_method_offer(setup.has_credentials()),
            Phase::Socks5AwaitMethod,
        ),
        ProxyKind::HttpConnect => {
            let login = setup
                .user
                .as_deref()
                .map(|u| (u, setup.password.as_deref().map_or("", |p| p.as_str())));
            send_then(
                st,
                &http::connect_request(&target.host, target.port, login),
                Phase::HttpAwaitStatus,
            )
        }
    }
}

fn socks4_wait_phase(bind: bool) -> Phase {
    if bind {
        Phase::Socks4AwaitBindReply
    } else {
        Phase::Socks4AwaitReply
    }
}

fn send_then(st: &mut SocketState, frame: &[u8], next: Phase) -> (Option<OwnerEvent>, Vec<Action>) {
    match st.send_frame(frame) {
        Ok(()) => {
            st.phase = next;
            (None, Vec::new())
        }
        Err(p) => fail(st, p.into()),
    }
}

/// Runs a frame parser over the buffered bytes, consuming a complete frame
/// and nothing past it.
fn buffered_frame<T>(
    st: &mut SocketState,
    parse: impl Fn(&[u8]) -> Parsed<T>,
) -> Parsed<T> {
    let parsed = parse(st.read_buf.as_slice());
    if let Parsed::Done(_, used) = &parsed {
        st.read_buf.consume(*used);
    }
    parsed
}

/// Pops one CRLF line off the buffer, or `None` while it is incomplete. A
/// line running past `max` bytes without a terminator is not a reply.
fn take_line(st: &mut SocketState, max: usize) -> Result<Option<String>, ProxyError> {
    let (found, over) = {
        let buffered = st.read_buf.as_slice();
        (memchr::memchr(b'\n', buffered), buffered.len() > max)
    };
    let Some(idx) = found else {
        if over {
            return Err(ProxyError::UnexpectedReply);
        }
        return Ok(None);
    };
    let mut line = st.read_buf.as_slice()[..idx].to_vec();
    st.read_buf.consume(idx + 1);
    while line.last() == Some(&b'\r') {
        line.pop();
    }
    match String::from_utf8(line) {
        Ok(text) => Ok(Some(text)),
        Err(_) => Err(ProxyError::UnexpectedReply),
    }
}

/// Reads whatever the proxy sent so far. `Ok(true)` when the stream hit EOF.
fn pull_replies(st: &mut SocketState) -> Result<bool, ProxyError> {
    loop {
        match st.fill_buffered(NEGOTIATE_CHUNK) {
            Ok(Fill::Bytes { maybe_more, .. }) => {
                if !maybe_more {
                    return Ok(false);
                }
            }
            Ok(Fill::WouldBlock) => return Ok(false),
            Ok(Fill::Eof) => return Ok(true),
            Err(e) => {
                debug!(error = %e, "receive failed during negotiation");
                return Err(ProxyError::ReceiveFailed);
            }
        }
    }
}

/// Parses as many complete reply frames as the buffer holds, following the
/// handshake through pipelined replies.
fn advance(st: &mut SocketState) -> (Option<OwnerEvent>, Vec<Action>) {
    loop {
        let before = st.phase;
        let out = match st.phase {
            Phase::Socks4AwaitReply => socks4_reply(st, false),
            Phase::Socks4AwaitBindReply => socks4_reply(st, true),
            Phase::Socks5AwaitMethod => socks5_method(st),
            Phase::Socks5AwaitAuth => socks5_auth(st),
            Phase::Socks5AwaitReply => socks5_reply(st, false),
            Phase::Socks5AwaitBindReply => socks5_reply(st, true),
            Phase::AwaitBoundPeer => bound_peer_reply(st),
            Phase::HttpAwaitStatus => http_status(st),
            _ => (None, Vec::new()),
        };
        if out.0.is_none() && st.phase != before {
            continue;
        }
        return out;
    }
}

fn is_settled(phase: Phase) -> bool {
    matches!(phase, Phase::Ready | Phase::ProxyFailed)
}

fn socks4_reply(st: &mut SocketState, bind: bool) -> (Option<OwnerEvent>, Vec<Action>) {
    let parsed = buffered_frame(st, socks::parse_socks4_reply);
    match parsed {
        Parsed::NeedMore => (None, Vec::new()),
        Parsed::Failed(p) => fail(st, p.into()),
        Parsed::Done((ip, port), _) => {
            if bind {
                listen_armed(st, ip, port)
            } else {
                finish_success(st)
            }
        }
    }
}

fn socks5_method(st: &mut SocketState) -> (Option<OwnerEvent>, Vec<Action>) {
    let parsed = buffered_frame(st, socks::parse_socks5_method);
    match parsed {
        Parsed::NeedMore => (None, Vec::new()),
        Parsed::Failed(p) => fail(st, p.into()),
        Parsed::Done(method, _) => match method {
            0 => send_socks5_request(st),
            2 => {
                let Some(setup) = st.setup.clone() else {
                    return fail(st, SocketError::NotOpen);
                };
                if !setup.has_credentials() {
                    // Refuse before any login bytes go out.
                    return fail(st, ProxyError::AuthUnsupported.into());
                }
                let user = setup.user.as_deref().unwrap_or("");
                let password = setup.password.as_deref().map_or("", |p| p.as_str());
                let frame = socks::socks5_auth_request(user, password);
                send_then(st, &frame, Phase::Socks5AwaitAuth)
            }
            _ => fail(st, ProxyError::AuthUnsupported.into()),
        },
    }
}

fn socks5_auth(st: &mut SocketState) -> (Option<OwnerEvent>, Vec<Action>) {
    let parsed = buffered_frame(st, socks::parse_socks5_auth_reply);
    match parsed {
        Parsed::NeedMore => (None, Vec::new()),
        Parsed::Failed(p) => fail(st, p.into()),
        Parsed::Done((), _) => send_socks5_request(st),
    }
}

fn send_socks5_request(st: &mut SocketState) -> (Option<OwnerEvent>, Vec<Action>) {
    let Some(target) = st.target.clone() else {
        return fail(st, SocketError::NotOpen);
    };
    let (frame, next) = if st.bind_mode {
        // BIND addresses the peer expected to dial in.
        let Some(ip) = target.ip else {
            return fail(st, ProxyError::ResolveFailed.into());
        };
        (
            socks::socks5_request_ip(socks::CMD_BIND, ip, target.port),
            Phase::Socks5AwaitBindReply,
        )
    } else if let Some(ip) = target.ip {
        (
            socks::socks5_request_ip(socks::CMD_CONNECT, ip, target.port),
            Phase::Socks5AwaitReply,
        )
    } else {
        (
            socks::socks5_request_host(socks::CMD_CONNECT, &target.host, target.port),
            Phase::Socks5AwaitReply,
        )
    };
    send_then(st, &frame, next)
}

fn socks5_reply(st: &mut SocketState, bind: bool) -> (Option<OwnerEvent>, Vec<Action>) {
    let parsed = buffered_frame(st, socks::parse_socks5_reply);
    match parsed {
        Parsed::NeedMore => (None, Vec::new()),
        Parsed::Failed(p) => fail(st, p.into()),
        Parsed::Done((ip, port), _) => {
            if bind {
                listen_armed(st, ip, port)
            } else {
                finish_success(st)
            }
        }
    }
}

/// Second BIND reply: the expected peer connected in (or not).
fn bound_peer_reply(st: &mut SocketState) -> (Option<OwnerEvent>, Vec<Action>) {
    let kind = st.setup.as_ref().map(|s| s.kind);
    let parsed = match kind {
        Some(ProxyKind::Socks4 | ProxyKind::Socks4A) => {
            buffered_frame(st, socks::parse_socks4_reply).map_value()
        }
        Some(ProxyKind::Socks5) => buffered_frame(st, socks::parse_socks5_reply).map_value(),
        _ => return fail(st, ProxyError::UnexpectedReply.into()),
    };
    match parsed {
        Parsed::NeedMore => (None, Vec::new()),
        Parsed::Failed(p) => fail(st, p.into()),
        Parsed::Done((), _) => {
            st.phase = Phase::Ready;
            st.touch();
            let mut actions = Vec::new();
            if !st.read_buf.is_empty() {
                actions.push(Action::Repost(NetEvent::new(Readiness::Readable)));
            }
            if st.replay_writable {
                st.replay_writable = false;
                actions.push(Action::Repost(NetEvent::new(Readiness::Writable)));
            }
            (Some(OwnerEvent::Accepted(Ok(()))), actions)
        }
    }
}

fn http_status(st: &mut SocketState) -> (Option<OwnerEvent>, Vec<Action>) {
    loop {
        let line = match take_line(st, http::MAX_LINE) {
            Ok(Some(line)) => line,
            Ok(None) => return (None, Vec::new()),
            Err(p) => return fail(st, p.into()),
        };
        if !st.http_status_seen {
            st.http_status_seen = true;
            match http::parse_status_line(&line) {
                Ok(http::StatusLine::Accepted) => {}
                Ok(http::StatusLine::Rejected(text)) => {
                    return fail(st, ProxyError::HttpRejected(text).into());
                }
                Err(p) => return fail(st, p.into()),
            }
        } else if line.is_empty() {
            // Headers done; the stream now belongs to the owner.
            return finish_success(st);
        }
    }
}

/// First BIND reply: the proxy is listening at `ip:port`.
fn listen_armed(st: &mut SocketState, ip: std::net::Ipv4Addr, port: u16) -> (Option<OwnerEvent>, Vec<Action>) {
    // An all-zero address means "same as the control channel's proxy".
    let ip = if ip.is_unspecified() {
        st.setup.as_ref().map_or(ip, |s| *s.addr.ip())
    } else {
        ip
    };
    st.phase = Phase::AwaitBoundPeer;
    trace!(%ip, port, "proxy listening on our behalf");
    (Some(OwnerEvent::ListenReady { ip, port }), Vec::new())
}

/// Negotiation done: hand the stream to the owner, replaying whatever
/// readiness was swallowed along the way.
fn finish_success(st: &mut SocketState) -> (Option<OwnerEvent>, Vec<Action>) {
    st.phase = Phase::Ready;
    st.touch();
    let mut actions = Vec::new();
    // Bytes past the final reply (a server banner, say) were pulled off the
    // kernel queue already, so no fresh readable edge will announce them.
    if !st.read_buf.is_empty() {
        actions.push(Action::Repost(NetEvent::new(Readiness::Readable)));
    }
    if st.replay_writable {
        st.replay_writable = false;
        actions.push(Action::Repost(NetEvent::new(Readiness::Writable)));
    }
    trace!("tunnel established");
    (Some(OwnerEvent::Connected), actions)
}

/// Records the failure and reports it on the channel matching the mode.
fn fail(st: &mut SocketState, err: SocketError) -> (Option<OwnerEvent>, Vec<Action>) {
    if let SocketError::Proxy(p) = &err {
        st.proxy_error = Some(p.clone());
    }
    debug!(phase = ?st.phase, error = %err, "tunnel negotiation failed");
    st.send_queue.clear();
    let at_peer_wait = st.phase == Phase::AwaitBoundPeer;
    let bind = st.bind_mode;
    st.phase = Phase::ProxyFailed;
    let event = if at_peer_wait {
        OwnerEvent::Accepted(Err(err))
    } else if bind {
        OwnerEvent::ListenFailed(err)
    } else {
        OwnerEvent::ConnectFailed(err)
    };
    (Some(event), Vec::new())
}
