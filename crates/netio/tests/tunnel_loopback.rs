//! Tunnel negotiation against scripted proxies on the loopback interface.
//!
//! Each test stands up a real reactor, registers a socket object through
//! the same embedding contract the engine uses, and scripts the proxy side
//! byte by byte on a helper thread.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;
use std::time::{Duration, Instant};

use netio::{
    CloseOutcome, OwnerEvent, ProxyError, ProxyKind, ProxySetup, SocketCore, SocketError,
    run_actions,
};
use reactor::{MsgKind, NetEvent, Reactor, ReactorSocket, SocketUid, TimerKind};

const RECV_WAIT: Duration = Duration::from_secs(5);

/// Test embedding of a socket core: every owner event goes to a channel.
struct PeerSocket {
    core: Arc<SocketCore>,
    events: Sender<OwnerEvent>,
}

impl ReactorSocket for PeerSocket {
    fn uid(&self) -> SocketUid {
        self.core.uid()
    }

    fn on_ready(&self, _reactor: &Reactor, event: NetEvent) {
        let (owner, actions) = self.core.handle_event(event);
        run_actions(&self.core, actions);
        if let Some(ev) = owner {
            let _ = self.events.send(ev);
        }
    }

    fn on_timer(&self, _reactor: &Reactor, _kind: TimerKind, _payload: u64) {}

    fn on_message(&self, _reactor: &Reactor, kind: MsgKind, payload: u64) {
        if let Some((owner, actions)) = self.core.handle_message(kind, payload) {
            run_actions(&self.core, actions);
            if let Some(ev) = owner {
                let _ = self.events.send(ev);
            }
        }
    }
}

fn rig() -> (Reactor, Arc<SocketCore>, Receiver<OwnerEvent>) {
    let rt = Reactor::spawn().expect("reactor starts");
    let core = SocketCore::new();
    let (tx, rx) = channel();
    let peer = Arc::new(PeerSocket {
        core: Arc::clone(&core),
        events: tx,
    });
    let slot = rt.register(peer).expect("slot available");
    core.bind(&rt, slot);
    (rt, core, rx)
}

/// Runs `script` against the first inbound connection.
fn scripted_server(
    script: impl FnOnce(TcpStream) + Send + 'static,
) -> (SocketAddrV4, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = match listener.local_addr().expect("local addr") {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => unreachable!("bound to IPv4"),
    };
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        script(stream);
    });
    (addr, handle)
}

fn recv_event(rx: &Receiver<OwnerEvent>) -> OwnerEvent {
    rx.recv_timeout(RECV_WAIT).expect("owner event")
}

/// Reads the fixed socks4 header plus the NUL-terminated user field.
fn read_socks4_request(stream: &mut TcpStream) -> [u8; 8] {
    let mut head = [0u8; 8];
    stream.read_exact(&mut head).expect("socks4 header");
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).expect("user field");
        if byte[0] == 0 {
            break;
        }
    }
    head
}

fn read_http_request(stream: &mut TcpStream) -> String {
    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    while !request.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).expect("request byte");
        request.push(byte[0]);
    }
    String::from_utf8(request).expect("ascii request")
}

#[test]
fn socks4_tunnel_hands_over_trailing_banner_untouched() {
    let banner = b"220 ready\r\n";
    let (proxy_addr, server) = scripted_server(move |mut stream| {
        let head = read_socks4_request(&mut stream);
        assert_eq!(head[0], 4);
        assert_eq!(head[1], 1);
        assert_eq!(u16::from_be_bytes([head[2], head[3]]), 2121);
        assert_eq!(&head[4..8], &[127, 0, 0, 1]);
        // Reply and server banner arrive in one burst.
        let mut burst = vec![0u8, 90, 0, 0, 0, 0, 0, 0];
        burst.extend_from_slice(b"220 ready\r\n");
        stream.write_all(&burst).expect("burst");
        thread::sleep(Duration::from_millis(300));
    });

    let (rt, core, rx) = rig();
    core.connect_via_proxy(
        ProxySetup::anonymous(ProxyKind::Socks4, proxy_addr),
        "127.0.0.1",
        Some(Ipv4Addr::LOCALHOST),
        2121,
    )
    .expect("proxied connect starts");

    assert!(matches!(recv_event(&rx), OwnerEvent::Connected));

    // Banner bytes beyond the 8-byte reply must be waiting for the owner.
    let deadline = Instant::now() + RECV_WAIT;
    while core.buffered_len() < banner.len() {
        assert!(Instant::now() < deadline, "banner never surfaced");
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(OwnerEvent::Readable) => {
                let _ = core.fill(1024);
            }
            Ok(OwnerEvent::Writable | OwnerEvent::WriteDrained) => {}
            Ok(other) => panic!("unexpected event {other:?}"),
            Err(_) => {}
        }
    }
    core.with_buffered(|bytes| assert_eq!(bytes, banner));

    core.close();
    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn socks4_refusal_surfaces_the_reply_byte() {
    let (proxy_addr, server) = scripted_server(|mut stream| {
        read_socks4_request(&mut stream);
        stream
            .write_all(&[0, 91, 0, 0, 0, 0, 0, 0])
            .expect("refusal");
    });

    let (rt, core, rx) = rig();
    core.connect_via_proxy(
        ProxySetup::anonymous(ProxyKind::Socks4, proxy_addr),
        "127.0.0.1",
        Some(Ipv4Addr::LOCALHOST),
        21,
    )
    .expect("proxied connect starts");

    match recv_event(&rx) {
        OwnerEvent::ConnectFailed(SocketError::Proxy(p)) => {
            assert_eq!(p, ProxyError::Socks4Refused(91));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(core.take_proxy_error(), Some(ProxyError::Socks4Refused(91)));

    core.close();
    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn socks4a_request_carries_hostname_for_the_proxy_to_resolve() {
    let (proxy_addr, server) = scripted_server(|mut stream| {
        let mut head = [0u8; 8];
        stream.read_exact(&mut head).expect("header");
        assert_eq!(head[..2], [4, 1]);
        assert_eq!(&head[4..8], &[0, 0, 0, 1], "SOCKS4A sentinel address");
        // Empty user field, then the hostname.
        let mut tail = Vec::new();
        let mut byte = [0u8; 1];
        let mut nuls = 0;
        while nuls < 2 {
            stream.read_exact(&mut byte).expect("tail");
            if byte[0] == 0 {
                nuls += 1;
            } else {
                tail.push(byte[0]);
            }
        }
        assert_eq!(tail, b"ftp.example.net");
        stream
            .write_all(&[0, 90, 0, 0, 0, 0, 0, 0])
            .expect("grant");
        thread::sleep(Duration::from_millis(200));
    });

    let (rt, core, rx) = rig();
    core.connect_via_proxy(
        ProxySetup::anonymous(ProxyKind::Socks4A, proxy_addr),
        "ftp.example.net",
        None,
        21,
    )
    .expect("proxied connect starts");

    assert!(matches!(recv_event(&rx), OwnerEvent::Connected));

    core.close();
    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn socks5_auth_demand_without_credentials_stops_before_login_bytes() {
    let (proxy_addr, server) = scripted_server(|mut stream| {
        let mut offer = [0u8; 3];
        stream.read_exact(&mut offer).expect("method offer");
        assert_eq!(offer, [5, 1, 0], "anonymous offer lists one method");
        stream.write_all(&[5, 2]).expect("demand auth");
        // No credentials were configured, so nothing more may arrive.
        stream
            .set_read_timeout(Some(Duration::from_millis(300)))
            .expect("timeout");
        let mut probe = [0u8; 1];
        match stream.read(&mut probe) {
            Ok(0) => {}
            Ok(n) => panic!("client sent {n} unexpected byte(s)"),
            Err(e) => assert!(
                matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ),
                "unexpected read error {e:?}"
            ),
        }
    });

    let (rt, core, rx) = rig();
    core.connect_via_proxy(
        ProxySetup::anonymous(ProxyKind::Socks5, proxy_addr),
        "127.0.0.1",
        Some(Ipv4Addr::LOCALHOST),
        21,
    )
    .expect("proxied connect starts");

    match recv_event(&rx) {
        OwnerEvent::ConnectFailed(SocketError::Proxy(p)) => {
            assert_eq!(p, ProxyError::AuthUnsupported);
            assert_eq!(p.to_string(), "user/password authentication not supported");
        }
        other => panic!("unexpected event {other:?}"),
    }

    server.join().expect("server thread");
    core.close();
    rt.shutdown();
}

#[test]
fn socks5_full_handshake_with_username_password() {
    let (proxy_addr, server) = scripted_server(|mut stream| {
        let mut offer = [0u8; 4];
        stream.read_exact(&mut offer).expect("method offer");
        assert_eq!(offer, [5, 2, 0, 2], "offer lists no-auth and user/pass");
        stream.write_all(&[5, 2]).expect("pick auth");

        let mut head = [0u8; 2];
        stream.read_exact(&mut head).expect("auth header");
        assert_eq!(head, [1, 4]);
        let mut user = [0u8; 4];
        stream.read_exact(&mut user).expect("user");
        assert_eq!(&user, b"anon");
        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).expect("plen");
        let mut password = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut password).expect("password");
        assert_eq!(password, b"sesame");
        stream.write_all(&[1, 0]).expect("auth ok");

        let mut request = [0u8; 10];
        stream.read_exact(&mut request).expect("connect request");
        assert_eq!(request[..4], [5, 1, 0, 1]);
        assert_eq!(&request[4..8], &[127, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([request[8], request[9]]), 2121);
        stream
            .write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 8, 33])
            .expect("grant");
        thread::sleep(Duration::from_millis(200));
    });

    let (rt, core, rx) = rig();
    core.connect_via_proxy(
        ProxySetup::with_login(ProxyKind::Socks5, proxy_addr, "anon", "sesame"),
        "127.0.0.1",
        Some(Ipv4Addr::LOCALHOST),
        2121,
    )
    .expect("proxied connect starts");

    assert!(matches!(recv_event(&rx), OwnerEvent::Connected));

    core.close();
    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn socks5_reply_with_foreign_address_type_is_unexpected() {
    let (proxy_addr, server) = scripted_server(|mut stream| {
        let mut offer = [0u8; 3];
        stream.read_exact(&mut offer).expect("method offer");
        stream.write_all(&[5, 0]).expect("no auth");
        let mut request = [0u8; 10];
        stream.read_exact(&mut request).expect("request");
        // ATYP 4 (IPv6) reply; the engine only speaks IPv4 on the wire.
        let reply = [5u8, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 21];
        stream.write_all(&reply).expect("reply");
    });

    let (rt, core, rx) = rig();
    core.connect_via_proxy(
        ProxySetup::anonymous(ProxyKind::Socks5, proxy_addr),
        "127.0.0.1",
        Some(Ipv4Addr::LOCALHOST),
        21,
    )
    .expect("proxied connect starts");

    match recv_event(&rx) {
        OwnerEvent::ConnectFailed(SocketError::Proxy(p)) => {
            assert_eq!(p, ProxyError::UnexpectedReply);
        }
        other => panic!("unexpected event {other:?}"),
    }

    core.close();
    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn http_connect_rejection_keeps_status_text_verbatim() {
    let (proxy_addr, server) = scripted_server(|mut stream| {
        let request = read_http_request(&mut stream);
        assert!(request.starts_with("CONNECT 127.0.0.1:21 HTTP/1.1\r\n"));
        stream
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .expect("reject");
    });

    let (rt, core, rx) = rig();
    core.connect_via_proxy(
        ProxySetup::anonymous(ProxyKind::HttpConnect, proxy_addr),
        "127.0.0.1",
        Some(Ipv4Addr::LOCALHOST),
        21,
    )
    .expect("proxied connect starts");

    match recv_event(&rx) {
        OwnerEvent::ConnectFailed(SocketError::Proxy(p)) => {
            assert_eq!(p.to_string(), "407 Proxy Authentication Required");
        }
        other => panic!("unexpected event {other:?}"),
    }

    core.close();
    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn http_connect_sends_both_auth_headers_and_skips_reply_headers() {
    let (proxy_addr, server) = scripted_server(|mut stream| {
        let request = read_http_request(&mut stream);
        assert!(request.contains("\r\nAuthorization: Basic YW5vbjpzZXNhbWU=\r\n"));
        assert!(request.contains("\r\nProxy-Authorization: Basic YW5vbjpzZXNhbWU=\r\n"));
        stream
            .write_all(
                b"HTTP/1.1 200 Connection established\r\nVia: 1.1 test\r\n\r\n220 hi\r\n",
            )
            .expect("accept");
        thread::sleep(Duration::from_millis(300));
    });

    let (rt, core, rx) = rig();
    core.connect_via_proxy(
        ProxySetup::with_login(ProxyKind::HttpConnect, proxy_addr, "anon", "sesame"),
        "127.0.0.1",
        Some(Ipv4Addr::LOCALHOST),
        21,
    )
    .expect("proxied connect starts");

    assert!(matches!(recv_event(&rx), OwnerEvent::Connected));

    let banner = b"220 hi\r\n";
    let deadline = Instant::now() + RECV_WAIT;
    while core.buffered_len() < banner.len() {
        assert!(Instant::now() < deadline, "banner never surfaced");
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(OwnerEvent::Readable) => {
                let _ = core.fill(1024);
            }
            Ok(OwnerEvent::Writable | OwnerEvent::WriteDrained) => {}
            Ok(other) => panic!("unexpected event {other:?}"),
            Err(_) => {}
        }
    }
    core.with_buffered(|bytes| assert_eq!(bytes, banner));

    core.close();
    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn plain_connect_write_read_close_cycle() {
    let (addr, server) = scripted_server(|mut stream| {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while !line.ends_with(b"\r\n") {
            stream.read_exact(&mut byte).expect("line byte");
            line.push(byte[0]);
        }
        assert_eq!(line, b"NOOP\r\n");
        stream.write_all(b"200 ok\r\n").expect("reply");
    });

    let (rt, core, rx) = rig();
    core.connect(addr).expect("connect starts");
    assert!(matches!(recv_event(&rx), OwnerEvent::Connected));

    assert!(core.write(b"NOOP\r\n").expect("write"));

    let mut collected = Vec::new();
    let deadline = Instant::now() + RECV_WAIT;
    while collected.len() < 8 {
        assert!(Instant::now() < deadline, "reply never arrived");
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(OwnerEvent::Readable) => {
                let _ = core.fill(1024);
                core.pull_into(&mut collected, 1024);
            }
            Ok(OwnerEvent::Closed { .. }) => {
                core.pull_into(&mut collected, 1024);
            }
            Ok(OwnerEvent::Writable) => {}
            Ok(other) => panic!("unexpected event {other:?}"),
            Err(_) => {
                // Bytes may have been buffered while no event was pending.
                core.pull_into(&mut collected, 1024);
            }
        }
    }
    assert_eq!(collected, b"200 ok\r\n");

    assert_eq!(core.close(), CloseOutcome::Closed);
    assert_eq!(core.close(), CloseOutcome::AlreadyClosed);

    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn listen_accepts_one_inbound_connection() {
    let (rt, core, rx) = rig();
    let (ip, port) = core
        .listen(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .expect("listen");
    assert_eq!(ip, Ipv4Addr::LOCALHOST);
    assert_ne!(port, 0);

    let dialer = thread::spawn(move || {
        let mut stream = TcpStream::connect((ip, port)).expect("dial back");
        stream.write_all(b"DATA").expect("payload");
        thread::sleep(Duration::from_millis(200));
    });

    match recv_event(&rx) {
        OwnerEvent::Accepted(Ok(())) => {}
        other => panic!("unexpected event {other:?}"),
    }

    let deadline = Instant::now() + RECV_WAIT;
    while core.buffered_len() < 4 {
        assert!(Instant::now() < deadline, "payload never arrived");
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(OwnerEvent::Readable) => {
                let _ = core.fill(64);
            }
            Ok(OwnerEvent::Writable | OwnerEvent::WriteDrained) => {}
            Ok(OwnerEvent::Closed { .. }) => {}
            Ok(other) => panic!("unexpected event {other:?}"),
            Err(_) => {
                let _ = core.fill(64);
            }
        }
    }
    core.with_buffered(|bytes| assert_eq!(bytes, b"DATA"));

    core.close();
    rt.shutdown();
    dialer.join().expect("dialer thread");
}

#[test]
fn http_proxy_refuses_to_listen() {
    let (rt, core, _rx) = rig();
    let setup = ProxySetup::anonymous(
        ProxyKind::HttpConnect,
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3128),
    );
    match core.listen_via_proxy(setup, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 21)) {
        Err(SocketError::Proxy(ProxyError::ListenUnsupported)) => {}
        other => panic!("unexpected outcome {other:?}"),
    }
    rt.shutdown();
}
