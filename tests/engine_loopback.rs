//! End-to-end sessions through the assembled engine: a worker, a reactor,
//! and the disk thread against scripted FTP servers, with forwarding
//! proxies in front of the control and data connections.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;
use std::time::{Duration, Instant};

use ftpkit::logging::MemorySink;
use ftpkit::netio::{ProxyKind, ProxySetup};
use ftpkit::reactor::Reactor;
use ftpkit::worker::{
    Credentials, DiskThread, ItemId, ItemKind, ItemOutcome, MemoryQueue, ServerProfile,
    TransferMode, WorkItem, WorkQueue, Worker, WorkerConfig, WorkerObserver,
};

const RECV_WAIT: Duration = Duration::from_secs(10);

/// One scripted control connection.
struct FtpConn {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl FtpConn {
    fn send(&mut self, line: &str) {
        self.stream
            .write_all(format!("{line}\r\n").as_bytes())
            .expect("send reply");
    }

    fn read_line(&mut self) -> String {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                return String::from_utf8_lossy(&line[..line.len() - 2]).into_owned();
            }
            let mut chunk = [0u8; 512];
            let n = self.stream.read(&mut chunk).expect("read command");
            assert!(n > 0, "control stream closed mid-script");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn expect(&mut self, prefix: &str) -> String {
        let line = self.read_line();
        assert!(
            line.starts_with(prefix),
            "expected a {prefix:?} command, got {line:?}"
        );
        line
    }

    fn wait_eof(&mut self) {
        let mut chunk = [0u8; 512];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

fn ftp_server(
    script: impl FnOnce(&mut FtpConn) + Send + 'static,
) -> (SocketAddrV4, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = match listener.local_addr().expect("local addr") {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => unreachable!("bound to IPv4"),
    };
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept control");
        stream
            .set_read_timeout(Some(RECV_WAIT))
            .expect("read timeout");
        let mut conn = FtpConn {
            stream,
            buf: Vec::new(),
        };
        script(&mut conn);
    });
    (addr, handle)
}

fn login(c: &mut FtpConn) {
    c.send("220 scripted server ready");
    c.expect("USER ");
    c.send("331 need password");
    c.expect("PASS ");
    c.send("230 logged in");
}

fn pasv(c: &mut FtpConn) -> TcpListener {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind data listener");
    let port = listener.local_addr().expect("data addr").port();
    c.send(&format!(
        "227 Entering Passive Mode (127,0,0,1,{},{})",
        port >> 8,
        port & 0xff
    ));
    listener
}

/// Copies one direction until EOF, then half-closes the other side.
fn pipe(mut from: TcpStream, mut to: TcpStream) {
    let mut buf = [0u8; 4096];
    loop {
        match from.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if to.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
    let _ = to.shutdown(Shutdown::Write);
}

/// A forwarding SOCKS5 proxy that serves `conns` CONNECT tunnels.
fn socks5_proxy(conns: usize) -> (SocketAddrV4, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind proxy");
    let addr = match listener.local_addr().expect("proxy addr") {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => unreachable!("bound to IPv4"),
    };
    let handle = thread::spawn(move || {
        let mut pumps = Vec::new();
        for _ in 0..conns {
            let (mut client, _) = listener.accept().expect("accept tunnel client");
            let mut offer = [0u8; 2];
            client.read_exact(&mut offer).expect("method offer");
            assert_eq!(offer[0], 5);
            let mut methods = vec![0u8; offer[1] as usize];
            client.read_exact(&mut methods).expect("methods");
            assert!(methods.contains(&0), "no-auth must be offered");
            client.write_all(&[5, 0]).expect("pick no-auth");

            let mut req = [0u8; 10];
            client.read_exact(&mut req).expect("connect request");
            assert_eq!(req[..4], [5, 1, 0, 1]);
            let target = SocketAddrV4::new(
                Ipv4Addr::new(req[4], req[5], req[6], req[7]),
                u16::from_be_bytes([req[8], req[9]]),
            );
            let upstream = TcpStream::connect(target).expect("dial target");
            client
                .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                .expect("grant");

            let c2 = client.try_clone().expect("clone client");
            let u2 = upstream.try_clone().expect("clone upstream");
            pumps.push(thread::spawn(move || pipe(client, upstream)));
            pumps.push(thread::spawn(move || pipe(u2, c2)));
        }
        for p in pumps {
            let _ = p.join();
        }
    });
    (addr, handle)
}

/// A forwarding HTTP CONNECT proxy that serves one tunnel.
fn http_proxy() -> (SocketAddrV4, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind proxy");
    let addr = match listener.local_addr().expect("proxy addr") {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => unreachable!("bound to IPv4"),
    };
    let handle = thread::spawn(move || {
        let (mut client, _) = listener.accept().expect("accept tunnel client");
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).expect("request byte");
            request.push(byte[0]);
        }
        let request = String::from_utf8(request).expect("ascii request");
        let target = request
            .strip_prefix("CONNECT ")
            .and_then(|r| r.split_whitespace().next())
            .expect("CONNECT target");
        let upstream = TcpStream::connect(target).expect("dial target");
        client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .expect("grant");

        let c2 = client.try_clone().expect("clone client");
        let u2 = upstream.try_clone().expect("clone upstream");
        let a = thread::spawn(move || pipe(client, upstream));
        let b = thread::spawn(move || pipe(u2, c2));
        let _ = a.join();
        let _ = b.join();
    });
    (addr, handle)
}

enum Event {
    Finished(WorkItem, ItemOutcome),
    ConnError(String),
}

struct Events {
    tx: Sender<Event>,
}

impl WorkerObserver for Events {
    fn item_finished(&self, item: &WorkItem, outcome: &ItemOutcome) {
        let _ = self.tx.send(Event::Finished(item.clone(), outcome.clone()));
    }

    fn conflict(&self, item: WorkItem, text: String) {
        panic!("unexpected conflict for {}: {text}", item.summary());
    }

    fn connection_error(&self, text: &str) {
        let _ = self.tx.send(Event::ConnError(text.to_owned()));
    }
}

fn rig(
    profile: ServerProfile,
    cfg: WorkerConfig,
) -> (Reactor, Arc<Worker>, Arc<MemoryQueue>, Receiver<Event>) {
    let rt = Reactor::spawn().expect("reactor starts");
    let queue = Arc::new(MemoryQueue::new());
    let disk = DiskThread::spawn().expect("disk thread starts");
    let (tx, rx) = channel();
    let w = Worker::new(
        profile,
        cfg,
        Arc::clone(&queue) as Arc<dyn WorkQueue>,
        disk,
        Arc::new(Events { tx }),
        MemorySink::new(256),
    );
    w.register(&rt).expect("slot available");
    (rt, w, queue, rx)
}

fn wait_finished(rx: &Receiver<Event>) -> (WorkItem, ItemOutcome) {
    let deadline = Instant::now() + RECV_WAIT;
    loop {
        assert!(Instant::now() < deadline, "no item finished in time");
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(Event::Finished(item, outcome)) => return (item, outcome),
            Ok(Event::ConnError(text)) => panic!("connection error: {text}"),
            Err(_) => {}
        }
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn socks5_tunneled_session_downloads_a_file() {
    let payload = patterned(8192);
    let body = payload.clone();
    let (server_addr, server) = ftp_server(move |c| {
        login(c);
        c.expect("TYPE I");
        c.send("200 binary");
        c.expect("SIZE /pub/big.bin");
        c.send(&format!("213 {}", body.len()));
        c.expect("PASV");
        let data = pasv(c);
        c.expect("RETR /pub/big.bin");
        c.send("150 opening data connection");
        let (mut ds, _) = data.accept().expect("data accept");
        ds.write_all(&body).expect("send body");
        drop(ds);
        c.send("226 transfer complete");
        c.wait_eof();
    });
    // Control and data connections each take one tunnel.
    let (proxy_addr, proxy) = socks5_proxy(2);

    let dir = tempfile::tempdir().expect("tempdir");
    let local = dir.path().join("big.bin");
    let mut profile = ServerProfile::new(
        &server_addr.ip().to_string(),
        server_addr.port(),
        Credentials::login("fred", "secret"),
    );
    profile.proxy = Some(ProxySetup::anonymous(ProxyKind::Socks5, proxy_addr));
    let (rt, w, queue, rx) = rig(profile, WorkerConfig::default());
    queue.push(WorkItem::new(
        ItemId(1),
        ItemKind::Download {
            remote: "/pub/big.bin".to_owned(),
            local: local.clone(),
            mode: TransferMode::Binary,
        },
    ));
    w.start();

    let (item, outcome) = wait_finished(&rx);
    assert_eq!(item.id, ItemId(1));
    assert_eq!(outcome, ItemOutcome::Done);
    assert_eq!(std::fs::read(&local).expect("read target"), payload);

    w.stop();
    rt.shutdown();
    server.join().expect("server thread");
    proxy.join().expect("proxy thread");
}

#[test]
fn http_tunneled_session_runs_control_commands() {
    let (server_addr, server) = ftp_server(|c| {
        login(c);
        c.expect("DELE stale.txt");
        c.send("250 deleted");
        c.wait_eof();
    });
    let (proxy_addr, proxy) = http_proxy();

    let mut profile = ServerProfile::new(
        &server_addr.ip().to_string(),
        server_addr.port(),
        Credentials::login("fred", "secret"),
    );
    profile.proxy = Some(ProxySetup::anonymous(ProxyKind::HttpConnect, proxy_addr));
    let (rt, w, queue, rx) = rig(profile, WorkerConfig::default());
    queue.push(WorkItem::new(
        ItemId(1),
        ItemKind::DeleteFile {
            path: "stale.txt".to_owned(),
        },
    ));
    w.start();

    let (_, outcome) = wait_finished(&rx);
    assert_eq!(outcome, ItemOutcome::Done);

    w.stop();
    rt.shutdown();
    server.join().expect("server thread");
    proxy.join().expect("proxy thread");
}

#[test]
fn plain_session_uploads_and_lists() {
    let payload = patterned(2048);
    let (got_tx, got_rx) = channel();
    let listing = b"-rw-r--r-- 1 ftp ftp 2048 Jan 1 00:00 new.bin\r\n";
    let (server_addr, server) = ftp_server(move |c| {
        login(c);
        c.expect("TYPE I");
        c.send("200 binary");
        c.expect("SIZE /inbox/new.bin");
        c.send("550 not found");
        c.expect("PASV");
        let data = pasv(c);
        c.expect("STOR /inbox/new.bin");
        c.send("150 ok, send it");
        let (mut ds, _) = data.accept().expect("data accept");
        let mut got = Vec::new();
        ds.read_to_end(&mut got).expect("collect upload");
        let _ = got_tx.send(got);
        c.send("226 stored");

        c.expect("CWD /inbox");
        c.send("250 directory changed");
        c.expect("PWD");
        c.send("257 \"/inbox\" is current");
        c.expect("TYPE A");
        c.send("200 ascii");
        c.expect("PASV");
        let data = pasv(c);
        c.expect("LIST");
        c.send("150 here it comes");
        let (mut ds, _) = data.accept().expect("data accept");
        ds.write_all(listing).expect("send listing");
        drop(ds);
        c.send("226 done");
        c.wait_eof();
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let local = dir.path().join("new.bin");
    std::fs::write(&local, &payload).expect("seed source");
    let profile = ServerProfile::new(
        &server_addr.ip().to_string(),
        server_addr.port(),
        Credentials::login("fred", "secret"),
    );
    let (rt, w, queue, rx) = rig(profile, WorkerConfig::default());
    queue.push(WorkItem::new(
        ItemId(1),
        ItemKind::Upload {
            local,
            remote: "/inbox/new.bin".to_owned(),
            mode: TransferMode::Binary,
        },
    ));
    queue.push(WorkItem::new(
        ItemId(2),
        ItemKind::ExploreDir {
            path: "/inbox".to_owned(),
        },
    ));
    w.start();

    let (first, outcome) = wait_finished(&rx);
    assert_eq!(first.id, ItemId(1));
    assert_eq!(outcome, ItemOutcome::Done);
    let got = got_rx.recv_timeout(RECV_WAIT).expect("server saw eof");
    assert_eq!(got, payload);

    let (second, outcome) = wait_finished(&rx);
    assert_eq!(second.id, ItemId(2));
    assert_eq!(outcome, ItemOutcome::Done);
    let sink = w.listings();
    let collected = sink.lock().expect("sink lock").clone();
    assert_eq!(collected, listing);

    w.stop();
    rt.shutdown();
    server.join().expect("server thread");
}
