//! Download and upload transfers against scripted peers on the loopback
//! interface.
//!
//! Each test registers a data connection in a real reactor next to an
//! owner probe that collects the posted coordination messages, then
//! drives the flush and prepare handshakes from the test thread the way
//! the worker does.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;
use std::time::{Duration, Instant};

use datacon::{
    DownloadConfig, DownloadConnection, MSG_DATA_CLOSED, MSG_DATA_CONNECTED, MSG_FLUSH_DATA,
    MSG_PREPARE_DATA, MSG_TRANSFER_FINISHED, OwnerTarget, TransferPhase, UploadConfig,
    UploadConnection,
};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use reactor::{MsgKind, NetEvent, Reactor, ReactorSocket, SocketUid, TimerKind};

const RECV_WAIT: Duration = Duration::from_secs(5);

/// Stand-in for the worker side: forwards every posted message to a
/// channel the test thread reads.
struct OwnerProbe {
    uid: SocketUid,
    msgs: Sender<(MsgKind, u64)>,
}

impl ReactorSocket for OwnerProbe {
    fn uid(&self) -> SocketUid {
        self.uid
    }

    fn on_ready(&self, _reactor: &Reactor, _event: NetEvent) {}

    fn on_timer(&self, _reactor: &Reactor, _kind: TimerKind, _payload: u64) {}

    fn on_message(&self, _reactor: &Reactor, kind: MsgKind, payload: u64) {
        let _ = self.msgs.send((kind, payload));
    }
}

fn owner_probe(rt: &Reactor) -> (OwnerTarget, Receiver<(MsgKind, u64)>) {
    let (tx, rx) = channel();
    let uid = SocketUid::fresh();
    let slot = rt
        .register(Arc::new(OwnerProbe { uid, msgs: tx }))
        .expect("slot available");
    (OwnerTarget { slot, uid }, rx)
}

fn download_rig(
    cfg: DownloadConfig,
) -> (Reactor, Arc<DownloadConnection>, Receiver<(MsgKind, u64)>) {
    let rt = Reactor::spawn().expect("reactor starts");
    let (owner, rx) = owner_probe(&rt);
    let conn = DownloadConnection::new(cfg);
    let slot = rt
        .register(Arc::clone(&conn) as Arc<dyn ReactorSocket>)
        .expect("slot available");
    conn.bind(&rt, slot);
    conn.set_owner(Some(owner));
    (rt, conn, rx)
}

fn upload_rig(cfg: UploadConfig) -> (Reactor, Arc<UploadConnection>, Receiver<(MsgKind, u64)>) {
    let rt = Reactor::spawn().expect("reactor starts");
    let (owner, rx) = owner_probe(&rt);
    let conn = UploadConnection::new(cfg);
    let slot = rt
        .register(Arc::clone(&conn) as Arc<dyn ReactorSocket>)
        .expect("slot available");
    conn.bind(&rt, slot);
    conn.set_owner(Some(owner));
    (rt, conn, rx)
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

fn wait_for(rx: &Receiver<(MsgKind, u64)>, want: MsgKind) -> u64 {
    let deadline = Instant::now() + RECV_WAIT;
    loop {
        assert!(Instant::now() < deadline, "message {want:?} never arrived");
        if let Ok((kind, payload)) = rx.recv_timeout(Duration::from_millis(200)) {
            if kind == want {
                return payload;
            }
        }
    }
}

/// Plays the worker's part of a disk-bound download: checks out every
/// announced flush buffer and returns the reassembled stream once the
/// transfer reports finished.
fn drain_download(conn: &DownloadConnection, rx: &Receiver<(MsgKind, u64)>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut closed = false;
    let deadline = Instant::now() + RECV_WAIT;
    loop {
        assert!(Instant::now() < deadline, "download never finished");
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok((MSG_FLUSH_DATA, _)) => {
                if let Some(fb) = conn.give_flush_data() {
                    out.extend_from_slice(fb.bytes());
                    conn.flush_done(fb);
                    if closed {
                        conn.all_data_flushed(false);
                    }
                }
            }
            Ok((MSG_DATA_CLOSED, _)) => {
                closed = true;
                conn.all_data_flushed(false);
            }
            Ok((MSG_TRANSFER_FINISHED, _)) => return out,
            Ok(_) | Err(_) => {}
        }
    }
}

/// Plays the worker's part of an upload: answers every prepare request
/// with the next batch of `source` until the connection closes on eof.
fn drive_upload(
    conn: &UploadConnection,
    rx: &Receiver<(MsgKind, u64)>,
    source: &[u8],
    batch: usize,
) {
    let mut offset = 0usize;
    let mut closed = false;
    let mut finished = false;
    let deadline = Instant::now() + RECV_WAIT;
    while !(closed && finished) {
        assert!(Instant::now() < deadline, "upload never finished");
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok((MSG_PREPARE_DATA, _)) => {
                if let Some(mut pb) = conn.give_buffer_for_data() {
                    let take = (source.len() - offset).min(batch);
                    pb.buf_mut().extend_from_slice(&source[offset..offset + take]);
                    offset += take;
                    conn.data_prepared(pb, offset == source.len());
                }
            }
            Ok((MSG_DATA_CLOSED, _)) => closed = true,
            Ok((MSG_TRANSFER_FINISHED, _)) => finished = true,
            Ok(_) | Err(_) => {}
        }
    }
}

/// Cycling byte pattern, cheap to compare against.
fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Xorshift noise, resistant to compression.
fn noisy(len: usize) -> Vec<u8> {
    let mut x = 0x2545_f491_4f6c_dd1d_u64;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x >> 24) as u8
        })
        .collect()
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::new(6));
    enc.write_all(data).expect("deflate payload");
    enc.finish().expect("finish deflate")
}

fn inflate(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .expect("inflate payload");
    out
}

#[test]
fn passive_download_collects_into_memory() {
    let payload = patterned(3000);
    let body = payload.clone();
    let (addr, server) = scripted_server(move |mut stream| {
        stream.write_all(&body).expect("send payload");
    });
    let (rt, conn, rx) = download_rig(DownloadConfig::default());
    conn.set_total_size(payload.len() as u64);
    conn.connect(addr).expect("dial starts");

    let from = wait_for(&rx, MSG_DATA_CONNECTED);
    assert_eq!(from, conn.uid().value());
    wait_for(&rx, MSG_DATA_CLOSED);
    wait_for(&rx, MSG_TRANSFER_FINISHED);

    assert!(conn.transfer_finished());
    assert!(conn.take_error().is_none());
    let status = conn.status();
    assert_eq!(status.phase, TransferPhase::Finished);
    assert_eq!(status.downloaded, payload.len() as u64);
    assert_eq!(status.total, payload.len() as u64);
    assert_eq!(conn.take_collected().expect("collected payload"), payload);

    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn disk_download_reassembles_through_flush_cycles() {
    let payload = patterned(2560);
    let body = payload.clone();
    let (addr, server) = scripted_server(move |mut stream| {
        stream.write_all(&body).expect("send payload");
    });
    let cfg = DownloadConfig {
        read_chunk_size: 512,
        flush_buffer_size: 1024,
        flush_to_disk: true,
        ..DownloadConfig::default()
    };
    let (rt, conn, rx) = download_rig(cfg);
    conn.connect(addr).expect("dial starts");

    wait_for(&rx, MSG_DATA_CONNECTED);
    let got = drain_download(&conn, &rx);

    assert_eq!(got, payload);
    assert!(conn.transfer_finished());
    assert!(conn.all_data_flushed(true));
    assert_eq!(conn.status().downloaded, payload.len() as u64);

    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn flush_timer_hands_over_a_partial_buffer() {
    let payload = patterned(300);
    let body = payload.clone();
    let (hold_tx, hold_rx) = channel::<()>();
    let (addr, server) = scripted_server(move |mut stream| {
        stream.write_all(&body).expect("send payload");
        let _ = hold_rx.recv_timeout(RECV_WAIT);
    });
    let cfg = DownloadConfig {
        flush_period: Duration::from_millis(100),
        flush_to_disk: true,
        ..DownloadConfig::default()
    };
    let (rt, conn, rx) = download_rig(cfg);
    conn.connect(addr).expect("dial starts");

    wait_for(&rx, MSG_DATA_CONNECTED);
    // The buffer is nowhere near full; only the timer can hand it over.
    wait_for(&rx, MSG_FLUSH_DATA);
    let fb = conn.give_flush_data().expect("flush buffer ready");
    assert_eq!(fb.bytes(), &payload[..]);
    conn.flush_done(fb);

    hold_tx.send(()).expect("release server");
    wait_for(&rx, MSG_DATA_CLOSED);
    wait_for(&rx, MSG_TRANSFER_FINISHED);
    assert!(conn.all_data_flushed(true));

    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn mode_z_disk_download_inflates_across_buffers() {
    let payload = noisy(6000);
    let wire = deflate(&payload);
    let (addr, server) = scripted_server(move |mut stream| {
        stream.write_all(&wire).expect("send compressed payload");
    });
    let cfg = DownloadConfig {
        read_chunk_size: 512,
        flush_buffer_size: 1024,
        compress: true,
        flush_to_disk: true,
        ..DownloadConfig::default()
    };
    let (rt, conn, rx) = download_rig(cfg);
    conn.connect(addr).expect("dial starts");

    wait_for(&rx, MSG_DATA_CONNECTED);
    let got = drain_download(&conn, &rx);

    assert_eq!(got, payload);
    assert!(conn.take_error().is_none());
    // The byte counter tracks decompressed output, not wire bytes.
    assert_eq!(conn.status().downloaded, payload.len() as u64);

    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn mode_z_collect_download_inflates_in_one_pass() {
    let payload = patterned(5000);
    let wire = deflate(&payload);
    let (addr, server) = scripted_server(move |mut stream| {
        stream.write_all(&wire).expect("send compressed payload");
    });
    let cfg = DownloadConfig {
        compress: true,
        ..DownloadConfig::default()
    };
    let (rt, conn, rx) = download_rig(cfg);
    conn.connect(addr).expect("dial starts");

    wait_for(&rx, MSG_DATA_CONNECTED);
    wait_for(&rx, MSG_TRANSFER_FINISHED);
    assert_eq!(conn.take_collected().expect("collected payload"), payload);

    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn paused_download_holds_bytes_until_resume() {
    let payload = patterned(2000);
    let body = payload.clone();
    let (addr, server) = scripted_server(move |mut stream| {
        // Give the pause below time to land before any byte goes out.
        thread::sleep(Duration::from_millis(250));
        stream.write_all(&body).expect("send payload");
    });
    let (rt, conn, rx) = download_rig(DownloadConfig::default());
    conn.connect(addr).expect("dial starts");

    wait_for(&rx, MSG_DATA_CONNECTED);
    conn.pause(true);
    thread::sleep(Duration::from_millis(600));
    assert_eq!(conn.status().downloaded, 0);
    assert!(!conn.transfer_finished());

    conn.pause(false);
    wait_for(&rx, MSG_TRANSFER_FINISHED);
    assert_eq!(conn.take_collected().expect("collected payload"), payload);

    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn cancel_accepts_a_late_flush_return() {
    let payload = patterned(1500);
    let (hold_tx, hold_rx) = channel::<()>();
    let (addr, server) = scripted_server(move |mut stream| {
        stream.write_all(&payload).expect("send payload");
        let _ = hold_rx.recv_timeout(RECV_WAIT);
    });
    let cfg = DownloadConfig {
        read_chunk_size: 512,
        flush_buffer_size: 1024,
        flush_to_disk: true,
        ..DownloadConfig::default()
    };
    let (rt, conn, rx) = download_rig(cfg);
    conn.connect(addr).expect("dial starts");

    wait_for(&rx, MSG_DATA_CONNECTED);
    wait_for(&rx, MSG_FLUSH_DATA);
    let fb = conn.give_flush_data().expect("flush buffer ready");

    conn.cancel();
    assert!(conn.transfer_finished());
    assert!(!conn.is_connected());
    // The disk side returns its buffer after the fact; nothing revives.
    conn.flush_done(fb);
    assert!(conn.give_flush_data().is_none());

    hold_tx.send(()).expect("release server");
    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn refused_dial_reports_a_socket_error() {
    let freed = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = match freed.local_addr().expect("local addr") {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => unreachable!("bound to IPv4"),
    };
    drop(freed);

    let (rt, conn, rx) = download_rig(DownloadConfig::default());
    conn.connect(addr).expect("dial starts");

    wait_for(&rx, MSG_DATA_CLOSED);
    assert!(!conn.is_connected());
    assert!(conn.take_error().is_some());

    rt.shutdown();
}

#[test]
fn activate_retries_a_refused_passive_dial() {
    let freed = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = match freed.local_addr().expect("local addr") {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => unreachable!("bound to IPv4"),
    };
    drop(freed);

    let (rt, conn, rx) = download_rig(DownloadConfig::default());
    conn.connect(addr).expect("dial starts");
    wait_for(&rx, MSG_DATA_CLOSED);
    assert!(!conn.is_connected());

    // The server opens its side only after the transfer command; the
    // retry finds a listener where the first dial found none.
    let payload = patterned(800);
    let body = payload.clone();
    let listener = TcpListener::bind(addr).expect("rebind freed port");
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept retry");
        stream.write_all(&body).expect("send payload");
    });
    conn.activate();

    wait_for(&rx, MSG_DATA_CONNECTED);
    wait_for(&rx, MSG_TRANSFER_FINISHED);
    assert_eq!(conn.take_collected().expect("collected payload"), payload);

    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn active_mode_download_accepts_the_dial_back() {
    let payload = patterned(1200);
    let body = payload.clone();
    let (rt, conn, rx) = download_rig(DownloadConfig::default());
    let (ip, port) = conn
        .listen_on(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .expect("listener opens");
    assert_eq!(conn.listen_endpoint(), Some((ip, port)));

    let server = thread::spawn(move || {
        let mut stream = TcpStream::connect(SocketAddrV4::new(ip, port)).expect("dial back");
        stream.write_all(&body).expect("send payload");
    });

    wait_for(&rx, MSG_DATA_CONNECTED);
    wait_for(&rx, MSG_TRANSFER_FINISHED);
    assert_eq!(conn.take_collected().expect("collected payload"), payload);

    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn upload_streams_prepared_batches_until_eof() {
    let payload = patterned(4000);
    let (out_tx, out_rx) = channel();
    let (addr, server) = scripted_server(move |mut stream| {
        let mut got = Vec::new();
        stream.read_to_end(&mut got).expect("collect upload");
        let _ = out_tx.send(got);
    });
    let cfg = UploadConfig {
        flush_buffer_size: 1024,
        ..UploadConfig::default()
    };
    let (rt, conn, rx) = upload_rig(cfg);
    conn.set_total_size(payload.len() as u64);
    conn.connect(addr).expect("dial starts");

    drive_upload(&conn, &rx, &payload, 1024);

    assert!(conn.all_data_transferred());
    assert!(conn.take_error().is_none());
    let got = out_rx.recv_timeout(RECV_WAIT).expect("server saw eof");
    assert_eq!(got, payload);
    // Bytes sent inside the warm-up are only credited at hand-off.
    conn.upload_finished();
    assert_eq!(conn.status().uploaded, payload.len() as u64);

    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn mode_z_upload_arrives_as_the_original_bytes() {
    let payload = noisy(3000);
    let (out_tx, out_rx) = channel();
    let (addr, server) = scripted_server(move |mut stream| {
        let mut got = Vec::new();
        stream.read_to_end(&mut got).expect("collect upload");
        let _ = out_tx.send(got);
    });
    let cfg = UploadConfig {
        flush_buffer_size: 512,
        compress: true,
        ..UploadConfig::default()
    };
    let (rt, conn, rx) = upload_rig(cfg);
    conn.connect(addr).expect("dial starts");

    drive_upload(&conn, &rx, &payload, 512);

    assert!(conn.all_data_transferred());
    let wire = out_rx.recv_timeout(RECV_WAIT).expect("server saw eof");
    assert_eq!(inflate(&wire), payload);
    conn.upload_finished();
    assert_eq!(conn.status().uploaded, payload.len() as u64);

    rt.shutdown();
    server.join().expect("server thread");
}

#[test]
fn paused_upload_defers_the_first_write() {
    let payload = patterned(600);
    let (out_tx, out_rx) = channel();
    let (addr, server) = scripted_server(move |mut stream| {
        let mut got = Vec::new();
        stream.read_to_end(&mut got).expect("collect upload");
        let _ = out_tx.send(got);
    });
    let (rt, conn, rx) = upload_rig(UploadConfig::default());
    conn.connect(addr).expect("dial starts");

    wait_for(&rx, MSG_PREPARE_DATA);
    conn.pause(true);
    let mut pb = conn.give_buffer_for_data().expect("prepare buffer ready");
    pb.buf_mut().extend_from_slice(&payload);
    conn.data_prepared(pb, true);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(conn.status().uploaded, 0);
    assert!(!conn.all_data_transferred());

    conn.pause(false);
    let deadline = Instant::now() + RECV_WAIT;
    let mut closed = false;
    let mut finished = false;
    while !(closed && finished) {
        assert!(Instant::now() < deadline, "upload never finished");
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok((MSG_DATA_CLOSED, _)) => closed = true,
            Ok((MSG_TRANSFER_FINISHED, _)) => finished = true,
            Ok(_) | Err(_) => {}
        }
    }
    assert!(conn.all_data_transferred());
    let got = out_rx.recv_timeout(RECV_WAIT).expect("server saw eof");
    assert_eq!(got, payload);

    rt.shutdown();
    server.join().expect("server thread");
}
