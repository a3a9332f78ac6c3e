//! End-to-end dispatch behavior through a live reactor thread.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::{Duration, Instant};

use reactor::{
    DeregisterMode, MsgKind, NetEvent, Readiness, Reactor, ReactorSocket, SlotId, SocketUid,
    TimerKind,
};

const RECV_WAIT: Duration = Duration::from_secs(5);
const SILENCE: Duration = Duration::from_millis(200);

#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Ready(Readiness),
    Timer(u32, u64),
    Message(u32, u64),
}

struct Recording {
    uid: SocketUid,
    tx: Sender<Delivery>,
}

impl ReactorSocket for Recording {
    fn uid(&self) -> SocketUid {
        self.uid
    }
    fn on_ready(&self, _: &Reactor, event: NetEvent) {
        let _ = self.tx.send(Delivery::Ready(event.readiness));
    }
    fn on_timer(&self, _: &Reactor, kind: TimerKind, payload: u64) {
        let _ = self.tx.send(Delivery::Timer(kind.0, payload));
    }
    fn on_message(&self, _: &Reactor, kind: MsgKind, payload: u64) {
        let _ = self.tx.send(Delivery::Message(kind.0, payload));
    }
}

fn recording() -> (Arc<Recording>, Receiver<Delivery>) {
    let (tx, rx) = channel();
    (
        Arc::new(Recording {
            uid: SocketUid::fresh(),
            tx,
        }),
        rx,
    )
}

fn register(rt: &Reactor, sock: &Arc<Recording>) -> SlotId {
    rt.register(Arc::clone(sock) as Arc<dyn ReactorSocket>)
        .expect("reactor accepting registrations")
}

#[test]
fn posted_messages_arrive_in_order() {
    let rt = Reactor::spawn().expect("spawn reactor");
    let (sock, rx) = recording();
    let slot = register(&rt, &sock);

    for i in 0..4 {
        assert!(rt.post(slot, sock.uid, MsgKind(9), i));
    }
    for i in 0..4 {
        assert_eq!(rx.recv_timeout(RECV_WAIT).unwrap(), Delivery::Message(9, i));
    }
    rt.shutdown();
}

#[test]
fn timer_fires_after_deadline() {
    let rt = Reactor::spawn().expect("spawn reactor");
    let (sock, rx) = recording();
    let slot = register(&rt, &sock);

    let armed_at = Instant::now();
    assert!(rt.add_timer(
        slot,
        sock.uid,
        armed_at + Duration::from_millis(50),
        TimerKind(3),
        77
    ));
    assert_eq!(rx.recv_timeout(RECV_WAIT).unwrap(), Delivery::Timer(3, 77));
    assert!(armed_at.elapsed() >= Duration::from_millis(50));
    rt.shutdown();
}

#[test]
fn deleted_timer_never_fires() {
    let rt = Reactor::spawn().expect("spawn reactor");
    let (sock, rx) = recording();
    let slot = register(&rt, &sock);

    assert!(rt.add_timer(
        slot,
        sock.uid,
        Instant::now() + Duration::from_millis(80),
        TimerKind(4),
        0
    ));
    assert!(rt.delete_timer(sock.uid, TimerKind(4)));
    assert!(rx.recv_timeout(SILENCE).is_err());
    rt.shutdown();
}

#[test]
fn stale_uid_is_dropped_not_misdelivered() {
    let rt = Reactor::spawn().expect("spawn reactor");
    let (old, old_rx) = recording();
    let slot = register(&rt, &old);
    assert!(rt.deregister(slot, old.uid, DeregisterMode::Drop));

    // Same slot, new occupant.
    let (new, new_rx) = recording();
    let reused = register(&rt, &new);
    assert_eq!(reused, slot);

    // An event addressed to the old uid must vanish; the sentinel addressed
    // to the new uid proves the queue was processed past it.
    assert!(rt.post(slot, old.uid, MsgKind(1), 111));
    assert!(rt.repost(slot, old.uid, NetEvent::new(Readiness::Readable)));
    assert!(rt.post(slot, new.uid, MsgKind(2), 222));

    assert_eq!(
        new_rx.recv_timeout(RECV_WAIT).unwrap(),
        Delivery::Message(2, 222)
    );
    assert!(new_rx.recv_timeout(SILENCE).is_err());
    assert!(old_rx.recv_timeout(Duration::ZERO).is_err());
    rt.shutdown();
}

#[test]
fn detached_socket_found_again_by_uid_scan() {
    let rt = Reactor::spawn().expect("spawn reactor");
    let (filler, _filler_rx) = recording();
    let (sock, rx) = recording();
    register(&rt, &filler);
    let first = register(&rt, &sock);

    // Timer armed against the first slot.
    assert!(rt.add_timer(
        first,
        sock.uid,
        Instant::now() + Duration::from_millis(60),
        TimerKind(5),
        5
    ));

    // Detach keeps the pending timer; after re-registration into a different
    // slot the uid scan must still deliver it.
    assert!(rt.deregister(first, sock.uid, DeregisterMode::Detach));
    let (occupier, _occupier_rx) = recording();
    assert_eq!(register(&rt, &occupier), first);
    let second = register(&rt, &sock);
    assert_ne!(first, second);

    assert_eq!(rx.recv_timeout(RECV_WAIT).unwrap(), Delivery::Timer(5, 5));
    rt.shutdown();
}

#[test]
fn shutdown_makes_primitives_fail_soft() {
    let rt = Reactor::spawn().expect("spawn reactor");
    let (sock, _rx) = recording();
    let slot = register(&rt, &sock);
    rt.shutdown();

    assert!(!rt.is_running());
    assert!(!rt.post(slot, sock.uid, MsgKind(0), 0));
    assert!(!rt.add_timer(slot, sock.uid, Instant::now(), TimerKind(0), 0));
    assert!(!rt.repost(slot, sock.uid, NetEvent::new(Readiness::Writable)));
    assert!(rt.register(Arc::clone(&sock) as Arc<dyn ReactorSocket>).is_none());
    // A second shutdown is a no-op.
    rt.shutdown();
}
