// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! End-to-end tests for shmbus.
//!
//! Every handle maps the shared segments independently, so handles on
//! separate threads behave like separate processes.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use shmbus_core::{
    purge, purge_with_timeout, Bus, BusError, BusInspector, BusKey, BusOptions, ConfigLoader,
    ProcessMutex, SharedMemoryError, SharedSegment, TerminalAddress,
};

fn unique_key(tag: u16) -> BusKey {
    BusKey::new(0x5000 | ((std::process::id() as u16 & 0x3F) << 6) | tag)
}

fn addr(instance: u16) -> TerminalAddress {
    TerminalAddress::new(0, instance).unwrap()
}

fn fresh(key: BusKey) -> BusKey {
    purge(key).unwrap();
    key
}

/// Send, refreshing and retrying when another handle changed the pipe table.
fn send_retrying(bus: &mut Bus, peer: TerminalAddress, payload: &[u8]) {
    loop {
        match bus.send(peer, payload) {
            Ok(()) => return,
            Err(BusError::PipeCreateFailed { .. }) => {
                bus.poll().unwrap();
            }
            Err(e) => panic!("send to {} failed: {}", peer, e),
        }
    }
}

#[test]
fn test_ping_pong_scenario() {
    let key = fresh(BusKey::new(0x1234));

    let mut t1 = Bus::create(key, addr(1)).unwrap();
    let mut t2 = Bus::create(key, addr(2)).unwrap();
    let inspector = BusInspector::open(key).unwrap();

    let before = inspector.snapshot().unwrap();
    assert_eq!(before.pipes.len(), 0);
    assert_eq!(before.pipe_version, 1);
    assert_eq!(before.terminals, vec![addr(1), addr(2)]);

    // t1 never polled, yet may send to a terminal that joined after it.
    t1.send(addr(2), b"ping").unwrap();

    let after = inspector.snapshot().unwrap();
    assert_eq!(after.pipes.len(), 1);
    assert_eq!(after.pipe_version, 2);
    assert_eq!(after.pipes[0].from, addr(1));
    assert_eq!(after.pipes[0].to, addr(2));

    assert!(t2.poll().unwrap());
    assert_eq!(t2.recv(addr(1)).unwrap(), Some(b"ping".to_vec()));
    assert_eq!(t2.recv(addr(1)).unwrap(), None);

    t2.send_all(b"pong").unwrap();
    assert!(t1.poll().unwrap());
    assert_eq!(t1.recv_all().unwrap(), Some((addr(2), b"pong".to_vec())));
    assert_eq!(t1.recv_all().unwrap(), None);
    assert_eq!(t1.versions(), (2, 3));

    let dump = t1.dump();
    assert!(dump.contains("terminals (2):"));
    assert!(dump.contains("pipes (2):"));

    drop(inspector);
    t2.release();
    t1.destroy().unwrap();
}

#[test]
fn test_unknown_peer_leaves_header_untouched() {
    let key = fresh(unique_key(1));

    let mut bus = Bus::create(key, addr(1)).unwrap();
    let inspector = BusInspector::open(key).unwrap();
    let before = inspector.snapshot().unwrap();

    let err = bus.send(addr(99), b"hello").unwrap_err();
    assert!(matches!(err, BusError::PeerNotFound { peer } if peer == addr(99)));

    assert_eq!(inspector.snapshot().unwrap(), before);
    assert_eq!(bus.send_pending_bytes(addr(99)), 0);

    drop(inspector);
    bus.destroy().unwrap();
}

#[test]
fn test_idempotent_join() {
    let key = fresh(unique_key(2));

    let first = Bus::create(key, addr(1)).unwrap();
    let second = Bus::create(key, addr(2)).unwrap();
    let again = Bus::create(key, addr(2)).unwrap();
    let creator_again = Bus::create(key, addr(1)).unwrap();

    let snapshot = BusInspector::open(key).unwrap().snapshot().unwrap();
    assert_eq!(snapshot.terminals, vec![addr(1), addr(2)]);
    assert_eq!(snapshot.terminal_version, 2);

    assert_eq!(again.terminals(), &[addr(1), addr(2)]);
    assert_eq!(creator_again.versions().0, 2);

    drop(creator_again);
    drop(again);
    drop(second);
    first.destroy().unwrap();
}

#[test]
fn test_concurrent_joins_and_lazy_creation() {
    const SENDERS: u16 = 8;
    let key = fresh(unique_key(3));

    let mut receiver = Bus::create(key, addr(0)).unwrap();
    let barrier = Arc::new(Barrier::new(SENDERS as usize));

    let handles: Vec<_> = (1..=SENDERS)
        .map(|instance| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut bus = Bus::create(key, addr(instance)).unwrap();
                barrier.wait();
                for round in 0..4u8 {
                    send_retrying(&mut bus, addr(0), &[instance as u8, round]);
                }
                bus.release();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = BusInspector::open(key).unwrap().snapshot().unwrap();
    assert_eq!(snapshot.terminals.len(), SENDERS as usize + 1);
    assert_eq!(snapshot.pipes.len(), SENDERS as usize);
    let pairs: HashSet<_> = snapshot.pipes.iter().map(|p| (p.from, p.to)).collect();
    assert_eq!(pairs.len(), SENDERS as usize);
    let keys: HashSet<_> = snapshot.pipes.iter().map(|p| p.key).collect();
    assert_eq!(keys.len(), SENDERS as usize);

    // One poll attaches every pipe.
    assert!(receiver.poll().unwrap());
    assert!(!receiver.poll().unwrap());

    let mut received = 0;
    for instance in 1..=SENDERS {
        for round in 0..4u8 {
            assert_eq!(
                receiver.recv(addr(instance)).unwrap(),
                Some(vec![instance as u8, round])
            );
            received += 1;
        }
    }
    assert_eq!(received, SENDERS as usize * 4);

    receiver.destroy().unwrap();
}

#[test]
fn test_opposite_directions_race() {
    let key = fresh(unique_key(4));
    let creator = Bus::create(key, addr(1)).unwrap();
    drop(Bus::create(key, addr(2)).unwrap());

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [(1u16, 2u16), (2, 1)]
        .into_iter()
        .map(|(from, to)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut bus = Bus::create(key, addr(from)).unwrap();
                barrier.wait();
                send_retrying(&mut bus, addr(to), b"hi");
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = BusInspector::open(key).unwrap().snapshot().unwrap();
    assert_eq!(snapshot.pipes.len(), 2);
    assert_eq!(snapshot.pipe_version, 3);

    creator.destroy().unwrap();
}

#[test]
fn test_recv_all_round_robin() {
    let key = fresh(unique_key(5));

    let mut receiver = Bus::create(key, addr(0)).unwrap();
    let mut senders: Vec<Bus> = (1..=3).map(|i| Bus::create(key, addr(i)).unwrap()).collect();

    for sender in senders.iter_mut() {
        sender.poll().unwrap();
        let tag = [sender.address().instance() as u8];
        for _ in 0..2 {
            send_retrying(sender, addr(0), &tag);
        }
    }

    receiver.poll().unwrap();

    let mut order = Vec::new();
    while let Some((peer, payload)) = receiver.recv_all().unwrap() {
        assert_eq!(payload, vec![peer.instance() as u8]);
        order.push(peer.instance());
    }

    assert_eq!(order.len(), 6);
    // No sender is served twice before the others are served once.
    let first_round: HashSet<_> = order[..3].iter().collect();
    assert_eq!(first_round.len(), 3);
    assert!(receiver.recv_all().unwrap().is_none());

    drop(senders);
    receiver.destroy().unwrap();
}

#[test]
fn test_backpressure_through_bus() {
    let key = fresh(unique_key(6));
    let options = BusOptions {
        pipe_capacity: 1024,
    };

    let mut sender = Bus::with_options(key, addr(1), options).unwrap();
    let mut receiver = Bus::create(key, addr(2)).unwrap();
    let message = [7u8; 100];

    for _ in 0..9 {
        sender.send(addr(2), &message).unwrap();
    }
    let err = sender.send(addr(2), &message).unwrap_err();
    assert!(matches!(
        err,
        BusError::SendFailed { size: 100, available: 84, .. }
    ));
    assert_eq!(sender.send_pending_bytes(addr(2)), 9 * 104);

    receiver.poll().unwrap();
    assert_eq!(receiver.recv_pending_bytes(addr(1)), 9 * 104);

    let mut small = [0u8; 10];
    assert!(matches!(
        receiver.peek(addr(1), &mut small),
        Err(BusError::PeekFailed { .. })
    ));
    assert!(matches!(
        receiver.recv_into(addr(1), &mut small),
        Err(BusError::RecvFailed {
            source: SharedMemoryError::TooLarge { .. },
            ..
        })
    ));

    let mut buf = [0u8; 128];
    assert_eq!(receiver.peek(addr(1), &mut buf).unwrap(), Some(100));
    assert_eq!(receiver.recv_into(addr(1), &mut buf).unwrap(), Some(100));
    assert_eq!(&buf[..100], &message[..]);

    sender.send(addr(2), &message).unwrap();

    // Oversized payloads never fit.
    let oversized = vec![0u8; 1021];
    assert!(matches!(
        sender.send(addr(2), &oversized),
        Err(BusError::SendFailed { .. })
    ));

    drop(receiver);
    sender.destroy().unwrap();
}

#[test]
fn test_messages_straddle_ring_end() {
    let key = fresh(unique_key(7));
    let options = BusOptions { pipe_capacity: 64 };

    let mut sender = Bus::with_options(key, addr(1), options).unwrap();
    let mut receiver = Bus::create(key, addr(2)).unwrap();
    sender.send(addr(2), b"prime").unwrap();
    receiver.poll().unwrap();
    receiver.recv(addr(1)).unwrap();

    for i in 0..50u8 {
        let payload: Vec<u8> = (0..(i % 23) + 1).map(|b| b.wrapping_mul(i)).collect();
        sender.send(addr(2), &payload).unwrap();
        assert_eq!(receiver.recv(addr(1)).unwrap(), Some(payload));
    }

    drop(receiver);
    sender.destroy().unwrap();
}

#[test]
fn test_broadcast_by_kind() {
    let key = fresh(unique_key(8));
    let worker = |i| TerminalAddress::new(2, i).unwrap();
    let logger = TerminalAddress::new(3, 1).unwrap();

    let mut hub = Bus::create(key, addr(1)).unwrap();
    let mut workers: Vec<Bus> = (1..=2).map(|i| Bus::create(key, worker(i)).unwrap()).collect();
    let mut log = Bus::create(key, logger).unwrap();

    hub.poll().unwrap();
    hub.send_by_type(b"job", 2).unwrap();
    hub.send_all(b"all").unwrap();

    for bus in workers.iter_mut() {
        bus.poll().unwrap();
        assert_eq!(bus.recv(addr(1)).unwrap(), Some(b"job".to_vec()));
        assert_eq!(bus.recv(addr(1)).unwrap(), Some(b"all".to_vec()));
    }

    log.poll().unwrap();
    assert_eq!(log.recv_all().unwrap(), Some((addr(1), b"all".to_vec())));
    assert!(log.recv_all().unwrap().is_none());

    drop(log);
    drop(workers);
    hub.destroy().unwrap();
}

#[test]
fn test_join_from_config_file() {
    let key = fresh(unique_key(9));
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("shmbus.yaml");
    std::fs::write(
        &path,
        format!(
            "bus:\n  key: {}\n  pipe_capacity: 2000\nterminal:\n  kind: 1\n  instance: 5\n",
            key.value()
        ),
    )
    .unwrap();

    let config = ConfigLoader::load_file(&path).unwrap();
    let mut bus = Bus::with_config(&config).unwrap();
    assert_eq!(bus.address(), TerminalAddress::new(1, 5).unwrap());
    assert_eq!(bus.options().pipe_capacity, 2048);

    let peer = Bus::create(key, addr(9)).unwrap();
    bus.send(addr(9), b"configured").unwrap();
    let snapshot = bus.snapshot();
    assert_eq!(snapshot.pipes.len(), 1);
    assert_eq!(snapshot.pipes[0].capacity, 2048);

    drop(peer);
    bus.destroy().unwrap();
}

#[test]
fn test_config_without_terminal_cannot_join() {
    let config = ConfigLoader::load_string("bus:\n  key: 1\n").unwrap();
    assert!(matches!(
        Bus::with_config(&config),
        Err(BusError::HardValidation(_))
    ));
}

#[test]
fn test_destroy_and_purge() {
    let key = fresh(unique_key(10));

    let mut a = Bus::create(key, addr(1)).unwrap();
    let b = Bus::create(key, addr(2)).unwrap();
    a.send(addr(2), b"bye").unwrap();
    let pipe_key = a.snapshot().pipes[0].key;
    drop(b);
    a.destroy().unwrap();

    assert!(matches!(
        BusInspector::open(key),
        Err(BusError::SharedMemory(SharedMemoryError::NotFound { .. }))
    ));
    assert!(!SharedSegment::unlink(pipe_key).unwrap());

    // Purging an absent bus succeeds.
    purge(key).unwrap();

    // A later join starts from scratch.
    let fresh_bus = Bus::create(key, addr(3)).unwrap();
    assert_eq!(fresh_bus.terminals(), &[addr(3)]);
    assert_eq!(fresh_bus.versions(), (1, 1));
    fresh_bus.destroy().unwrap();
}

#[test]
fn test_roster_full_rejects_new_terminals() {
    let key = fresh(unique_key(11));

    let creator = Bus::create(key, addr(0)).unwrap();
    for instance in 1..64 {
        Bus::create(key, addr(instance)).unwrap().release();
    }

    assert!(matches!(
        Bus::create(key, addr(64)),
        Err(BusError::TerminalTableFull { max: 64 })
    ));

    // A listed terminal may still rejoin.
    let rejoined = Bus::create(key, addr(17)).unwrap();
    assert_eq!(rejoined.terminals().len(), 64);
    assert_eq!(rejoined.versions().0, 64);

    let snapshot = BusInspector::open(key).unwrap().snapshot().unwrap();
    assert!(!snapshot.terminals.contains(&addr(64)));

    rejoined.release();
    creator.destroy().unwrap();
}

#[test]
fn test_purge_recovers_from_abandoned_lock() {
    let key = fresh(unique_key(12));

    let mut a = Bus::create(key, addr(1)).unwrap();
    let b = Bus::create(key, addr(2)).unwrap();
    a.send(addr(2), b"stuck").unwrap();
    let pipe_key = a.snapshot().pipes[0].key;

    // The holder goes away without unlocking.
    let holder = ProcessMutex::create_or_open(key.header_key()).unwrap();
    std::mem::forget(holder.lock().unwrap());
    drop(holder);

    purge_with_timeout(key, Duration::from_millis(50)).unwrap();
    assert!(!SharedSegment::unlink(pipe_key).unwrap());
    assert!(matches!(
        BusInspector::open(key),
        Err(BusError::SharedMemory(SharedMemoryError::NotFound { .. }))
    ));

    // Joining starts a new bus with a new lock.
    let (tx, rx) = std::sync::mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(Bus::create(key, addr(3)).map(|bus| bus.destroy()));
    });
    let joined = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    joined.unwrap().unwrap();

    drop(b);
    drop(a);
}
