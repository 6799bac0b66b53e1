// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Write queue watermark hysteresis and callback registration semantics.

mod common;

use common::*;

use buffer::BufferChain;
use gantry::dcb::{Dcb, DrainMode, Reason};

use std::sync::atomic::{AtomicUsize, Ordering};

static HIGH_FIRES: AtomicUsize = AtomicUsize::new(0);
static LOW_FIRES: AtomicUsize = AtomicUsize::new(0);
static DRAIN_FIRES: AtomicUsize = AtomicUsize::new(0);

fn on_high(_dcb: &mut Dcb, reason: Reason, _userdata: u64) {
    assert_eq!(reason, Reason::HighWater);
    HIGH_FIRES.fetch_add(1, Ordering::Relaxed);
}

fn on_low(_dcb: &mut Dcb, reason: Reason, _userdata: u64) {
    assert_eq!(reason, Reason::LowWater);
    LOW_FIRES.fetch_add(1, Ordering::Relaxed);
}

fn on_drained(_dcb: &mut Dcb, reason: Reason, _userdata: u64) {
    assert_eq!(reason, Reason::Drained);
    DRAIN_FIRES.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn watermark_hysteresis() {
    HIGH_FIRES.store(0, Ordering::Relaxed);
    LOW_FIRES.store(0, Ordering::Relaxed);
    DRAIN_FIRES.store(0, Ordering::Relaxed);

    let mut rig = rig(RigOptions {
        high_water: 1024,
        low_water: 256,
        ..RigOptions::default()
    });

    let mut client = connect(rig.addr);
    rig.spin(2);
    let (token, _session) = rig.find_client().expect("client was accepted");

    {
        let dcb = rig.worker.dcb_mut(token).unwrap();
        assert!(dcb.add_callback(Reason::HighWater, on_high, 0));
        assert!(dcb.add_callback(Reason::LowWater, on_low, 0));
        assert!(dcb.add_callback(Reason::Drained, on_drained, 0));

        // a duplicate registration is refused
        assert!(!dcb.add_callback(Reason::HighWater, on_high, 0));
        // a different userdata is a different registration
        assert!(dcb.add_callback(Reason::HighWater, on_high, 1));
        assert!(dcb.remove_callback(Reason::HighWater, on_high, 1));
    }

    // buffer 2000 bytes without draining: one upward crossing of 1024
    let data = BufferChain::from(vec![b'x'; 2000]);
    assert!(rig.worker.writeq_append(token, data, DrainMode::No));
    assert_eq!(HIGH_FIRES.load(Ordering::Relaxed), 1);
    assert_eq!(LOW_FIRES.load(Ordering::Relaxed), 0);

    // buffering more while above the mark does not fire again
    let more = BufferChain::from(vec![b'y'; 500]);
    assert!(rig.worker.writeq_append(token, more, DrainMode::No));
    assert_eq!(HIGH_FIRES.load(Ordering::Relaxed), 1);

    // draining to empty crosses the low water mark exactly once
    let flushed = rig.worker.writeq_drain(token);
    assert_eq!(flushed, 2500);
    assert_eq!(LOW_FIRES.load(Ordering::Relaxed), 1);
    assert_eq!(DRAIN_FIRES.load(Ordering::Relaxed), 1);

    // the peer observes the appended buffers back to back
    let received = read_exact_bytes(&mut client, 2500);
    assert_eq!(received.len(), 2500);
    assert!(received[..2000].iter().all(|b| *b == b'x'));
    assert!(received[2000..].iter().all(|b| *b == b'y'));

    // a second drain with an empty queue fires nothing further
    rig.worker.writeq_drain(token);
    assert_eq!(LOW_FIRES.load(Ordering::Relaxed), 1);
    assert_eq!(DRAIN_FIRES.load(Ordering::Relaxed), 1);
}

#[test]
fn writes_appear_in_call_order() {
    let mut rig = rig(RigOptions::default());
    let mut client = connect(rig.addr);
    rig.spin(2);
    let (token, _session) = rig.find_client().expect("client was accepted");

    assert!(rig
        .worker
        .writeq_append(token, BufferChain::from(&b"first "[..]), DrainMode::No));
    assert!(rig
        .worker
        .writeq_append(token, BufferChain::from(&b"second"[..]), DrainMode::Yes));

    let received = read_exact_bytes(&mut client, 12);
    assert_eq!(received, b"first second");
}

#[test]
fn close_is_idempotent_and_silences_the_dcb() {
    let mut rig = rig(RigOptions::default());
    let mut client = connect(rig.addr);
    rig.spin(2);
    let (token, _session) = rig.find_client().expect("client was accepted");

    rig.worker.close_dcb(token);
    // closing again is a no-op
    rig.worker.close_dcb(token);

    // writes and drains after close do nothing
    assert!(!rig
        .worker
        .writeq_append(token, BufferChain::from(&b"late"[..]), DrainMode::Yes));
    assert_eq!(rig.worker.writeq_drain(token), 0);

    rig.spin(2);
    assert_eq!(rig.client_count(), 0);

    // the peer sees end of stream
    let received = read_exact_bytes(&mut client, 1);
    assert!(received.is_empty());
}
