// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Synthetic event re-delivery.

mod common;

use common::*;

use std::io::Write;
use std::sync::atomic::Ordering;

#[test]
fn triggered_read_reenters_once_before_the_next_wait() {
    let protocol = TestProtocol::with_trigger();
    let counters = protocol.counters.clone();

    let mut rig = rig(RigOptions {
        protocol,
        ..RigOptions::default()
    });

    let mut client = connect(rig.addr);
    rig.spin(2);
    assert_eq!(counters.init_calls.load(Ordering::Relaxed), 1);
    assert_eq!(counters.read_calls.load(Ordering::Relaxed), 0);

    client.write_all(b"hello").unwrap();

    // one turn delivers the natural read plus exactly one synthesized
    // re-entry queued by the handler
    rig.spin(1);
    assert_eq!(counters.read_calls.load(Ordering::Relaxed), 2);

    // no stale re-delivery on later turns
    rig.spin(2);
    assert_eq!(counters.read_calls.load(Ordering::Relaxed), 2);
}

#[test]
fn init_runs_exactly_once_before_reads() {
    let protocol = TestProtocol::new();
    let counters = protocol.counters.clone();

    let mut rig = rig(RigOptions {
        protocol,
        ..RigOptions::default()
    });

    let mut client = connect(rig.addr);
    rig.spin(2);
    assert_eq!(counters.init_calls.load(Ordering::Relaxed), 1);

    client.write_all(b"hello").unwrap();
    rig.spin(2);

    assert_eq!(counters.init_calls.load(Ordering::Relaxed), 1);
    assert!(counters.read_calls.load(Ordering::Relaxed) >= 1);
}
