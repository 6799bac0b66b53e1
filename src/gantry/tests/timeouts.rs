// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Idle connection sweeping.

mod common;

use common::*;

use gantry::session::{CloseReason, SessionState};

use std::time::Duration;

#[test]
fn idle_client_is_timed_out() {
    let mut rig = rig(RigOptions {
        idle_timeout_ms: 100,
        ..RigOptions::default()
    });

    let mut client = connect(rig.addr);
    rig.spin(2);
    let (_token, session) = rig.find_client().expect("client was accepted");
    assert_eq!(session.state(), SessionState::Started);

    // not yet idle for long enough
    rig.worker.process_timeouts();
    assert_eq!(session.close_reason(), CloseReason::None);

    std::thread::sleep(Duration::from_millis(150));
    rig.worker.process_timeouts();
    rig.spin(2);

    assert_eq!(session.close_reason(), CloseReason::Timeout);
    assert_eq!(session.close_reason().as_str(), "Timed out by Gantry");
    assert_eq!(session.state(), SessionState::Stopping);
    assert_eq!(rig.client_count(), 0);

    // the client socket was closed underneath the peer
    let received = read_exact_bytes(&mut client, 1);
    assert!(received.is_empty());
}

#[test]
fn active_client_survives_the_sweep() {
    use std::io::Write;

    let mut rig = rig(RigOptions {
        idle_timeout_ms: 300,
        ..RigOptions::default()
    });

    let mut client = connect(rig.addr);
    rig.spin(2);
    let (_token, session) = rig.find_client().expect("client was accepted");

    // traffic keeps refreshing the last-read stamp
    for _ in 0..3 {
        std::thread::sleep(Duration::from_millis(100));
        client.write_all(b"ping").unwrap();
        rig.spin(2);
        rig.worker.process_timeouts();
    }

    assert_eq!(session.close_reason(), CloseReason::None);
    assert_eq!(session.state(), SessionState::Started);
    assert_eq!(rig.client_count(), 1);
}
