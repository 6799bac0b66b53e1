// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Listener lifecycle, registry, auth-flood rejection and persistence.

mod common;

use common::*;

use gantry::listener::{
    listener_find, listener_find_by_service, listener_serialize, ListenerState,
};

use std::sync::atomic::Ordering;

#[test]
fn auth_flood_gets_rejected_before_the_protocol_sees_it() {
    let protocol = TestProtocol::new();
    let counters = protocol.counters.clone();

    let mut rig = rig(RigOptions {
        protocol,
        ..RigOptions::default()
    });

    // ten failures from this remote within the window
    for _ in 0..10 {
        rig.listener.mark_auth_as_failed("127.0.0.1");
    }

    let mut client = connect(rig.addr);
    rig.spin(2);

    // the connection was turned away with the protocol's deny message and
    // no session or protocol state was ever built
    let received = read_exact_bytes(&mut client, 9);
    assert_eq!(received, b"REJECTED\n");
    let eof = read_exact_bytes(&mut client, 1);
    assert!(eof.is_empty());

    assert_eq!(counters.init_calls.load(Ordering::Relaxed), 0);
    assert_eq!(rig.client_count(), 0);
}

#[test]
fn auth_failures_decay_over_time() {
    let rig = rig(RigOptions::default());

    for _ in 0..10 {
        rig.listener.mark_auth_as_failed("198.51.100.9");
    }
    // a different remote is unaffected
    assert!(!rig.listener.auth_blocked("203.0.113.1"));
    assert!(rig.listener.auth_blocked("198.51.100.9"));

    // at one forgiven failure per second the score is gone inside ~10s;
    // poll rather than sleeping the whole window
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(15);
    while rig.listener.auth_blocked("198.51.100.9") {
        assert!(std::time::Instant::now() < deadline, "score never decayed");
        std::thread::sleep(std::time::Duration::from_millis(500));
    }
}

#[test]
fn stop_start_keeps_address_and_sessions() {
    use std::io::Write;

    let mut rig = rig(RigOptions::default());
    let addr = rig.addr;

    let mut first = connect(addr);
    rig.spin(2);
    assert_eq!(rig.client_count(), 1);

    assert!(rig.listener.stop(rig.worker.workers()));
    rig.spin(2);
    assert_eq!(rig.listener.state(), ListenerState::Stopped);

    // a connect while stopped sits in the backlog unaccepted
    let _second = connect(addr);
    rig.spin(3);
    assert_eq!(rig.client_count(), 1);

    // the already-accepted session keeps working
    first.write_all(b"still here\n").unwrap();
    rig.spin(2);
    let echoed = read_exact_bytes(&mut first, 11);
    assert_eq!(echoed, b"still here\n");

    // start again on the same address; the backlogged connect is accepted
    assert!(rig.listener.start(rig.worker.workers()));
    rig.spin(3);
    assert_eq!(rig.listener.state(), ListenerState::Started);
    assert_eq!(rig.client_count(), 2);
}

#[test]
fn registry_find_and_destroy() {
    use gantry::listener::Listener;

    let mut rig = rig(RigOptions::default());
    let name = rig.listener.name().to_string();
    let service = rig.listener.service().name().to_string();

    assert!(listener_find(&name).is_some());
    assert_eq!(listener_find_by_service(&service).len(), 1);

    // a client accepted before destruction keeps its shared reference
    let _client = connect(rig.addr);
    rig.spin(2);
    let (_token, session) = rig.find_client().expect("client was accepted");

    Listener::destroy(&rig.listener, rig.worker.workers());
    rig.spin(2);

    assert!(listener_find(&name).is_none());
    assert_eq!(rig.listener.state(), ListenerState::Destroyed);

    // the session still reaches its listener through the shared reference
    assert_eq!(session.listener().name(), name);
}

#[test]
fn serialized_listener_round_trips_through_the_config_parser() {
    let rig = rig(RigOptions::default());
    let dir = tempfile::tempdir().expect("failed to create tempdir");

    let path = listener_serialize(&rig.listener, dir.path()).expect("failed to serialize");
    let content = std::fs::read_to_string(&path).expect("failed to read back");

    // the persisted fragment parses as a listener section
    let parsed: toml::Value = toml::from_str(&content).expect("persisted file is valid toml");
    let listeners = parsed
        .get("listener")
        .and_then(|v| v.as_array())
        .expect("file contains a listener array");
    assert_eq!(listeners.len(), 1);
    assert_eq!(
        listeners[0].get("name").and_then(|v| v.as_str()),
        Some(rig.listener.name())
    );
    assert_eq!(
        listeners[0].get("protocol").and_then(|v| v.as_str()),
        Some("test")
    );
}

#[test]
fn connection_limit_refuses_with_a_message() {
    let mut rig = rig(RigOptions {
        max_connections: 1,
        ..RigOptions::default()
    });

    let _first = connect(rig.addr);
    rig.spin(2);
    assert_eq!(rig.client_count(), 1);

    let mut second = connect(rig.addr);
    rig.spin(3);

    let received = read_exact_bytes(&mut second, 21);
    assert_eq!(received, b"TOO MANY CONNECTIONS\n");
    let eof = read_exact_bytes(&mut second, 1);
    assert!(eof.is_empty());
    assert_eq!(rig.client_count(), 1);
}
