// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! End-to-end flow through a backend: client bytes travel down the routing
//! chain to a backend connection and the backend's reply travels back up.

mod common;

use common::*;

use gantry::dcb::Role;
use gantry::session::{CloseReason, SessionState};

use std::io::Write;
use std::sync::Arc;

#[test]
fn query_and_reply_round_trip_through_a_backend() {
    let backend_addr = spawn_echo_backend();

    let mut rig = rig(RigOptions {
        router: Arc::new(ForwardRouter),
        targets: vec![backend_addr],
        retain_last_statements: Some(8),
        ..RigOptions::default()
    });

    let mut client = connect(rig.addr);
    rig.spin(3);

    let (_token, session) = rig.find_client().expect("client was accepted");
    assert_eq!(session.state(), SessionState::Started);
    // the router connected one backend during session start
    assert_eq!(rig.worker.dcb_count_by_role(Role::Backend), 1);
    assert_eq!(session.backend_tokens().len(), 1);

    client.write_all(b"select now()\n").unwrap();

    // a few turns: client read, backend connect completion + delayed queue
    // release, backend reply, client write
    for _ in 0..10 {
        rig.spin(1);
    }

    let echoed = read_exact_bytes(&mut client, 13);
    assert_eq!(echoed, b"select now()\n");

    // the reply was booked against the backend in the query ring
    let queries = session.queries_as_json();
    let entries = queries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    let responses = entries[0]["responses"].as_array().unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["server"], "backend-0");
}

#[test]
fn backend_failure_terminates_the_session() {
    // a backend that is not listening: the connect fails on first use
    let dead_addr = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
        // probe drops here, the port is closed again
    };

    let mut rig = rig(RigOptions {
        router: Arc::new(ForwardRouter),
        targets: vec![dead_addr],
        ..RigOptions::default()
    });

    let mut client = connect(rig.addr);
    for _ in 0..10 {
        rig.spin(1);
    }

    // the router's handle_error declined to continue, so the session is
    // gone and the client socket was closed
    client.write_all(b"anyone there?\n").ok();
    for _ in 0..10 {
        rig.spin(1);
        if rig.client_count() == 0 {
            break;
        }
    }

    assert_eq!(rig.client_count(), 0);
    assert_eq!(rig.worker.dcb_count_by_role(Role::Backend), 0);

    let eof = read_exact_bytes(&mut client, 64);
    assert!(eof.is_empty());
}

#[test]
fn session_reference_count_drains_to_zero() {
    let backend_addr = spawn_echo_backend();

    let mut rig = rig(RigOptions {
        router: Arc::new(ForwardRouter),
        targets: vec![backend_addr],
        ..RigOptions::default()
    });

    let client = connect(rig.addr);
    rig.spin(3);

    let (token, session) = rig.find_client().expect("client was accepted");
    let weak = std::rc::Rc::downgrade(&session);
    drop(session);

    // the DCBs and their protocol sessions still hold references
    assert!(weak.upgrade().is_some());

    rig.worker.close_dcb(token);
    rig.spin(3);
    drop(client);

    // both DCBs are gone, and with them the last references
    assert!(weak.upgrade().is_none());
    assert_eq!(rig.worker.dcb_count_by_role(Role::Backend), 0);
}

#[test]
fn router_refusal_closes_the_connection() {
    // a forward router with no targets refuses the session outright
    let mut rig = rig(RigOptions {
        router: Arc::new(ForwardRouter),
        targets: vec![],
        ..RigOptions::default()
    });

    let mut client = connect(rig.addr);
    rig.spin(3);

    // the router refused the session, so no client session remains
    assert_eq!(rig.client_count(), 0);
    let eof = read_exact_bytes(&mut client, 16);
    assert!(eof.is_empty());
}

#[test]
fn delayed_routing_holds_a_session_reference() {
    use buffer::BufferChain;
    use gantry::session::session_delay_routing;

    let backend_addr = spawn_echo_backend();

    let mut rig = rig(RigOptions {
        router: Arc::new(ForwardRouter),
        targets: vec![backend_addr],
        ..RigOptions::default()
    });

    let mut client = connect(rig.addr);
    rig.spin(3);
    let (_token, session) = rig.find_client().expect("client was accepted");

    session_delay_routing(
        &mut rig.worker,
        session.clone(),
        BufferChain::from(&b"later\n"[..]),
        50,
    );

    // nothing routed yet
    rig.spin(1);

    // after the deadline the query flows to the backend and back
    std::thread::sleep(std::time::Duration::from_millis(60));
    for _ in 0..10 {
        rig.spin(1);
    }

    let echoed = read_exact_bytes(&mut client, 6);
    assert_eq!(echoed, b"later\n");
    assert_eq!(session.close_reason(), CloseReason::None);
}
