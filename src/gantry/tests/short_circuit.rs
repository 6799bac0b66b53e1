// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Filter short-circuiting via the session response slot.

mod common;

use common::*;

use buffer::BufferChain;

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn filter_response_reaches_the_client_exactly_once() {
    let fired = Arc::new(AtomicUsize::new(0));
    let filter = Arc::new(ShortCircuitFilter {
        response: b"CANNED\n",
        fired: fired.clone(),
    });

    let mut rig = rig(RigOptions {
        filters: vec![filter],
        retain_last_statements: Some(4),
        ..RigOptions::default()
    });

    let mut client = connect(rig.addr);
    rig.spin(2);
    let (_token, session) = rig.find_client().expect("client was accepted");

    client.write_all(b"select 1\n").unwrap();
    rig.spin(2);

    assert_eq!(fired.load(Ordering::Relaxed), 1);

    // the canned reply arrived, once
    let received = read_exact_bytes(&mut client, 7);
    assert_eq!(received, b"CANNED\n");
    let nothing_more = read_exact_bytes(&mut client, 1);
    assert!(nothing_more.is_empty());

    // the short-circuited query was booked complete before the next query
    // is accepted
    let queries = session.queries_as_json();
    let entries = queries.as_array().expect("queries are an array");
    assert_eq!(entries.len(), 1);
    assert!(entries[0].get("completed").is_some());
}

#[test]
fn a_second_response_for_the_same_query_is_rejected() {
    let mut rig = rig(RigOptions::default());
    let _client = connect(rig.addr);
    rig.spin(2);
    let (_token, session) = rig.find_client().expect("client was accepted");

    assert!(session.set_response(0, BufferChain::from(&b"first"[..])));
    assert!(!session.set_response(0, BufferChain::from(&b"second"[..])));
}

#[test]
fn query_ring_never_exceeds_its_depth() {
    let mut rig = rig(RigOptions {
        retain_last_statements: Some(3),
        ..RigOptions::default()
    });
    let mut client = connect(rig.addr);
    rig.spin(2);
    let (_token, session) = rig.find_client().expect("client was accepted");

    for i in 0..10 {
        client
            .write_all(format!("query {}\n", i).as_bytes())
            .unwrap();
        rig.spin(1);
        assert!(session.query_ring_len() <= 3);
    }
}
