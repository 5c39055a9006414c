// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Liveness: a receiver whose sender dies ungracefully gets a transport
//! timeout instead of silence.

mod support;

use aerolink::Processor;
use std::time::Duration;
use support::{bind_producer, fresh_manager, payloads, test_context, TestProbe, Terminal};

const CHANNEL: &str = "aeron:udp?endpoint=localhost:40140";

#[test]
fn client_times_out_after_sender_dies() {
    let manager = fresh_manager(128);
    let interval_millis = 100;
    let timeout_millis = 600;

    let server = Processor::create(
        test_context("server", CHANNEL, &manager)
            .heartbeat_interval_millis(interval_millis)
            .heartbeat_timeout_millis(timeout_millis),
    )
    .expect("server");
    bind_producer(&server, payloads(&["One"]), Terminal::Open);

    let client = Processor::create(
        test_context("client", CHANNEL, &manager)
            .heartbeat_interval_millis(interval_millis)
            .heartbeat_timeout_millis(timeout_millis),
    )
    .expect("client");
    let (probe, subscriber) = TestProbe::unlimited();
    client.subscribe(subscriber);

    // Heartbeat replies are flowing; the item proves the link is up.
    assert!(probe.await_items(1, Duration::from_secs(5)));
    std::thread::sleep(Duration::from_millis(3 * interval_millis));
    assert_eq!(probe.error_count(), 0, "premature liveness error");

    // Kill the sender without any terminal frame.
    server.shutdown();

    // Within the timeout plus roughly one interval the client must fail its
    // subscribers with a transport timeout.
    let bound = Duration::from_millis(timeout_millis + 4 * interval_millis);
    assert!(probe.await_error(bound), "expected a liveness error");
    assert!(probe.has_timeout_error(), "expected TransportTimeout");
    assert_eq!(probe.complete_count(), 0);

    client.shutdown();
}

#[test]
fn client_without_any_sender_does_not_time_out() {
    let manager = fresh_manager(128);

    let client = Processor::create(
        test_context("client", CHANNEL, &manager)
            .heartbeat_interval_millis(100)
            .heartbeat_timeout_millis(500),
    )
    .expect("client");
    let (probe, subscriber) = TestProbe::unlimited();
    client.subscribe(subscriber);

    // No sender ever replies; liveness stays unarmed and no error fires.
    std::thread::sleep(Duration::from_millis(1_500));
    assert_eq!(probe.error_count(), 0);

    client.shutdown();
}
