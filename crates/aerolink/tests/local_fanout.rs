// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local fan-out: several subscribers on one processor, each pacing itself.

mod support;

use aerolink::Processor;
use std::time::Duration;
use support::{bind_producer, fresh_manager, payloads, test_context, wait_until, TestProbe, Terminal};

const CHANNEL: &str = "aeron:udp?endpoint=localhost:40170";
const TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(300);

#[test]
fn two_subscribers_on_one_processor_both_see_everything() {
    let manager = fresh_manager(128);

    let server = Processor::create(test_context("server", CHANNEL, &manager)).expect("server");
    bind_producer(
        &server,
        payloads(&["One", "Two", "Three"]),
        Terminal::Complete,
    );

    let client = Processor::create(test_context("client", CHANNEL, &manager)).expect("client");
    let (probe_a, subscriber_a) = TestProbe::unlimited();
    client.subscribe(subscriber_a);
    let (probe_b, subscriber_b) = TestProbe::unlimited();
    client.subscribe(subscriber_b);

    assert!(probe_a.await_items(3, TIMEOUT));
    assert!(probe_b.await_items(3, TIMEOUT));
    assert_eq!(probe_a.items_utf8(), vec!["One", "Two", "Three"]);
    assert_eq!(probe_b.items_utf8(), vec!["One", "Two", "Three"]);
    assert!(probe_a.await_complete(TIMEOUT));
    assert!(probe_b.await_complete(TIMEOUT));

    client.shutdown();
    server.shutdown();
}

#[test]
fn quiescent_subscriber_neither_starves_nor_loses_items() {
    let manager = fresh_manager(128);

    let server = Processor::create(test_context("server", CHANNEL, &manager)).expect("server");
    bind_producer(
        &server,
        payloads(&["One", "Two", "Three"]),
        Terminal::Complete,
    );

    let client = Processor::create(test_context("client", CHANNEL, &manager)).expect("client");
    let (fast, fast_subscriber) = TestProbe::unlimited();
    client.subscribe(fast_subscriber);
    let (slow, slow_subscriber) = TestProbe::manual();
    client.subscribe(slow_subscriber);

    // The silent sibling must not cap the stream: the fast subscriber runs
    // to completion on its own demand.
    assert!(fast.await_items(3, TIMEOUT), "fast subscriber was starved");
    assert_eq!(fast.items_utf8(), vec!["One", "Two", "Three"]);
    assert!(fast.await_complete(TIMEOUT));

    // The slow subscriber has consumed nothing, and its Complete waits
    // behind the items it has not taken yet.
    std::thread::sleep(SETTLE);
    assert_eq!(slow.item_count(), 0, "delivery ignored the entry's demand");
    assert_eq!(slow.complete_count(), 0, "Complete cut the backlog off");

    // Items the fast subscriber already consumed are still here, in order.
    slow.request(2);
    assert!(slow.await_items(2, TIMEOUT), "backlogged items were lost");
    assert_eq!(slow.items_utf8(), vec!["One", "Two"]);
    assert_eq!(slow.complete_count(), 0);

    slow.request(1);
    assert!(slow.await_items(3, TIMEOUT));
    assert_eq!(slow.items_utf8(), vec!["One", "Two", "Three"]);
    assert!(
        wait_until(TIMEOUT, || slow.complete_count() > 0),
        "deferred Complete never arrived"
    );

    client.shutdown();
    server.shutdown();
}
