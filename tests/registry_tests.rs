//! Connection Registry Tests
//!
//! Tests for:
//! - Exclusive handle allocation under concurrent opens
//! - Slot reuse after close
//! - Requests against closed or unknown handles

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::{call, memory_bridge_with_capacity, open_native};
use dbx_bridge::dispatch::STATUS_NO_CONNECTION;
use dbx_bridge::DbType;
use dbx_protocol::Command;

// ============================================================================
// Allocation Tests
// ============================================================================

#[test]
fn test_concurrent_opens_fill_table_exactly() {
    const CAPACITY: usize = 8;
    let (_memory, bridge) = memory_bridge_with_capacity(DbType::YottaDb, CAPACITY);
    let bridge = Arc::new(bridge);
    let barrier = Arc::new(Barrier::new(CAPACITY + 1));

    let workers: Vec<_> = (0..=CAPACITY)
        .map(|_| {
            let bridge = bridge.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                call(&bridge, Command::Open, 0, &["yottadb", "/db"])
            })
        })
        .collect();

    let responses: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    let failures: Vec<_> = responses.iter().filter(|r| r.is_error()).collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].first_text(), "Connection table full");

    let mut handles: Vec<usize> = responses
        .iter()
        .filter(|r| !r.is_error())
        .map(|r| r.first_text().parse().unwrap())
        .collect();
    handles.sort_unstable();
    assert_eq!(handles, (0..CAPACITY).collect::<Vec<_>>());
    assert_eq!(bridge.registry().live(), CAPACITY);
}

#[test]
fn test_open_after_close_reuses_a_slot() {
    let (_memory, bridge) = memory_bridge_with_capacity(DbType::YottaDb, 2);
    let first = open_native(&bridge, "yottadb");
    let _second = open_native(&bridge, "yottadb");
    assert!(call(&bridge, Command::Open, 0, &["yottadb", "/db"]).is_error());

    let closed = call(&bridge, Command::Close, first, &[]);
    assert_eq!(closed.status, 0);
    assert_eq!(closed.first_text(), "0");

    let reopened = open_native(&bridge, "yottadb");
    assert_eq!(reopened, first);
}

#[test]
fn test_failed_open_does_not_leak_a_slot() {
    let (_memory, bridge) = memory_bridge_with_capacity(DbType::YottaDb, 1);
    let response = call(&bridge, Command::Open, 0, &["yottadb"]);
    assert_eq!(
        response.first_text(),
        "Unable to determine the path to the database installation"
    );
    let response = call(&bridge, Command::Open, 0, &["sybase", "/db"]);
    assert_eq!(response.first_text(), "Unable to determine the database type");
    assert_eq!(bridge.registry().live(), 0);
    open_native(&bridge, "yottadb");
}

// ============================================================================
// Handle Validity Tests
// ============================================================================

#[test]
fn test_requests_on_closed_handle() {
    let (_memory, bridge) = memory_bridge_with_capacity(DbType::YottaDb, 4);
    let handle = open_native(&bridge, "yottadb");
    call(&bridge, Command::Close, handle, &[]);

    let response = call(&bridge, Command::Get, handle, &["^g"]);
    assert_eq!(response.status, STATUS_NO_CONNECTION);
    assert!(response.is_error());
    assert_eq!(response.first_text(), "No Database Connection");

    let response = call(&bridge, Command::Close, handle, &[]);
    assert_eq!(response.status, STATUS_NO_CONNECTION);
}

#[test]
fn test_handle_out_of_range() {
    let (_memory, bridge) = memory_bridge_with_capacity(DbType::Iris, 4);
    let response = call(&bridge, Command::Defined, 1000, &["^g"]);
    assert_eq!(response.status, STATUS_NO_CONNECTION);
}

#[test]
fn test_init_closes_connections() {
    let (memory, bridge) = memory_bridge_with_capacity(DbType::Iris, 4);
    let handle = open_native(&bridge, "iris");
    bridge.init();
    assert!(memory.is_closed());
    let response = call(&bridge, Command::Get, handle, &["^g"]);
    assert_eq!(response.status, STATUS_NO_CONNECTION);
}
