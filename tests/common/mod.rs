//! Common test utilities
//!
//! Provides shared helpers for:
//! - Building bridges over the in-memory backend
//! - Encoding requests and reading responses

#![allow(dead_code)]

use std::sync::Arc;

use dbx_bridge::driver::memory::{MemoryBackend, MemoryConnector};
use dbx_bridge::{Bridge, DbType, Registry, Response};
use dbx_protocol::{decode_blocks, Command, RequestBuilder};

pub fn memory_bridge(db_type: DbType) -> (Arc<MemoryBackend>, Bridge) {
    memory_bridge_with_capacity(db_type, dbx_bridge::MAX_CONNECTIONS)
}

pub fn memory_bridge_with_capacity(db_type: DbType, capacity: usize) -> (Arc<MemoryBackend>, Bridge) {
    let memory = Arc::new(MemoryBackend::new(db_type));
    let connector = Arc::new(MemoryConnector::new(memory.clone()));
    let bridge = Bridge::with_registry(connector, Registry::with_capacity(capacity));
    (memory, bridge)
}

pub fn call(bridge: &Bridge, command: Command, handle: u32, args: &[&str]) -> Response {
    let frame = args
        .iter()
        .fold(RequestBuilder::new(command, handle), |b, a| b.arg(a))
        .build()
        .unwrap();
    bridge.dispatch(&frame)
}

/// Open a native connection and return its handle.
pub fn open_native(bridge: &Bridge, db_type: &str) -> u32 {
    let response = call(bridge, Command::Open, 0, &[db_type, "/db", "", "0"]);
    assert!(!response.is_error(), "open failed: {}", response.first_text());
    response.first_text().parse().expect("handle")
}

pub fn texts(response: &Response) -> Vec<String> {
    decode_blocks(&response.output)
        .expect("decodable response")
        .iter()
        .map(|b| b.as_str().into_owned())
        .collect()
}
