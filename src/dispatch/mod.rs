//! Dispatch layer
//!
//! Every operation takes an encoded request and produces a status and an
//! encoded output. Status 1 means the handle named no open connection;
//! everything else reports 0 and carries failures as an error block.

pub mod ops;

use std::sync::Arc;
use std::time::Duration;

use dbx_protocol::{Buffer, Command, DEFAULT_OUTPUT_SIZE};
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::driver::version::describe;
use crate::driver::{Connector, NativeConnector};
use crate::error::DbxError;
use crate::registry::Registry;
use crate::request::{encode_error, Reply, Request, Response, OUTPUT_INCREMENT};

/// Status returned when the handle names no open connection
pub const STATUS_NO_CONNECTION: i32 = 1;

/// The process-wide bridge over the vendor libraries
static BRIDGE: Lazy<Bridge> = Lazy::new(|| Bridge::new(Arc::new(NativeConnector)));

/// Connection table plus the connector used for native opens
pub struct Bridge {
    registry: Registry,
    connector: Arc<dyn Connector>,
}

impl Bridge {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            registry: Registry::new(),
            connector,
        }
    }

    pub fn with_registry(connector: Arc<dyn Connector>, registry: Registry) -> Self {
        Self {
            registry,
            connector,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Close every connection and start from an empty table.
    pub fn init(&self) {
        self.registry.reset();
    }

    /// Version string for `handle`; a handle with no connection reports
    /// only the bridge's own version.
    pub fn version(&self, handle: usize) -> String {
        let conn = self.registry.lookup(handle).ok();
        describe(
            env!("CARGO_PKG_VERSION"),
            conn.as_ref().and_then(|c| c.version()),
        )
    }

    pub fn dispatch(&self, input: &[u8]) -> Response {
        let request = match Request::parse(input) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejecting request: {}", e);
                let mut out = Buffer::new(DEFAULT_OUTPUT_SIZE as usize, OUTPUT_INCREMENT);
                encode_error(&mut out, &e);
                return Response::new(0, out);
            }
        };

        debug!("{} on handle {}", request.command, request.handle());
        let mut out = request.output();
        let status = match request.command {
            Command::Open => self.open(&request, &mut out),
            Command::Close => self.close(&request, &mut out),
            _ => self.perform(&request, &mut out),
        };
        Response::new(status, out)
    }

    fn open(&self, request: &Request<'_>, out: &mut Buffer) -> i32 {
        let result = ConnectionConfig::from_arguments(&request.args)
            .and_then(|config| self.registry.open(&config, self.connector.as_ref()));
        match result {
            Ok(conn) => {
                if let Err(e) = Reply::text(conn.handle().to_string()).encode_or_error(out) {
                    warn!("Open reply failed: {}", e);
                }
            }
            Err(e) => {
                warn!("Open failed: {}", e);
                encode_error(out, &e);
            }
        }
        0
    }

    fn close(&self, request: &Request<'_>, out: &mut Buffer) -> i32 {
        match self.registry.close(request.handle()) {
            Ok(()) => {
                if let Err(e) = Reply::ok().encode_or_error(out) {
                    warn!("Close reply failed: {}", e);
                }
                0
            }
            Err(e) => {
                encode_error(out, &e);
                STATUS_NO_CONNECTION
            }
        }
    }

    fn perform(&self, request: &Request<'_>, out: &mut Buffer) -> i32 {
        let conn = match self.registry.lookup(request.handle()) {
            Ok(conn) => conn,
            Err(e) => {
                encode_error(out, &e);
                return STATUS_NO_CONNECTION;
            }
        };

        let result = {
            let mut session = conn.session();
            ops::perform(conn.db_type(), &mut session, request)
        };
        match result.and_then(|reply| reply.encode(out)) {
            Ok(()) => {
                conn.clear_error();
                0
            }
            Err(e) => {
                debug!("{} on handle {} failed: {}", request.command, conn.handle(), e);
                conn.record_error(&e);
                encode_error(out, &e);
                if matches!(e, DbxError::NoConnection) {
                    STATUS_NO_CONNECTION
                } else {
                    0
                }
            }
        }
    }
}

pub fn bridge() -> &'static Bridge {
    &BRIDGE
}

/// Reset the process-wide connection table.
pub fn init() -> i32 {
    BRIDGE.init();
    0
}

/// Dispatch an encoded request on the process-wide bridge.
pub fn dispatch(input: &[u8]) -> Response {
    BRIDGE.dispatch(input)
}

pub fn version(handle: usize) -> String {
    BRIDGE.version(handle)
}

pub fn sleep(ms: u64) -> i32 {
    std::thread::sleep(Duration::from_millis(ms));
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::{MemoryBackend, MemoryConnector};
    use crate::driver::DbType;
    use dbx_protocol::RequestBuilder;

    fn bridge(db_type: DbType) -> Bridge {
        let memory = Arc::new(MemoryBackend::new(db_type));
        Bridge::new(Arc::new(MemoryConnector::new(memory)))
    }

    fn open(bridge: &Bridge, db_type: &str) -> usize {
        let frame = RequestBuilder::new(Command::Open, 0).arg(db_type).arg("/db").build().unwrap();
        let response = bridge.dispatch(&frame);
        assert!(!response.is_error(), "{}", response.first_text());
        response.first_text().parse().unwrap()
    }

    #[test]
    fn test_unknown_handle_reports_status_one() {
        let bridge = bridge(DbType::YottaDb);
        let frame = RequestBuilder::new(Command::Get, 5).arg("^g").build().unwrap();
        let response = bridge.dispatch(&frame);
        assert_eq!(response.status, STATUS_NO_CONNECTION);
        assert_eq!(response.first_text(), "No Database Connection");
    }

    #[test]
    fn test_version_string() {
        let bridge = bridge(DbType::Iris);
        assert_eq!(
            bridge.version(0),
            format!("dbx-bridge:{}", env!("CARGO_PKG_VERSION"))
        );
        let handle = open(&bridge, "iris");
        assert!(bridge.version(handle).ends_with("; InterSystems IRIS:2019.2.b107"));
    }

    #[test]
    fn test_objects_rejected_on_yottadb() {
        let bridge = bridge(DbType::YottaDb);
        let handle = open(&bridge, "yottadb") as u32;
        let frame = RequestBuilder::new(Command::ClassMethod, handle)
            .arg("%SYSTEM.Version")
            .arg("GetVersion")
            .build()
            .unwrap();
        let response = bridge.dispatch(&frame);
        assert_eq!(response.status, 0);
        assert!(response.is_error());
        assert_eq!(
            response.first_text(),
            "Cache objects are not available with this platform"
        );
        let conn = bridge.registry().lookup(handle as usize).unwrap();
        assert_eq!(conn.last_error().map(|(code, _)| code), Some(2020));
    }

    #[test]
    fn test_malformed_request() {
        let bridge = bridge(DbType::YottaDb);
        let response = bridge.dispatch(&[1, 2, 3]);
        assert!(response.is_error());
    }

    #[test]
    fn test_sleep() {
        assert_eq!(sleep(1), 0);
    }
}
