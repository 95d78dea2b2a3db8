pub mod config;
pub mod connection;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod net;
pub mod registry;
pub mod request;
pub mod transaction;

pub use config::{ConnectionConfig, Transport};
pub use connection::Connection;
pub use dispatch::{dispatch, init, sleep, version, Bridge};
pub use driver::{Backend, Connector, DbType, NativeConnector};
pub use error::{DbxError, DbxResult};
pub use registry::{Registry, MAX_CONNECTIONS};
pub use request::{Reply, Request, Response};
