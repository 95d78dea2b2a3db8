//! Backend drivers.
//!
//! Every database the bridge can talk to in-process implements [`Backend`].
//! Operations take the already decoded global name, subscripts and values;
//! encoding the result into the output buffer is left to the dispatch layer.

pub mod gtm;
pub mod isc;
pub mod library;
pub mod memory;
pub mod status;
pub mod version;
pub mod ydb;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dbx_protocol::Argument;
use serde::{Deserialize, Serialize};

use crate::config::ConnectionConfig;
use crate::error::{DbxError, DbxResult};
use version::{Product, VersionInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    Cache,
    Iris,
    YottaDb,
    Gtm,
}

impl DbType {
    /// Cache and IRIS share one call-in interface.
    pub fn is_isc(self) -> bool {
        matches!(self, DbType::Cache | DbType::Iris)
    }

    /// YottaDB and GT.M have neither objects nor namespaces.
    pub fn is_m_only(self) -> bool {
        matches!(self, DbType::YottaDb | DbType::Gtm)
    }

    pub fn product(self) -> Product {
        match self {
            DbType::Cache => Product::Cache,
            DbType::Iris => Product::Iris,
            DbType::YottaDb => Product::YottaDb,
            DbType::Gtm => Product::Gtm,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DbType::Cache => "cache",
            DbType::Iris => "iris",
            DbType::YottaDb => "yottadb",
            DbType::Gtm => "gtm",
        }
    }
}

impl FromStr for DbType {
    type Err = DbxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cache" => Ok(DbType::Cache),
            "iris" => Ok(DbType::Iris),
            "yottadb" => Ok(DbType::YottaDb),
            "gtm" => Ok(DbType::Gtm),
            _ => Err(DbxError::UnknownDbType),
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn as_i32(self) -> i32 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

/// How a backend nests transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionModel {
    /// Explicit start/commit/rollback calls on the connection
    Native,
    /// A callback runs the whole transaction, so each level needs a thread
    Threaded,
}

/// Result of a transaction body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpOutcome {
    Commit,
    Rollback,
}

/// Value produced by an object operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectValue {
    Data(Vec<u8>),
    Oref(i64),
}

/// A database session reachable through native calls.
pub trait Backend: Send + Sync {
    fn db_type(&self) -> DbType;

    /// Server version read when the session was opened
    fn version(&self) -> Option<VersionInfo>;

    fn set(&self, global: &str, subs: &[Argument<'_>], value: &Argument<'_>) -> DbxResult<()>;

    /// `None` when the node is undefined.
    fn get(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<Option<Vec<u8>>>;

    /// Adjacent subscript at the level of the last subscript, empty at the end.
    fn order(&self, global: &str, subs: &[Argument<'_>], dir: Direction) -> DbxResult<Vec<u8>>;

    /// Subscripts of the adjacent node, `None` at the end of the global.
    fn query(
        &self,
        global: &str,
        subs: &[Argument<'_>],
        dir: Direction,
    ) -> DbxResult<Option<Vec<Vec<u8>>>>;

    fn delete(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<()>;

    /// 0, 1, 10 or 11
    fn defined(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<u32>;

    fn increment(&self, global: &str, subs: &[Argument<'_>], by: f64) -> DbxResult<Vec<u8>>;

    /// `false` when the timeout expired before the lock was granted.
    fn lock(&self, global: &str, subs: &[Argument<'_>], timeout: i64) -> DbxResult<bool>;

    fn unlock(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<()>;

    fn function(&self, label: &str, routine: &str, args: &[Argument<'_>]) -> DbxResult<Vec<u8>>;

    fn class_method(
        &self,
        _class: &str,
        _method: &str,
        _args: &[Argument<'_>],
    ) -> DbxResult<ObjectValue> {
        Err(DbxError::objects_not_available())
    }

    fn method(&self, _oref: i64, _method: &str, _args: &[Argument<'_>]) -> DbxResult<ObjectValue> {
        Err(DbxError::objects_not_available())
    }

    fn get_property(&self, _oref: i64, _property: &str) -> DbxResult<ObjectValue> {
        Err(DbxError::objects_not_available())
    }

    fn set_property(&self, _oref: i64, _property: &str, _value: &Argument<'_>) -> DbxResult<()> {
        Err(DbxError::objects_not_available())
    }

    fn close_instance(&self, _oref: i64) -> DbxResult<()> {
        Err(DbxError::objects_not_available())
    }

    fn get_namespace(&self) -> DbxResult<Vec<u8>> {
        Err(DbxError::namespaces_not_available())
    }

    fn set_namespace(&self, _namespace: &str) -> DbxResult<()> {
        Err(DbxError::namespaces_not_available())
    }

    fn transaction_model(&self) -> TransactionModel {
        TransactionModel::Native
    }

    fn tstart(&self) -> DbxResult<()>;

    fn tlevel(&self) -> DbxResult<i32>;

    fn tcommit(&self) -> DbxResult<()>;

    fn trollback(&self) -> DbxResult<()>;

    /// Run `body` as one transaction on the calling thread. The engine may
    /// call `body` again after a restart.
    fn run_transaction(&self, _body: &mut dyn FnMut() -> TpOutcome) -> DbxResult<TpOutcome> {
        Err(DbxError::NotAvailable(
            "Transactions are not available with this platform".to_string(),
        ))
    }

    /// True while the engine is re-running a transaction body after a restart.
    fn restart_pending(&self) -> bool {
        false
    }

    fn close(&self) -> DbxResult<()>;
}

/// Opens native sessions
pub trait Connector: Send + Sync {
    fn connect(&self, config: &ConnectionConfig) -> DbxResult<Arc<dyn Backend>>;
}

/// Connector backed by the vendor shared libraries
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeConnector;

impl Connector for NativeConnector {
    fn connect(&self, config: &ConnectionConfig) -> DbxResult<Arc<dyn Backend>> {
        let backend: Arc<dyn Backend> = match config.db_type {
            DbType::Cache | DbType::Iris => Arc::new(isc::IscBackend::open(config)?),
            DbType::YottaDb => Arc::new(ydb::YdbBackend::open(config)?),
            DbType::Gtm => Arc::new(gtm::GtmBackend::open(config)?),
        };
        Ok(backend)
    }
}

/// Marks the single native session a backend kind allows per process.
/// Released on drop.
pub(crate) struct SessionClaim(&'static AtomicBool);

impl SessionClaim {
    pub(crate) fn acquire(flag: &'static AtomicBool) -> DbxResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DbxError::MultipleConnections)?;
        Ok(Self(flag))
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Format a number the way M prints it: no trailing `.0`, no leading zero
/// before the decimal point.
pub fn format_number(value: f64) -> Vec<u8> {
    let text = format!("{}", value);
    let text = if let Some(rest) = text.strip_prefix("0.") {
        format!(".{}", rest)
    } else if let Some(rest) = text.strip_prefix("-0.") {
        format!("-.{}", rest)
    } else {
        text
    };
    text.into_bytes()
}

/// Split `label^routine`.
pub fn split_function_name(name: &str) -> Option<(&str, &str)> {
    let (label, routine) = name.split_once('^')?;
    Some((label, routine))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_type_parsing() {
        assert_eq!("YottaDB".parse::<DbType>().unwrap(), DbType::YottaDb);
        assert_eq!("IRIS".parse::<DbType>().unwrap(), DbType::Iris);
        assert_eq!("cache".parse::<DbType>().unwrap(), DbType::Cache);
        assert!(matches!(
            "postgres".parse::<DbType>(),
            Err(DbxError::UnknownDbType)
        ));
        assert!(DbType::Iris.is_isc());
        assert!(DbType::Gtm.is_m_only());
    }

    #[test]
    fn test_session_claim_is_exclusive() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        let claim = SessionClaim::acquire(&FLAG).unwrap();
        assert!(matches!(
            SessionClaim::acquire(&FLAG),
            Err(DbxError::MultipleConnections)
        ));
        drop(claim);
        assert!(SessionClaim::acquire(&FLAG).is_ok());
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), b"3".to_vec());
        assert_eq!(format_number(0.25), b".25".to_vec());
        assert_eq!(format_number(-0.5), b"-.5".to_vec());
        assert_eq!(format_number(-12.75), b"-12.75".to_vec());
    }

    #[test]
    fn test_split_function_name() {
        assert_eq!(split_function_name("add^math"), Some(("add", "math")));
        assert_eq!(split_function_name("^math"), Some(("", "math")));
        assert_eq!(split_function_name("nocaret"), None);
    }
}
