use dbx_protocol::ProtocolError;
use thiserror::Error;

use crate::driver::status::{isc, ERROR_SIZE};

/// Error code reported for library load failures and duplicate native sessions
pub const LOAD_ERROR_CODE: i32 = 1009;

/// Error code reported when an operation has no meaning on the selected platform
pub const NOT_AVAILABLE_CODE: i32 = 2020;

#[derive(Error, Debug)]
pub enum DbxError {
    #[error("No Database Connection")]
    NoConnection,

    #[error("Connection table full")]
    TableFull,

    #[error("Unable to determine the database type")]
    UnknownDbType,

    #[error("Unable to determine the path to the database installation")]
    UnknownPath,

    #[error("Cannot create multiple connections to the database")]
    MultipleConnections,

    #[error("{0}")]
    LibraryLoad(String),

    #[error("{message}")]
    Authentication { code: i32, message: String },

    /// A status returned by the backend together with its translated message
    #[error("{message}")]
    Backend { code: i32, message: String },

    #[error("{0}")]
    NotAvailable(String),

    #[error("{message}")]
    Transport { status: i32, message: String },

    #[error("No active transaction")]
    NoTransaction,

    #[error("Transaction was rolled back")]
    TransactionRolledBack,

    #[error("Invalid argument: {0}")]
    BadArgument(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type DbxResult<T> = Result<T, DbxError>;

impl DbxError {
    pub fn backend(code: i32, message: impl Into<String>) -> Self {
        DbxError::Backend {
            code,
            message: message.into(),
        }
    }

    pub fn objects_not_available() -> Self {
        DbxError::NotAvailable("Cache objects are not available with this platform".to_string())
    }

    pub fn namespaces_not_available() -> Self {
        DbxError::NotAvailable(
            "Cache Namespace operations are not available with this platform".to_string(),
        )
    }

    /// Numeric code recorded on the connection alongside the message.
    ///
    /// Negative backend statuses are reported as `900 + |status|`.
    pub fn error_code(&self) -> i32 {
        match self {
            DbxError::Backend { code, .. } | DbxError::Authentication { code, .. } => {
                normalise_code(*code)
            }
            DbxError::Transport { status, .. } => normalise_code(*status),
            DbxError::LibraryLoad(_) | DbxError::MultipleConnections => LOAD_ERROR_CODE,
            DbxError::NotAvailable(_) => NOT_AVAILABLE_CODE,
            DbxError::NoConnection | DbxError::UnknownDbType | DbxError::UnknownPath => {
                normalise_code(isc::NOCON)
            }
            DbxError::NoTransaction | DbxError::TransactionRolledBack => {
                normalise_code(isc::FAILURE)
            }
            DbxError::BadArgument(_) => normalise_code(isc::BADARG),
            _ => normalise_code(isc::FAILURE),
        }
    }

    /// Message as written into an error block, capped at the error size limit.
    pub fn wire_message(&self) -> String {
        let mut message = self.to_string();
        if message.len() >= ERROR_SIZE {
            let mut end = ERROR_SIZE - 1;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        message
    }
}

fn normalise_code(code: i32) -> i32 {
    if code < 0 {
        900 + code.saturating_neg()
    } else {
        code
    }
}

impl serde::Serialize for DbxError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}
