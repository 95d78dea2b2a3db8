//! A single open connection and the link it talks through.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, Transport};
use crate::driver::version::VersionInfo;
use crate::driver::{Backend, Connector, DbType};
use crate::error::{DbxError, DbxResult};
use crate::net::{GatewayClient, PrimaryClient};
use crate::transaction::Transactions;

/// Where requests for a connection go
pub enum Link {
    Native(Arc<dyn Backend>),
    Network(PrimaryClient),
    Gateway(GatewayClient),
    Closed,
}

impl Link {
    pub fn is_closed(&self) -> bool {
        matches!(self, Link::Closed)
    }
}

/// State guarded by the connection mutex. Holding the guard serialises
/// every call into the link.
pub struct Session {
    pub link: Link,
    pub transactions: Transactions,
}

pub struct Connection {
    handle: usize,
    db_type: DbType,
    transport: Transport,
    version: Option<VersionInfo>,
    session: Mutex<Session>,
    last_error: Mutex<Option<(i32, String)>>,
}

impl Connection {
    /// Connect according to `config`. Blocks for as long as the backend or
    /// the server takes to answer.
    pub fn open(
        handle: usize,
        config: &ConnectionConfig,
        connector: &dyn Connector,
    ) -> DbxResult<Self> {
        config.apply_environment();
        let transport = config.transport()?;
        debug!("Opening handle {} ({}, {:?})", handle, config.db_type, transport);

        let (link, version) = match transport {
            Transport::Native => {
                let backend = connector.connect(config)?;
                let version = backend.version();
                (Link::Native(backend), version)
            }
            Transport::Network => {
                let client = PrimaryClient::connect(config)?;
                let version = client.version();
                (Link::Network(client), version)
            }
            Transport::Gateway => (Link::Gateway(GatewayClient::connect(config)?), None),
        };

        info!("Handle {} connected to {}", handle, config.db_type);
        Ok(Self {
            handle,
            db_type: config.db_type,
            transport,
            version,
            session: Mutex::new(Session {
                link,
                transactions: Transactions::new(),
            }),
            last_error: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> usize {
        self.handle
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn version(&self) -> Option<&VersionInfo> {
        self.version.as_ref()
    }

    pub fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock()
    }

    pub fn record_error(&self, err: &DbxError) {
        *self.last_error.lock() = Some((err.error_code(), err.wire_message()));
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    /// Code and message of the last failed operation.
    pub fn last_error(&self) -> Option<(i32, String)> {
        self.last_error.lock().clone()
    }

    /// Roll back open transactions and tear the link down. Safe to call
    /// more than once.
    pub fn close(&self) {
        let mut session = self.session.lock();
        session.transactions.abandon();
        match std::mem::replace(&mut session.link, Link::Closed) {
            Link::Native(backend) => {
                if let Err(e) = backend.close() {
                    warn!("Handle {}: error closing {}: {}", self.handle, self.db_type, e);
                }
            }
            Link::Network(mut client) => client.close(self.handle as u32),
            Link::Gateway(mut client) => client.close(),
            Link::Closed => return,
        }
        info!("Handle {} closed", self.handle);
    }
}
