//! Fixed-size table of open connections.
//!
//! Handles are slot indexes. The table lock only covers slot bookkeeping:
//! connecting and tearing down happen outside it, so a slow server never
//! blocks other callers from opening or closing their own connections.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::driver::Connector;
use crate::error::{DbxError, DbxResult};

/// Number of connections a process can hold open
pub const MAX_CONNECTIONS: usize = 32;

enum Slot {
    Free,
    /// Claimed by an `open` that is still connecting
    Reserved,
    Live(Arc<Connection>),
}

pub struct Registry {
    slots: Mutex<Vec<Slot>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_capacity(MAX_CONNECTIONS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::Free).collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of live connections.
    pub fn live(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| matches!(s, Slot::Live(_)))
            .count()
    }

    fn reserve(&self) -> DbxResult<usize> {
        let mut slots = self.slots.lock();
        let handle = slots
            .iter()
            .position(|s| matches!(s, Slot::Free))
            .ok_or(DbxError::TableFull)?;
        slots[handle] = Slot::Reserved;
        Ok(handle)
    }

    /// Claim a slot and connect it.
    pub fn open(
        &self,
        config: &ConnectionConfig,
        connector: &dyn Connector,
    ) -> DbxResult<Arc<Connection>> {
        let handle = self.reserve()?;
        debug!("Reserved handle {}", handle);

        match Connection::open(handle, config, connector) {
            Ok(conn) => {
                let conn = Arc::new(conn);
                self.slots.lock()[handle] = Slot::Live(conn.clone());
                Ok(conn)
            }
            Err(e) => {
                self.slots.lock()[handle] = Slot::Free;
                Err(e)
            }
        }
    }

    pub fn lookup(&self, handle: usize) -> DbxResult<Arc<Connection>> {
        match self.slots.lock().get(handle) {
            Some(Slot::Live(conn)) => Ok(conn.clone()),
            _ => Err(DbxError::NoConnection),
        }
    }

    /// Free the slot, then tear the connection down. A request already
    /// holding the connection finishes before the teardown starts.
    pub fn close(&self, handle: usize) -> DbxResult<()> {
        let conn = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(handle).ok_or(DbxError::NoConnection)?;
            if !matches!(slot, Slot::Live(_)) {
                return Err(DbxError::NoConnection);
            }
            match std::mem::replace(slot, Slot::Free) {
                Slot::Live(conn) => conn,
                _ => return Err(DbxError::NoConnection),
            }
        };
        conn.close();
        Ok(())
    }

    /// Close every live connection and empty the table.
    pub fn reset(&self) {
        let live: Vec<Arc<Connection>> = {
            let mut slots = self.slots.lock();
            slots
                .iter_mut()
                .filter_map(|slot| match std::mem::replace(slot, Slot::Free) {
                    Slot::Live(conn) => Some(conn),
                    Slot::Reserved => {
                        *slot = Slot::Reserved;
                        None
                    }
                    Slot::Free => None,
                })
                .collect()
        };
        if !live.is_empty() {
            info!("Closing {} connections", live.len());
        }
        for conn in live {
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::{MemoryBackend, MemoryConnector};
    use crate::driver::DbType;
    use std::path::PathBuf;

    fn setup() -> (Registry, MemoryConnector, ConnectionConfig) {
        let memory = Arc::new(MemoryBackend::new(DbType::YottaDb));
        let mut config = ConnectionConfig::new(DbType::YottaDb);
        config.path = Some(PathBuf::from("/db"));
        (Registry::with_capacity(2), MemoryConnector::new(memory), config)
    }

    #[test]
    fn test_table_full_and_reuse() {
        let (registry, connector, config) = setup();
        let a = registry.open(&config, &connector).unwrap();
        let b = registry.open(&config, &connector).unwrap();
        assert_eq!((a.handle(), b.handle()), (0, 1));
        assert!(matches!(
            registry.open(&config, &connector),
            Err(DbxError::TableFull)
        ));

        registry.close(0).unwrap();
        assert!(matches!(registry.lookup(0), Err(DbxError::NoConnection)));
        let c = registry.open(&config, &connector).unwrap();
        assert_eq!(c.handle(), 0);
        assert_eq!(registry.live(), 2);
    }

    #[test]
    fn test_failed_open_frees_slot() {
        let (registry, connector, _) = setup();
        let bad = ConnectionConfig::new(DbType::YottaDb);
        assert!(registry.open(&bad, &connector).is_err());
        assert_eq!(registry.live(), 0);
        assert!(matches!(registry.lookup(0), Err(DbxError::NoConnection)));
    }

    #[test]
    fn test_close_unknown_handle() {
        let (registry, _, _) = setup();
        assert!(matches!(registry.close(0), Err(DbxError::NoConnection)));
        assert!(matches!(registry.close(99), Err(DbxError::NoConnection)));
    }

    #[test]
    fn test_reset_closes_everything() {
        let (registry, connector, config) = setup();
        let conn = registry.open(&config, &connector).unwrap();
        registry.reset();
        assert_eq!(registry.live(), 0);
        assert!(conn.session().link.is_closed());
    }
}
