//! GT.M call-in driver.
//!
//! Only extrinsic functions are reachable: the library exposes the call-in
//! interface and nothing of the simple API.

use std::ffi::c_int;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dbx_protocol::Argument;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::library::{candidates, Library};
use super::status::ydb;
use super::version::VersionInfo;
use super::ydb::{call_in_value, zstatus_text, FnCallIn, FnZstatus};
use super::{Backend, DbType, Direction, SessionClaim};
use crate::config::ConnectionConfig;
use crate::error::{DbxError, DbxResult};

type FnVoid = unsafe extern "C" fn() -> c_int;

struct GtmApi {
    library: Library,
    init: FnVoid,
    exit: FnVoid,
    ci: FnCallIn,
    zstatus: Option<FnZstatus>,
}

static GTM_API: Lazy<Mutex<Option<Arc<GtmApi>>>> = Lazy::new(|| Mutex::new(None));
static GTM_SESSION: AtomicBool = AtomicBool::new(false);

fn load_api(dir: &Path) -> DbxResult<Arc<GtmApi>> {
    let mut slot = GTM_API.lock();
    if let Some(api) = slot.as_ref() {
        return Ok(api.clone());
    }
    let library = Library::open_first("GT.M", "gtm_", &candidates(dir, &["libgtmshr"]))?;
    let api = unsafe {
        GtmApi {
            init: library.require("init")?,
            exit: library.require("exit")?,
            ci: library.require("ci")?,
            zstatus: library.symbol("zstatus"),
            library,
        }
    };
    let api = Arc::new(api);
    info!("Loaded GT.M library {}", api.library.path().display());
    *slot = Some(api.clone());
    Ok(api)
}

fn globals_not_available() -> DbxError {
    DbxError::NotAvailable("Global operations are not available with this platform".to_string())
}

fn transactions_not_available() -> DbxError {
    DbxError::NotAvailable("Transactions are not available with this platform".to_string())
}

/// A GT.M session
pub struct GtmBackend {
    api: Arc<GtmApi>,
    call: Mutex<()>,
    _claim: SessionClaim,
}

impl GtmBackend {
    pub fn open(config: &ConnectionConfig) -> DbxResult<Self> {
        let dir = config.path.as_deref().ok_or(DbxError::UnknownPath)?;
        let claim = SessionClaim::acquire(&GTM_SESSION)?;
        let api = load_api(dir)?;
        let rc = unsafe { (api.init)() };
        if rc != ydb::OK {
            return Err(error(&api, rc));
        }
        debug!("GT.M call-in interface initialised");
        Ok(Self {
            api,
            call: Mutex::new(()),
            _claim: claim,
        })
    }
}

fn error(api: &GtmApi, rc: c_int) -> DbxError {
    let message = api.zstatus.map(zstatus_text).unwrap_or_default();
    if message.is_empty() {
        DbxError::backend(rc, format!("GT.M error {}", rc))
    } else {
        DbxError::backend(rc, message)
    }
}

impl Backend for GtmBackend {
    fn db_type(&self) -> DbType {
        DbType::Gtm
    }

    fn version(&self) -> Option<VersionInfo> {
        None
    }

    fn set(&self, _global: &str, _subs: &[Argument<'_>], _value: &Argument<'_>) -> DbxResult<()> {
        Err(globals_not_available())
    }

    fn get(&self, _global: &str, _subs: &[Argument<'_>]) -> DbxResult<Option<Vec<u8>>> {
        Err(globals_not_available())
    }

    fn order(&self, _global: &str, _subs: &[Argument<'_>], _dir: Direction) -> DbxResult<Vec<u8>> {
        Err(globals_not_available())
    }

    fn query(
        &self,
        _global: &str,
        _subs: &[Argument<'_>],
        _dir: Direction,
    ) -> DbxResult<Option<Vec<Vec<u8>>>> {
        Err(globals_not_available())
    }

    fn delete(&self, _global: &str, _subs: &[Argument<'_>]) -> DbxResult<()> {
        Err(globals_not_available())
    }

    fn defined(&self, _global: &str, _subs: &[Argument<'_>]) -> DbxResult<u32> {
        Err(globals_not_available())
    }

    fn increment(&self, _global: &str, _subs: &[Argument<'_>], _by: f64) -> DbxResult<Vec<u8>> {
        Err(globals_not_available())
    }

    fn lock(&self, _global: &str, _subs: &[Argument<'_>], _timeout: i64) -> DbxResult<bool> {
        Err(globals_not_available())
    }

    fn unlock(&self, _global: &str, _subs: &[Argument<'_>]) -> DbxResult<()> {
        Err(globals_not_available())
    }

    fn function(&self, label: &str, _routine: &str, args: &[Argument<'_>]) -> DbxResult<Vec<u8>> {
        let _guard = self.call.lock();
        call_in_value(self.api.ci, label, args)?.map_err(|rc| error(&self.api, rc))
    }

    fn tstart(&self) -> DbxResult<()> {
        Err(transactions_not_available())
    }

    fn tlevel(&self) -> DbxResult<i32> {
        Err(transactions_not_available())
    }

    fn tcommit(&self) -> DbxResult<()> {
        Err(transactions_not_available())
    }

    fn trollback(&self) -> DbxResult<()> {
        Err(transactions_not_available())
    }

    fn close(&self) -> DbxResult<()> {
        let _guard = self.call.lock();
        let rc = unsafe { (self.api.exit)() };
        info!("GT.M session ended ({})", rc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ConnectionConfig::new(DbType::Gtm);
        config.path = Some(dir.path().to_path_buf());
        let err = GtmBackend::open(&config).err().unwrap();
        assert_eq!(err.error_code(), 1009);
        assert!(err.to_string().starts_with("Error loading GT.M Library"));
    }

    #[test]
    fn test_path_required() {
        let config = ConnectionConfig::new(DbType::Gtm);
        assert!(matches!(GtmBackend::open(&config), Err(DbxError::UnknownPath)));
    }
}
