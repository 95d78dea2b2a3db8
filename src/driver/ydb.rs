//! YottaDB simple-API driver.
//!
//! Every call takes the global name and an explicit array of subscript
//! descriptors pointing straight into the request's argument bytes.
//! Output descriptors are grown and the call repeated when the engine
//! reports the value did not fit.

use std::ffi::{c_char, c_int, c_uint, c_ulong, c_ulonglong, c_void, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dbx_protocol::Argument;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::library::{candidates, Library};
use super::status::{is_undefined, ydb};
use super::version::VersionInfo;
use super::{Backend, DbType, Direction, TpOutcome, TransactionModel, SessionClaim};
use crate::config::ConnectionConfig;
use crate::error::{DbxError, DbxResult};

/// Largest value the driver will grow an output buffer to
pub const MAX_VALUE_SIZE: usize = 1_048_576;

const INITIAL_VALUE_SIZE: usize = 32_767;
const SUBSCRIPT_SIZE: usize = 1_024;
const MAX_SUBSCRIPTS: usize = 31;
const DELETE_TREE: c_int = 1;
const TRANSACTION_ID: &[u8] = b"DBX\0";
const NANOS_PER_SECOND: u64 = 1_000_000_000;
/// `YDB_MAX_TIME_NSEC`; longer lock timeouts are rejected by the engine
const MAX_LOCK_NANOS: u64 = 2_147_483_647 * 1_000_000;

/// `ydb_buffer_t`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct YdbBuffer {
    len_alloc: c_uint,
    len_used: c_uint,
    buf_addr: *mut c_char,
}

impl YdbBuffer {
    /// Read-only descriptor over `bytes`; the engine never writes through it.
    fn input(bytes: &[u8]) -> Self {
        Self {
            len_alloc: bytes.len() as c_uint,
            len_used: bytes.len() as c_uint,
            buf_addr: bytes.as_ptr() as *mut c_char,
        }
    }

    fn output(storage: &mut [u8]) -> Self {
        Self {
            len_alloc: storage.len() as c_uint,
            len_used: 0,
            buf_addr: storage.as_mut_ptr() as *mut c_char,
        }
    }

    fn overflowed(&self) -> bool {
        self.len_used > self.len_alloc
    }
}

/// `ydb_string_t`, used by call-ins
#[repr(C)]
pub struct YdbString {
    length: c_ulong,
    address: *mut c_char,
}

impl YdbString {
    fn input(bytes: &[u8]) -> Self {
        Self {
            length: bytes.len() as c_ulong,
            address: bytes.as_ptr() as *mut c_char,
        }
    }
}

type FnVoid = unsafe extern "C" fn() -> c_int;
type FnData = unsafe extern "C" fn(*mut YdbBuffer, c_int, *mut YdbBuffer, *mut c_uint) -> c_int;
type FnDelete = unsafe extern "C" fn(*mut YdbBuffer, c_int, *mut YdbBuffer, c_int) -> c_int;
type FnValue = unsafe extern "C" fn(*mut YdbBuffer, c_int, *mut YdbBuffer, *mut YdbBuffer) -> c_int;
type FnNode =
    unsafe extern "C" fn(*mut YdbBuffer, c_int, *mut YdbBuffer, *mut c_int, *mut YdbBuffer) -> c_int;
type FnIncrement = unsafe extern "C" fn(
    *mut YdbBuffer,
    c_int,
    *mut YdbBuffer,
    *mut YdbBuffer,
    *mut YdbBuffer,
) -> c_int;
pub(crate) type FnCallIn = unsafe extern "C" fn(*const c_char, ...) -> c_int;
type FnLockIncr = unsafe extern "C" fn(c_ulonglong, *mut YdbBuffer, c_int, *mut YdbBuffer) -> c_int;
type FnLockDecr = unsafe extern "C" fn(*mut YdbBuffer, c_int, *mut YdbBuffer) -> c_int;
pub(crate) type FnZstatus = unsafe extern "C" fn(*mut c_char, c_int);
type TpCallback = extern "C" fn(*mut c_void) -> c_int;
type FnTp =
    unsafe extern "C" fn(TpCallback, *mut c_void, *const c_char, c_int, *mut YdbBuffer) -> c_int;

struct YdbApi {
    library: Library,
    init: FnVoid,
    exit: FnVoid,
    data: FnData,
    delete: FnDelete,
    set: FnValue,
    get: FnValue,
    subscript_next: FnValue,
    subscript_previous: FnValue,
    node_next: FnNode,
    node_previous: FnNode,
    incr: FnIncrement,
    ci: FnCallIn,
    lock_incr: FnLockIncr,
    lock_decr: FnLockDecr,
    zstatus: Option<FnZstatus>,
    tp: Option<FnTp>,
}

impl YdbApi {
    unsafe fn bind(library: Library) -> DbxResult<Self> {
        let lib = &library;
        Ok(Self {
            init: lib.require("init")?,
            exit: lib.require("exit")?,
            data: lib.require("data_s")?,
            delete: lib.require("delete_s")?,
            set: lib.require("set_s")?,
            get: lib.require("get_s")?,
            subscript_next: lib.require("subscript_next_s")?,
            subscript_previous: lib.require("subscript_previous_s")?,
            node_next: lib.require("node_next_s")?,
            node_previous: lib.require("node_previous_s")?,
            incr: lib.require("incr_s")?,
            ci: lib.require("ci")?,
            lock_incr: lib.require("lock_incr_s")?,
            lock_decr: lib.require("lock_decr_s")?,
            zstatus: lib.symbol("zstatus"),
            tp: lib.symbol("tp_s"),
            library,
        })
    }
}

static YDB_API: Lazy<Mutex<Option<Arc<YdbApi>>>> = Lazy::new(|| Mutex::new(None));
static YDB_SESSION: AtomicBool = AtomicBool::new(false);

fn load_api(dir: &Path) -> DbxResult<Arc<YdbApi>> {
    let mut slot = YDB_API.lock();
    if let Some(api) = slot.as_ref() {
        return Ok(api.clone());
    }
    let library = Library::open_first("YottaDB", "ydb_", &candidates(dir, &["libyottadb"]))?;
    let api = Arc::new(unsafe { YdbApi::bind(library)? });
    info!("Loaded YottaDB library {}", api.library.path().display());
    *slot = Some(api.clone());
    Ok(api)
}

/// Globals are always addressed with their `^`.
pub(crate) fn global_name(global: &str) -> String {
    if global.starts_with('^') {
        global.to_string()
    } else {
        format!("^{}", global)
    }
}

fn subscripts(subs: &[Argument<'_>]) -> Vec<YdbBuffer> {
    subs.iter().map(|s| YdbBuffer::input(s.bytes)).collect()
}

/// Call `f` with an output descriptor, growing it while the engine reports
/// that the value did not fit.
fn read_value(mut f: impl FnMut(&mut YdbBuffer) -> c_int) -> Result<Vec<u8>, c_int> {
    let mut size = INITIAL_VALUE_SIZE;
    loop {
        let mut storage = vec![0u8; size];
        let mut out = YdbBuffer::output(&mut storage);
        let rc = f(&mut out);
        if rc != ydb::OK && out.overflowed() && (out.len_used as usize) <= MAX_VALUE_SIZE {
            size = out.len_used as usize;
            continue;
        }
        if rc != ydb::OK {
            return Err(rc);
        }
        storage.truncate(out.len_used as usize);
        return Ok(storage);
    }
}

/// A YottaDB session
pub struct YdbBackend {
    api: Arc<YdbApi>,
    version: Option<VersionInfo>,
    call: Mutex<()>,
    _claim: SessionClaim,
}

impl YdbBackend {
    pub fn open(config: &ConnectionConfig) -> DbxResult<Self> {
        let dir = config.path.as_deref().ok_or(DbxError::UnknownPath)?;
        let claim = SessionClaim::acquire(&YDB_SESSION)?;
        let api = load_api(dir)?;

        let rc = unsafe { (api.init)() };
        if rc != ydb::OK {
            debug!("ydb_init returned {}", rc);
        }

        let mut backend = Self {
            api,
            version: None,
            call: Mutex::new(()),
            _claim: claim,
        };
        match backend.intrinsic("$zv") {
            Ok(text) => {
                let text = String::from_utf8_lossy(&text).into_owned();
                debug!("$ZVersion: {}", text);
                backend.version = VersionInfo::parse_ydb(&text, config.db_type.product());
            }
            Err(e) => warn!("Cannot read YottaDB version: {}", e),
        }
        Ok(backend)
    }

    /// Read an intrinsic special variable such as `$zstatus`.
    fn intrinsic(&self, name: &str) -> DbxResult<Vec<u8>> {
        let mut var = YdbBuffer::input(name.as_bytes());
        read_value(|out| unsafe { (self.api.get)(&mut var, 0, std::ptr::null_mut(), out) })
            .map_err(|rc| self.error(rc))
    }

    fn intrinsic_int(&self, name: &str) -> DbxResult<i32> {
        let text = self.intrinsic(name)?;
        Ok(dbx_protocol::leading_int(&text) as i32)
    }

    /// Build the error for `rc` from `$zstatus`.
    fn error(&self, rc: c_int) -> DbxError {
        let mut var = YdbBuffer::input(b"$zstatus");
        let message = read_value(|out| unsafe {
            (self.api.get)(&mut var, 0, std::ptr::null_mut(), out)
        })
        .map(|m| String::from_utf8_lossy(&m).into_owned())
        .unwrap_or_default();
        let message = match (message.is_empty(), self.api.zstatus) {
            (false, _) => message,
            (true, Some(zstatus)) => zstatus_text(zstatus),
            (true, None) => String::new(),
        };
        if message.is_empty() {
            return DbxError::backend(rc, format!("YottaDB error {}", rc));
        }
        DbxError::backend(rc, message)
    }

    fn check(&self, rc: c_int) -> DbxResult<()> {
        if rc == ydb::OK {
            Ok(())
        } else {
            Err(self.error(rc))
        }
    }

    fn is_node_end(&self, rc: c_int) -> bool {
        if rc == ydb::NODE_END {
            return true;
        }
        self.intrinsic("$zstatus")
            .map(|s| String::from_utf8_lossy(&s).contains("NODEEND"))
            .unwrap_or(false)
    }

    fn adjacent_subscript(
        &self,
        global: &str,
        subs: &[Argument<'_>],
        dir: Direction,
    ) -> DbxResult<Vec<u8>> {
        let name = global_name(global);
        let mut var = YdbBuffer::input(name.as_bytes());
        let mut keys = subscripts(subs);
        let call = match dir {
            Direction::Forward => self.api.subscript_next,
            Direction::Backward => self.api.subscript_previous,
        };
        let _guard = self.call.lock();
        match read_value(|out| unsafe { call(&mut var, keys.len() as c_int, keys.as_mut_ptr(), out) }) {
            Ok(value) => Ok(value),
            Err(rc) if self.is_node_end(rc) => Ok(Vec::new()),
            Err(rc) => Err(self.error(rc)),
        }
    }

    fn adjacent_node(
        &self,
        global: &str,
        subs: &[Argument<'_>],
        dir: Direction,
    ) -> DbxResult<Option<Vec<Vec<u8>>>> {
        let name = global_name(global);
        let mut var = YdbBuffer::input(name.as_bytes());
        let mut keys = subscripts(subs);
        let call = match dir {
            Direction::Forward => self.api.node_next,
            Direction::Backward => self.api.node_previous,
        };
        let _guard = self.call.lock();

        let mut size = SUBSCRIPT_SIZE;
        loop {
            let mut storage = vec![vec![0u8; size]; MAX_SUBSCRIPTS];
            let mut out: Vec<YdbBuffer> = storage.iter_mut().map(|s| YdbBuffer::output(s)).collect();
            let mut used = MAX_SUBSCRIPTS as c_int;
            let rc = unsafe {
                call(&mut var, keys.len() as c_int, keys.as_mut_ptr(), &mut used, out.as_mut_ptr())
            };
            if rc == ydb::OK {
                let used = (used.max(0) as usize).min(MAX_SUBSCRIPTS);
                let nodes = out[..used]
                    .iter()
                    .zip(storage.iter())
                    .map(|(b, s)| s[..(b.len_used as usize).min(s.len())].to_vec())
                    .collect();
                return Ok(Some(nodes));
            }
            if let Some(longest) = out.iter().filter(|b| b.overflowed()).map(|b| b.len_used).max() {
                if (longest as usize) <= MAX_VALUE_SIZE {
                    size = longest as usize;
                    continue;
                }
            }
            if self.is_node_end(rc) {
                return Ok(None);
            }
            return Err(self.error(rc));
        }
    }
}

/// Text of the last error as reported by the engine's `zstatus` entry point.
pub(crate) fn zstatus_text(zstatus: FnZstatus) -> String {
    let mut buffer = vec![0u8; 1024];
    unsafe {
        zstatus(buffer.as_mut_ptr() as *mut c_char, buffer.len() as c_int);
    }
    let end = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).into_owned()
}

/// Entered by the engine on the transaction thread, possibly more than
/// once when the transaction restarts.
extern "C" fn transaction_callback(param: *mut c_void) -> c_int {
    let body = unsafe { &mut *(param as *mut &mut dyn FnMut() -> TpOutcome) };
    match catch_unwind(AssertUnwindSafe(|| body())) {
        Ok(TpOutcome::Commit) => ydb::OK,
        Ok(TpOutcome::Rollback) => ydb::TP_ROLLBACK,
        Err(_) => ydb::TP_ROLLBACK,
    }
}

/// Pass up to three string arguments to a call-in routine.
///
/// # Safety
///
/// `ci` must be the engine's call-in entry point and `name` a NUL
/// terminated routine name.
pub(crate) unsafe fn call_in(
    ci: FnCallIn,
    name: &CString,
    out: &mut YdbString,
    args: &mut [YdbString],
) -> DbxResult<c_int> {
    let rc = match args {
        [] => ci(name.as_ptr(), out as *mut YdbString),
        [a] => ci(name.as_ptr(), out as *mut YdbString, a as *mut YdbString),
        [a, b] => ci(
            name.as_ptr(),
            out as *mut YdbString,
            a as *mut YdbString,
            b as *mut YdbString,
        ),
        [a, b, c] => ci(
            name.as_ptr(),
            out as *mut YdbString,
            a as *mut YdbString,
            b as *mut YdbString,
            c as *mut YdbString,
        ),
        _ => {
            return Err(DbxError::BadArgument(
                "Too many arguments for a call-in (maximum 3)".to_string(),
            ))
        }
    };
    Ok(rc)
}

/// Run a call-in with a value-sized output string.
pub(crate) fn call_in_value(
    ci: FnCallIn,
    label: &str,
    args: &[Argument<'_>],
) -> DbxResult<Result<Vec<u8>, c_int>> {
    let name = CString::new(label)
        .map_err(|_| DbxError::BadArgument(format!("Invalid function name: {}", label)))?;
    let mut strings: Vec<YdbString> = args.iter().map(|a| YdbString::input(a.bytes)).collect();
    let mut storage = vec![0u8; MAX_VALUE_SIZE];
    let mut out = YdbString {
        length: storage.len() as c_ulong,
        address: storage.as_mut_ptr() as *mut c_char,
    };
    let rc = unsafe { call_in(ci, &name, &mut out, &mut strings)? };
    if rc != ydb::OK {
        return Ok(Err(rc));
    }
    storage.truncate((out.length as usize).min(MAX_VALUE_SIZE));
    Ok(Ok(storage))
}

fn not_available() -> DbxError {
    DbxError::NotAvailable("Transactions are not available with this platform".to_string())
}

impl Backend for YdbBackend {
    fn db_type(&self) -> DbType {
        DbType::YottaDb
    }

    fn version(&self) -> Option<VersionInfo> {
        self.version.clone()
    }

    fn set(&self, global: &str, subs: &[Argument<'_>], value: &Argument<'_>) -> DbxResult<()> {
        let name = global_name(global);
        let mut var = YdbBuffer::input(name.as_bytes());
        let mut keys = subscripts(subs);
        let mut data = YdbBuffer::input(value.bytes);
        let _guard = self.call.lock();
        let rc = unsafe { (self.api.set)(&mut var, keys.len() as c_int, keys.as_mut_ptr(), &mut data) };
        self.check(rc)
    }

    fn get(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<Option<Vec<u8>>> {
        let name = global_name(global);
        let mut var = YdbBuffer::input(name.as_bytes());
        let mut keys = subscripts(subs);
        let _guard = self.call.lock();
        match read_value(|out| unsafe {
            (self.api.get)(&mut var, keys.len() as c_int, keys.as_mut_ptr(), out)
        }) {
            Ok(value) => Ok(Some(value)),
            Err(rc) if is_undefined(rc) => Ok(None),
            Err(rc) => Err(self.error(rc)),
        }
    }

    fn order(&self, global: &str, subs: &[Argument<'_>], dir: Direction) -> DbxResult<Vec<u8>> {
        self.adjacent_subscript(global, subs, dir)
    }

    fn query(
        &self,
        global: &str,
        subs: &[Argument<'_>],
        dir: Direction,
    ) -> DbxResult<Option<Vec<Vec<u8>>>> {
        self.adjacent_node(global, subs, dir)
    }

    fn delete(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<()> {
        let name = global_name(global);
        let mut var = YdbBuffer::input(name.as_bytes());
        let mut keys = subscripts(subs);
        let _guard = self.call.lock();
        let rc = unsafe {
            (self.api.delete)(&mut var, keys.len() as c_int, keys.as_mut_ptr(), DELETE_TREE)
        };
        self.check(rc)
    }

    fn defined(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<u32> {
        let name = global_name(global);
        let mut var = YdbBuffer::input(name.as_bytes());
        let mut keys = subscripts(subs);
        let mut n: c_uint = 0;
        let _guard = self.call.lock();
        let rc = unsafe { (self.api.data)(&mut var, keys.len() as c_int, keys.as_mut_ptr(), &mut n) };
        self.check(rc)?;
        Ok(n)
    }

    fn increment(&self, global: &str, subs: &[Argument<'_>], by: f64) -> DbxResult<Vec<u8>> {
        let name = global_name(global);
        let by = super::format_number(by);
        let mut var = YdbBuffer::input(name.as_bytes());
        let mut keys = subscripts(subs);
        let mut increment = YdbBuffer::input(&by);
        let _guard = self.call.lock();
        read_value(|out| unsafe {
            (self.api.incr)(&mut var, keys.len() as c_int, keys.as_mut_ptr(), &mut increment, out)
        })
        .map_err(|rc| self.error(rc))
    }

    fn lock(&self, global: &str, subs: &[Argument<'_>], timeout: i64) -> DbxResult<bool> {
        let name = global_name(global);
        let mut var = YdbBuffer::input(name.as_bytes());
        let mut keys = subscripts(subs);
        let nanos = lock_timeout_nanos(timeout);
        let _guard = self.call.lock();
        let rc = unsafe { (self.api.lock_incr)(nanos, &mut var, keys.len() as c_int, keys.as_mut_ptr()) };
        match rc {
            ydb::OK => Ok(true),
            ydb::LOCK_TIMEOUT => Ok(false),
            rc => Err(self.error(rc)),
        }
    }

    fn unlock(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<()> {
        let name = global_name(global);
        let mut var = YdbBuffer::input(name.as_bytes());
        let mut keys = subscripts(subs);
        let _guard = self.call.lock();
        let rc = unsafe { (self.api.lock_decr)(&mut var, keys.len() as c_int, keys.as_mut_ptr()) };
        self.check(rc)
    }

    fn function(&self, label: &str, _routine: &str, args: &[Argument<'_>]) -> DbxResult<Vec<u8>> {
        let _guard = self.call.lock();
        call_in_value(self.api.ci, label, args)?.map_err(|rc| self.error(rc))
    }

    fn transaction_model(&self) -> TransactionModel {
        TransactionModel::Threaded
    }

    fn tstart(&self) -> DbxResult<()> {
        Err(not_available())
    }

    fn tlevel(&self) -> DbxResult<i32> {
        self.intrinsic_int("$tlevel")
    }

    fn tcommit(&self) -> DbxResult<()> {
        Err(not_available())
    }

    fn trollback(&self) -> DbxResult<()> {
        Err(not_available())
    }

    fn run_transaction(&self, body: &mut dyn FnMut() -> TpOutcome) -> DbxResult<TpOutcome> {
        let tp = self.api.tp.ok_or_else(not_available)?;
        let mut body = body;
        let param = &mut body as *mut &mut dyn FnMut() -> TpOutcome as *mut c_void;
        let rc = unsafe {
            tp(
                transaction_callback,
                param,
                TRANSACTION_ID.as_ptr() as *const c_char,
                0,
                std::ptr::null_mut(),
            )
        };
        match rc {
            ydb::OK => Ok(TpOutcome::Commit),
            ydb::TP_ROLLBACK => Ok(TpOutcome::Rollback),
            rc => Err(self.error(rc)),
        }
    }

    fn restart_pending(&self) -> bool {
        self.intrinsic_int("$trestart").map(|n| n > 0).unwrap_or(false)
    }

    fn close(&self) -> DbxResult<()> {
        let _guard = self.call.lock();
        let rc = unsafe { (self.api.exit)() };
        info!("YottaDB session ended ({})", rc);
        Ok(())
    }
}

/// Lock timeout in seconds as `ydb_lock_incr_s` nanoseconds. A negative
/// timeout waits as long as the engine allows.
fn lock_timeout_nanos(timeout: i64) -> u64 {
    match u64::try_from(timeout) {
        Ok(seconds) => seconds.saturating_mul(NANOS_PER_SECOND).min(MAX_LOCK_NANOS),
        Err(_) => MAX_LOCK_NANOS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_nanos() {
        assert_eq!(lock_timeout_nanos(-1), MAX_LOCK_NANOS);
        assert_eq!(lock_timeout_nanos(0), 0);
        assert_eq!(lock_timeout_nanos(5), 5 * NANOS_PER_SECOND);
        assert_eq!(lock_timeout_nanos(i64::MAX), MAX_LOCK_NANOS);
    }

    #[test]
    fn test_global_name_keeps_caret() {
        assert_eq!(global_name("^Person"), "^Person");
        assert_eq!(global_name("Person"), "^Person");
    }

    #[test]
    fn test_read_value_grows_buffer() {
        let value = vec![b'z'; INITIAL_VALUE_SIZE + 100];
        let mut calls = 0;
        let result = read_value(|out| {
            calls += 1;
            if (out.len_alloc as usize) < value.len() {
                out.len_used = value.len() as c_uint;
                return -150_375_522;
            }
            unsafe {
                std::ptr::copy_nonoverlapping(value.as_ptr(), out.buf_addr as *mut u8, value.len());
            }
            out.len_used = value.len() as c_uint;
            ydb::OK
        })
        .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(result, value);
    }

    #[test]
    fn test_read_value_reports_failure() {
        let err = read_value(|_| ydb::ERR_GVUNDEF).unwrap_err();
        assert_eq!(err, ydb::ERR_GVUNDEF);
        assert!(is_undefined(err));
    }

    #[test]
    fn test_transaction_callback_maps_outcomes() {
        let mut commit = || TpOutcome::Commit;
        let mut body: &mut dyn FnMut() -> TpOutcome = &mut commit;
        let param = &mut body as *mut &mut dyn FnMut() -> TpOutcome as *mut c_void;
        assert_eq!(transaction_callback(param), ydb::OK);

        let mut rollback = || TpOutcome::Rollback;
        let mut body: &mut dyn FnMut() -> TpOutcome = &mut rollback;
        let param = &mut body as *mut &mut dyn FnMut() -> TpOutcome as *mut c_void;
        assert_eq!(transaction_callback(param), ydb::TP_ROLLBACK);
    }

    #[test]
    fn test_missing_library() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ConnectionConfig::new(DbType::YottaDb);
        config.path = Some(dir.path().to_path_buf());
        let err = YdbBackend::open(&config).err().unwrap();
        assert_eq!(err.error_code(), 1009);
        assert!(err.to_string().starts_with("Error loading YottaDB Library"));
    }
}
