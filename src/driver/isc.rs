//! InterSystems Cache/IRIS call-in driver.
//!
//! Arguments travel over the engine's implicit argument stack: a global
//! reference is pushed name first, then each subscript, then the call is
//! made and its result popped. The whole push/call/pop sequence runs under
//! the session's call lock.

use std::ffi::{c_char, c_double, c_int, c_uint, c_ulong, CString};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dbx_protocol::{Argument, DataType};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::library::{candidates, Library};
use super::status::{authentication_message, isc, isc_error_text};
use super::version::VersionInfo;
use super::{Backend, DbType, Direction, ObjectValue, SessionClaim};
use crate::config::ConnectionConfig;
use crate::error::{DbxError, DbxResult};

/// Longest string that fits an ordinary push; longer ones use extended strings
pub const MAX_STRLEN: usize = 32767;

const TTALL: c_ulong = 1;
const TTNEVER: c_ulong = 8;
const PROGMODE: c_ulong = 32;
const CACHE_ASTRING: c_ulong = 3;
const CACHE_OREF: c_int = 16;
const LOCK_INCREMENTAL: c_int = 1;
const AUTH_TIMEOUT: c_int = 15;
const EXE_NAME: &[u8] = b"mg_dba";
const NULL_DEVICE: &str = "/dev/null/";
const ERRXLATE_LEN: u16 = 50;

/// Counted string with inline storage
#[repr(C)]
pub struct AStr {
    len: u16,
    str: [u8; MAX_STRLEN],
}

impl AStr {
    fn boxed(bytes: &[u8]) -> Box<Self> {
        let mut s = Box::new(AStr {
            len: 0,
            str: [0; MAX_STRLEN],
        });
        let n = bytes.len().min(MAX_STRLEN - 1);
        s.str[..n].copy_from_slice(&bytes[..n]);
        s.len = n as u16;
        s
    }

    fn as_bytes(&self) -> &[u8] {
        &self.str[..(self.len as usize).min(MAX_STRLEN)]
    }
}

/// Engine-allocated string of any length
#[repr(C)]
pub struct ExStr {
    len: c_uint,
    ch: *mut u8,
}

impl ExStr {
    fn empty() -> Self {
        Self {
            len: 0,
            ch: std::ptr::null_mut(),
        }
    }
}

type FnSetDir = unsafe extern "C" fn(*mut c_char) -> c_int;
type FnSecureStart =
    unsafe extern "C" fn(*mut AStr, *mut AStr, *mut AStr, c_ulong, c_int, *mut AStr, *mut AStr) -> c_int;
type FnVoid = unsafe extern "C" fn() -> c_int;
type FnExStrNew = unsafe extern "C" fn(*mut ExStr, c_int) -> *mut u8;
type FnExStr = unsafe extern "C" fn(*mut ExStr) -> c_int;
type FnPushStr = unsafe extern "C" fn(c_int, *const c_char) -> c_int;
type FnPopStr = unsafe extern "C" fn(*mut c_int, *mut *mut c_char) -> c_int;
type FnPushDbl = unsafe extern "C" fn(c_double) -> c_int;
type FnPopDbl = unsafe extern "C" fn(*mut c_double) -> c_int;
type FnPushInt = unsafe extern "C" fn(c_int) -> c_int;
type FnPopInt = unsafe extern "C" fn(*mut c_int) -> c_int;
type FnPushInt64 = unsafe extern "C" fn(i64) -> c_int;
type FnPushName = unsafe extern "C" fn(c_int, *const c_char) -> c_int;
type FnNarg = unsafe extern "C" fn(c_int) -> c_int;
type FnNargFlag = unsafe extern "C" fn(c_int, c_int) -> c_int;
type FnOrder = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type FnAcquireLock = unsafe extern "C" fn(c_int, c_int, c_int, *mut c_int) -> c_int;
type FnPushFunc =
    unsafe extern "C" fn(*mut c_uint, c_int, *const c_char, c_int, *const c_char) -> c_int;
type FnExtFun = unsafe extern "C" fn(c_uint, c_int) -> c_int;
type FnPushClassMethod =
    unsafe extern "C" fn(c_int, *const c_char, c_int, *const c_char, c_int) -> c_int;
type FnPushMethod = unsafe extern "C" fn(c_uint, c_int, *const c_char, c_int) -> c_int;
type FnPushProperty = unsafe extern "C" fn(c_uint, c_int, *const c_char) -> c_int;
type FnOref = unsafe extern "C" fn(c_uint) -> c_int;
type FnPopOref = unsafe extern "C" fn(*mut c_uint) -> c_int;
type FnAStr = unsafe extern "C" fn(*mut AStr) -> c_int;
type FnConvert = unsafe extern "C" fn(c_ulong, *mut AStr) -> c_int;
type FnErrxlate = unsafe extern "C" fn(c_int, *mut AStr) -> c_int;

/// Function table of a loaded Cache/IRIS library
struct IscApi {
    library: Library,
    set_dir: FnSetDir,
    secure_start: FnSecureStart,
    end: FnVoid,
    ex_str_new: FnExStrNew,
    push_ex_str: FnExStr,
    pop_ex_str: FnExStr,
    ex_str_kill: FnExStr,
    push_str: FnPushStr,
    #[allow(dead_code)]
    pop_str: FnPopStr,
    push_dbl: FnPushDbl,
    #[allow(dead_code)]
    pop_dbl: FnPopDbl,
    push_int: FnPushInt,
    pop_int: FnPopInt,
    push_int64: Option<FnPushInt64>,
    push_global: FnPushName,
    global_get: FnNargFlag,
    global_set: FnNarg,
    global_data: FnNargFlag,
    global_kill: FnNargFlag,
    global_order: FnOrder,
    global_query: FnOrder,
    global_increment: FnNarg,
    acquire_lock: FnAcquireLock,
    release_lock: FnNargFlag,
    push_lock: FnPushName,
    push_func: Option<FnPushFunc>,
    ext_fun: Option<FnExtFun>,
    push_class_method: Option<FnPushClassMethod>,
    invoke_class_method: Option<FnNarg>,
    push_method: Option<FnPushMethod>,
    invoke_method: Option<FnNarg>,
    push_property: Option<FnPushProperty>,
    get_property: Option<FnVoid>,
    set_property: Option<FnVoid>,
    close_oref: Option<FnOref>,
    pop_oref: Option<FnPopOref>,
    type_of: Option<FnVoid>,
    eval: Option<FnAStr>,
    execute: Option<FnAStr>,
    convert: Option<FnConvert>,
    errxlate: Option<FnErrxlate>,
    enable_multi_thread: Option<FnVoid>,
    tstart: Option<FnVoid>,
    tlevel: Option<FnVoid>,
    tcommit: Option<FnVoid>,
    trollback: Option<FnNarg>,
}

impl IscApi {
    /// Bind every symbol; a missing mandatory one fails the load.
    unsafe fn bind(library: Library) -> DbxResult<Self> {
        let lib = &library;
        Ok(Self {
            set_dir: lib.require("SetDir")?,
            secure_start: lib.require("SecureStartA")?,
            end: lib.require("End")?,
            ex_str_new: lib.require("ExStrNew")?,
            push_ex_str: lib.require("PushExStr")?,
            pop_ex_str: lib.require("PopExStr")?,
            ex_str_kill: lib.require("ExStrKill")?,
            push_str: lib.require("PushStr")?,
            pop_str: lib.require("PopStr")?,
            push_dbl: lib.require("PushDbl")?,
            pop_dbl: lib.require("PopDbl")?,
            push_int: lib.require("PushInt")?,
            pop_int: lib.require("PopInt")?,
            push_int64: lib.symbol("PushInt64"),
            push_global: lib.require("PushGlobal")?,
            global_get: lib.require("GlobalGet")?,
            global_set: lib.require("GlobalSet")?,
            global_data: lib.require("GlobalData")?,
            global_kill: lib.require("GlobalKill")?,
            global_order: lib.require("GlobalOrder")?,
            global_query: lib.require("GlobalQuery")?,
            global_increment: lib.require("GlobalIncrement")?,
            acquire_lock: lib.require("AcquireLock")?,
            release_lock: lib.require("ReleaseLock")?,
            push_lock: lib.require("PushLock")?,
            push_func: lib.symbol("PushFunc"),
            ext_fun: lib.symbol("ExtFun"),
            push_class_method: lib.symbol("PushClassMethod"),
            invoke_class_method: lib.symbol("InvokeClassMethod"),
            push_method: lib.symbol("PushMethod"),
            invoke_method: lib.symbol("InvokeMethod"),
            push_property: lib.symbol("PushProperty"),
            get_property: lib.symbol("GetProperty"),
            set_property: lib.symbol("SetProperty"),
            close_oref: lib.symbol("CloseOref"),
            pop_oref: lib.symbol("PopOref"),
            type_of: lib.symbol("Type"),
            eval: lib.symbol("EvalA"),
            execute: lib.symbol("ExecuteA"),
            convert: lib.symbol("Convert"),
            errxlate: lib.symbol("ErrxlateA"),
            enable_multi_thread: lib.symbol("EnableMultiThread"),
            tstart: lib.symbol("TStart"),
            tlevel: lib.symbol("TLevel"),
            tcommit: lib.symbol("TCommit"),
            trollback: lib.symbol("TRollback"),
            library,
        })
    }

    /// The engine's own text for `code`, when it can translate it.
    fn translate(&self, code: c_int) -> Option<String> {
        let errxlate = self.errxlate?;
        let mut text = AStr::boxed(b"");
        text.len = ERRXLATE_LEN;
        unsafe {
            errxlate(code, &mut *text);
        }
        let len = (text.len).min(ERRXLATE_LEN) as usize;
        if len == 0 {
            return None;
        }
        Some(String::from_utf8_lossy(&text.str[..len]).into_owned())
    }

    fn error(&self, code: c_int) -> DbxError {
        DbxError::backend(code, isc_error_text(code, self.translate(code).as_deref()))
    }

    fn check(&self, rc: c_int) -> DbxResult<()> {
        if rc == isc::SUCCESS {
            Ok(())
        } else {
            Err(self.error(rc))
        }
    }

    fn unavailable(&self) -> DbxError {
        DbxError::backend(isc::ERUNIMPLEMENTED, isc_error_text(isc::ERUNIMPLEMENTED, None))
    }
}

static ISC_API: Lazy<Mutex<Option<Arc<IscApi>>>> = Lazy::new(|| Mutex::new(None));
static ISC_SESSION: AtomicBool = AtomicBool::new(false);

/// Directory holding the shared library: the install directory's parent plus `bin`.
fn library_dir(install: &Path) -> PathBuf {
    install
        .parent()
        .map(|p| p.join("bin"))
        .unwrap_or_else(|| install.join("bin"))
}

fn load_api(config: &ConnectionConfig, install: &Path) -> DbxResult<Arc<IscApi>> {
    let mut slot = ISC_API.lock();
    if let Some(api) = slot.as_ref() {
        return Ok(api.clone());
    }

    let stems: [&str; 2] = if config.db_type == DbType::Iris {
        ["libirisdb", "libcache"]
    } else {
        ["libcache", "libirisdb"]
    };
    let list = candidates(&library_dir(install), &stems);
    let mut library = Library::open_first("Cache", "Cache", &list)?;

    let file_name = library
        .path()
        .file_name()
        .map(|f| f.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if file_name.contains("iris") {
        library.set_product("IRIS", "Iris");
    }

    let api = Arc::new(unsafe { IscApi::bind(library)? });
    info!("Loaded {} call-in library {}", api.library.db_name(), api.library.path().display());
    *slot = Some(api.clone());
    Ok(api)
}

/// Keeps extended strings alive until the call that uses them has returned
struct ExStrPool<'a> {
    api: &'a IscApi,
    items: Vec<Box<ExStr>>,
}

impl<'a> ExStrPool<'a> {
    fn new(api: &'a IscApi) -> Self {
        Self {
            api,
            items: Vec::new(),
        }
    }
}

impl Drop for ExStrPool<'_> {
    fn drop(&mut self) {
        for item in &mut self.items {
            unsafe {
                (self.api.ex_str_kill)(&mut **item);
            }
        }
    }
}

/// A Cache/IRIS session
pub struct IscBackend {
    api: Arc<IscApi>,
    db_type: DbType,
    version: Option<VersionInfo>,
    call: Mutex<()>,
    _claim: SessionClaim,
}

impl IscBackend {
    pub fn open(config: &ConnectionConfig) -> DbxResult<Self> {
        let install = config.path.as_deref().ok_or(DbxError::UnknownPath)?;
        let claim = SessionClaim::acquire(&ISC_SESSION)?;
        let api = load_api(config, install)?;

        let dir = CString::new(install.to_string_lossy().as_bytes())
            .map_err(|e| DbxError::Config(format!("Invalid install directory: {}", e)))?;
        unsafe {
            (api.set_dir)(dir.as_ptr() as *mut c_char);
        }

        let version = authenticate(&api, config)?;
        Ok(Self {
            api,
            db_type: config.db_type,
            version,
            call: Mutex::new(()),
            _claim: claim,
        })
    }

    unsafe fn push_value(&self, arg: &Argument<'_>, pool: &mut ExStrPool<'_>) -> c_int {
        let api = &*self.api;
        match arg.data_type {
            DataType::Int => (api.push_int)(arg.to_int() as c_int),
            DataType::Int64 => match api.push_int64 {
                Some(push) => push(arg.to_int()),
                None => (api.push_int)(arg.to_int() as c_int),
            },
            DataType::Double => (api.push_dbl)(arg.to_double()),
            _ => self.push_bytes(arg.bytes, pool),
        }
    }

    unsafe fn push_bytes(&self, bytes: &[u8], pool: &mut ExStrPool<'_>) -> c_int {
        let api = &*self.api;
        if bytes.len() < MAX_STRLEN {
            return (api.push_str)(bytes.len() as c_int, bytes.as_ptr() as *const c_char);
        }
        let mut ex = Box::new(ExStr::empty());
        let buf = (api.ex_str_new)(&mut *ex, (bytes.len() + 1) as c_int);
        if buf.is_null() {
            return isc::STRTOOLONG;
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len());
        *buf.add(bytes.len()) = 0;
        ex.len = bytes.len() as c_uint;
        let rc = (api.push_ex_str)(&mut *ex);
        pool.items.push(ex);
        rc
    }

    /// Push `^global(subs...)`; the leading `^` is not part of the pushed name.
    unsafe fn push_reference(
        &self,
        global: &str,
        subs: &[Argument<'_>],
        pool: &mut ExStrPool<'_>,
    ) -> DbxResult<()> {
        let name = global.strip_prefix('^').unwrap_or(global);
        let rc = (self.api.push_global)(name.len() as c_int, name.as_ptr() as *const c_char);
        self.api.check(rc)?;
        self.push_all(subs, pool)
    }

    unsafe fn push_all(&self, args: &[Argument<'_>], pool: &mut ExStrPool<'_>) -> DbxResult<()> {
        for arg in args {
            self.api.check(self.push_value(arg, pool))?;
        }
        Ok(())
    }

    unsafe fn pop_bytes(&self) -> DbxResult<Vec<u8>> {
        let api = &*self.api;
        let mut ex = ExStr::empty();
        api.check((api.pop_ex_str)(&mut ex))?;
        let bytes = if ex.ch.is_null() {
            Vec::new()
        } else {
            std::slice::from_raw_parts(ex.ch, ex.len as usize).to_vec()
        };
        (api.ex_str_kill)(&mut ex);
        Ok(bytes)
    }

    /// Pop whatever the last call left on the stack.
    unsafe fn pop_value(&self) -> DbxResult<ObjectValue> {
        let api = &*self.api;
        if let (Some(type_of), Some(pop_oref)) = (api.type_of, api.pop_oref) {
            if type_of() == CACHE_OREF {
                let mut oref: c_uint = 0;
                api.check(pop_oref(&mut oref))?;
                return Ok(ObjectValue::Oref(i64::from(oref)));
            }
        }
        Ok(ObjectValue::Data(self.pop_bytes()?))
    }

    fn with_reference<T>(
        &self,
        global: &str,
        subs: &[Argument<'_>],
        call: impl FnOnce(c_int) -> DbxResult<T>,
    ) -> DbxResult<T> {
        let _guard = self.call.lock();
        let mut pool = ExStrPool::new(&self.api);
        unsafe { self.push_reference(global, subs, &mut pool)? };
        call(subs.len() as c_int)
    }

    fn object_value_bytes(value: ObjectValue) -> Vec<u8> {
        match value {
            ObjectValue::Data(bytes) => bytes,
            ObjectValue::Oref(oref) => oref.to_string().into_bytes(),
        }
    }
}

fn device(name: &str, console: &str) -> Option<Box<AStr>> {
    if name.is_empty() {
        return None;
    }
    if name.eq_ignore_ascii_case(console) {
        return Some(AStr::boxed(b""));
    }
    if name == NULL_DEVICE {
        return None;
    }
    Some(AStr::boxed(name.as_bytes()))
}

/// Start the session, read `$ZVersion` and switch namespace.
///
/// A connection the server breaks while the version is being read is
/// reopened once.
fn authenticate(api: &IscApi, config: &ConnectionConfig) -> DbxResult<Option<VersionInfo>> {
    let mut version = None;

    for attempt in 0..2 {
        let mut input = device(&config.input_device, "stdin");
        let mut output = device(&config.output_device, "stdout");
        let flags = if input.is_some() && output.is_some() {
            TTALL | PROGMODE
        } else {
            TTNEVER | PROGMODE
        };
        let mut username = AStr::boxed(config.username.as_bytes());
        let mut password = AStr::boxed(config.password.as_bytes());
        let mut exe = AStr::boxed(EXE_NAME);

        let rc = unsafe {
            (api.secure_start)(
                &mut *username,
                &mut *password,
                &mut *exe,
                flags,
                AUTH_TIMEOUT,
                input.as_deref_mut().map_or(std::ptr::null_mut(), |p| p as *mut AStr),
                output.as_deref_mut().map_or(std::ptr::null_mut(), |p| p as *mut AStr),
            )
        };
        if let Some(message) = authentication_message(rc) {
            return Err(DbxError::Authentication { code: rc, message });
        }

        match read_version(api) {
            Ok(v) => {
                version = v;
                break;
            }
            Err(rc) if rc == isc::CONBROKEN && attempt == 0 => {
                warn!("Connection broken while reading $ZVersion, reopening");
                continue;
            }
            Err(rc) => {
                debug!("Cannot read $ZVersion: {}", rc);
                break;
            }
        }
    }

    if !config.namespace.is_empty() {
        change_namespace(api, &config.namespace)?;
    }

    if let Some(enable) = api.enable_multi_thread {
        unsafe {
            enable();
        }
    }

    Ok(version)
}

fn read_version(api: &IscApi) -> Result<Option<VersionInfo>, c_int> {
    let (Some(eval), Some(convert)) = (api.eval, api.convert) else {
        return Ok(None);
    };
    let mut expr = AStr::boxed(b"$ZVersion");
    let mut result = AStr::boxed(b"");
    result.len = 256;
    unsafe {
        let rc = eval(&mut *expr);
        if rc != isc::SUCCESS {
            return Err(rc);
        }
        let rc = convert(CACHE_ASTRING, &mut *result);
        if rc != isc::SUCCESS {
            return Err(rc);
        }
    }
    let text = String::from_utf8_lossy(result.as_bytes()).into_owned();
    debug!("$ZVersion: {}", text);
    Ok(VersionInfo::parse_isc(&text))
}

fn change_namespace(api: &IscApi, namespace: &str) -> DbxResult<()> {
    if namespace.is_empty() || namespace.len() > 64 {
        return Err(api.error(isc::ERNAMSP));
    }
    let execute = api.execute.ok_or_else(|| api.error(isc::ERNAMSP))?;
    let mut command = AStr::boxed(format!("ZN \"{}\"", namespace).as_bytes());
    api.check(unsafe { execute(&mut *command) })
}

/// Decode a `$LIST` of subscripts as returned by a global query.
pub fn decode_list(mut bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut items = Vec::new();
    while !bytes.is_empty() {
        let (header, len) = match bytes[0] {
            0 if bytes.len() >= 3 => {
                let len = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
                if len == 0 && bytes.len() >= 7 {
                    (7, u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]) as usize)
                } else {
                    (3, len)
                }
            }
            n => (1, n as usize),
        };
        if len <= header || len > bytes.len() {
            break;
        }
        let kind = bytes[header];
        let data = &bytes[header + 1..len];
        items.push(match kind {
            4 => {
                let mut raw = [0u8; 8];
                raw[..data.len().min(8)].copy_from_slice(&data[..data.len().min(8)]);
                u64::from_le_bytes(raw).to_string().into_bytes()
            }
            5 => {
                let mut raw = [0xffu8; 8];
                raw[..data.len().min(8)].copy_from_slice(&data[..data.len().min(8)]);
                i64::from_le_bytes(raw).to_string().into_bytes()
            }
            2 => {
                let units: Vec<u16> = data
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                String::from_utf16_lossy(&units).into_bytes()
            }
            _ => data.to_vec(),
        });
        bytes = &bytes[len..];
    }
    items
}

impl Backend for IscBackend {
    fn db_type(&self) -> DbType {
        self.db_type
    }

    fn version(&self) -> Option<VersionInfo> {
        self.version.clone()
    }

    fn set(&self, global: &str, subs: &[Argument<'_>], value: &Argument<'_>) -> DbxResult<()> {
        let _guard = self.call.lock();
        let mut pool = ExStrPool::new(&self.api);
        unsafe {
            self.push_reference(global, subs, &mut pool)?;
            self.api.check(self.push_value(value, &mut pool))?;
            self.api.check((self.api.global_set)(subs.len() as c_int))
        }
    }

    fn get(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<Option<Vec<u8>>> {
        self.with_reference(global, subs, |narg| unsafe {
            match (self.api.global_get)(narg, 0) {
                isc::SUCCESS => self.pop_bytes().map(Some),
                isc::ERUNDEF => Ok(None),
                rc => Err(self.api.error(rc)),
            }
        })
    }

    fn order(&self, global: &str, subs: &[Argument<'_>], dir: Direction) -> DbxResult<Vec<u8>> {
        self.with_reference(global, subs, |narg| unsafe {
            self.api.check((self.api.global_order)(narg, dir.as_i32(), 0))?;
            self.pop_bytes()
        })
    }

    fn query(
        &self,
        global: &str,
        subs: &[Argument<'_>],
        dir: Direction,
    ) -> DbxResult<Option<Vec<Vec<u8>>>> {
        self.with_reference(global, subs, |narg| unsafe {
            self.api.check((self.api.global_query)(narg, dir.as_i32(), 0))?;
            let list = self.pop_bytes()?;
            if list.is_empty() {
                Ok(None)
            } else {
                Ok(Some(decode_list(&list)))
            }
        })
    }

    fn delete(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<()> {
        self.with_reference(global, subs, |narg| unsafe {
            self.api.check((self.api.global_kill)(narg, 0))
        })
    }

    fn defined(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<u32> {
        self.with_reference(global, subs, |narg| unsafe {
            self.api.check((self.api.global_data)(narg, 0))?;
            let mut n: c_int = 0;
            self.api.check((self.api.pop_int)(&mut n))?;
            Ok(n.max(0) as u32)
        })
    }

    fn increment(&self, global: &str, subs: &[Argument<'_>], by: f64) -> DbxResult<Vec<u8>> {
        let _guard = self.call.lock();
        let mut pool = ExStrPool::new(&self.api);
        unsafe {
            self.push_reference(global, subs, &mut pool)?;
            self.api.check((self.api.push_dbl)(by))?;
            self.api.check((self.api.global_increment)(subs.len() as c_int))?;
            self.pop_bytes()
        }
    }

    fn lock(&self, global: &str, subs: &[Argument<'_>], timeout: i64) -> DbxResult<bool> {
        let _guard = self.call.lock();
        let mut pool = ExStrPool::new(&self.api);
        let name = global.strip_prefix('^').unwrap_or(global);
        let name = format!("^{}", name);
        unsafe {
            self.api
                .check((self.api.push_lock)(name.len() as c_int, name.as_ptr() as *const c_char))?;
            self.push_all(subs, &mut pool)?;
            let mut acquired: c_int = 0;
            let rc = (self.api.acquire_lock)(
                subs.len() as c_int,
                LOCK_INCREMENTAL,
                timeout.clamp(-1, i64::from(c_int::MAX)) as c_int,
                &mut acquired,
            );
            match rc {
                isc::SUCCESS => Ok(acquired == 1),
                isc::ETIMEOUT => Ok(false),
                rc => Err(self.api.error(rc)),
            }
        }
    }

    fn unlock(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<()> {
        let _guard = self.call.lock();
        let mut pool = ExStrPool::new(&self.api);
        let name = global.strip_prefix('^').unwrap_or(global);
        let name = format!("^{}", name);
        unsafe {
            self.api
                .check((self.api.push_lock)(name.len() as c_int, name.as_ptr() as *const c_char))?;
            self.push_all(subs, &mut pool)?;
            self.api
                .check((self.api.release_lock)(subs.len() as c_int, LOCK_INCREMENTAL))
        }
    }

    fn function(&self, label: &str, routine: &str, args: &[Argument<'_>]) -> DbxResult<Vec<u8>> {
        let (Some(push_func), Some(ext_fun)) = (self.api.push_func, self.api.ext_fun) else {
            return Err(self.api.unavailable());
        };
        let _guard = self.call.lock();
        let mut pool = ExStrPool::new(&self.api);
        unsafe {
            let mut rflag: c_uint = 0;
            self.api.check(push_func(
                &mut rflag,
                label.len() as c_int,
                label.as_ptr() as *const c_char,
                routine.len() as c_int,
                routine.as_ptr() as *const c_char,
            ))?;
            self.push_all(args, &mut pool)?;
            self.api.check(ext_fun(rflag, args.len() as c_int))?;
            self.pop_value().map(Self::object_value_bytes)
        }
    }

    fn class_method(
        &self,
        class: &str,
        method: &str,
        args: &[Argument<'_>],
    ) -> DbxResult<ObjectValue> {
        let (Some(push), Some(invoke)) = (self.api.push_class_method, self.api.invoke_class_method)
        else {
            return Err(self.api.unavailable());
        };
        let _guard = self.call.lock();
        let mut pool = ExStrPool::new(&self.api);
        unsafe {
            self.api.check(push(
                class.len() as c_int,
                class.as_ptr() as *const c_char,
                method.len() as c_int,
                method.as_ptr() as *const c_char,
                1,
            ))?;
            self.push_all(args, &mut pool)?;
            self.api.check(invoke(args.len() as c_int))?;
            self.pop_value()
        }
    }

    fn method(&self, oref: i64, method: &str, args: &[Argument<'_>]) -> DbxResult<ObjectValue> {
        let (Some(push), Some(invoke)) = (self.api.push_method, self.api.invoke_method) else {
            return Err(self.api.unavailable());
        };
        let _guard = self.call.lock();
        let mut pool = ExStrPool::new(&self.api);
        unsafe {
            self.api.check(push(
                oref as c_uint,
                method.len() as c_int,
                method.as_ptr() as *const c_char,
                1,
            ))?;
            self.push_all(args, &mut pool)?;
            self.api.check(invoke(args.len() as c_int))?;
            self.pop_value()
        }
    }

    fn get_property(&self, oref: i64, property: &str) -> DbxResult<ObjectValue> {
        let (Some(push), Some(get)) = (self.api.push_property, self.api.get_property) else {
            return Err(self.api.unavailable());
        };
        let _guard = self.call.lock();
        unsafe {
            self.api.check(push(
                oref as c_uint,
                property.len() as c_int,
                property.as_ptr() as *const c_char,
            ))?;
            self.api.check(get())?;
            self.pop_value()
        }
    }

    fn set_property(&self, oref: i64, property: &str, value: &Argument<'_>) -> DbxResult<()> {
        let (Some(push), Some(set)) = (self.api.push_property, self.api.set_property) else {
            return Err(self.api.unavailable());
        };
        let _guard = self.call.lock();
        let mut pool = ExStrPool::new(&self.api);
        unsafe {
            self.api.check(push(
                oref as c_uint,
                property.len() as c_int,
                property.as_ptr() as *const c_char,
            ))?;
            self.api.check(self.push_value(value, &mut pool))?;
            self.api.check(set())
        }
    }

    fn close_instance(&self, oref: i64) -> DbxResult<()> {
        let close = self.api.close_oref.ok_or_else(|| self.api.unavailable())?;
        let _guard = self.call.lock();
        self.api.check(unsafe { close(oref as c_uint) })
    }

    fn get_namespace(&self) -> DbxResult<Vec<u8>> {
        let (Some(eval), Some(convert)) = (self.api.eval, self.api.convert) else {
            return Err(self.api.unavailable());
        };
        let _guard = self.call.lock();
        let mut expr = AStr::boxed(b"$Namespace");
        let mut result = AStr::boxed(b"");
        result.len = 256;
        unsafe {
            self.api.check(eval(&mut *expr))?;
            self.api.check(convert(CACHE_ASTRING, &mut *result))?;
        }
        Ok(result.as_bytes().to_vec())
    }

    fn set_namespace(&self, namespace: &str) -> DbxResult<()> {
        let _guard = self.call.lock();
        change_namespace(&self.api, namespace)
    }

    fn tstart(&self) -> DbxResult<()> {
        let tstart = self.api.tstart.ok_or_else(|| self.api.unavailable())?;
        let _guard = self.call.lock();
        self.api.check(unsafe { tstart() })
    }

    fn tlevel(&self) -> DbxResult<i32> {
        let tlevel = self.api.tlevel.ok_or_else(|| self.api.unavailable())?;
        let _guard = self.call.lock();
        let level = unsafe { tlevel() };
        if level < 0 {
            return Err(self.api.error(level));
        }
        Ok(level)
    }

    fn tcommit(&self) -> DbxResult<()> {
        let tcommit = self.api.tcommit.ok_or_else(|| self.api.unavailable())?;
        let _guard = self.call.lock();
        self.api.check(unsafe { tcommit() })
    }

    fn trollback(&self) -> DbxResult<()> {
        let trollback = self.api.trollback.ok_or_else(|| self.api.unavailable())?;
        let _guard = self.call.lock();
        self.api.check(unsafe { trollback(0) })
    }

    fn close(&self) -> DbxResult<()> {
        let _guard = self.call.lock();
        let rc = unsafe { (self.api.end)() };
        info!("{} session ended ({})", self.api.library.db_name(), rc);
        Ok(())
    }
}
