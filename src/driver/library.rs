//! Runtime loading of vendor shared libraries.

use std::ffi::{c_void, CStr, CString};
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::error::{DbxError, DbxResult};

/// A shared library opened with `dlopen`
pub struct Library {
    handle: *mut c_void,
    path: PathBuf,
    db_name: String,
    prefix: String,
}

// The handle is only used for symbol lookup, which the loader serialises.
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl Library {
    /// Try each candidate in order and keep the first one that loads.
    ///
    /// When none loads, the error names the first candidate together with
    /// the loader's message for it.
    pub fn open_first(db_name: &str, prefix: &str, candidates: &[PathBuf]) -> DbxResult<Self> {
        let mut first_error: Option<(PathBuf, String)> = None;

        for path in candidates {
            match Self::open(path) {
                Ok(handle) => {
                    debug!("Loaded {} library {}", db_name, path.display());
                    return Ok(Self {
                        handle,
                        path: path.clone(),
                        db_name: db_name.to_string(),
                        prefix: prefix.to_string(),
                    });
                }
                Err(reason) => {
                    debug!("Cannot load {}: {}", path.display(), reason);
                    if first_error.is_none() {
                        first_error = Some((path.clone(), reason));
                    }
                }
            }
        }

        let (path, reason) = first_error.unwrap_or_default();
        let message = format!(
            "Error loading {} Library: {} ({})",
            db_name,
            path.display(),
            reason
        );
        error!("{}", message);
        Err(DbxError::LibraryLoad(message))
    }

    fn open(path: &Path) -> Result<*mut c_void, String> {
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|e| format!("Invalid library path: {}", e))?;
        unsafe {
            let handle = libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL);
            if handle.is_null() {
                return Err(last_dl_error());
            }
            Ok(handle)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Rename the product once the loaded file tells which one it is.
    pub fn set_product(&mut self, db_name: &str, prefix: &str) {
        self.db_name = db_name.to_string();
        self.prefix = prefix.to_string();
    }

    /// Look up `<prefix><name>`.
    ///
    /// # Safety
    ///
    /// `T` must be a function pointer type matching the exported symbol.
    pub unsafe fn symbol<T: Copy>(&self, name: &str) -> Option<T> {
        debug_assert_eq!(std::mem::size_of::<T>(), std::mem::size_of::<*mut c_void>());
        let full = CString::new(format!("{}{}", self.prefix, name)).ok()?;
        let ptr = libc::dlsym(self.handle, full.as_ptr());
        if ptr.is_null() {
            None
        } else {
            Some(std::mem::transmute_copy::<*mut c_void, T>(&ptr))
        }
    }

    /// Like [`Library::symbol`], failing with the load error when absent.
    ///
    /// # Safety
    ///
    /// Same contract as [`Library::symbol`].
    pub unsafe fn require<T: Copy>(&self, name: &str) -> DbxResult<T> {
        self.symbol(name).ok_or_else(|| {
            let message = format!(
                "Error loading {} library: {}; Cannot locate the following function : {}{}",
                self.db_name,
                self.path.display(),
                self.prefix,
                name
            );
            error!("{}", message);
            DbxError::LibraryLoad(message)
        })
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

fn last_dl_error() -> String {
    unsafe {
        let msg = libc::dlerror();
        if msg.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

/// Candidate file names for a library, `.so` before `.dylib` except on macOS.
pub fn candidates(dir: &Path, stems: &[&str]) -> Vec<PathBuf> {
    let exts: [&str; 2] = if cfg!(target_os = "macos") {
        ["dylib", "so"]
    } else {
        ["so", "dylib"]
    };
    stems
        .iter()
        .flat_map(|stem| exts.iter().map(move |ext| dir.join(format!("{}.{}", stem, ext))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_reports_first_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let list = candidates(dir.path(), &["libyottadb"]);
        let err = Library::open_first("YottaDB", "ydb_", &list).err().unwrap();
        let text = err.to_string();
        assert!(text.starts_with("Error loading YottaDB Library: "));
        assert!(text.contains("libyottadb"));
        assert_eq!(err.error_code(), 1009);
    }

    #[test]
    fn test_candidate_order() {
        let list = candidates(Path::new("/opt/iris/bin"), &["libirisdb", "libcache"]);
        assert_eq!(list.len(), 4);
        assert!(list[0].to_string_lossy().starts_with("/opt/iris/bin/libirisdb"));
        assert!(list[2].to_string_lossy().starts_with("/opt/iris/bin/libcache"));
    }
}
