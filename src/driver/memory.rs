//! In-process backend holding globals in memory.
//!
//! Behaves like a real engine as far as the bridge can observe: subscripts
//! collate canonical numbers first, `defined` reports 0/1/10/11 and
//! transactions roll back to a snapshot. A YottaDB flavoured instance runs
//! transactions through [`Backend::run_transaction`] and can be told to
//! restart them, which lets the transaction coordinator be exercised
//! without a vendor library.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dbx_protocol::{leading_double, Argument};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::debug;

use super::status::{isc, isc_message};
use super::version::VersionInfo;
use super::{format_number, Backend, Connector, DbType, Direction, TpOutcome, TransactionModel};
use crate::config::ConnectionConfig;
use crate::error::{DbxError, DbxResult};

static CANONIC_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:0|-?[1-9][0-9]*(?:\.[0-9]*[1-9])?|-?\.[0-9]*[1-9])$")
        .expect("valid canonic number pattern")
});

/// One key element, ordered the way M collates subscripts
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Subscript(Vec<u8>);

impl Subscript {
    fn number(&self) -> Option<f64> {
        let text = std::str::from_utf8(&self.0).ok()?;
        if !CANONIC_NUMBER.is_match(text) {
            return None;
        }
        text.parse().ok()
    }
}

impl Ord for Subscript {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match (self.number(), other.number()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(CmpOrdering::Equal),
            (Some(_), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for Subscript {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

type Key = Vec<Subscript>;
type Globals = BTreeMap<Key, Vec<u8>>;
type Function = Box<dyn Fn(&[Vec<u8>]) -> DbxResult<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct State {
    globals: Globals,
    /// One snapshot per open transaction level
    snapshots: Vec<Globals>,
    locks: HashSet<Key>,
    namespace: String,
}

pub struct MemoryBackend {
    db_type: DbType,
    state: Mutex<State>,
    functions: Mutex<HashMap<String, Function>>,
    failure: Mutex<Option<(i32, String)>>,
    restarts: AtomicUsize,
    restarting: AtomicBool,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new(db_type: DbType) -> Self {
        Self {
            db_type,
            state: Mutex::new(State {
                namespace: "USER".to_string(),
                ..State::default()
            }),
            functions: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            restarts: AtomicUsize::new(0),
            restarting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Make `label^routine` callable through [`Backend::function`].
    pub fn register_function<F>(&self, name: &str, f: F)
    where
        F: Fn(&[Vec<u8>]) -> DbxResult<Vec<u8>> + Send + Sync + 'static,
    {
        self.functions.lock().insert(name.to_string(), Box::new(f));
    }

    /// Fail the next operation with `code`/`message`.
    pub fn fail_next(&self, code: i32, message: &str) {
        *self.failure.lock() = Some((code, message.to_string()));
    }

    /// Restart the next `count` transaction commits.
    pub fn restart_next_commits(&self, count: usize) {
        self.restarts.store(count, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of stored nodes.
    pub fn node_count(&self) -> usize {
        self.state.lock().globals.len()
    }

    fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    fn check(&self) -> DbxResult<()> {
        if self.is_closed() {
            return Err(DbxError::backend(isc::NOCON, isc_message(isc::NOCON)));
        }
        if let Some((code, message)) = self.failure.lock().take() {
            return Err(DbxError::backend(code, message));
        }
        Ok(())
    }

    fn key(global: &str, subs: &[Argument<'_>]) -> Key {
        let mut key = Vec::with_capacity(subs.len() + 1);
        key.push(Subscript(global.as_bytes().to_vec()));
        key.extend(subs.iter().map(|s| Subscript(s.bytes.to_vec())));
        key
    }
}

fn has_prefix(key: &[Subscript], prefix: &[Subscript]) -> bool {
    key.len() >= prefix.len() && key[..prefix.len()] == *prefix
}

impl Backend for MemoryBackend {
    fn db_type(&self) -> DbType {
        self.db_type
    }

    fn version(&self) -> Option<VersionInfo> {
        if self.db_type.is_isc() {
            let text = match self.db_type {
                DbType::Cache => "Cache for UNIX (In-Memory) 2018.1 (Build 100U)",
                _ => "IRIS for UNIX (In-Memory) 2019.2 (Build 107U)",
            };
            VersionInfo::parse_isc(text)
        } else {
            VersionInfo::parse_ydb("GT.M V6.3-009 In-Memory", self.db_type.product())
        }
    }

    fn set(&self, global: &str, subs: &[Argument<'_>], value: &Argument<'_>) -> DbxResult<()> {
        self.check()?;
        if subs.iter().any(|s| s.is_empty()) {
            return Err(DbxError::backend(isc::ERSUBSCR, isc_message(isc::ERSUBSCR)));
        }
        let key = Self::key(global, subs);
        self.state.lock().globals.insert(key, value.bytes.to_vec());
        Ok(())
    }

    fn get(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<Option<Vec<u8>>> {
        self.check()?;
        let key = Self::key(global, subs);
        Ok(self.state.lock().globals.get(&key).cloned())
    }

    fn order(&self, global: &str, subs: &[Argument<'_>], dir: Direction) -> DbxResult<Vec<u8>> {
        self.check()?;
        let Some((seed, parent_subs)) = subs.split_last() else {
            return Ok(Vec::new());
        };
        let parent = Self::key(global, parent_subs);
        let seed = Subscript(seed.bytes.to_vec());
        let depth = parent.len();

        let state = self.state.lock();
        let mut siblings = state
            .globals
            .range(parent.clone()..)
            .map(|(k, _)| k)
            .take_while(|k| has_prefix(k, &parent))
            .filter(|k| k.len() > depth)
            .map(|k| &k[depth]);

        let found = match dir {
            Direction::Forward => siblings.find(|s| seed.0.is_empty() || **s > seed),
            Direction::Backward => siblings.filter(|s| seed.0.is_empty() || **s < seed).last(),
        };
        Ok(found.map(|s| s.0.clone()).unwrap_or_default())
    }

    fn query(
        &self,
        global: &str,
        subs: &[Argument<'_>],
        dir: Direction,
    ) -> DbxResult<Option<Vec<Vec<u8>>>> {
        self.check()?;
        let key = Self::key(global, subs);
        let root = Self::key(global, &[]);

        let state = self.state.lock();
        let in_global = |k: &&Key| k.len() > 1 && has_prefix(k, &root);
        let found = match dir {
            Direction::Forward => state
                .globals
                .range((Bound::Excluded(key), Bound::Unbounded))
                .map(|(k, _)| k)
                .take_while(|k| has_prefix(k, &root))
                .find(|k| in_global(k)),
            Direction::Backward if subs.is_empty() => state
                .globals
                .range(root.clone()..)
                .map(|(k, _)| k)
                .take_while(|k| has_prefix(k, &root))
                .filter(|k| in_global(k))
                .last(),
            Direction::Backward => state
                .globals
                .range(..key)
                .map(|(k, _)| k)
                .rev()
                .take_while(|k| has_prefix(k, &root))
                .find(|k| in_global(k)),
        };
        Ok(found.map(|k| k[1..].iter().map(|s| s.0.clone()).collect()))
    }

    fn delete(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<()> {
        self.check()?;
        let key = Self::key(global, subs);
        self.state.lock().globals.retain(|k, _| !has_prefix(k, &key));
        Ok(())
    }

    fn defined(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<u32> {
        self.check()?;
        let key = Self::key(global, subs);
        let state = self.state.lock();
        let mut data = 0;
        if state.globals.contains_key(&key) {
            data += 1;
        }
        let has_children = state
            .globals
            .range((Bound::Excluded(key.clone()), Bound::Unbounded))
            .next()
            .map(|(k, _)| has_prefix(k, &key))
            .unwrap_or(false);
        if has_children {
            data += 10;
        }
        Ok(data)
    }

    fn increment(&self, global: &str, subs: &[Argument<'_>], by: f64) -> DbxResult<Vec<u8>> {
        self.check()?;
        let key = Self::key(global, subs);
        let mut state = self.state.lock();
        let current = state.globals.get(&key).map(|v| leading_double(v)).unwrap_or(0.0);
        let value = format_number(current + by);
        state.globals.insert(key, value.clone());
        Ok(value)
    }

    fn lock(&self, global: &str, subs: &[Argument<'_>], _timeout: i64) -> DbxResult<bool> {
        self.check()?;
        self.state.lock().locks.insert(Self::key(global, subs));
        Ok(true)
    }

    fn unlock(&self, global: &str, subs: &[Argument<'_>]) -> DbxResult<()> {
        self.check()?;
        self.state.lock().locks.remove(&Self::key(global, subs));
        Ok(())
    }

    fn function(&self, label: &str, routine: &str, args: &[Argument<'_>]) -> DbxResult<Vec<u8>> {
        self.check()?;
        let name = format!("{}^{}", label, routine);
        let functions = self.functions.lock();
        let f = functions
            .get(&name)
            .ok_or_else(|| DbxError::backend(isc::ERNOROUTINE, isc_message(isc::ERNOROUTINE)))?;
        let owned: Vec<Vec<u8>> = args.iter().map(|a| a.bytes.to_vec()).collect();
        f(&owned)
    }

    fn get_namespace(&self) -> DbxResult<Vec<u8>> {
        if !self.db_type.is_isc() {
            return Err(DbxError::namespaces_not_available());
        }
        self.check()?;
        Ok(self.state.lock().namespace.clone().into_bytes())
    }

    fn set_namespace(&self, namespace: &str) -> DbxResult<()> {
        if !self.db_type.is_isc() {
            return Err(DbxError::namespaces_not_available());
        }
        self.check()?;
        self.state.lock().namespace = namespace.to_string();
        Ok(())
    }

    fn transaction_model(&self) -> TransactionModel {
        if self.db_type == DbType::YottaDb {
            TransactionModel::Threaded
        } else {
            TransactionModel::Native
        }
    }

    fn tstart(&self) -> DbxResult<()> {
        self.check()?;
        let mut state = self.state.lock();
        let snapshot = state.globals.clone();
        state.snapshots.push(snapshot);
        Ok(())
    }

    fn tlevel(&self) -> DbxResult<i32> {
        self.check()?;
        Ok(self.state.lock().snapshots.len() as i32)
    }

    fn tcommit(&self) -> DbxResult<()> {
        self.check()?;
        self.state
            .lock()
            .snapshots
            .pop()
            .map(|_| ())
            .ok_or(DbxError::NoTransaction)
    }

    fn trollback(&self) -> DbxResult<()> {
        self.check()?;
        let mut state = self.state.lock();
        if state.snapshots.is_empty() {
            return Err(DbxError::NoTransaction);
        }
        let outermost = state.snapshots.drain(..).next().unwrap_or_default();
        state.globals = outermost;
        Ok(())
    }

    fn run_transaction(&self, body: &mut dyn FnMut() -> TpOutcome) -> DbxResult<TpOutcome> {
        if self.transaction_model() != TransactionModel::Threaded {
            return Err(DbxError::NotAvailable(
                "Transactions are not available with this platform".to_string(),
            ));
        }
        self.check()?;
        loop {
            {
                let mut state = self.state.lock();
                let snapshot = state.globals.clone();
                state.snapshots.push(snapshot);
            }

            let outcome = body();

            let mut state = self.state.lock();
            let snapshot = state.snapshots.pop().unwrap_or_default();
            if outcome == TpOutcome::Rollback {
                state.globals = snapshot;
                self.restarting.store(false, Ordering::SeqCst);
                return Ok(TpOutcome::Rollback);
            }

            let restart = self
                .restarts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if restart {
                debug!("Restarting in-memory transaction");
                state.globals = snapshot;
                self.restarting.store(true, Ordering::SeqCst);
                continue;
            }

            self.restarting.store(false, Ordering::SeqCst);
            return Ok(TpOutcome::Commit);
        }
    }

    fn restart_pending(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    fn close(&self) -> DbxResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector that always hands out the same in-memory backend
pub struct MemoryConnector {
    backend: Arc<MemoryBackend>,
}

impl MemoryConnector {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self { backend }
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, config: &ConnectionConfig) -> DbxResult<Arc<dyn Backend>> {
        if config.db_type != self.backend.db_type() {
            return Err(DbxError::UnknownDbType);
        }
        self.backend.reopen();
        let backend: Arc<dyn Backend> = self.backend.clone();
        Ok(backend)
    }
}
