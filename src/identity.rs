//! Function and thread identities
//!
//! A [`FunctionId`] is the aggregation key. It is cloned into every frame, so
//! it is a pointer to shared, immutable data with a hash computed once at
//! construction.

use fnv::FnvHasher;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::cell::Cell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct FunctionInfo {
    name: Box<str>,
    file: Box<str>,
    line: u32,
    hash: u64,
}

/// Identity of an instrumented callable
///
/// Two ids are equal only if qualified name, file and line all match, so
/// same-named functions in different modules (or overloads defined on
/// different lines) aggregate separately.
#[derive(Clone)]
pub struct FunctionId(Arc<FunctionInfo>);

impl FunctionId {
    pub fn new(name: impl Into<Box<str>>, file: impl Into<Box<str>>, line: u32) -> Self {
        let name = name.into();
        let file = file.into();

        let mut hasher = FnvHasher::default();
        name.hash(&mut hasher);
        file.hash(&mut hasher);
        line.hash(&mut hasher);
        let hash = hasher.finish();

        FunctionId(Arc::new(FunctionInfo {
            name,
            file,
            line,
            hash,
        }))
    }

    /// Identity without a source location (e.g. names from a foreign runtime)
    pub fn named(name: impl Into<Box<str>>) -> Self {
        Self::new(name, "", 0)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn file(&self) -> &str {
        &self.0.file
    }

    pub fn line(&self) -> u32 {
        self.0.line
    }
}

impl PartialEq for FunctionId {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.hash == other.0.hash
                && self.0.line == other.0.line
                && self.0.name == other.0.name
                && self.0.file == other.0.file)
    }
}

impl Eq for FunctionId {}

impl Hash for FunctionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl fmt::Debug for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionId")
            .field("name", &self.0.name)
            .field("file", &self.0.file)
            .field("line", &self.0.line)
            .finish()
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.file.is_empty() {
            write!(f, "{}", self.0.name)
        } else {
            write!(f, "{} ({}:{})", self.0.name, self.0.file, self.0.line)
        }
    }
}

impl Serialize for FunctionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("FunctionId", 3)?;
        s.serialize_field("name", self.name())?;
        s.serialize_field("file", self.file())?;
        s.serialize_field("line", &self.line())?;
        s.end()
    }
}

/// Keys handed out by [`ThreadKey::current`] start here so they never
/// collide with raw ids supplied by a host runtime.
const CURRENT_THREAD_BASE: u64 = 1 << 63;

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(CURRENT_THREAD_BASE);

thread_local! {
    static CURRENT_THREAD_KEY: Cell<Option<ThreadKey>> = const { Cell::new(None) };
}

/// Identity of the thread an event was delivered on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ThreadKey(u64);

impl ThreadKey {
    /// Wrap a host-supplied thread id (expected below 2^63)
    pub const fn from_raw(raw: u64) -> Self {
        ThreadKey(raw)
    }

    /// Process-unique key for the calling thread
    pub fn current() -> Self {
        CURRENT_THREAD_KEY.with(|slot| match slot.get() {
            Some(key) => key,
            None => {
                let key = ThreadKey(NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed));
                slot.set(Some(key));
                key
            }
        })
    }

    /// Key of the calling thread, if [`ThreadKey::current`] already ran on it
    pub fn assigned() -> Option<Self> {
        CURRENT_THREAD_KEY.try_with(Cell::get).ok().flatten()
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= CURRENT_THREAD_BASE {
            write!(f, "thread-{}", self.0 - CURRENT_THREAD_BASE)
        } else {
            write!(f, "thread-raw-{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_assigned_only_after_current() {
        let fresh = thread::spawn(|| {
            let before = ThreadKey::assigned();
            let key = ThreadKey::current();
            (before, key, ThreadKey::assigned())
        })
        .join()
        .unwrap();
        assert_eq!(fresh.0, None);
        assert_eq!(fresh.2, Some(fresh.1));
    }

    #[test]
    fn test_function_id_equality() {
        let a = FunctionId::new("app::parse", "src/app.rs", 10);
        let b = FunctionId::new("app::parse", "src/app.rs", 10);
        assert_eq!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_same_name_different_scope_is_distinct() {
        let a = FunctionId::new("parse", "src/json.rs", 10);
        let b = FunctionId::new("parse", "src/toml.rs", 10);
        let c = FunctionId::new("parse", "src/json.rs", 42);
        assert_ne!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_function_id_display() {
        let id = FunctionId::new("app::run", "src/main.rs", 7);
        assert_eq!(id.to_string(), "app::run (src/main.rs:7)");
        assert_eq!(FunctionId::named("builtins.len").to_string(), "builtins.len");
    }

    #[test]
    fn test_function_id_serializes_fields() {
        let id = FunctionId::new("app::run", "src/main.rs", 7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#"{"name":"app::run","file":"src/main.rs","line":7}"#);
    }

    #[test]
    fn test_thread_key_stable_within_thread() {
        assert_eq!(ThreadKey::current(), ThreadKey::current());
    }

    #[test]
    fn test_thread_key_distinct_across_threads() {
        let here = ThreadKey::current();
        let there = thread::spawn(ThreadKey::current).join().unwrap();
        assert_ne!(here, there);
        assert!(there.as_u64() >= CURRENT_THREAD_BASE);
    }

    #[test]
    fn test_raw_thread_key_never_collides_with_current() {
        let raw = ThreadKey::from_raw(7);
        assert_ne!(raw, ThreadKey::current());
        assert_eq!(raw.to_string(), "thread-raw-7");
    }
}
