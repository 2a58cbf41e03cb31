//! Configuration store access
//!
//! The hierarchical key/value store (XenStore in production) is reached
//! through the [`ConfigStore`] trait: plain reads and writes, directory
//! listing, watches with tokens, and transactions. On top sits the typed
//! layer the orchestrator actually uses: formatted device reads/writes and
//! scanf-style parsing. All values are NUL-free strings; embedded NULs are
//! rejected at this boundary.

use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use blktap_core::{Error, Result};
use tracing::debug;

/// A fired watch: the modified path and the token of the triggered watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub token: String,
}

/// One transaction's view of the store
pub trait StoreTx {
    fn read(&mut self, path: &str) -> Result<Option<String>>;
    fn write(&mut self, path: &str, value: &str) -> Result<()>;
    fn exists(&mut self, path: &str) -> Result<bool>;
}

/// The store interface the orchestrator is written against
pub trait ConfigStore: Send {
    /// Read a key; `None` iff the key is absent
    fn read(&self, path: &str) -> Result<Option<String>>;
    fn write(&self, path: &str, value: &str) -> Result<()>;
    fn rm(&self, path: &str) -> Result<()>;
    fn exists(&self, path: &str) -> Result<bool>;
    /// Immediate children of a directory node
    fn list(&self, path: &str) -> Result<Vec<String>>;

    /// Register a watch on `path` and everything below it.
    ///
    /// Registration fires one synthetic event for `path` itself, so a
    /// watcher always sees the current state before any change.
    fn watch(&self, path: &str, token: &str) -> Result<()>;
    fn unwatch(&self, path: &str, token: &str) -> Result<()>;
    /// Next fired watch, or `None` on timeout
    fn next_event(&self, timeout: Duration) -> Result<Option<WatchEvent>>;

    /// Run `f` inside a transaction; aborts on error
    fn transaction(
        &self,
        f: &mut dyn FnMut(&mut dyn StoreTx) -> Result<()>,
    ) -> Result<()>;
}

fn check_value(value: &str) -> Result<()> {
    if value.contains('\0') {
        return Err(Error::invalid_arg("embedded NUL in store value"));
    }
    Ok(())
}

/// Typed read: parse a key with `FromStr`
pub fn read_parse<T: FromStr>(store: &dyn ConfigStore, path: &str) -> Result<Option<T>> {
    match store.read(path)? {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::format(format!("unparseable value at {}: '{}'", path, raw))),
    }
}

/// Typed read of a required key
pub fn read_parse_required<T: FromStr>(store: &dyn ConfigStore, path: &str) -> Result<T> {
    read_parse(store, path)?.ok_or_else(|| Error::not_found(path.to_string()))
}

/// Transactional write of `<device_path>/<key>`, aborting cleanly if the
/// device directory was removed in the interim.
///
/// With `mkread` the key is written world-readable; permission handling is
/// the store's concern, the flag just travels through.
pub fn device_printf(
    store: &dyn ConfigStore,
    device_path: &str,
    key: &str,
    _mkread: bool,
    value: &str,
) -> Result<()> {
    check_value(value)?;
    let path = format!("{}/{}", device_path, key);
    store.transaction(&mut |tx| {
        if !tx.exists(device_path)? {
            // Device vanished between the watch firing and us acting on
            // it; nothing to update.
            debug!(device_path, key, "device gone, skipping write");
            return Ok(());
        }
        tx.write(&path, value)
    })
}

/// In-memory store with watch semantics, backing the tests and any
/// single-process deployment
pub struct MemStore {
    state: Mutex<MemState>,
    wakeup: Condvar,
}

struct MemState {
    nodes: BTreeMap<String, String>,
    watches: Vec<(String, String)>,
    events: VecDeque<WatchEvent>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState {
                nodes: BTreeMap::new(),
                watches: Vec::new(),
                events: VecDeque::new(),
            }),
            wakeup: Condvar::new(),
        }
    }

    fn fire(state: &mut MemState, path: &str) {
        let mut fired = Vec::new();
        for (watched, token) in &state.watches {
            if path == watched || path.starts_with(&format!("{}/", watched)) {
                fired.push(WatchEvent {
                    path: path.to_string(),
                    token: token.clone(),
                });
            }
        }
        state.events.extend(fired);
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for MemStore {
    fn read(&self, path: &str) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state.nodes.get(path).cloned())
    }

    fn write(&self, path: &str, value: &str) -> Result<()> {
        check_value(value)?;
        let mut state = self.state.lock().unwrap();
        state.nodes.insert(path.to_string(), value.to_string());
        Self::fire(&mut state, path);
        drop(state);
        self.wakeup.notify_all();
        Ok(())
    }

    fn rm(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let prefix = format!("{}/", path);
        state
            .nodes
            .retain(|k, _| k != path && !k.starts_with(&prefix));
        Self::fire(&mut state, path);
        drop(state);
        self.wakeup.notify_all();
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        let prefix = format!("{}/", path);
        Ok(state.nodes.contains_key(path)
            || state.nodes.keys().any(|k| k.starts_with(&prefix)))
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let prefix = format!("{}/", path);
        let mut children: Vec<String> = state
            .nodes
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
            .collect();
        children.sort();
        children.dedup();
        Ok(children)
    }

    fn watch(&self, path: &str, token: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .watches
            .push((path.to_string(), token.to_string()));
        // Registration event, as the real store delivers
        state.events.push_back(WatchEvent {
            path: path.to_string(),
            token: token.to_string(),
        });
        drop(state);
        self.wakeup.notify_all();
        Ok(())
    }

    fn unwatch(&self, path: &str, token: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .watches
            .retain(|(p, t)| !(p == path && t == token));
        Ok(())
    }

    fn next_event(&self, timeout: Duration) -> Result<Option<WatchEvent>> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(event) = state.events.pop_front() {
                return Ok(Some(event));
            }
            let (next, result) = self.wakeup.wait_timeout(state, timeout).unwrap();
            state = next;
            if result.timed_out() {
                return Ok(state.events.pop_front());
            }
        }
    }

    fn transaction(
        &self,
        f: &mut dyn FnMut(&mut dyn StoreTx) -> Result<()>,
    ) -> Result<()> {
        // The mutex serializes all access, so a transaction is a snapshot
        // plus a deferred apply.
        let snapshot = {
            let state = self.state.lock().unwrap();
            state.nodes.clone()
        };
        let mut tx = MemTx {
            snapshot,
            writes: Vec::new(),
        };
        f(&mut tx)?;
        for (path, value) in tx.writes {
            self.write(&path, &value)?;
        }
        Ok(())
    }
}

struct MemTx {
    snapshot: BTreeMap<String, String>,
    writes: Vec<(String, String)>,
}

impl StoreTx for MemTx {
    fn read(&mut self, path: &str) -> Result<Option<String>> {
        if let Some((_, v)) = self.writes.iter().rev().find(|(p, _)| p == path) {
            return Ok(Some(v.clone()));
        }
        Ok(self.snapshot.get(path).cloned())
    }

    fn write(&mut self, path: &str, value: &str) -> Result<()> {
        check_value(value)?;
        self.writes.push((path.to_string(), value.to_string()));
        Ok(())
    }

    fn exists(&mut self, path: &str) -> Result<bool> {
        let prefix = format!("{}/", path);
        Ok(self.snapshot.contains_key(path)
            || self.snapshot.keys().any(|k| k.starts_with(&prefix))
            || self.writes.iter().any(|(p, _)| p == path || p.starts_with(&prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_rm() {
        let store = MemStore::new();
        assert_eq!(store.read("a/b").unwrap(), None);
        store.write("a/b", "1").unwrap();
        assert_eq!(store.read("a/b").unwrap(), Some("1".into()));
        store.rm("a").unwrap();
        assert_eq!(store.read("a/b").unwrap(), None);
    }

    #[test]
    fn test_nul_rejected() {
        let store = MemStore::new();
        assert!(store.write("a", "bad\0value").is_err());
    }

    #[test]
    fn test_list_children() {
        let store = MemStore::new();
        store.write("backend/vbd/1/100/params", "x").unwrap();
        store.write("backend/vbd/1/101/params", "y").unwrap();
        store.write("backend/vbd/2/100/params", "z").unwrap();
        assert_eq!(store.list("backend/vbd").unwrap(), vec!["1", "2"]);
        assert_eq!(store.list("backend/vbd/1").unwrap(), vec!["100", "101"]);
    }

    #[test]
    fn test_watch_fires_on_registration_and_write() {
        let store = MemStore::new();
        store.watch("backend/vbd", "tok").unwrap();

        let reg = store.next_event(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(reg.path, "backend/vbd");
        assert_eq!(reg.token, "tok");

        store.write("backend/vbd/1/100/params", "x").unwrap();
        let ev = store.next_event(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(ev.path, "backend/vbd/1/100/params");
        assert_eq!(ev.token, "tok");
    }

    #[test]
    fn test_unwatched_paths_are_silent() {
        let store = MemStore::new();
        store.watch("backend/vbd", "tok").unwrap();
        store.next_event(Duration::from_millis(10)).unwrap();

        store.write("device/vbd/100/state", "4").unwrap();
        assert_eq!(store.next_event(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn test_read_parse() {
        let store = MemStore::new();
        store.write("a", "51712").unwrap();
        assert_eq!(read_parse::<u32>(&store, "a").unwrap(), Some(51712));
        store.write("a", "junk").unwrap();
        assert!(read_parse::<u32>(&store, "a").is_err());
        assert_eq!(read_parse::<u32>(&store, "missing").unwrap(), None);
    }

    #[test]
    fn test_device_printf_skips_removed_device() {
        let store = MemStore::new();
        store.write("backend/vbd/1/100/params", "x").unwrap();
        device_printf(&store, "backend/vbd/1/100", "sectors", true, "8192").unwrap();
        assert_eq!(
            store.read("backend/vbd/1/100/sectors").unwrap(),
            Some("8192".into())
        );

        store.rm("backend/vbd/1/100").unwrap();
        device_printf(&store, "backend/vbd/1/100", "sectors", true, "8192").unwrap();
        assert_eq!(store.read("backend/vbd/1/100/sectors").unwrap(), None);
    }
}
