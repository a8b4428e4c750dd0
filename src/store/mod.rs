//!
//! pkgindex store module
//! ---------------------
//! This module implements the in-memory dependency graph behind the index
//! service. The graph is held as two adjacency maps: `deps` (package name to
//! the set of packages it depends on) and `users` (package name to the set of
//! packages that depend on it). The reverse map exists so removal eligibility
//! is a set lookup instead of a walk over every indexed package.
//!
//! Key responsibilities:
//! - `index` with upsert semantics: a re-index replaces the dependency set
//!   wholesale and reconciles reverse edges for dropped/added dependencies.
//! - `remove` only when no indexed package still depends on the name;
//!   removing an absent name counts as removed.
//! - `query` for presence, never mutating.
//!
//! A package is present in both maps or in neither, every forward edge has a
//! matching reverse edge, every dependency is itself indexed, and no package
//! refers to itself. Operations either complete or refuse without touching
//! state; a refusal is an `Outcome`, not an error.
//!
//! The public API centers around `PackageIndex`, which is wrapped in the
//! thread-safe `SharedIndex` (`Arc<Mutex<PackageIndex>>`) everywhere the
//! server touches it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;


/// Outcome of a mutating store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation took effect (or was already satisfied, for removals).
    Ok,
    /// The operation was refused to keep the graph consistent. No state changed.
    Refused,
}

/// Result of a presence query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
}

/// The dependency graph. Owns both adjacency maps exclusively; the maps are
/// always freshly allocated so no two instances can ever alias state.
pub struct PackageIndex {
    /// Forward edges: package -> set of packages it depends on.
    deps: HashMap<String, HashSet<String>>,
    /// Reverse edges: package -> set of packages that depend on it.
    users: HashMap<String, HashSet<String>>,
}

impl PackageIndex {
    pub fn new() -> Self {
        Self { deps: HashMap::new(), users: HashMap::new() }
    }

    /// Report whether `name` is currently indexed.
    pub fn query(&self, name: &str) -> Presence {
        if self.deps.contains_key(name) {
            Presence::Present
        } else {
            Presence::Absent
        }
    }

    /// Insert or replace the record for `name`.
    ///
    /// Refused when the declared list names the package itself or any package
    /// that is not currently indexed. Otherwise the previous dependency set
    /// (empty for a first-time index) is diffed against the declared one:
    /// reverse edges are detached for dropped dependencies and attached for
    /// added ones, then the forward set is replaced wholesale. Duplicates in
    /// the declared list collapse.
    pub fn index(&mut self, name: &str, declared: &[String]) -> Outcome {
        let mut wanted: HashSet<String> = HashSet::with_capacity(declared.len());
        for dep in declared {
            if dep.as_str() == name {
                debug!(target: "pkgindex::store", "refusing index of '{}': depends on itself", name);
                return Outcome::Refused;
            }
            wanted.insert(dep.clone());
        }

        if wanted.iter().any(|dep| !self.deps.contains_key(dep)) {
            debug!(
                target: "pkgindex::store",
                "refusing index of '{}': not all dependencies are indexed", name
            );
            return Outcome::Refused;
        }

        let prev = self.deps.get(name).cloned().unwrap_or_default();
        for dropped in prev.difference(&wanted) {
            if let Some(using) = self.users.get_mut(dropped) {
                using.remove(name);
            }
        }
        for added in wanted.difference(&prev) {
            // `added` passed the presence check above, so its users entry exists.
            self.users.entry(added.clone()).or_default().insert(name.to_string());
        }

        self.users.entry(name.to_string()).or_default();
        self.deps.insert(name.to_string(), wanted);
        Outcome::Ok
    }

    /// Remove the record for `name`.
    ///
    /// An absent name counts as removed, so repeated removals are idempotent.
    /// Refused while any indexed package still lists `name` as a dependency.
    pub fn remove(&mut self, name: &str) -> Outcome {
        if !self.deps.contains_key(name) {
            debug!(target: "pkgindex::store", "'{}' not indexed, treating removal as done", name);
            return Outcome::Ok;
        }

        if self.users.get(name).map(|using| !using.is_empty()).unwrap_or(false) {
            debug!(
                target: "pkgindex::store",
                "refusing removal of '{}': indexed packages still depend on it", name
            );
            return Outcome::Refused;
        }

        if let Some(wanted) = self.deps.remove(name) {
            for dep in &wanted {
                if let Some(using) = self.users.get_mut(dep) {
                    using.remove(name);
                }
            }
        }
        self.users.remove(name);
        Outcome::Ok
    }

    /// Number of indexed packages.
    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Dump both adjacency maps at debug level. The server calls this once on
    /// shutdown; it is also handy when debugging indexed data by hand.
    pub fn log_state(&self) {
        debug!(target: "pkgindex::store", "index state: {} packages", self.deps.len());
        for (name, wanted) in &self.deps {
            debug!(
                target: "pkgindex::store",
                "    {}: deps={:?} users={:?}",
                name,
                wanted,
                self.users.get(name)
            );
        }
    }
}

impl Default for PackageIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle to a `PackageIndex`, cloned into every connection
/// handler. Each operation holds the lock for its entire duration, so every
/// operation is atomic and their serialization order is the order of lock
/// acquisition.
#[derive(Clone)]
pub struct SharedIndex(pub Arc<Mutex<PackageIndex>>);

impl SharedIndex {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(PackageIndex::new())))
    }

    pub fn query(&self, name: &str) -> Presence {
        self.0.lock().query(name)
    }

    pub fn index(&self, name: &str, declared: &[String]) -> Outcome {
        self.0.lock().index(name, declared)
    }

    pub fn remove(&self, name: &str) -> Outcome {
        self.0.lock().remove(name)
    }

    pub fn log_state(&self) {
        self.0.lock().log_state()
    }
}

impl Default for SharedIndex {
    fn default() -> Self {
        Self::new()
    }
}
