use crate::injection::{CrashKey, TriggerSet};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A testcase together with one minimal set of injection points that
/// reproduces its crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Crash {
    /// Testcase path relative to the walked crashes directory.
    pub testcase: PathBuf,
    pub triggers: TriggerSet,
}

impl Crash {
    pub fn key(&self) -> CrashKey {
        self.triggers.key()
    }
}

/// Crashes keyed by their trigger set.
///
/// Two crashes with the same triggers are the same finding; inserting the
/// second replaces the first.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct CrashSet {
    crashes: BTreeMap<CrashKey, Crash>,
}

impl CrashSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `crash`, returning the crash previously stored under the
    /// same key.
    pub fn insert(&mut self, crash: Crash) -> Option<Crash> {
        self.crashes.insert(crash.key(), crash)
    }

    pub fn get(&self, key: &CrashKey) -> Option<&Crash> {
        self.crashes.get(key)
    }

    pub fn len(&self) -> usize {
        self.crashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crashes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &CrashKey> {
        self.crashes.keys()
    }
}
