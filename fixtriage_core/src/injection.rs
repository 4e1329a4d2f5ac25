//! Identifiers for injection points and the ways they are combined.
//!
//! A `TriggerSet` is the unit of everything downstream: the minimizer
//! enables one per run through an `InjectionDirective`, and deduplication
//! keys crashes by its `CrashKey` rendering.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Environment variable the instrumented binary reads to select which
/// injection points stay active.
pub const FIXREVERTER_ENV: &str = "FIXREVERTER";

/// Separator used when a `TriggerSet` is rendered as a `CrashKey`.
pub const CRASH_KEY_SEPARATOR: &str = "+";

/// Numeric identifier of one bug-injection site in the instrumented binary.
pub type InjectionId = u64;

/// A set of injection points, kept sorted so that iteration order and
/// rendered keys are canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerSet(BTreeSet<InjectionId>);

impl TriggerSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn insert(&mut self, id: InjectionId) -> bool {
        self.0.insert(id)
    }

    pub fn contains(&self, id: InjectionId) -> bool {
        self.0.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ascending iteration over the ids.
    pub fn iter(&self) -> impl Iterator<Item = InjectionId> + '_ {
        self.0.iter().copied()
    }

    pub fn is_superset(&self, other: &TriggerSet) -> bool {
        self.0.is_superset(&other.0)
    }

    pub fn is_subset(&self, other: &TriggerSet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Adds every id of `other` to `self`.
    pub fn union_with(&mut self, other: &TriggerSet) {
        self.0.extend(other.0.iter().copied());
    }

    pub fn to_vec(&self) -> Vec<InjectionId> {
        self.iter().collect()
    }

    pub fn key(&self) -> CrashKey {
        CrashKey::from(self)
    }
}

impl FromIterator<InjectionId> for TriggerSet {
    fn from_iter<T: IntoIterator<Item = InjectionId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[InjectionId; N]> for TriggerSet {
    fn from(ids: [InjectionId; N]) -> Self {
        ids.into_iter().collect()
    }
}

impl Extend<InjectionId> for TriggerSet {
    fn extend<T: IntoIterator<Item = InjectionId>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl fmt::Display for TriggerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, id) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id}")?;
        }
        write!(f, "}}")
    }
}

/// Deduplication identity of a crash: the sorted trigger ids joined by `+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrashKey(String);

impl CrashKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&TriggerSet> for CrashKey {
    fn from(set: &TriggerSet) -> Self {
        let parts: Vec<String> = set.iter().map(|id| id.to_string()).collect();
        CrashKey(parts.join(CRASH_KEY_SEPARATOR))
    }
}

impl fmt::Display for CrashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which injection points a trial runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionDirective {
    /// No directive at all; the binary falls back to its own default.
    Baseline,
    /// Only the listed injection points are enabled.
    Enable(TriggerSet),
}

impl InjectionDirective {
    /// Value for the `FIXREVERTER` variable, or `None` when the variable
    /// must be absent.
    pub fn env_value(&self) -> Option<String> {
        match self {
            InjectionDirective::Baseline => None,
            InjectionDirective::Enable(set) => {
                let mut value = String::from("on");
                for id in set.iter() {
                    value.push(' ');
                    value.push_str(&id.to_string());
                }
                Some(value)
            }
        }
    }
}
