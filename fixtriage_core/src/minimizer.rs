//! Combinatorial isolation of the injection points behind a crash.
//!
//! A crashing testcase is first replayed with no directive to learn which
//! injection points it triggers. Every subset of those points is then
//! replayed on its own, smallest subsets first, and each subset that still
//! crashes is recorded as a minimal cause. Candidates containing an
//! already-recorded cause are skipped without running the target.

use crate::executor::{Executor, ExecutorError};
use crate::injection::{InjectionDirective, TriggerSet};
use crate::injection_log;
use crate::oracle::{CrashReport, Oracle};
use std::path::Path;
use tracing::{debug, info};

/// Lexicographic `k`-combinations of a slice, by index.
pub struct Combinations<'a, T> {
    pool: &'a [T],
    indices: Vec<usize>,
    first: bool,
    done: bool,
}

pub fn combinations<T: Copy>(pool: &[T], k: usize) -> Combinations<'_, T> {
    Combinations {
        pool,
        indices: (0..k).collect(),
        first: true,
        done: k > pool.len(),
    }
}

impl<T: Copy> Iterator for Combinations<'_, T> {
    type Item = Vec<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let n = self.pool.len();
        let k = self.indices.len();
        if self.first {
            self.first = false;
        } else {
            // Rightmost index that has not reached its final position.
            let mut i = k;
            loop {
                if i == 0 {
                    self.done = true;
                    return None;
                }
                i -= 1;
                if self.indices[i] != i + n - k {
                    break;
                }
            }
            self.indices[i] += 1;
            for j in i + 1..k {
                self.indices[j] = self.indices[j - 1] + 1;
            }
        }
        Some(self.indices.iter().map(|&i| self.pool[i]).collect())
    }
}

/// What minimizing one testcase found.
#[derive(Debug, Clone, Default)]
pub struct MinimizationOutcome {
    /// Crash observed on the baseline run, if any.
    pub baseline: Option<CrashReport>,
    /// Injection points triggered on the baseline run.
    pub triggered: TriggerSet,
    /// Minimal crash-causing sets in discovery order. No set contains another.
    pub minimal_sets: Vec<TriggerSet>,
    /// Target executions, baseline included.
    pub executions: usize,
    /// Candidates skipped because they contain a known minimal set.
    pub pruned: usize,
}

/// Isolates the injection points responsible for a crash.
///
/// The `Minimizer` owns the `Executor` it replays testcases with and the
/// `Oracle` that judges each replay. It keeps no state between testcases.
pub struct Minimizer<E, O> {
    executor: E,
    oracle: O,
}

impl<E: Executor, O: Oracle> Minimizer<E, O> {
    /// Creates a new `Minimizer`.
    ///
    /// # Arguments
    /// * `executor`: runs the target once per candidate trigger set.
    /// * `oracle`: decides whether a run reproduced the crash.
    pub fn new(executor: E, oracle: O) -> Self {
        Self { executor, oracle }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Finds every minimal set of injection points that reproduces the
    /// crash of `testcase`.
    ///
    /// # Arguments
    /// * `testcase`: crashing input to replay.
    ///
    /// # Returns
    /// A `MinimizationOutcome` whose `minimal_sets` are pairwise
    /// incomparable. It is empty when the baseline run does not crash or the
    /// crash triggered no injection point. Errors only when the target could
    /// not be run; the outcome of the current testcase is then discarded.
    pub fn minimize(&mut self, testcase: &Path) -> Result<MinimizationOutcome, ExecutorError> {
        let target = self.executor.target().to_path_buf();
        let mut outcome = MinimizationOutcome::default();

        let baseline = self
            .executor
            .execute_sync(testcase, &InjectionDirective::Baseline)?;
        outcome.executions += 1;

        let Some(report) = self.oracle.examine(&baseline, &target) else {
            debug!("Baseline run of {testcase:?} did not crash");
            return Ok(outcome);
        };
        let triggered = injection_log::parse(&baseline.combined_output()).triggered;
        info!(
            "{testcase:?} crashes ({}) with triggered injections {triggered}",
            report.crash_type.replace('\n', " ")
        );
        outcome.baseline = Some(report);

        if triggered.is_empty() {
            info!("{testcase:?} crashed without triggering an injection");
            return Ok(outcome);
        }

        let ids = triggered.to_vec();
        outcome.triggered = triggered;

        for size in 1..=ids.len() {
            for candidate in combinations(&ids, size) {
                let candidate: TriggerSet = candidate.into_iter().collect();
                if outcome
                    .minimal_sets
                    .iter()
                    .any(|known| candidate.is_superset(known))
                {
                    outcome.pruned += 1;
                    continue;
                }

                let directive = InjectionDirective::Enable(candidate.clone());
                let result = self.executor.execute_sync(testcase, &directive)?;
                outcome.executions += 1;

                if self.oracle.is_crash(&result, &target) {
                    info!("{testcase:?} reproduces with only {candidate} enabled");
                    outcome.minimal_sets.push(candidate);
                }
            }
        }

        debug!(
            "Minimized {testcase:?}: {} minimal sets, {} executions, {} pruned",
            outcome.minimal_sets.len(),
            outcome.executions,
            outcome.pruned
        );
        Ok(outcome)
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::{MarkerOracle, Script, ScriptedExecutor};
    use super::*;
    use crate::executor::ExecutionResult;

    fn set<const N: usize>(ids: [u64; N]) -> TriggerSet {
        TriggerSet::from(ids)
    }

    fn minimizer(script: Script) -> Minimizer<ScriptedExecutor, MarkerOracle> {
        Minimizer::new(ScriptedExecutor::new([("crash-1", script)]), MarkerOracle)
    }

    #[test]
    fn combinations_are_lexicographic() {
        let got: Vec<Vec<u64>> = combinations(&[1, 2, 3], 2).collect();
        assert_eq!(got, vec![vec![1, 2], vec![1, 3], vec![2, 3]]);
        let all: Vec<Vec<u64>> = combinations(&[4, 5, 6], 3).collect();
        assert_eq!(all, vec![vec![4, 5, 6]]);
    }

    #[test]
    fn combinations_edge_sizes() {
        assert_eq!(combinations(&[1u64, 2], 3).count(), 0);
        assert_eq!(combinations(&[1u64, 2], 0).collect::<Vec<_>>(), vec![Vec::<u64>::new()]);
        assert_eq!(combinations(&[0u64; 6], 3).count(), 20);
    }

    #[test]
    fn superset_of_found_cause_is_never_executed() {
        let mut m = minimizer(Script {
            triggered: set([1, 2]),
            causes: vec![set([1])],
        });
        let outcome = m.minimize(Path::new("/crashes/crash-1")).unwrap();

        assert_eq!(outcome.minimal_sets, vec![set([1])]);
        assert_eq!(outcome.triggered, set([1, 2]));
        assert_eq!(outcome.executions, 3);
        assert_eq!(outcome.pruned, 1);
        assert_eq!(
            m.executor().directives(),
            vec![
                InjectionDirective::Baseline,
                InjectionDirective::Enable(set([1])),
                InjectionDirective::Enable(set([2])),
            ]
        );
    }

    #[test]
    fn non_crashing_baseline_runs_nothing_else() {
        let mut m = minimizer(Script {
            triggered: set([1, 2, 3]),
            causes: vec![],
        });
        let outcome = m.minimize(Path::new("/crashes/crash-1")).unwrap();
        assert!(outcome.minimal_sets.is_empty());
        assert!(outcome.baseline.is_none());
        assert_eq!(outcome.executions, 1);
        assert_eq!(m.executor().calls.len(), 1);
    }

    #[test]
    fn crash_without_triggers_is_not_minimized() {
        let mut m = minimizer(Script {
            triggered: TriggerSet::new(),
            causes: vec![TriggerSet::new()],
        });
        let outcome = m.minimize(Path::new("/crashes/crash-1")).unwrap();
        assert!(outcome.baseline.is_some());
        assert!(outcome.minimal_sets.is_empty());
        assert_eq!(m.executor().calls.len(), 1);
    }

    #[test]
    fn disjoint_causes_are_all_found() {
        let mut m = minimizer(Script {
            triggered: set([1, 2, 3]),
            causes: vec![set([1]), set([2, 3])],
        });
        let outcome = m.minimize(Path::new("/crashes/crash-1")).unwrap();
        assert_eq!(outcome.minimal_sets, vec![set([1]), set([2, 3])]);
        // baseline, {1}, {2}, {3}, {2,3}; {1,2}, {1,3} and {1,2,3} are pruned.
        assert_eq!(outcome.executions, 5);
        assert_eq!(outcome.pruned, 3);
    }

    #[test]
    fn cause_needing_every_trigger() {
        let mut m = minimizer(Script {
            triggered: set([4, 9]),
            causes: vec![set([4, 9])],
        });
        let outcome = m.minimize(Path::new("/crashes/crash-1")).unwrap();
        assert_eq!(outcome.minimal_sets, vec![set([4, 9])]);
        assert_eq!(outcome.executions, 4);
        assert_eq!(outcome.pruned, 0);
    }

    #[test]
    fn minimal_sets_are_pairwise_incomparable() {
        let scenarios = vec![
            vec![set([1]), set([1, 2])],
            vec![set([2, 3]), set([1, 2, 3]), set([4])],
            vec![set([1, 5]), set([2, 5]), set([1, 2])],
            vec![set([3]), set([3, 4, 5]), set([1, 2, 4])],
        ];
        for causes in scenarios {
            let mut m = minimizer(Script {
                triggered: set([1, 2, 3, 4, 5]),
                causes: causes.clone(),
            });
            let found = m.minimize(Path::new("/crashes/crash-1")).unwrap().minimal_sets;
            assert!(!found.is_empty(), "{causes:?}");
            for (i, a) in found.iter().enumerate() {
                for (j, b) in found.iter().enumerate() {
                    if i != j {
                        assert!(!a.is_superset(b), "{a} contains {b} for {causes:?}");
                    }
                }
            }
            // Every genuinely minimal cause is recovered.
            for cause in &causes {
                if !causes.iter().any(|c| c != cause && cause.is_superset(c)) {
                    assert!(found.contains(cause), "missing {cause} for {causes:?}");
                }
            }
        }
    }

    struct BrokenExecutor;

    impl Executor for BrokenExecutor {
        fn target(&self) -> &Path {
            Path::new("/missing/fuzz_target")
        }

        fn execute_sync(
            &mut self,
            _testcase: &Path,
            _directive: &InjectionDirective,
        ) -> Result<ExecutionResult, ExecutorError> {
            Err(ExecutorError::Spawn {
                binary: self.target().to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        }
    }

    #[test]
    fn spawn_failure_is_surfaced() {
        let mut m = Minimizer::new(BrokenExecutor, MarkerOracle);
        let err = m.minimize(Path::new("/crashes/crash-1")).unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }
}
