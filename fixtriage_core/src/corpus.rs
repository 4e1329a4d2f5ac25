use crate::dedup::{Crash, CrashSet};
use crate::executor::{Executor, ExecutorError};
use crate::injection::{InjectionDirective, TriggerSet};
use crate::injection_log::{self, InjectionLog};
use crate::minimizer::Minimizer;
use crate::oracle::Oracle;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info};
use walkdir::WalkDir;

/// File name prefixes libFuzzer gives to inputs that only hit a resource
/// limit. They are not worth replaying.
pub const DEFAULT_SKIP_PREFIXES: &[&str] = &["oom-", "timeout-"];

/// Defines errors that can arise while walking a corpus.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The corpus root is missing or is not a directory.
    #[error("Corpus directory {0:?} does not exist or is not a directory")]
    NotADirectory(PathBuf),

    /// Directory traversal failed part-way.
    #[error("Failed to walk corpus directory {dir:?}: {source}")]
    Walk {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    /// Running the target on a testcase failed and the walk was configured
    /// to abort.
    #[error("Execution of testcase {testcase:?} failed: {source}")]
    Execution {
        testcase: PathBuf,
        #[source]
        source: ExecutorError,
    },
}

/// What to do when the target cannot be run for a testcase.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Stop the walk and return the error.
    Abort,
    /// Record the failure in the report and carry on.
    #[default]
    Skip,
}

/// A testcase the target could not be run on.
#[derive(Debug, Clone, Serialize)]
pub struct TestcaseFailure {
    pub testcase: PathBuf,
    pub error: String,
}

/// Counters for one corpus walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub testcases: usize,
    pub skipped: usize,
    pub executions: usize,
}

/// Result of a crashes run.
#[derive(Debug, Default, Serialize)]
pub struct CrashRunReport {
    pub crashes: CrashSet,
    pub failures: Vec<TestcaseFailure>,
    #[serde(skip)]
    pub stats: RunStats,
}

/// Injection points reached and triggered across a whole corpus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FixReverterCoverage {
    pub reaches: TriggerSet,
    pub triggers: TriggerSet,
}

impl FixReverterCoverage {
    /// Folds one execution's log into the accumulated coverage.
    pub fn absorb(mut self, log: &InjectionLog) -> Self {
        self.reaches.union_with(&log.reached);
        self.triggers.union_with(&log.triggered);
        self
    }
}

/// Result of a coverage run.
#[derive(Debug, Default, Serialize)]
pub struct CoverageRunReport {
    #[serde(flatten)]
    pub coverage: FixReverterCoverage,
    pub failures: Vec<TestcaseFailure>,
    #[serde(skip)]
    pub stats: RunStats,
}

/// Iterates the testcases below one directory and feeds them to the
/// target.
///
/// Files are visited recursively in file-name order, which makes the
/// last-write-wins deduplication of a crashes run deterministic. Name
/// prefixes only filter crashes runs; a coverage run executes every unit.
#[derive(Debug, Clone)]
pub struct CorpusWalker {
    root: PathBuf,
    skip_prefixes: Vec<String>,
    on_error: ErrorPolicy,
}

impl CorpusWalker {
    /// Creates a walker over `root` with the default skip prefixes and the
    /// `Skip` error policy.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            skip_prefixes: DEFAULT_SKIP_PREFIXES.iter().map(|p| p.to_string()).collect(),
            on_error: ErrorPolicy::default(),
        }
    }

    pub fn with_skip_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.skip_prefixes = prefixes;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every file below the root, recursively, in file-name order.
    pub fn testcases(&self) -> Result<Vec<PathBuf>, CorpusError> {
        if !self.root.is_dir() {
            return Err(CorpusError::NotADirectory(self.root.clone()));
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|source| CorpusError::Walk {
                dir: self.root.clone(),
                source,
            })?;
            if entry.path().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    /// Whether a crash testcase is filtered out by name before any run.
    pub fn is_skipped(&self, testcase: &Path) -> bool {
        let Some(name) = testcase.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        self.skip_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    fn relative(&self, testcase: &Path) -> PathBuf {
        testcase
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| testcase.to_path_buf())
    }

    fn handle_failure(
        &self,
        testcase: &Path,
        source: ExecutorError,
        failures: &mut Vec<TestcaseFailure>,
    ) -> Result<(), CorpusError> {
        match self.on_error {
            ErrorPolicy::Abort => Err(CorpusError::Execution {
                testcase: testcase.to_path_buf(),
                source,
            }),
            ErrorPolicy::Skip => {
                error!("Skipping {testcase:?}: {source}");
                failures.push(TestcaseFailure {
                    testcase: self.relative(testcase),
                    error: source.to_string(),
                });
                Ok(())
            }
        }
    }

    /// Minimizes every crash testcase and deduplicates the minimal trigger
    /// sets found.
    ///
    /// # Arguments
    /// * `minimizer`: replays each testcase against the target.
    ///
    /// # Returns
    /// A `CrashRunReport` keyed by trigger set, or a `CorpusError` if the
    /// directory cannot be walked or a run fails under `ErrorPolicy::Abort`.
    pub fn run_crashes<E: Executor, O: Oracle>(
        &self,
        minimizer: &mut Minimizer<E, O>,
    ) -> Result<CrashRunReport, CorpusError> {
        let mut report = CrashRunReport::default();

        for testcase in self.testcases()? {
            if self.is_skipped(&testcase) {
                debug!("Skipping {testcase:?} by name");
                report.stats.skipped += 1;
                continue;
            }
            report.stats.testcases += 1;

            let outcome = match minimizer.minimize(&testcase) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.handle_failure(&testcase, e, &mut report.failures)?;
                    continue;
                }
            };
            report.stats.executions += outcome.executions;

            let relative = self.relative(&testcase);
            for triggers in outcome.minimal_sets {
                let crash = Crash {
                    testcase: relative.clone(),
                    triggers,
                };
                let key = crash.key();
                if let Some(previous) = report.crashes.insert(crash) {
                    debug!("Crash {key} from {:?} replaced by {relative:?}", previous.testcase);
                }
            }
        }

        info!(
            "Crashes run over {:?}: {} testcases, {} skipped, {} executions, {} unique crashes, {} failures",
            self.root,
            report.stats.testcases,
            report.stats.skipped,
            report.stats.executions,
            report.crashes.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Runs every unit once and collects the injection points it reaches
    /// and triggers.
    pub fn run_coverage<E: Executor>(
        &self,
        executor: &mut E,
    ) -> Result<CoverageRunReport, CorpusError> {
        let mut coverage = FixReverterCoverage::default();
        let mut failures = Vec::new();
        let mut stats = RunStats::default();

        for unit in self.testcases()? {
            stats.testcases += 1;
            match executor.execute_sync(&unit, &InjectionDirective::Baseline) {
                Ok(result) => {
                    stats.executions += 1;
                    coverage = coverage.absorb(&injection_log::parse(&result.combined_output()));
                }
                Err(e) => self.handle_failure(&unit, e, &mut failures)?,
            }
        }

        info!(
            "Coverage run over {:?}: {} units, {} reached, {} triggered",
            self.root,
            stats.testcases,
            coverage.reaches.len(),
            coverage.triggers.len()
        );
        Ok(CoverageRunReport {
            coverage,
            failures,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionResult;
    use crate::minimizer::test_utils::{MarkerOracle, Script, ScriptedExecutor};
    use std::fs;

    fn touch(root: &Path, relative: &str) -> PathBuf {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, b"").unwrap();
        path
    }

    fn script(triggered: &[u64], causes: &[&[u64]]) -> Script {
        Script {
            triggered: triggered.iter().copied().collect(),
            causes: causes.iter().map(|c| c.iter().copied().collect()).collect(),
        }
    }

    #[test]
    fn testcases_are_found_recursively_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "b");
        touch(dir.path(), "a/nested/c");
        touch(dir.path(), "a/z");

        let walker = CorpusWalker::new(dir.path());
        let found: Vec<PathBuf> = walker
            .testcases()
            .unwrap()
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            found,
            vec![
                PathBuf::from("a/nested/c"),
                PathBuf::from("a/z"),
                PathBuf::from("b")
            ]
        );
    }

    #[test]
    fn missing_root_is_an_error() {
        let walker = CorpusWalker::new("/definitely/not/a/corpus/dir");
        assert!(matches!(walker.testcases(), Err(CorpusError::NotADirectory(_))));
    }

    #[test]
    fn oom_and_timeout_testcases_are_never_run() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "oom-1234");
        touch(dir.path(), "timeout-5678");
        touch(dir.path(), "crash-1");

        let executor = ScriptedExecutor::new([
            ("oom-1234", script(&[1], &[&[1]])),
            ("timeout-5678", script(&[2], &[&[2]])),
            ("crash-1", script(&[3], &[&[3]])),
        ]);
        let mut minimizer = Minimizer::new(executor, MarkerOracle);
        let report = CorpusWalker::new(dir.path())
            .run_crashes(&mut minimizer)
            .unwrap();

        assert_eq!(report.stats.skipped, 2);
        assert_eq!(report.stats.testcases, 1);
        let keys: Vec<&str> = report.crashes.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["3"]);
        assert!(
            minimizer
                .executor()
                .calls
                .iter()
                .all(|(path, _)| path.ends_with("crash-1"))
        );
    }

    #[test]
    fn same_trigger_set_from_two_testcases_keeps_the_last() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "crash-a");
        touch(dir.path(), "sub/crash-b");

        let executor = ScriptedExecutor::new([
            ("crash-a", script(&[1, 2], &[&[1]])),
            ("crash-b", script(&[1], &[&[1]])),
        ]);
        let mut minimizer = Minimizer::new(executor, MarkerOracle);
        let report = CorpusWalker::new(dir.path())
            .run_crashes(&mut minimizer)
            .unwrap();

        assert_eq!(report.crashes.len(), 1);
        let key = TriggerSet::from([1]).key();
        let kept = report.crashes.get(&key).unwrap();
        // "crash-a" sorts before "sub", so sub/crash-b is processed last.
        assert_eq!(kept.testcase, PathBuf::from("sub/crash-b"));
        assert_eq!(kept.triggers, TriggerSet::from([1]));
    }

    #[test]
    fn custom_skip_prefixes_replace_defaults() {
        let walker = CorpusWalker::new("/crashes").with_skip_prefixes(vec!["leak-".to_string()]);
        assert!(walker.is_skipped(Path::new("/crashes/leak-1")));
        assert!(!walker.is_skipped(Path::new("/crashes/oom-1")));
    }

    /// Fails to start for testcases whose name begins with `broken`.
    struct FlakyExecutor(ScriptedExecutor);

    impl Executor for FlakyExecutor {
        fn target(&self) -> &Path {
            self.0.target()
        }

        fn execute_sync(
            &mut self,
            testcase: &Path,
            directive: &InjectionDirective,
        ) -> Result<ExecutionResult, ExecutorError> {
            let broken = testcase
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("broken"));
            if broken {
                return Err(ExecutorError::Spawn {
                    binary: self.0.target.clone(),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                });
            }
            self.0.execute_sync(testcase, directive)
        }
    }

    fn flaky_corpus() -> (tempfile::TempDir, FlakyExecutor) {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "broken-1");
        touch(dir.path(), "crash-2");
        let executor = FlakyExecutor(ScriptedExecutor::new([("crash-2", script(&[7], &[&[7]]))]));
        (dir, executor)
    }

    #[test]
    fn skip_policy_reports_failures_and_continues() {
        let (dir, executor) = flaky_corpus();
        let mut minimizer = Minimizer::new(executor, MarkerOracle);
        let report = CorpusWalker::new(dir.path())
            .with_error_policy(ErrorPolicy::Skip)
            .run_crashes(&mut minimizer)
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].testcase, PathBuf::from("broken-1"));
        assert_eq!(report.crashes.len(), 1);
    }

    #[test]
    fn abort_policy_stops_the_walk() {
        let (dir, executor) = flaky_corpus();
        let mut minimizer = Minimizer::new(executor, MarkerOracle);
        let err = CorpusWalker::new(dir.path())
            .with_error_policy(ErrorPolicy::Abort)
            .run_crashes(&mut minimizer)
            .unwrap_err();

        match err {
            CorpusError::Execution { testcase, .. } => assert!(testcase.ends_with("broken-1")),
            other => panic!("Expected execution error, got {other:?}"),
        }
        assert!(minimizer.executor().0.calls.is_empty());
    }

    #[test]
    fn coverage_is_the_union_over_units() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "unit-1");
        touch(dir.path(), "unit-2");
        touch(dir.path(), "oom-3");

        let mut executor = ScriptedExecutor::new([
            ("unit-1", script(&[1, 2], &[])),
            ("unit-2", script(&[2, 5], &[])),
            ("oom-3", script(&[9], &[])),
        ]);
        let report = CorpusWalker::new(dir.path())
            .run_coverage(&mut executor)
            .unwrap();

        // Units are never filtered by name and never minimized.
        assert_eq!(report.stats.executions, 3);
        assert_eq!(report.coverage.triggers, TriggerSet::from([1, 2, 5, 9]));
        assert!(report.coverage.reaches.is_superset(&report.coverage.triggers));
        assert!(
            executor
                .directives()
                .iter()
                .all(|d| *d == InjectionDirective::Baseline)
        );
    }

    #[test]
    fn reports_serialize_without_counters() {
        let mut crashes = CrashRunReport::default();
        crashes.crashes.insert(Crash {
            testcase: PathBuf::from("crash-a"),
            triggers: TriggerSet::from([2]),
        });
        crashes.failures.push(TestcaseFailure {
            testcase: PathBuf::from("broken-1"),
            error: "denied".to_string(),
        });
        crashes.stats.executions = 4;
        assert_eq!(
            serde_json::to_value(&crashes).unwrap(),
            serde_json::json!({
                "crashes": { "2": { "testcase": "crash-a", "triggers": [2] } },
                "failures": [{ "testcase": "broken-1", "error": "denied" }],
            })
        );

        let coverage = CoverageRunReport {
            coverage: FixReverterCoverage::default()
                .absorb(&injection_log::parse("triggered bug index 1\nreached bug index 3\n")),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&coverage).unwrap(),
            serde_json::json!({ "reaches": [1, 3], "triggers": [1], "failures": [] })
        );
    }

    #[test]
    fn absorb_unions_both_sets() {
        let log = injection_log::parse("triggered bug index 1\nreached bug index 4\n");
        let coverage = FixReverterCoverage::default()
            .absorb(&log)
            .absorb(&injection_log::parse("reached bug index 6\n"));
        assert_eq!(coverage.reaches, TriggerSet::from([1, 4, 6]));
        assert_eq!(coverage.triggers, TriggerSet::from([1]));
    }
}
