pub mod config;
pub mod corpus;
pub mod dedup;
pub mod executor;
pub mod injection;
pub mod injection_log;
pub mod minimizer;
pub mod oracle;
pub mod sanitizer;

pub use config::TriageConfig;
pub use corpus::{
    CorpusError, CorpusWalker, CoverageRunReport, CrashRunReport, ErrorPolicy, FixReverterCoverage,
};
pub use dedup::{Crash, CrashSet};
pub use executor::{
    CommandExecutor, CommandExecutorConfig, ExecutionResult, ExecutionStatus, Executor,
    ExecutorError,
};
pub use injection::{CrashKey, InjectionDirective, InjectionId, TriggerSet};
pub use injection_log::{InjectionLog, LogParseError};
pub use minimizer::{MinimizationOutcome, Minimizer};
pub use oracle::{CrashOracle, CrashReport, Oracle, SanitizerStackParser, StackClassifier};
pub use sanitizer::SanitizerOptions;
