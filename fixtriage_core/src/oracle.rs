//! Deciding whether a run of the target is a crash worth root-causing.
//!
//! Raw output is handed to a `StackClassifier`, which extracts a crash type
//! and crash state in the style of ClusterFuzz. `CrashOracle` then throws
//! away hangs, runs with no usable stack, and resource-limit crashes.

use crate::executor::ExecutionResult;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

/// Crash types that say nothing about the injected logic bugs.
pub const UNINTERESTING_CRASH_TYPES: &[&str] = &["Timeout", "Out-of-memory"];

/// Crash state used when a crash is detected but no frame survives filtering.
const NULL_STATE: &str = "NULL";
/// Number of frames that make up a crash state.
const STATE_FRAMES: usize = 3;

static SIZE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s([0-9]+|\{\*\})$").expect("valid size regex"));
static CPLUSPLUS_TEMPLATE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)(<[^>]+>|<[^\n]+$)").expect("valid template regex"));
static SANITIZER_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"ERROR: (AddressSanitizer|HWAddressSanitizer|MemorySanitizer|ThreadSanitizer|LeakSanitizer|UndefinedBehaviorSanitizer): (.*)$",
    )
    .expect("valid sanitizer regex")
});
static LIBFUZZER_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ERROR: libFuzzer: (.*)$").expect("valid libFuzzer regex"));
static UBSAN_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"runtime error: (.*)$").expect("valid ubsan regex"));
static ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"on (?:unknown )?address (0x[0-9a-fA-F]+)").expect("valid address regex")
});
static ACCESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(READ|WRITE) of size (\d+)").expect("valid access regex"));
static FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*#(\d+)\s+0x[0-9a-fA-F]+\s+in\s+(.+)$").expect("valid frame regex")
});
static IGNORED_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(__asan|__hwasan|__msan|__tsan|__lsan|__ubsan|__sanitizer|__interceptor_|fuzzer::|LLVMFuzzerTestOneInput$|main$|__libc_start|_start$|abort$|raise$|gsignal$)",
    )
    .expect("valid ignore regex")
});

/// Strips trailing access sizes such as `\nREAD 4`'s `4`.
pub fn filter_crash_type(crash_type: &str) -> String {
    SIZE_REGEX.replace(crash_type, "").into_owned()
}

/// Strips simple C++ template arguments such as `<int>`.
pub fn filter_crash_state(crash_state: &str) -> String {
    CPLUSPLUS_TEMPLATE_REGEX.replace_all(crash_state, "").into_owned()
}

/// Result of analysing a target's output for a crash.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackAnalysis {
    pub crash_type: String,
    pub crash_state: String,
    pub crash_address: Option<String>,
}

/// Extracts crash type and crash state from raw process output.
///
/// This is the seam for an external stack analyzer; `SanitizerStackParser`
/// is the built-in implementation.
pub trait StackClassifier: Send + Sync {
    /// Analyses the combined output of one run.
    ///
    /// # Arguments
    /// * `output`: stdout followed by stderr of the target.
    /// * `fuzz_target`: file name of the target binary.
    ///
    /// # Returns
    /// A `StackAnalysis`. An empty `crash_state` means no crash was found.
    fn classify(&self, output: &str, fuzz_target: &str) -> StackAnalysis;
}

/// Heuristic parser for sanitizer, UBSan and libFuzzer reports.
#[derive(Debug, Clone)]
pub struct SanitizerStackParser {
    pub detect_ooms_and_hangs: bool,
    pub include_ubsan: bool,
}

impl Default for SanitizerStackParser {
    fn default() -> Self {
        Self {
            detect_ooms_and_hangs: true,
            include_ubsan: true,
        }
    }
}

fn capitalize(kind: &str) -> String {
    let mut chars = kind.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl SanitizerStackParser {
    fn sanitizer_type(&self, sanitizer: &str, message: &str) -> Option<String> {
        if sanitizer == "UndefinedBehaviorSanitizer" && !self.include_ubsan {
            return None;
        }
        if sanitizer == "LeakSanitizer" {
            return Some("Direct-leak".to_string());
        }
        if message.starts_with("out of memory") || message.starts_with("allocator is out of memory") {
            return self.detect_ooms_and_hangs.then(|| "Out-of-memory".to_string());
        }
        let kind = message.split_whitespace().next()?.trim_end_matches(':');
        if kind == "SEGV" {
            let null_like = ADDRESS
                .captures(message)
                .and_then(|c| u64::from_str_radix(c[1].trim_start_matches("0x"), 16).ok())
                .is_some_and(|addr| addr < 4096);
            return Some(if null_like { "Null-dereference" } else { "UNKNOWN" }.to_string());
        }
        Some(capitalize(kind))
    }

    fn libfuzzer_type(&self, message: &str) -> Option<String> {
        if message.starts_with("timeout") {
            self.detect_ooms_and_hangs.then(|| "Timeout".to_string())
        } else if message.starts_with("out-of-memory") || message.starts_with("malloc limit") {
            self.detect_ooms_and_hangs.then(|| "Out-of-memory".to_string())
        } else if message.starts_with("deadly signal") {
            Some("Fatal-signal".to_string())
        } else if message.starts_with("fuzz target exited") {
            Some("Unexpected-exit".to_string())
        } else {
            None
        }
    }

    fn ubsan_type(&self, message: &str) -> Option<String> {
        if !self.include_ubsan {
            return None;
        }
        let kind = if message.contains("integer overflow") {
            "Integer-overflow"
        } else if message.contains("division by zero") {
            "Divide-by-zero"
        } else {
            "Undefined-behavior"
        };
        Some(kind.to_string())
    }

    /// Function name of a symbolized frame, without location or parameters.
    fn frame_function(rest: &str) -> &str {
        let without_location = match rest.rsplit_once(' ') {
            Some((func, location))
                if location.contains('/') || location.starts_with('(') || location.contains(':') =>
            {
                func
            }
            _ => rest,
        };
        let trimmed = without_location.trim();
        match trimmed.find('(') {
            Some(0) | None => trimmed,
            Some(idx) => &trimmed[..idx],
        }
    }

    fn crash_state(lines: &[&str]) -> String {
        let mut frames = Vec::new();
        let mut seen_frame = false;
        for line in lines {
            let Some(caps) = FRAME.captures(line) else {
                continue;
            };
            if &caps[1] == "0" && seen_frame {
                // Start of an auxiliary stack (allocation/free site).
                break;
            }
            seen_frame = true;
            let func = Self::frame_function(caps.get(2).map_or("", |m| m.as_str()));
            if func.is_empty() || IGNORED_FRAME.is_match(func) {
                continue;
            }
            frames.push(func.to_string());
            if frames.len() == STATE_FRAMES {
                break;
            }
        }
        if frames.is_empty() {
            return NULL_STATE.to_string();
        }
        let mut state = String::new();
        for frame in frames {
            state.push_str(&frame);
            state.push('\n');
        }
        state
    }
}

impl StackClassifier for SanitizerStackParser {
    fn classify(&self, output: &str, _fuzz_target: &str) -> StackAnalysis {
        let lines: Vec<&str> = output.lines().collect();

        for (idx, line) in lines.iter().enumerate() {
            let header = if let Some(caps) = SANITIZER_HEADER.captures(line) {
                self.sanitizer_type(&caps[1], &caps[2])
                    .map(|t| (t, ADDRESS.captures(&caps[2]).map(|a| a[1].to_string())))
            } else if let Some(caps) = LIBFUZZER_HEADER.captures(line) {
                self.libfuzzer_type(&caps[1]).map(|t| (t, None))
            } else if let Some(caps) = UBSAN_HEADER.captures(line) {
                self.ubsan_type(&caps[1]).map(|t| (t, None))
            } else {
                None
            };
            let Some((mut crash_type, crash_address)) = header else {
                continue;
            };

            let rest = &lines[idx + 1..];
            if let Some(caps) = rest.iter().take(3).find_map(|l| ACCESS.captures(l)) {
                crash_type = format!("{crash_type}\n{} {}", &caps[1], &caps[2]);
            }
            return StackAnalysis {
                crash_type,
                crash_state: Self::crash_state(rest),
                crash_address,
            };
        }
        StackAnalysis::default()
    }
}

/// A crash an `Oracle` considers worth root-causing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub fuzz_target: String,
    pub crash_type: String,
    pub crash_state: String,
    pub crash_address: Option<String>,
}

/// An `Oracle` examines the outcome of one execution of the target to decide
/// whether it is an interesting crash.
pub trait Oracle: Send + Sync {
    /// Examines a finished execution.
    ///
    /// # Arguments
    /// * `result`: status and captured output of the run. A timed-out run may
    ///   still carry a report if the target printed one before the watchdog.
    /// * `target`: path of the binary that was run.
    ///
    /// # Returns
    /// `Some(CrashReport)` when the run crashed in a way worth root-causing,
    /// otherwise `None`.
    fn examine(&self, result: &ExecutionResult, target: &Path) -> Option<CrashReport>;

    /// Shorthand for `examine(..).is_some()`.
    fn is_crash(&self, result: &ExecutionResult, target: &Path) -> bool {
        self.examine(result, target).is_some()
    }
}

/// Reports crashes found by a `StackClassifier`, ignoring hangs, timeouts
/// and out-of-memory conditions.
#[derive(Debug, Default)]
pub struct CrashOracle<C = SanitizerStackParser> {
    classifier: C,
}

impl CrashOracle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C: StackClassifier> CrashOracle<C> {
    pub fn with_classifier(classifier: C) -> Self {
        Self { classifier }
    }
}

impl<C: StackClassifier> Oracle for CrashOracle<C> {
    fn examine(&self, result: &ExecutionResult, target: &Path) -> Option<CrashReport> {
        let output = result.combined_output();
        if output.is_empty() {
            if result.timed_out() {
                debug!("Target hung without output, not a crash");
            }
            return None;
        }

        let fuzz_target = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let analysis = self.classifier.classify(&output, &fuzz_target);
        if analysis.crash_state.is_empty() {
            return None;
        }

        let crash_type = filter_crash_type(&analysis.crash_type);
        if UNINTERESTING_CRASH_TYPES.contains(&crash_type.as_str()) {
            debug!("Ignoring uninteresting crash type {crash_type}");
            return None;
        }

        Some(CrashReport {
            fuzz_target,
            crash_type,
            crash_state: filter_crash_state(&analysis.crash_state),
            crash_address: analysis.crash_address,
        })
    }
}
