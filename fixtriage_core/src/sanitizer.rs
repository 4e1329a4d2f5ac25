use std::collections::BTreeMap;

/// Options shared by every sanitizer runtime for triage runs.
const BASE_OPTIONS: &[(&str, &str)] = &[
    ("alloc_dealloc_mismatch", "0"),
    ("allocator_may_return_null", "1"),
    ("allocator_release_to_os_interval_ms", "500"),
    ("allow_user_segv_handler", "0"),
    ("check_malloc_usable_size", "0"),
    ("dedup_token_length", "3"),
    ("detect_leaks", "1"),
    ("detect_odr_violation", "0"),
    ("detect_stack_use_after_return", "1"),
    ("fast_unwind_on_fatal", "0"),
    ("handle_abort", "2"),
    ("handle_segv", "2"),
    ("handle_sigbus", "2"),
    ("handle_sigfpe", "2"),
    ("handle_sigill", "2"),
    ("max_uar_stack_size_log", "16"),
    ("quarantine_size_mb", "64"),
    ("strict_memcmp", "1"),
    ("symbolize", "1"),
    ("symbolize_inline_frames", "0"),
];

/// UBSan only prints a stack when asked to, and must stop at the first
/// report for the stack to be classifiable.
const UBSAN_EXTRA: &[(&str, &str)] = &[("halt_on_error", "1"), ("print_stacktrace", "1")];

/// Sanitizer runtime options merged into the target's environment.
#[derive(Debug, Clone)]
pub struct SanitizerOptions {
    options: BTreeMap<String, String>,
}

impl Default for SanitizerOptions {
    fn default() -> Self {
        Self {
            options: BASE_OPTIONS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl SanitizerOptions {
    /// Defaults overridden by `overrides`.
    pub fn with_overrides(overrides: &BTreeMap<String, String>) -> Self {
        let mut opts = Self::default();
        for (key, value) in overrides {
            opts.options.insert(key.clone(), value.clone());
        }
        opts
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    fn render(options: &BTreeMap<String, String>) -> String {
        options
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// `(variable, value)` pairs to set on the child process.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let common = Self::render(&self.options);
        let mut ubsan = self.options.clone();
        for (k, v) in UBSAN_EXTRA {
            ubsan.entry(k.to_string()).or_insert_with(|| v.to_string());
        }
        vec![
            ("ASAN_OPTIONS", common.clone()),
            ("MSAN_OPTIONS", common),
            ("UBSAN_OPTIONS", Self::render(&ubsan)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_colon_separated() {
        let vars = SanitizerOptions::default().env_vars();
        let (_, asan) = vars.iter().find(|(k, _)| *k == "ASAN_OPTIONS").unwrap();
        assert!(asan.starts_with("alloc_dealloc_mismatch=0:"));
        assert!(asan.contains(":symbolize=1:"));
        assert!(!asan.contains("print_stacktrace"));
    }

    #[test]
    fn ubsan_gets_stacktraces() {
        let vars = SanitizerOptions::default().env_vars();
        let (_, ubsan) = vars.iter().find(|(k, _)| *k == "UBSAN_OPTIONS").unwrap();
        assert!(ubsan.contains("print_stacktrace=1"));
        assert!(ubsan.contains("halt_on_error=1"));
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut overrides = BTreeMap::new();
        overrides.insert("detect_leaks".to_string(), "0".to_string());
        overrides.insert("abort_on_error".to_string(), "1".to_string());
        let opts = SanitizerOptions::with_overrides(&overrides);
        assert_eq!(opts.get("detect_leaks"), Some("0"));
        assert_eq!(opts.get("abort_on_error"), Some("1"));
        assert_eq!(opts.get("symbolize"), Some("1"));
    }
}
