//! Parsing of the injection events an instrumented binary prints.
//!
//! The binary reports every injection site it passes through with a line
//! ending in `reached bug index <N>`, and every site whose injected bug
//! actually fired with `triggered bug index <N>`.

use crate::injection::{InjectionId, TriggerSet};
use thiserror::Error;
use tracing::warn;

pub const TRIGGERED_MARKER: &str = "triggered bug index";
pub const REACHED_MARKER: &str = "reached bug index";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogParseError {
    #[error("Injection line has no trailing id: {line:?}")]
    MissingId { line: String },
    #[error("Injection line has a non-numeric id {token:?}: {line:?}")]
    InvalidId { line: String, token: String },
}

/// One recognised injection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionEvent {
    Reached(InjectionId),
    Triggered(InjectionId),
}

/// Reached and triggered injection points seen in one execution.
///
/// Every triggered id is also recorded as reached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InjectionLog {
    pub reached: TriggerSet,
    pub triggered: TriggerSet,
}

impl InjectionLog {
    pub fn record(&mut self, event: InjectionEvent) {
        match event {
            InjectionEvent::Triggered(id) => {
                self.reached.insert(id);
                self.triggered.insert(id);
            }
            InjectionEvent::Reached(id) => {
                self.reached.insert(id);
            }
        }
    }
}

/// Classifies a single output line.
///
/// Returns `Ok(None)` for lines that carry no injection event.
pub fn parse_line(line: &str) -> Result<Option<InjectionEvent>, LogParseError> {
    if line.contains(TRIGGERED_MARKER) {
        trailing_id(line).map(|id| Some(InjectionEvent::Triggered(id)))
    } else if line.contains(REACHED_MARKER) {
        trailing_id(line).map(|id| Some(InjectionEvent::Reached(id)))
    } else {
        Ok(None)
    }
}

fn trailing_id(line: &str) -> Result<InjectionId, LogParseError> {
    let token = line
        .split_whitespace()
        .next_back()
        .ok_or_else(|| LogParseError::MissingId {
            line: line.to_string(),
        })?;
    token.parse().map_err(|_| LogParseError::InvalidId {
        line: line.to_string(),
        token: token.to_string(),
    })
}

/// Collects every injection event in `output`.
///
/// Malformed injection lines are logged and skipped so that one bad line
/// does not discard the rest of the trial.
pub fn parse(output: &str) -> InjectionLog {
    let mut log = InjectionLog::default();
    for line in output.lines() {
        match parse_line(line) {
            Ok(Some(event)) => log.record(event),
            Ok(None) => {}
            Err(e) => warn!("Skipping malformed injection line: {e}"),
        }
    }
    log
}
