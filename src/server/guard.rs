// src/server/guard.rs

use std::time::{Duration, Instant};

use crate::errors::{HarnessError, Result};

/// Per-case wall-clock ceiling, checked explicitly at chosen call sites.
///
/// Nothing is interrupted in the background: work between two checks runs to
/// completion, and the next `check` reports the overrun.
#[derive(Debug, Clone)]
pub struct CaseGuard {
    case: String,
    started: Instant,
    limit: Duration,
}

impl CaseGuard {
    pub fn new(case: impl Into<String>, limit: Duration) -> Self {
        Self::starting_at(case, Instant::now(), limit)
    }

    pub fn starting_at(case: impl Into<String>, started: Instant, limit: Duration) -> Self {
        Self { case: case.into(), started, limit }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }

    pub fn check(&self) -> Result<()> {
        if self.elapsed() > self.limit {
            return Err(HarnessError::CaseTimeout {
                case: self.case.clone(),
                timeout_secs: self.limit.as_secs(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_within_limit() {
        let guard = CaseGuard::new("llama", Duration::from_secs(60));
        assert!(guard.check().is_ok());
        assert!(guard.remaining() > Duration::from_secs(59));
    }

    #[test]
    fn test_guard_past_deadline() {
        let started = Instant::now() - Duration::from_secs(5);
        let guard = CaseGuard::starting_at("llama", started, Duration::from_secs(2));

        let err = guard.check().unwrap_err();
        assert_eq!(err.to_string(), "Case timeout 2s for llama");
        assert_eq!(guard.remaining(), Duration::ZERO);
    }
}
