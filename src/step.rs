//! Outcome of a best-effort step.
//!
//! Cleanup and convenience actions (removing a stale lock, opening a browser,
//! migrating credentials) never abort the operation they belong to. They
//! report what happened instead, so callers can log it and tests can assert it.

use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub ok: bool,
    pub detail: String,
}

impl StepResult {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }

    pub fn skipped(detail: impl Into<String>) -> Self {
        Self::ok(format!("skipped: {}", detail.into()))
    }

    /// Wraps a fallible closure, turning any error into a failed step.
    pub fn attempt<T, E: Display>(
        what: &str,
        f: impl FnOnce() -> std::result::Result<T, E>,
    ) -> Self {
        match f() {
            Ok(_) => Self::ok(what),
            Err(e) => Self::failed(format!("{what}: {e}")),
        }
    }

    /// Logs the step at debug on success and warn on failure.
    pub fn log(self, step: &str) -> Self {
        if self.ok {
            debug!("{step}: {}", self.detail);
        } else {
            warn!("{step}: {}", self.detail);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_captures_error() {
        let step = StepResult::attempt("remove lock", || {
            Err::<(), _>(std::io::Error::other("permission denied"))
        });
        assert!(!step.ok);
        assert_eq!(step.detail, "remove lock: permission denied");

        let step = StepResult::attempt("remove lock", || Ok::<_, std::io::Error>(()));
        assert!(step.ok);
    }

    #[test]
    fn test_skipped_is_ok() {
        let step = StepResult::skipped("nothing to migrate");
        assert!(step.ok);
        assert!(step.detail.starts_with("skipped"));
    }
}
