//! Decides, per error, between retrying, falling back and failing fast.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Defect in the calling code: propagate immediately.
    NonFallback,
    /// Transient and no fallback remains: retry the same backend.
    Retryable,
    /// A fallback remains: move on to the next candidate.
    FallbackEligible,
    /// Neither retryable nor routable.
    Fatal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::NonFallback => "non_fallback",
            FailureClass::Retryable => "retryable",
            FailureClass::FallbackEligible => "fallback_eligible",
            FailureClass::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error kinds that never trigger a retry or a fallback.
pub const DEFAULT_NON_FALLBACK_KINDS: &[&str] = &[
    "invalid_argument",
    "type_mismatch",
    "missing_method",
    "not_implemented",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureClassifier {
    non_fallback: BTreeSet<String>,
}

impl FailureClassifier {
    pub fn new() -> Self {
        Self {
            non_fallback: DEFAULT_NON_FALLBACK_KINDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }

    /// Add error kinds (see [`Error::kind`]) to the non-fallback set.
    /// The defaults are always kept.
    pub fn with_non_fallback<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.non_fallback.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn non_fallback_kinds(&self) -> impl Iterator<Item = &str> {
        self.non_fallback.iter().map(String::as_str)
    }

    pub fn is_non_fallback(&self, error: &Error) -> bool {
        error.is_programming_error() || self.non_fallback.contains(error.kind())
    }

    /// `has_fallback` is whether another candidate remains after the current one.
    pub fn classify(&self, error: &Error, has_fallback: bool) -> FailureClass {
        if self.is_non_fallback(error) {
            FailureClass::NonFallback
        } else if has_fallback {
            FailureClass::FallbackEligible
        } else if error.is_retryable() {
            FailureClass::Retryable
        } else {
            FailureClass::Fatal
        }
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_programming_errors_never_fall_back() {
        let classifier = FailureClassifier::new();
        for error in [
            Error::InvalidArgument("empty prompt".into()),
            Error::TypeMismatch("expected string".into()),
            Error::MissingMethod("embed".into()),
            Error::NotImplemented("audio".into()),
        ] {
            assert_eq!(classifier.classify(&error, true), FailureClass::NonFallback);
            assert_eq!(classifier.classify(&error, false), FailureClass::NonFallback);
        }
    }

    #[test]
    fn test_fallback_presence_turns_retryable_into_fallback() {
        let classifier = FailureClassifier::new();
        let rate_limited = Error::RateLimit {
            retry_after: Some(Duration::from_secs(1)),
        };

        assert_eq!(classifier.classify(&rate_limited, false), FailureClass::Retryable);
        assert_eq!(
            classifier.classify(&rate_limited, true),
            FailureClass::FallbackEligible
        );
    }

    #[test]
    fn test_non_transient_without_fallback_is_fatal() {
        let classifier = FailureClassifier::new();
        let denied = Error::api(403, "forbidden");

        assert_eq!(classifier.classify(&denied, false), FailureClass::Fatal);
        assert_eq!(classifier.classify(&denied, true), FailureClass::FallbackEligible);
    }

    #[test]
    fn test_custom_kinds_merge_with_defaults() {
        let classifier = FailureClassifier::new().with_non_fallback(["schema_violation"]);
        let custom = Error::custom("schema_violation", "missing field");

        assert_eq!(classifier.classify(&custom, true), FailureClass::NonFallback);
        assert!(classifier.non_fallback_kinds().any(|k| k == "invalid_argument"));
        assert_eq!(
            classifier.classify(&Error::custom("other", "x"), true),
            FailureClass::FallbackEligible
        );
    }
}
