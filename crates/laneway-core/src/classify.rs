//! Failure classification at the worker boundary
//!
//! A body's explicit hint wins; otherwise the error message is matched
//! against keyword families in a fixed order. Keywords match whole words
//! (runs of ASCII letters and digits), so `oom` never hits `room`.

use crate::types::{FailureType, StageOutcome};

const RULES: &[(FailureType, &[&str])] = &[
    (
        FailureType::Timeout,
        &["timed out", "timeout", "timeouts", "deadline exceeded"],
    ),
    (
        FailureType::ResourceExhaustion,
        &[
            "out of memory",
            "oom",
            "no space left",
            "disk full",
            "too many open files",
            "cannot allocate",
            "resource exhausted",
        ],
    ),
    (
        FailureType::NetworkError,
        &[
            "connection refused",
            "connection reset",
            "network",
            "networking",
            "unreachable",
            "dns",
            "could not resolve",
            "tls handshake",
            "econnrefused",
        ],
    ),
    (
        FailureType::RevisionControlError,
        &["git", "merge conflict", "detached head", "not a repository", "rebase"],
    ),
    (
        FailureType::QualityGateFailure,
        &["coverage", "lint", "clippy", "quality gate", "complexity", "security scan"],
    ),
    (
        FailureType::TestFailure,
        &["test failed", "tests failed", "assertion", "assertions", "failures:", "test result: failed"],
    ),
];

/// Classify a failed outcome
#[must_use]
pub fn classify(outcome: &StageOutcome) -> FailureType {
    if let Some(hint) = outcome.failure_hint {
        return hint;
    }
    outcome
        .error_message
        .as_deref()
        .map_or(FailureType::Unknown, classify_message)
}

/// Classify from an error message alone
#[must_use]
pub fn classify_message(message: &str) -> FailureType {
    let words = words(message);
    RULES
        .iter()
        .find(|(_, phrases)| phrases.iter().any(|p| contains_phrase(&words, p)))
        .map_or(FailureType::Unknown, |(kind, _)| *kind)
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

fn contains_phrase(words: &[String], phrase: &str) -> bool {
    let needle = self::words(phrase);
    !needle.is_empty() && words.windows(needle.len()).any(|w| w == needle.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_wins_over_message() {
        let outcome = StageOutcome::failed_as(FailureType::QualityGateFailure, "connection refused");
        assert_eq!(classify(&outcome), FailureType::QualityGateFailure);
    }

    #[test]
    fn keyword_families() {
        assert_eq!(classify_message("operation timed out after 30s"), FailureType::Timeout);
        assert_eq!(classify_message("fatal: No space left on device"), FailureType::ResourceExhaustion);
        assert_eq!(classify_message("Connection refused (os error 111)"), FailureType::NetworkError);
        assert_eq!(classify_message("CONFLICT: merge conflict in src/lib.rs"), FailureType::RevisionControlError);
        assert_eq!(classify_message("coverage 61% below 70%"), FailureType::QualityGateFailure);
        assert_eq!(classify_message("test result: FAILED. 3 passed; 1 failed"), FailureType::TestFailure);
        assert_eq!(classify_message("exit status 139"), FailureType::Unknown);
    }

    #[test]
    fn keywords_match_whole_words_only() {
        assert_eq!(classify_message("assertion failed: digits differ"), FailureType::TestFailure);
        assert_eq!(classify_message("no room left in fixture table"), FailureType::Unknown);
        assert_eq!(classify_message("assert_eq failed on zoom level"), FailureType::Unknown);
        assert_eq!(classify_message("legitimate value rejected"), FailureType::Unknown);
        assert_eq!(classify_message("process killed: OOM"), FailureType::ResourceExhaustion);
        assert_eq!(classify_message("fatal: not a git repository"), FailureType::RevisionControlError);
        assert_eq!(classify_message("lookup failed: DNS error"), FailureType::NetworkError);
    }

    #[test]
    fn missing_message_is_unknown() {
        let outcome = StageOutcome {
            success: false,
            ..StageOutcome::default()
        };
        assert_eq!(classify(&outcome), FailureType::Unknown);
    }
}
