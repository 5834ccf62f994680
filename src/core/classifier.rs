//! Maps a failed attempt to `recoverable` or `permanent`.
//!
//! Free-text matching against tool output is heuristic. The patterns live in
//! one table so they can be tuned and tested on their own. Rules are checked
//! in order and the first match wins:
//!
//! 1. killed by timeout, the stuck sweep or shutdown: recoverable
//! 2. transient network / HTTP indicators: recoverable
//! 3. definitive absence indicators: permanent
//! 4. zero-content exits: permanent
//! 5. anything else: recoverable (bounded by the retry cap)

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::core::models::FailureKind;
use crate::core::runner::Termination;
use crate::core::strategy::RawOutcome;

/// One named pattern in the rule table.
pub struct Rule {
    pub name: &'static str,
    pub kind: FailureKind,
    pub pattern: &'static str,
}

pub const TEXT_RULES: &[Rule] = &[
    // transient
    Rule {
        name: "connection_reset",
        kind: FailureKind::Recoverable,
        pattern: r"connection reset|connection refused|broken pipe|read error",
    },
    Rule {
        name: "timed_out",
        kind: FailureKind::Recoverable,
        pattern: r"timed out|operation timeout",
    },
    Rule {
        name: "rate_limited",
        kind: FailureKind::Recoverable,
        pattern: r"too many requests|(?:error|http)[^\n]{0,12}\b429\b",
    },
    Rule {
        name: "upstream_unavailable",
        kind: FailureKind::Recoverable,
        pattern: r"bad gateway|service unavailable|gateway time-?out|(?:error|http)[^\n]{0,12}\b50[234]\b",
    },
    Rule {
        name: "network_failure",
        kind: FailureKind::Recoverable,
        pattern: r"network failure|network is unreachable|temporary failure in name resolution",
    },
    // definitive absence
    Rule {
        name: "not_found",
        kind: FailureKind::Permanent,
        pattern: r"(?:error|http)[^\n]{0,12}\b(?:404|410)\b|\b410 gone\b",
    },
    Rule {
        name: "dns_unresolvable",
        kind: FailureKind::Permanent,
        pattern: r"name or service not known|could not resolve host|unable to resolve host address|no address associated with hostname|nxdomain",
    },
    Rule {
        name: "tls_invalid",
        kind: FailureKind::Permanent,
        pattern: r"certificate (?:has expired|verify failed|is not trusted)|self[- ]signed certificate|ssl verification failure|cannot verify [^\n]*certificate",
    },
    Rule {
        name: "forbidden",
        kind: FailureKind::Permanent,
        pattern: r"(?:error|http)[^\n]{0,12}\b403\b|403 forbidden",
    },
    Rule {
        name: "content_unavailable",
        kind: FailureKind::Permanent,
        pattern: r"this channel does not exist|private video|video unavailable|account (?:has been )?terminated|unsupported url",
    },
    Rule {
        name: "authentication",
        kind: FailureKind::Permanent,
        pattern: r"authentication failure|authentication failed",
    },
];

static COMPILED: LazyLock<Vec<(&'static Rule, Regex)>> = LazyLock::new(|| {
    TEXT_RULES
        .iter()
        .map(|rule| {
            let re = RegexBuilder::new(rule.pattern)
                .case_insensitive(true)
                .build()
                .unwrap_or_else(|e| panic!("invalid classifier rule {}: {}", rule.name, e));
            (rule, re)
        })
        .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub kind: FailureKind,
    pub rule: &'static str,
}

/// Classify a failed, non-cancelled attempt.
pub fn classify(raw: &RawOutcome) -> Classification {
    if matches!(
        raw.termination,
        Termination::TimedOut | Termination::Stuck | Termination::Interrupted
    ) {
        return Classification {
            kind: FailureKind::Recoverable,
            rule: "timeout",
        };
    }

    let text = diagnostic_text(raw);
    if let Some(c) = classify_text(&text) {
        return c;
    }

    if raw.zero_content {
        return Classification {
            kind: FailureKind::Permanent,
            rule: "zero_content",
        };
    }

    Classification {
        kind: FailureKind::Recoverable,
        rule: "unclassified",
    }
}

/// Text-only part of the table (rules 2 and 3).
pub fn classify_text(text: &str) -> Option<Classification> {
    COMPILED
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(rule, _)| Classification {
            kind: rule.kind,
            rule: rule.name,
        })
}

fn diagnostic_text(raw: &RawOutcome) -> String {
    let mut text = raw.summary.clone();
    for line in &raw.tail {
        text.push('\n');
        text.push_str(line);
    }
    text
}
