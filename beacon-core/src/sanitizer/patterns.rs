//! Built-in PII detectors
//!
//! Each detector is compiled lazily. A pattern that fails to compile stays
//! `None`; the sanitizer treats that as a detector failure and fails closed.

use regex::{Captures, Regex};
use std::sync::LazyLock;

/// A compiled value detector.
pub struct ValuePattern {
    pub name: &'static str,
    pub regex: &'static LazyLock<Option<Regex>>,
    /// Extra check on a candidate match; `None` accepts every match
    pub verify: Option<fn(&str) -> bool>,
}

macro_rules! value_pattern {
    ($name:ident, $regex_str:expr) => {
        pub static $name: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new($regex_str).ok());
    };
}

// ── Keys whose values are never sent ──────────────────────────────────────
value_pattern!(
    RE_DENY_KEY,
    r"(?i)(e[-_]?mail|phone|mobile|passw(or)?d|secret|token|api[-_]?key|authorization|credential|ssn|street|address|note[-_]?(body|content|text)|free[-_]?text|^(content|body|text|message)$)"
);

// ── JWT ───────────────────────────────────────────────────────────────────
value_pattern!(
    RE_JWT,
    r"\beyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+"
);

// ── Bearer token ──────────────────────────────────────────────────────────
value_pattern!(RE_BEARER, r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+");

// ── Credit card (13-19 digits, optional separators, Luhn-checked) ─────────
value_pattern!(RE_CREDIT_CARD, r"\b(?:\d[ -]?){12,18}\d\b");

// ── SSN ───────────────────────────────────────────────────────────────────
value_pattern!(RE_SSN, r"\b\d{3}-\d{2}-\d{4}\b");

// ── Email ─────────────────────────────────────────────────────────────────
value_pattern!(
    RE_EMAIL,
    r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}"
);

// ── Phone (separated groups, or + and 8-15 digits) ────────────────────────
value_pattern!(
    RE_PHONE,
    r"(?:\+\d{1,3}[-.\s]?)?(?:\(\d{3}\)\s?|\b\d{3}[-.\s])\d{3}[-.\s]\d{4}\b|\+\d{8,15}\b"
);

// ── IPv4 ──────────────────────────────────────────────────────────────────
value_pattern!(
    RE_IPV4,
    r"\b(?:(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\.){3}(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\b"
);

/// Value detectors in application order (most specific first).
pub fn value_patterns() -> [ValuePattern; 7] {
    [
        ValuePattern {
            name: "jwt",
            regex: &RE_JWT,
            verify: None,
        },
        ValuePattern {
            name: "bearer",
            regex: &RE_BEARER,
            verify: None,
        },
        ValuePattern {
            name: "credit_card",
            regex: &RE_CREDIT_CARD,
            verify: Some(luhn_valid),
        },
        ValuePattern {
            name: "ssn",
            regex: &RE_SSN,
            verify: None,
        },
        ValuePattern {
            name: "email",
            regex: &RE_EMAIL,
            verify: None,
        },
        ValuePattern {
            name: "phone",
            regex: &RE_PHONE,
            verify: None,
        },
        ValuePattern {
            name: "ipv4",
            regex: &RE_IPV4,
            verify: None,
        },
    ]
}

/// Replace every verified match of `regex` in `text` with `placeholder`.
///
/// Returns the rewritten text and the number of replacements.
pub fn redact_matches(
    text: &str,
    regex: &Regex,
    verify: Option<fn(&str) -> bool>,
    placeholder: &str,
) -> (String, usize) {
    let mut hits = 0;
    let out = regex.replace_all(text, |caps: &Captures| {
        let candidate = &caps[0];
        if verify.map_or(true, |check| check(candidate)) {
            hits += 1;
            placeholder.to_string()
        } else {
            candidate.to_string()
        }
    });
    (out.into_owned(), hits)
}

/// Luhn checksum over the digits of `candidate`, ignoring separators.
pub fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
