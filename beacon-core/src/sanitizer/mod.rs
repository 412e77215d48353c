//! PII sanitization of event properties
//!
//! Runs before taxonomy validation. Two kinds of rules apply:
//!
//! - **Key rules**: a property whose key looks like it holds personal data
//!   (email, phone, tokens, free-text note content...) has its whole value
//!   replaced with [`REDACTED`], whatever its type.
//! - **Value rules**: substrings of string values that look like emails,
//!   phone numbers, card numbers, SSNs, bearer tokens, JWTs or IPv4
//!   addresses are replaced with [`REDACTED`].
//!
//! Sanitization is total. If a detector is unavailable the sanitizer fails
//! closed: a broken key rule redacts every value, a broken value rule
//! redacts every string value outright.

pub mod patterns;

use crate::config::SanitizerConfig;
use crate::error::{Error, Result};
use crate::types::{Properties, PropertyValue};
use patterns::ValuePattern;
use regex::{Regex, RegexBuilder};

/// Placeholder written in place of redacted data
pub const REDACTED: &str = "[REDACTED]";

/// Sanitized properties plus what was done to them
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    pub properties: Properties,
    /// Values or substrings replaced with the placeholder
    pub redactions: usize,
    /// Strings shortened to the configured limit
    pub truncations: usize,
    /// A built-in detector was unavailable and whole values were redacted
    pub degraded: bool,
}

/// Property sanitizer
#[derive(Debug, Clone)]
pub struct Sanitizer {
    extra_deny_keys: Vec<Regex>,
    extra_value_patterns: Vec<Regex>,
    max_string_len: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self {
            extra_deny_keys: vec![],
            extra_value_patterns: vec![],
            max_string_len: SanitizerConfig::default().max_string_len,
        }
    }
}

impl Sanitizer {
    /// Build a sanitizer, compiling any user-supplied patterns.
    ///
    /// An invalid user pattern is a configuration error surfaced at
    /// `initialize()`, never at `track()`.
    pub fn new(config: &SanitizerConfig) -> Result<Self> {
        let extra_deny_keys = config
            .deny_keys
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::Config(format!("sanitizer.deny_keys {:?}: {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let extra_value_patterns = config
            .value_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    Error::Config(format!("sanitizer.value_patterns {:?}: {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            extra_deny_keys,
            extra_value_patterns,
            max_string_len: config.max_string_len,
        })
    }

    /// Sanitize properties, discarding the report
    pub fn sanitize(&self, properties: Properties) -> Properties {
        self.sanitize_with_report(properties).properties
    }

    /// Sanitize properties and report how many values were touched
    pub fn sanitize_with_report(&self, properties: Properties) -> Sanitized {
        self.sanitize_with_detectors(
            properties,
            patterns::RE_DENY_KEY.as_ref(),
            &patterns::value_patterns(),
        )
    }

    /// Sanitize against an explicit detector set. A `None` key rule or a
    /// value detector whose regex failed to build puts the pass in fail
    /// closed mode.
    fn sanitize_with_detectors(
        &self,
        properties: Properties,
        key_rule: Option<&Regex>,
        value_rules: &[ValuePattern],
    ) -> Sanitized {
        let mut pass = Pass {
            sanitizer: self,
            key_rule,
            value_rules,
            value_rules_healthy: value_rules.iter().all(|p| p.regex.is_some()),
            redactions: 0,
            truncations: 0,
        };

        let degraded = pass.key_rule.is_none() || !pass.value_rules_healthy;
        if degraded {
            tracing::warn!("PII detector unavailable; redacting whole values");
        }

        let properties = pass.map(properties);

        Sanitized {
            properties,
            redactions: pass.redactions,
            truncations: pass.truncations,
            degraded,
        }
    }

    fn key_denied(&self, key_rule: Option<&Regex>, key: &str) -> bool {
        match key_rule {
            Some(rule) => {
                rule.is_match(key) || self.extra_deny_keys.iter().any(|re| re.is_match(key))
            }
            // Fail closed
            None => true,
        }
    }
}

/// State for one sanitize call
struct Pass<'a> {
    sanitizer: &'a Sanitizer,
    key_rule: Option<&'a Regex>,
    value_rules: &'a [ValuePattern],
    value_rules_healthy: bool,
    redactions: usize,
    truncations: usize,
}

impl Pass<'_> {
    fn map(&mut self, properties: Properties) -> Properties {
        properties
            .into_iter()
            .map(|(key, value)| {
                let value = if self.sanitizer.key_denied(self.key_rule, &key) {
                    self.redactions += 1;
                    PropertyValue::String(REDACTED.to_string())
                } else {
                    self.value(value)
                };
                (key, value)
            })
            .collect()
    }

    fn value(&mut self, value: PropertyValue) -> PropertyValue {
        match value {
            PropertyValue::String(s) => PropertyValue::String(self.string(s)),
            PropertyValue::Map(inner) => PropertyValue::Map(self.map(inner)),
            // NaN and infinities have no JSON encoding
            PropertyValue::Float(f) if !f.is_finite() => {
                self.redactions += 1;
                PropertyValue::String(REDACTED.to_string())
            }
            other => other,
        }
    }

    fn string(&mut self, s: String) -> String {
        if !self.value_rules_healthy {
            self.redactions += 1;
            return REDACTED.to_string();
        }

        let mut text = s;
        for pattern in self.value_rules {
            let Some(re) = pattern.regex.as_ref() else {
                continue;
            };
            let (out, hits) = patterns::redact_matches(&text, re, pattern.verify, REDACTED);
            if hits > 0 {
                tracing::trace!(detector = pattern.name, hits, "Redacted property value");
                self.redactions += hits;
                text = out;
            }
        }
        for re in &self.sanitizer.extra_value_patterns {
            let (out, hits) = patterns::redact_matches(&text, re, None, REDACTED);
            if hits > 0 {
                self.redactions += hits;
                text = out;
            }
        }

        let max = self.sanitizer.max_string_len;
        if text.chars().count() > max {
            self.truncations += 1;
            text = text.chars().take(max).collect();
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props;
    use std::sync::LazyLock;

    #[test]
    fn test_denied_keys_redact_whole_value() {
        let sanitizer = Sanitizer::default();
        let out = sanitizer.sanitize(props! {
            "email" => "a@b.com",
            "phoneNumber" => 5551234,
            "note_body" => props! { "text" => "secret diary" },
            "noteId" => "n1",
        });

        assert_eq!(out["email"].as_str(), Some(REDACTED));
        assert_eq!(out["phoneNumber"].as_str(), Some(REDACTED));
        assert_eq!(out["note_body"].as_str(), Some(REDACTED));
        assert_eq!(out["noteId"].as_str(), Some("n1"));
    }

    #[test]
    fn test_value_detectors_redact_substrings() {
        let sanitizer = Sanitizer::default();
        let report = sanitizer.sanitize_with_report(props! {
            "query" => "mail jane.doe@example.com or call 555-867-5309",
            "card" => "pay with 4111 1111 1111 1111 today",
            "header" => "Bearer abc.def-123",
        });

        assert_eq!(
            report.properties["query"].as_str(),
            Some("mail [REDACTED] or call [REDACTED]")
        );
        assert_eq!(
            report.properties["card"].as_str(),
            Some("pay with [REDACTED] today")
        );
        assert_eq!(report.properties["header"].as_str(), Some(REDACTED));
        assert_eq!(report.redactions, 4);
        assert!(!report.degraded);
    }

    #[test]
    fn test_nested_maps_are_sanitized() {
        let sanitizer = Sanitizer::default();
        let out = sanitizer.sanitize(props! {
            "context" => props! { "ip" => "10.0.0.12", "password" => "hunter2" },
        });

        let PropertyValue::Map(ctx) = &out["context"] else {
            panic!("context should stay a map");
        };
        assert_eq!(ctx["ip"].as_str(), Some(REDACTED));
        assert_eq!(ctx["password"].as_str(), Some(REDACTED));
    }

    #[test]
    fn test_non_pii_values_untouched() {
        let sanitizer = Sanitizer::default();
        let input = props! {
            "noteId" => "550e8400-e29b-41d4-a716-446655440000",
            "createdAtMs" => "1700000000001",
            "words" => 42,
            "ratio" => 0.5,
            "pinned" => true,
        };
        let report = sanitizer.sanitize_with_report(input.clone());
        assert_eq!(report.properties, input);
        assert_eq!(report.redactions, 0);
    }

    #[test]
    fn test_non_finite_float_redacted() {
        let sanitizer = Sanitizer::default();
        let out = sanitizer.sanitize(props! { "ratio" => f64::NAN });
        assert_eq!(out["ratio"].as_str(), Some(REDACTED));
    }

    #[test]
    fn test_long_strings_truncated() {
        let config = SanitizerConfig {
            max_string_len: 8,
            ..Default::default()
        };
        let sanitizer = Sanitizer::new(&config).unwrap();
        let report = sanitizer.sanitize_with_report(props! { "screen" => "settings/notifications" });
        assert_eq!(report.properties["screen"].as_str(), Some("settings"));
        assert_eq!(report.truncations, 1);
    }

    #[test]
    fn test_user_patterns() {
        let config = SanitizerConfig {
            deny_keys: vec!["^customer".to_string()],
            value_patterns: vec![r"ACCT-\d+".to_string()],
            ..Default::default()
        };
        let sanitizer = Sanitizer::new(&config).unwrap();
        let out = sanitizer.sanitize(props! {
            "CustomerName" => "Ada",
            "ref" => "see ACCT-991",
        });
        assert_eq!(out["CustomerName"].as_str(), Some(REDACTED));
        assert_eq!(out["ref"].as_str(), Some("see [REDACTED]"));
    }

    #[test]
    fn test_invalid_user_pattern_is_config_error() {
        let config = SanitizerConfig {
            value_patterns: vec!["(unclosed".to_string()],
            ..Default::default()
        };
        assert!(matches!(Sanitizer::new(&config), Err(Error::Config(_))));
    }

    static UNAVAILABLE: LazyLock<Option<Regex>> = LazyLock::new(|| None);

    #[test]
    fn test_missing_value_detector_redacts_every_string() {
        let mut detectors: Vec<ValuePattern> = patterns::value_patterns().into_iter().collect();
        detectors.push(ValuePattern {
            name: "unavailable",
            regex: &UNAVAILABLE,
            verify: None,
        });

        let report = Sanitizer::default().sanitize_with_detectors(
            props! { "screen" => "settings", "words" => 42, "email" => "a@b.com" },
            patterns::RE_DENY_KEY.as_ref(),
            &detectors,
        );

        assert!(report.degraded);
        assert_eq!(report.properties["screen"].as_str(), Some(REDACTED));
        assert_eq!(report.properties["email"].as_str(), Some(REDACTED));
        // Non-string values carry no free text
        assert_eq!(report.properties["words"], PropertyValue::Int(42));
        assert_eq!(report.redactions, 2);
    }

    #[test]
    fn test_missing_key_rule_redacts_every_value() {
        let report = Sanitizer::default().sanitize_with_detectors(
            props! { "noteId" => "n1", "words" => 42, "pinned" => true },
            None,
            &patterns::value_patterns(),
        );

        assert!(report.degraded);
        assert_eq!(report.redactions, 3);
        assert!(report
            .properties
            .values()
            .all(|v| v.as_str() == Some(REDACTED)));
    }

    #[test]
    fn test_healthy_detectors_are_not_degraded() {
        let report = Sanitizer::default().sanitize_with_detectors(
            props! { "noteId" => "n1" },
            patterns::RE_DENY_KEY.as_ref(),
            &patterns::value_patterns(),
        );
        assert!(!report.degraded);
        assert_eq!(report.properties["noteId"].as_str(), Some("n1"));
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let sanitizer = Sanitizer::default();
        let once = sanitizer.sanitize(props! { "q" => "jane@example.com", "token" => "t" });
        let twice = sanitizer.sanitize(once.clone());
        assert_eq!(once, twice);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_embedded_emails_never_survive(
                prefix in "[a-z ]{0,20}",
                local in "[a-z0-9.]{1,12}",
                domain in "[a-z]{1,12}",
                suffix in "[ ,;]{0,3}[a-z ]{0,20}",
            ) {
                let text = format!("{} {}@{}.com{}", prefix, local, domain, suffix);
                let out = Sanitizer::default().sanitize(props! { "query" => text });
                let value = out["query"].as_str().unwrap_or_default();
                prop_assert!(!value.contains('@'), "leaked: {:?}", value);
            }

            #[test]
            fn prop_keys_are_preserved(
                entries in proptest::collection::btree_map("[a-zA-Z_]{1,12}", "\\PC{0,40}", 0..8),
            ) {
                let input: Properties = entries
                    .into_iter()
                    .map(|(k, v)| (k, PropertyValue::String(v)))
                    .collect();
                let out = Sanitizer::default().sanitize(input.clone());
                prop_assert!(out.keys().eq(input.keys()));
            }
        }
    }
}
