//! Pluggable mapping from error text to an error code and severity.

use regex::Regex;

use super::{ErrorCode, Severity};

/// Result of classifying one error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub code: ErrorCode,
    pub severity: Severity,
    pub category: String,
}

impl Classification {
    pub fn new(code: ErrorCode, severity: Severity, category: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            category: category.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(ErrorCode::Unknown, Severity::Medium, "unknown")
    }
}

/// Maps an error message onto a [`Classification`].
///
/// Swap in an implementation backed by structured upstream error codes when
/// message sniffing is not good enough.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, message: &str) -> Classification;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Matcher {
    Keywords(Vec<String>),
    Pattern(Regex),
}

/// One ordered classification rule. Rules see the lowercased message.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    matcher: Matcher,
    classification: Classification,
}

impl ClassificationRule {
    /// Match when the message contains any of `keywords`.
    pub fn keywords(keywords: &[&str], classification: Classification) -> Self {
        Self {
            matcher: Matcher::Keywords(keywords.iter().map(|k| k.to_lowercase()).collect()),
            classification,
        }
    }

    /// Match when `pattern` finds a match in the message.
    pub fn pattern(pattern: &str, classification: Classification) -> Result<Self, regex::Error> {
        Ok(Self {
            matcher: Matcher::Pattern(Regex::new(pattern)?),
            classification,
        })
    }

    fn matches(&self, lowered: &str) -> bool {
        match &self.matcher {
            Matcher::Keywords(words) => words.iter().any(|w| lowered.contains(w.as_str())),
            Matcher::Pattern(re) => re.is_match(lowered),
        }
    }
}

/// First-match-wins rule list with an `Unknown`/`Medium` fallback.
///
/// The default rule order is timeout, validation, LLM, network, auth,
/// resource. Timeout comes first so that a message mentioning a timeout is
/// always a timeout, even when it also says e.g. "invalid".
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rules: Vec<ClassificationRule>,
}

impl KeywordClassifier {
    /// A classifier with no rules; everything is `Unknown`.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule after the existing ones.
    pub fn with_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Insert a rule ahead of all existing ones.
    pub fn with_priority_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.insert(0, rule);
        self
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        fn rule(words: &[&str], code: ErrorCode, severity: Severity, category: &str) -> ClassificationRule {
            ClassificationRule::keywords(words, Classification::new(code, severity, category))
        }

        Self {
            rules: vec![
                rule(
                    &["timeout", "deadline", "context canceled"],
                    ErrorCode::Timeout,
                    Severity::High,
                    "timeout",
                ),
                rule(
                    &["validation", "invalid", "required", "missing"],
                    ErrorCode::Validation,
                    Severity::Medium,
                    "validation",
                ),
                rule(
                    &["llm", "openai", "azure", "model", "completion"],
                    ErrorCode::Llm,
                    Severity::Medium,
                    "llm",
                ),
                rule(
                    &["network", "connection", "dial", "http"],
                    ErrorCode::Network,
                    Severity::High,
                    "network",
                ),
                rule(
                    &["auth", "unauthorized", "forbidden", "token"],
                    ErrorCode::Auth,
                    Severity::Critical,
                    "auth",
                ),
                rule(
                    &["memory", "resource", "limit", "quota"],
                    ErrorCode::Resource,
                    Severity::Critical,
                    "resource",
                ),
            ],
        }
    }
}

impl ErrorClassifier for KeywordClassifier {
    fn classify(&self, message: &str) -> Classification {
        let lowered = message.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&lowered))
            .map(|rule| rule.classification.clone())
            .unwrap_or_else(Classification::unknown)
    }
}
