//! Maps human-readable download failures onto availability verdicts.
//!
//! Upstream tools only report why a video cannot be fetched through free-form,
//! possibly localized text. The table below is an ordered list of patterns;
//! the first pattern that matches decides the verdict. Anything unmatched is
//! an ordinary failure and gets retried on the next request.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::RuleConfig;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableKind {
    LiveStream,
    SponsorOnly,
    LoginRequired,
    Removed,
    Private,
}

impl UnavailableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnavailableKind::LiveStream => "live_stream",
            UnavailableKind::SponsorOnly => "sponsor_only",
            UnavailableKind::LoginRequired => "login_required",
            UnavailableKind::Removed => "removed",
            UnavailableKind::Private => "private",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            UnavailableKind::LiveStream => 422,
            UnavailableKind::SponsorOnly => 402,
            UnavailableKind::LoginRequired => 401,
            UnavailableKind::Removed => 410,
            UnavailableKind::Private => 403,
        }
    }
}

impl fmt::Display for UnavailableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub pattern: Regex,
    pub kind: UnavailableKind,
    pub message: String,
}

impl ClassificationRule {
    pub fn new(pattern: &str, kind: UnavailableKind, message: impl Into<String>) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|err| ConfigError::invalid("classification.rules.pattern", err.to_string()))?;
        Ok(Self {
            pattern,
            kind,
            message: message.into(),
        })
    }
}

// Ukrainian entries match the extractor language the service has always run
// with; the English ones cover the tool's default locale.
const BUILTIN_RULES: &[(&str, UnavailableKind, &str)] = &[
    (
        r"(?i)\b(?:live|premiere|подія в прямому ефірі|прем’єра|трансляція)\b",
        UnavailableKind::LiveStream,
        "Video is Live Stream or Premiere",
    ),
    (
        r"(?i)\b(?:спонсор.*?|members-only|join this channel)\b",
        UnavailableKind::SponsorOnly,
        "Need to be a sponsor to access the video",
    ),
    (
        r"(?i)\b(?:увійдіть|sign in to confirm)\b",
        UnavailableKind::LoginRequired,
        "Login required",
    ),
    (
        r"(?i)\b(?:вилучив|has been removed|no longer available)\b",
        UnavailableKind::Removed,
        "Removed video",
    ),
    (
        r"(?i)\b(?:приватне|private video)\b",
        UnavailableKind::Private,
        "Private video",
    ),
];

#[derive(Debug, Clone)]
pub struct FailureClassifier {
    rules: Vec<ClassificationRule>,
}

impl FailureClassifier {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    pub fn from_rules(rules: &[RuleConfig]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| ClassificationRule::new(&rule.pattern, rule.kind, rule.message.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    /// Configured rules when present, otherwise the built-in table.
    pub fn from_config(rules: &[RuleConfig]) -> Result<Self> {
        if rules.is_empty() {
            Ok(Self::default())
        } else {
            Self::from_rules(rules)
        }
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn classify(&self, text: &str) -> Option<&ClassificationRule> {
        self.rules.iter().find(|rule| rule.pattern.is_match(text))
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        let rules = BUILTIN_RULES
            .iter()
            .map(|(pattern, kind, message)| ClassificationRule {
                pattern: Regex::new(pattern).expect("built-in classification pattern"),
                kind: *kind,
                message: (*message).to_string(),
            })
            .collect();
        Self::new(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(text: &str) -> Option<UnavailableKind> {
        FailureClassifier::default()
            .classify(text)
            .map(|rule| rule.kind)
    }

    #[test]
    fn builtin_table_matches_localized_messages() {
        assert_eq!(
            kind_of("ERROR: [youtube] abc: Ця трансляція почнеться за 5 хвилин"),
            Some(UnavailableKind::LiveStream)
        );
        assert_eq!(
            kind_of("ERROR: Це відео доступне лише для спонсорів каналу"),
            Some(UnavailableKind::SponsorOnly)
        );
        assert_eq!(
            kind_of("ERROR: Увійдіть, щоб підтвердити свій вік"),
            Some(UnavailableKind::LoginRequired)
        );
        assert_eq!(
            kind_of("ERROR: Автор вилучив це відео"),
            Some(UnavailableKind::Removed)
        );
        assert_eq!(
            kind_of("ERROR: Це приватне відео"),
            Some(UnavailableKind::Private)
        );
    }

    #[test]
    fn english_messages_are_classified() {
        assert_eq!(
            kind_of("Video is Live Stream or Premiere: abc"),
            Some(UnavailableKind::LiveStream)
        );
        assert_eq!(
            kind_of("ERROR: [youtube] abc: Private video. Sign in if you've been granted access"),
            Some(UnavailableKind::Private)
        );
        assert_eq!(
            kind_of("ERROR: [youtube] abc: Join this channel to get access to members-only content"),
            Some(UnavailableKind::SponsorOnly)
        );
    }

    #[test]
    fn word_boundaries_prevent_partial_matches() {
        assert_eq!(kind_of("ERROR: unable to deliver payload"), None);
        assert_eq!(kind_of("HTTP Error 503: Service Unavailable"), None);
    }

    #[test]
    fn first_matching_rule_wins() {
        let classifier = FailureClassifier::new(vec![
            ClassificationRule::new("(?i)video", UnavailableKind::Removed, "first").unwrap(),
            ClassificationRule::new("(?i)private", UnavailableKind::Private, "second").unwrap(),
        ]);
        let rule = classifier.classify("Private video").unwrap();
        assert_eq!(rule.kind, UnavailableKind::Removed);
        assert_eq!(rule.message, "first");
    }

    #[test]
    fn configured_rules_replace_builtin_table() {
        let classifier = FailureClassifier::from_config(&[RuleConfig {
            pattern: "(?i)geo.?blocked".into(),
            kind: UnavailableKind::Private,
            message: "Blocked in this region".into(),
        }])
        .unwrap();
        assert_eq!(classifier.rules().len(), 1);
        assert!(classifier.classify("live").is_none());
        assert_eq!(
            classifier.classify("video is GEO-BLOCKED").unwrap().kind,
            UnavailableKind::Private
        );
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = FailureClassifier::from_rules(&[RuleConfig {
            pattern: "(unclosed".into(),
            kind: UnavailableKind::Removed,
            message: "x".into(),
        }])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn kinds_map_to_distinct_statuses() {
        assert_eq!(UnavailableKind::LiveStream.http_status(), 422);
        assert_eq!(UnavailableKind::SponsorOnly.http_status(), 402);
        assert_eq!(UnavailableKind::LoginRequired.http_status(), 401);
        assert_eq!(UnavailableKind::Removed.http_status(), 410);
        assert_eq!(UnavailableKind::Private.http_status(), 403);
    }
}
