// Automated rules: which targets to act on and what to do with them.
//
// A Rule is immutable and can only be produced by RuleBuilder::build, which
// checks every field in a fixed order and stops at the first violation.
// Rules decoded from JSON or form fields go through the same builder, so a
// persisted rule that no longer validates is never resurrected.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::match_expression::{IllegalMatchExpression, MatchExpressionEvaluator};

/// Event specifier value for rules that archive instead of recording.
pub const ARCHIVE_EVENT: &str = "archive";

/// Prefix of the recording a template rule starts on each matched target.
pub const RECORDING_NAME_PREFIX: &str = "auto_";

// ============================================================================
// ERRORS
// ============================================================================

/// Error types for rule construction
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    /// A field failed validation; the message names the field and value.
    #[error("{0}")]
    IllegalArgument(String),

    #[error("{0}")]
    MatchExpressionValidation(#[source] IllegalMatchExpression),
}

impl RuleError {
    fn blank(field: &str, value: &str) -> Self {
        RuleError::IllegalArgument(format!("\"{}\" cannot be blank, was \"{}\"", field, value))
    }

    fn negative(field: &str, value: i64) -> Self {
        RuleError::IllegalArgument(format!("\"{}\" cannot be negative, was \"{}\"", field, value))
    }

    fn positive(field: &str, value: i64) -> Self {
        RuleError::IllegalArgument(format!("\"{}\" cannot be positive, was \"{}\"", field, value))
    }
}

// ============================================================================
// EVENT SPECIFIER
// ============================================================================

/// Where a template comes from on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TemplateType {
    /// Shipped with the target runtime
    Target,
    /// Uploaded by a user
    Custom,
}

impl fmt::Display for TemplateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateType::Target => write!(f, "TARGET"),
            TemplateType::Custom => write!(f, "CUSTOM"),
        }
    }
}

/// What a rule does when its expression matches a target.
///
/// Written as `archive` or `template=<name>[,type=TARGET|CUSTOM]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventSpecifier {
    /// Snapshot the target and move the snapshot into the archive store.
    Archive,
    /// Start a recording with the named event template.
    Template {
        name: String,
        template_type: Option<TemplateType>,
    },
}

impl EventSpecifier {
    pub fn is_archive(&self) -> bool {
        matches!(self, EventSpecifier::Archive)
    }

    /// Template name, `None` for archive rules.
    pub fn template_name(&self) -> Option<&str> {
        match self {
            EventSpecifier::Archive => None,
            EventSpecifier::Template { name, .. } => Some(name),
        }
    }

    pub fn template_type(&self) -> Option<TemplateType> {
        match self {
            EventSpecifier::Archive => None,
            EventSpecifier::Template { template_type, .. } => *template_type,
        }
    }
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FromStr for EventSpecifier {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RuleError::IllegalArgument(s.to_string());

        if s == ARCHIVE_EVENT {
            return Ok(EventSpecifier::Archive);
        }

        let rest = s.strip_prefix("template=").ok_or_else(invalid)?;
        let (name, template_type) = match rest.split_once(',') {
            None => (rest, None),
            Some((name, type_part)) => {
                let template_type = match type_part.strip_prefix("type=") {
                    Some("TARGET") => TemplateType::Target,
                    Some("CUSTOM") => TemplateType::Custom,
                    _ => return Err(invalid()),
                };
                (name, Some(template_type))
            }
        };

        if !is_word(name) {
            return Err(invalid());
        }
        Ok(EventSpecifier::Template {
            name: name.to_string(),
            template_type,
        })
    }
}

impl fmt::Display for EventSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSpecifier::Archive => write!(f, "{}", ARCHIVE_EVENT),
            EventSpecifier::Template {
                name,
                template_type: None,
            } => write!(f, "template={}", name),
            EventSpecifier::Template {
                name,
                template_type: Some(t),
            } => write!(f, "template={},type={}", name, t),
        }
    }
}

impl Serialize for EventSpecifier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventSpecifier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// RULE
// ============================================================================

/// A validated automated rule.
///
/// Numeric fields use zero for "not set". `max_age_seconds` and
/// `max_size_bytes` are only applied to the started recording when positive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    name: String,
    description: String,
    match_expression: String,
    event_specifier: EventSpecifier,
    archival_period_seconds: i64,
    preserved_archives: i64,
    max_age_seconds: i64,
    max_size_bytes: i64,
    enabled: bool,
}

impl Rule {
    pub fn builder() -> RuleBuilder {
        RuleBuilder::default()
    }

    /// Sanitized rule name, unique within the rule set.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn match_expression(&self) -> &str {
        &self.match_expression
    }

    pub fn event_specifier(&self) -> &EventSpecifier {
        &self.event_specifier
    }

    pub fn archival_period_seconds(&self) -> i64 {
        self.archival_period_seconds
    }

    pub fn preserved_archives(&self) -> i64 {
        self.preserved_archives
    }

    pub fn max_age_seconds(&self) -> i64 {
        self.max_age_seconds
    }

    pub fn max_size_bytes(&self) -> i64 {
        self.max_size_bytes
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_archiver(&self) -> bool {
        self.event_specifier.is_archive()
    }

    /// Name of the recording this rule starts on matched targets.
    pub fn recording_name(&self) -> String {
        format!("{}{}", RECORDING_NAME_PREFIX, self.name)
    }

    /// Copy of this rule with a different enabled flag.
    pub fn with_enabled(&self, enabled: bool) -> Rule {
        Rule {
            enabled,
            ..self.clone()
        }
    }

    /// Builder pre-populated with this rule's fields.
    pub fn to_builder(&self) -> RuleBuilder {
        RuleBuilder {
            name: Some(self.name.clone()),
            description: Some(self.description.clone()),
            match_expression: Some(self.match_expression.clone()),
            event_specifier: Some(self.event_specifier.to_string()),
            archival_period_seconds: Some(self.archival_period_seconds),
            preserved_archives: Some(self.preserved_archives),
            max_age_seconds: Some(self.max_age_seconds),
            max_size_bytes: Some(self.max_size_bytes),
            enabled: Some(self.enabled),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rule({}: [{}] -> {})",
            self.name, self.match_expression, self.event_specifier
        )
    }
}

/// Replaces every whitespace character with `_`.
pub fn sanitize_rule_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for Rule. Every field is optional until `build`.
///
/// Also the decoding target for JSON bodies and form fields; both use the
/// camelCase field names (`matchExpression`, `eventSpecifier`, ...).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleBuilder {
    name: Option<String>,
    description: Option<String>,
    match_expression: Option<String>,
    event_specifier: Option<String>,
    archival_period_seconds: Option<i64>,
    preserved_archives: Option<i64>,
    max_age_seconds: Option<i64>,
    max_size_bytes: Option<i64>,
    enabled: Option<bool>,
}

impl RuleBuilder {
    pub fn new() -> Self {
        RuleBuilder::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn match_expression(mut self, match_expression: impl Into<String>) -> Self {
        self.match_expression = Some(match_expression.into());
        self
    }

    pub fn event_specifier(mut self, event_specifier: impl Into<String>) -> Self {
        self.event_specifier = Some(event_specifier.into());
        self
    }

    pub fn archival_period_seconds(mut self, seconds: i64) -> Self {
        self.archival_period_seconds = Some(seconds);
        self
    }

    pub fn preserved_archives(mut self, count: i64) -> Self {
        self.preserved_archives = Some(count);
        self
    }

    pub fn max_age_seconds(mut self, seconds: i64) -> Self {
        self.max_age_seconds = Some(seconds);
        self
    }

    pub fn max_size_bytes(mut self, bytes: i64) -> Self {
        self.max_size_bytes = Some(bytes);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Decodes a JSON object into a builder. Unknown keys are ignored.
    pub fn from_json(json: &str) -> Result<Self, RuleError> {
        serde_json::from_str(json).map_err(|e| RuleError::IllegalArgument(e.to_string()))
    }

    /// Decodes submitted form fields into a builder.
    ///
    /// Numeric fields must parse as integers; `enabled` accepts `true`/`false`.
    pub fn from_form(form: &HashMap<String, String>) -> Result<Self, RuleError> {
        fn int(form: &HashMap<String, String>, key: &str) -> Result<Option<i64>, RuleError> {
            match form.get(key) {
                None => Ok(None),
                Some(raw) => raw.trim().parse::<i64>().map(Some).map_err(|_| {
                    RuleError::IllegalArgument(format!(
                        "\"{}\" must be an integer, was \"{}\"",
                        key, raw
                    ))
                }),
            }
        }

        let enabled = match form.get("enabled") {
            None => None,
            Some(raw) => Some(raw.trim().parse::<bool>().map_err(|_| {
                RuleError::IllegalArgument(format!(
                    "\"enabled\" must be true or false, was \"{}\"",
                    raw
                ))
            })?),
        };

        Ok(RuleBuilder {
            name: form.get("name").cloned(),
            description: form.get("description").cloned(),
            match_expression: form.get("matchExpression").cloned(),
            event_specifier: form.get("eventSpecifier").cloned(),
            archival_period_seconds: int(form, "archivalPeriodSeconds")?,
            preserved_archives: int(form, "preservedArchives")?,
            max_age_seconds: int(form, "maxAgeSeconds")?,
            max_size_bytes: int(form, "maxSizeBytes")?,
            enabled,
        })
    }

    /// Validates every field and produces the rule, or the first violation.
    ///
    /// Order: name, matchExpression, eventSpecifier, negative fields,
    /// archive-only restrictions, then static expression validation.
    pub fn build(self, evaluator: &dyn MatchExpressionEvaluator) -> Result<Rule, RuleError> {
        let raw_name = self.name.unwrap_or_default();
        let match_expression = self.match_expression.unwrap_or_default();
        let raw_specifier = self.event_specifier.unwrap_or_default();
        let is_archive = raw_specifier.trim() == ARCHIVE_EVENT;

        // Archive rules may be unnamed; they get a name derived below.
        if raw_name.trim().is_empty() && !is_archive {
            return Err(RuleError::blank("name", &raw_name));
        }
        if match_expression.trim().is_empty() {
            return Err(RuleError::blank("matchExpression", &match_expression));
        }
        if raw_specifier.trim().is_empty() {
            return Err(RuleError::blank("eventSpecifier", &raw_specifier));
        }
        let event_specifier: EventSpecifier = raw_specifier.trim().parse()?;

        let archival_period_seconds = self.archival_period_seconds.unwrap_or(0);
        let preserved_archives = self.preserved_archives.unwrap_or(0);
        let max_age_seconds = self.max_age_seconds.unwrap_or(0);
        let max_size_bytes = self.max_size_bytes.unwrap_or(0);

        if archival_period_seconds < 0 {
            return Err(RuleError::negative(
                "archivalPeriodSeconds",
                archival_period_seconds,
            ));
        }
        if preserved_archives < 0 {
            return Err(RuleError::negative("preservedArchives", preserved_archives));
        }

        if event_specifier.is_archive() {
            for (field, value) in [
                ("archivalPeriodSeconds", archival_period_seconds),
                ("preservedArchives", preserved_archives),
                ("maxSizeBytes", max_size_bytes),
                ("maxAgeSeconds", max_age_seconds),
            ] {
                if value > 0 {
                    return Err(RuleError::positive(field, value));
                }
            }
        }

        evaluator
            .validate(&match_expression)
            .map_err(RuleError::MatchExpressionValidation)?;

        let name = if raw_name.trim().is_empty() {
            derived_archive_name(&match_expression)
        } else {
            sanitize_rule_name(&raw_name)
        };

        Ok(Rule {
            name,
            description: self.description.unwrap_or_default(),
            match_expression,
            event_specifier,
            archival_period_seconds,
            preserved_archives,
            max_age_seconds,
            max_size_bytes,
            enabled: self.enabled.unwrap_or(true),
        })
    }
}

/// `archive_` plus the first 8 hex digits of the expression's SHA-256.
fn derived_archive_name(match_expression: &str) -> String {
    let digest = Sha256::digest(match_expression.as_bytes());
    let hex: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("{}_{}", ARCHIVE_EVENT, hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::match_expression::CompiledEvaluator;

    const MATCH_EXPRESSION: &str = "target.alias == 'someAlias'";

    fn valid() -> RuleBuilder {
        RuleBuilder::new()
            .name("Some Rule")
            .match_expression(MATCH_EXPRESSION)
            .event_specifier("template=Continuous")
    }

    fn build(builder: RuleBuilder) -> Result<Rule, RuleError> {
        builder.build(&CompiledEvaluator::new())
    }

    fn message(err: RuleError) -> String {
        match err {
            RuleError::IllegalArgument(msg) => msg,
            other => panic!("expected IllegalArgument, got {:?}", other),
        }
    }

    #[test]
    fn test_name_is_sanitized() {
        let rule = build(valid()).unwrap();
        assert_eq!(rule.name(), "Some_Rule");
        assert_eq!(rule.recording_name(), "auto_Some_Rule");
        assert!(rule.is_enabled());
        assert_eq!(rule.description(), "");
    }

    #[test]
    fn test_blank_fields_rejected_in_order() {
        let err = build(valid().name("")).unwrap_err();
        assert_eq!(message(err), "\"name\" cannot be blank, was \"\"");

        let err = build(valid().match_expression("  ")).unwrap_err();
        assert_eq!(message(err), "\"matchExpression\" cannot be blank, was \"  \"");

        let err = build(RuleBuilder::new().name("r").match_expression("true")).unwrap_err();
        assert_eq!(message(err), "\"eventSpecifier\" cannot be blank, was \"\"");
    }

    #[test]
    fn test_invalid_event_specifiers() {
        for specifier in ["invalid", "events=incorrect", "tenplate=typo", "template=", "template=a,type=OTHER"] {
            let err = build(valid().event_specifier(specifier)).unwrap_err();
            assert_eq!(message(err), specifier);
        }
    }

    #[test]
    fn test_template_specifier_with_type() {
        let rule = build(valid().event_specifier("template=Profiling,type=TARGET")).unwrap();
        assert_eq!(rule.event_specifier().template_name(), Some("Profiling"));
        assert_eq!(rule.event_specifier().template_type(), Some(TemplateType::Target));
        assert_eq!(
            rule.event_specifier().to_string(),
            "template=Profiling,type=TARGET"
        );
    }

    #[test]
    fn test_negative_fields_rejected() {
        let err = build(valid().archival_period_seconds(-1)).unwrap_err();
        assert_eq!(
            message(err),
            "\"archivalPeriodSeconds\" cannot be negative, was \"-1\""
        );
        let err = build(valid().preserved_archives(-1)).unwrap_err();
        assert_eq!(message(err), "\"preservedArchives\" cannot be negative, was \"-1\"");
    }

    #[test]
    fn test_archive_rejects_positive_fields_but_accepts_zero() {
        let archive = || valid().event_specifier("archive");

        let cases: [(&str, RuleBuilder); 4] = [
            ("archivalPeriodSeconds", archive().archival_period_seconds(5)),
            ("preservedArchives", archive().preserved_archives(5)),
            ("maxSizeBytes", archive().max_size_bytes(5)),
            ("maxAgeSeconds", archive().max_age_seconds(5)),
        ];
        for (field, builder) in cases {
            let err = build(builder).unwrap_err();
            assert_eq!(message(err), format!("\"{}\" cannot be positive, was \"5\"", field));
        }

        let rule = build(
            archive()
                .archival_period_seconds(0)
                .preserved_archives(0)
                .max_size_bytes(0)
                .max_age_seconds(0),
        )
        .unwrap();
        assert!(rule.is_archiver());
    }

    #[test]
    fn test_unnamed_archive_rule_gets_derived_name() {
        let rule = build(
            RuleBuilder::new()
                .match_expression(MATCH_EXPRESSION)
                .event_specifier("archive"),
        )
        .unwrap();
        assert!(rule.name().starts_with("archive_"));
        assert_eq!(rule.name().len(), "archive_".len() + 8);

        let again = build(
            RuleBuilder::new()
                .match_expression(MATCH_EXPRESSION)
                .event_specifier("archive"),
        )
        .unwrap();
        assert_eq!(rule.name(), again.name());
    }

    #[test]
    fn test_disallowed_expressions_rejected() {
        for expression in [
            "while (true) continue; false",
            "function foo() { return false; }; foo();",
            "System.exit(1)",
            "java.lang.System.exit(1)",
        ] {
            match build(valid().match_expression(expression)).unwrap_err() {
                RuleError::MatchExpressionValidation(e) => {
                    assert!(e.to_string().starts_with("matchExpression rejected, illegal"))
                }
                other => panic!("unexpected error {:?}", other),
            }
        }
    }

    #[test]
    fn test_field_errors_reported_before_expression_errors() {
        let err = build(
            valid()
                .match_expression("System.exit(1)")
                .archival_period_seconds(-1),
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::IllegalArgument(_)));
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "name": "Some Rule",
            "description": "This is a description",
            "matchExpression": "target.alias == 'someAlias'",
            "eventSpecifier": "template=Continuous",
            "maxAgeSeconds": 60,
            "maxSizeBytes": 32768,
            "archivalPeriodSeconds": 300,
            "preservedArchives": 5
        }"#;
        let rule = build(RuleBuilder::from_json(json).unwrap()).unwrap();
        assert_eq!(rule.name(), "Some_Rule");
        assert_eq!(rule.description(), "This is a description");
        assert_eq!(rule.max_age_seconds(), 60);
        assert_eq!(rule.max_size_bytes(), 32768);
        assert_eq!(rule.archival_period_seconds(), 300);
        assert_eq!(rule.preserved_archives(), 5);
    }

    #[test]
    fn test_from_form() {
        let form: HashMap<String, String> = [
            ("name", "Some Rule"),
            ("matchExpression", MATCH_EXPRESSION),
            ("eventSpecifier", "template=Continuous"),
            ("archivalPeriodSeconds", "300"),
            ("preservedArchives", "5"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let rule = build(RuleBuilder::from_form(&form).unwrap()).unwrap();
        assert_eq!(rule.archival_period_seconds(), 300);
        assert_eq!(rule.preserved_archives(), 5);

        let mut bad = form.clone();
        bad.insert("preservedArchives".to_string(), "five".to_string());
        assert!(RuleBuilder::from_form(&bad).is_err());
    }

    #[test]
    fn test_serialized_rule_rebuilds() {
        let rule = build(valid().description("d").max_age_seconds(30)).unwrap();
        let json = serde_json::to_string(&rule).unwrap();
        let rebuilt = build(RuleBuilder::from_json(&json).unwrap()).unwrap();
        assert_eq!(rule, rebuilt);
    }
}
