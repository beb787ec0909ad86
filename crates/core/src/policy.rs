use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::message::PlatformId;

/// A named group of rules sharing one priority. Rule sets are externally
/// managed (loaded from JSON, hot-reloadable by an admin process) and
/// read-only during evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub priority: i64,
    pub rules: Vec<PolicyRule>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub action_type: String,
    pub target_pattern: TargetPattern,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Block,
    RequireApproval,
}

/// Target match: exact name or a `*` glob. Parsed from the plain string form
/// used by the legacy rule files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TargetPattern {
    Exact(String),
    Glob(String),
}

impl TargetPattern {
    pub fn parse(raw: &str) -> Self {
        if raw.contains('*') {
            Self::Glob(raw.to_owned())
        } else {
            Self::Exact(raw.to_owned())
        }
    }

    pub fn matches(&self, target: &str) -> bool {
        match self {
            Self::Exact(name) => name == target,
            Self::Glob(pattern) => glob_match(pattern, target),
        }
    }
}

impl From<String> for TargetPattern {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<TargetPattern> for String {
    fn from(pattern: TargetPattern) -> Self {
        match pattern {
            TargetPattern::Exact(name) => name,
            TargetPattern::Glob(pattern) => pattern,
        }
    }
}

fn glob_match(pattern: &str, input: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == input;
    }

    let mut remaining = input;

    // Leading and trailing literals anchor at the ends of the input.
    let first = segments[0];
    if !first.is_empty() {
        match remaining.strip_prefix(first) {
            Some(rest) => remaining = rest,
            None => return false,
        }
    }
    let last = segments[segments.len() - 1];
    if !last.is_empty() {
        match remaining.strip_suffix(last) {
            Some(rest) => remaining = rest,
            None => return false,
        }
    }

    // Middle literals must appear between them, in order.
    for segment in &segments[1..segments.len() - 1] {
        if segment.is_empty() {
            continue;
        }
        match remaining.find(segment) {
            Some(position) => remaining = &remaining[position + segment.len()..],
            None => return false,
        }
    }

    true
}

/// One comparison operator, one variant. Deserialized from the legacy
/// `{field, operator, value}` shape so existing rule files keep working.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Gt(f64),
    Gte(f64),
    Lt(f64),
    Lte(f64),
    Contains(String),
    In(Vec<Value>),
}

impl Predicate {
    fn holds(&self, actual: Option<&Value>) -> bool {
        let Some(actual) = actual else { return false };
        match self {
            Self::Eq(expected) => actual == expected,
            Self::Ne(expected) => actual != expected,
            Self::Gt(threshold) => actual.as_f64().is_some_and(|value| value > *threshold),
            Self::Gte(threshold) => actual.as_f64().is_some_and(|value| value >= *threshold),
            Self::Lt(threshold) => actual.as_f64().is_some_and(|value| value < *threshold),
            Self::Lte(threshold) => actual.as_f64().is_some_and(|value| value <= *threshold),
            Self::Contains(needle) => match actual {
                Value::String(haystack) => haystack.contains(needle),
                Value::Array(items) => {
                    items.iter().any(|item| item.as_str() == Some(needle.as_str()))
                }
                _ => false,
            },
            Self::In(candidates) => candidates.contains(actual),
        }
    }
}

/// A conjunctive clause over a dotted path into the request envelope
/// (e.g. `params.center` or `context.platform`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCondition", into = "RawCondition")]
pub struct Condition {
    pub field: String,
    pub predicate: Predicate,
}

impl Condition {
    fn holds(&self, envelope: &Value) -> bool {
        self.predicate.holds(resolve_path(envelope, &self.field))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RawCondition {
    field: String,
    operator: String,
    value: Value,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConditionParseError {
    #[error("unknown condition operator: {0}")]
    UnknownOperator(String),
    #[error("condition operator {operator} expects a {expected} value")]
    InvalidValue { operator: String, expected: &'static str },
}

impl TryFrom<RawCondition> for Condition {
    type Error = ConditionParseError;

    fn try_from(raw: RawCondition) -> Result<Self, Self::Error> {
        let predicate = match raw.operator.as_str() {
            "eq" => Predicate::Eq(raw.value),
            "ne" => Predicate::Ne(raw.value),
            "gt" => Predicate::Gt(numeric_value("gt", &raw.value)?),
            "gte" => Predicate::Gte(numeric_value("gte", &raw.value)?),
            "lt" => Predicate::Lt(numeric_value("lt", &raw.value)?),
            "lte" => Predicate::Lte(numeric_value("lte", &raw.value)?),
            "contains" => Predicate::Contains(string_value("contains", &raw.value)?),
            "in" => Predicate::In(array_value("in", &raw.value)?),
            other => return Err(ConditionParseError::UnknownOperator(other.to_owned())),
        };
        Ok(Self { field: raw.field, predicate })
    }
}

impl From<Condition> for RawCondition {
    fn from(condition: Condition) -> Self {
        let (operator, value) = match condition.predicate {
            Predicate::Eq(value) => ("eq", value),
            Predicate::Ne(value) => ("ne", value),
            Predicate::Gt(value) => ("gt", json!(value)),
            Predicate::Gte(value) => ("gte", json!(value)),
            Predicate::Lt(value) => ("lt", json!(value)),
            Predicate::Lte(value) => ("lte", json!(value)),
            Predicate::Contains(value) => ("contains", json!(value)),
            Predicate::In(values) => ("in", Value::Array(values)),
        };
        Self { field: condition.field, operator: operator.to_owned(), value }
    }
}

fn numeric_value(operator: &str, value: &Value) -> Result<f64, ConditionParseError> {
    value.as_f64().ok_or(ConditionParseError::InvalidValue {
        operator: operator.to_owned(),
        expected: "numeric",
    })
}

fn string_value(operator: &str, value: &Value) -> Result<String, ConditionParseError> {
    value.as_str().map(str::to_owned).ok_or(ConditionParseError::InvalidValue {
        operator: operator.to_owned(),
        expected: "string",
    })
}

fn array_value(operator: &str, value: &Value) -> Result<Vec<Value>, ConditionParseError> {
    value.as_array().cloned().ok_or(ConditionParseError::InvalidValue {
        operator: operator.to_owned(),
        expected: "array",
    })
}

fn resolve_path<'a>(envelope: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = envelope;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Ephemeral authorization request, constructed per tool-call attempt.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActionRequest {
    pub action_type: String,
    pub target: String,
    pub arguments: Value,
    pub context: RequestContext,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestContext {
    pub platform: PlatformId,
}

impl ActionRequest {
    pub fn tool_call(target: impl Into<String>, arguments: Value, platform: PlatformId) -> Self {
        Self {
            action_type: "tool_call".to_owned(),
            target: target.into(),
            arguments,
            context: RequestContext { platform },
        }
    }

    /// Envelope the condition paths resolve against; tool arguments sit under
    /// `params` to match the legacy rule files.
    fn envelope(&self) -> Value {
        json!({
            "action_type": self.action_type,
            "target": self.target,
            "params": self.arguments,
            "context": { "platform": self.context.platform.as_str() },
        })
    }
}

/// Evaluation result. A degraded allow (evaluator unavailable, fail-open) is
/// its own variant so it stays distinguishable from a rule-based or default
/// allow in logs and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow { rule: Option<String> },
    AllowDegraded { reason: String },
    Block { rule: String, reason: Option<String> },
    RequireApproval { rule: String, approval_id: String },
}

impl PolicyDecision {
    pub fn permits_execution(&self) -> bool {
        matches!(self, Self::Allow { .. } | Self::AllowDegraded { .. })
    }
}

#[derive(Debug, Error)]
pub enum PolicyLoadError {
    #[error("policy rules failed to parse: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Deterministic interpreter over the rule set.
#[derive(Clone, Debug, Default)]
pub struct PolicyEngine {
    policies: Vec<Policy>,
}

impl PolicyEngine {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self { policies }
    }

    /// Loads a rule set from a JSON array of policies.
    pub fn from_json(raw: &str) -> Result<Self, PolicyLoadError> {
        let policies = serde_json::from_str::<Vec<Policy>>(raw)?;
        Ok(Self::new(policies))
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Pure evaluation: filter rules by action type, target pattern, and
    /// conjunctive conditions; pick the numerically highest priority; break
    /// ties by declaration order (first declared wins); no match defaults to
    /// allow.
    pub fn evaluate(&self, request: &ActionRequest) -> PolicyDecision {
        let envelope = request.envelope();
        let mut selected: Option<(i64, &Policy, &PolicyRule)> = None;

        for policy in &self.policies {
            for rule in &policy.rules {
                if rule.action_type != request.action_type {
                    continue;
                }
                if !rule.target_pattern.matches(&request.target) {
                    continue;
                }
                if !rule.conditions.iter().all(|condition| condition.holds(&envelope)) {
                    continue;
                }
                // Strictly-greater comparison keeps the first declared policy
                // on priority ties.
                let applies = match &selected {
                    Some((priority, _, _)) => policy.priority > *priority,
                    None => true,
                };
                if applies {
                    selected = Some((policy.priority, policy, rule));
                }
            }
        }

        match selected {
            None => PolicyDecision::Allow { rule: None },
            Some((_, policy, rule)) => match rule.effect {
                Effect::Allow => PolicyDecision::Allow { rule: Some(policy.name.clone()) },
                Effect::Block => PolicyDecision::Block {
                    rule: policy.name.clone(),
                    reason: rule.reason.clone(),
                },
                Effect::RequireApproval => PolicyDecision::RequireApproval {
                    rule: policy.name.clone(),
                    approval_id: Uuid::new_v4().to_string(),
                },
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyGateError {
    #[error("policy evaluator unavailable: {0}")]
    Unavailable(String),
}

/// Async seam in front of the evaluator. The in-process `PolicyEngine` never
/// fails; a remote evaluator can, and the generation engine fails open when
/// it does.
#[async_trait]
pub trait PolicyGate: Send + Sync {
    async fn evaluate(&self, request: &ActionRequest) -> Result<PolicyDecision, PolicyGateError>;
}

#[async_trait]
impl PolicyGate for PolicyEngine {
    async fn evaluate(&self, request: &ActionRequest) -> Result<PolicyDecision, PolicyGateError> {
        Ok(PolicyEngine::evaluate(self, request))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::message::PlatformId;

    use super::{
        ActionRequest, Condition, Effect, Policy, PolicyDecision, PolicyEngine, PolicyRule,
        Predicate, TargetPattern,
    };

    #[test]
    fn no_matching_rule_defaults_to_allow() {
        let engine = PolicyEngine::new(vec![block_policy("deny-bookings", 10, None)]);
        let request = ActionRequest::tool_call(
            "check_availability",
            json!({"center": "norte"}),
            PlatformId::Whatsapp,
        );

        assert_eq!(engine.evaluate(&request), PolicyDecision::Allow { rule: None });
    }

    #[test]
    fn matching_block_rule_wins_over_default() {
        let engine = PolicyEngine::new(vec![block_policy(
            "deny-bookings",
            10,
            Some(condition_eq("params.center", json!("norte"))),
        )]);
        let request =
            ActionRequest::tool_call("create_booking", json!({"center": "norte"}), PlatformId::Whatsapp);

        let decision = engine.evaluate(&request);
        assert!(matches!(decision, PolicyDecision::Block { ref rule, .. } if rule == "deny-bookings"));
    }

    #[test]
    fn condition_on_missing_field_does_not_match() {
        let engine = PolicyEngine::new(vec![block_policy(
            "deny-bookings",
            10,
            Some(condition_eq("params.center", json!("norte"))),
        )]);
        let request = ActionRequest::tool_call("create_booking", json!({}), PlatformId::Whatsapp);

        assert_eq!(engine.evaluate(&request), PolicyDecision::Allow { rule: None });
    }

    #[test]
    fn highest_priority_dominates_regardless_of_declaration_order() {
        let engine = PolicyEngine::new(vec![
            allow_policy("allow-low", 14),
            block_policy("block-high", 112, None),
        ]);
        let request = ActionRequest::tool_call("create_booking", json!({}), PlatformId::Whatsapp);

        let decision = engine.evaluate(&request);
        assert!(matches!(decision, PolicyDecision::Block { ref rule, .. } if rule == "block-high"));

        // Same priorities, reversed declaration order: still the higher one.
        let engine = PolicyEngine::new(vec![
            block_policy("block-high", 112, None),
            allow_policy("allow-low", 14),
        ]);
        let decision = engine.evaluate(&request);
        assert!(matches!(decision, PolicyDecision::Block { ref rule, .. } if rule == "block-high"));
    }

    #[test]
    fn equal_priorities_break_ties_by_declaration_order() {
        let engine = PolicyEngine::new(vec![
            allow_policy("declared-first", 50),
            block_policy("declared-second", 50, None),
        ]);
        let request = ActionRequest::tool_call("create_booking", json!({}), PlatformId::Whatsapp);

        let decision = engine.evaluate(&request);
        assert_eq!(decision, PolicyDecision::Allow { rule: Some("declared-first".to_owned()) });
    }

    #[test]
    fn evaluation_is_deterministic_for_a_fixed_rule_set_and_request() {
        let engine = PolicyEngine::new(vec![
            allow_policy("allow-low", 14),
            block_policy("block-high", 112, None),
        ]);
        let request = ActionRequest::tool_call("create_booking", json!({}), PlatformId::Whatsapp);

        let first = engine.evaluate(&request);
        for _ in 0..10 {
            assert_eq!(engine.evaluate(&request), first);
        }
    }

    #[test]
    fn require_approval_mints_a_unique_approval_id() {
        let policy = Policy {
            name: "manual-review".to_owned(),
            priority: 90,
            rules: vec![PolicyRule {
                action_type: "tool_call".to_owned(),
                target_pattern: TargetPattern::parse("create_booking"),
                conditions: Vec::new(),
                effect: Effect::RequireApproval,
                reason: None,
            }],
        };
        let engine = PolicyEngine::new(vec![policy]);
        let request = ActionRequest::tool_call("create_booking", json!({}), PlatformId::Whatsapp);

        let first = engine.evaluate(&request);
        let second = engine.evaluate(&request);
        let (first_id, second_id) = match (first, second) {
            (
                PolicyDecision::RequireApproval { approval_id: first_id, .. },
                PolicyDecision::RequireApproval { approval_id: second_id, .. },
            ) => (first_id, second_id),
            other => panic!("expected two require_approval decisions, got {other:?}"),
        };
        assert_ne!(first_id, second_id);
    }

    #[test]
    fn glob_target_patterns_match_prefixes() {
        let pattern = TargetPattern::parse("create_*");
        assert!(pattern.matches("create_booking"));
        assert!(pattern.matches("create_invoice"));
        assert!(!pattern.matches("cancel_booking"));

        let exact = TargetPattern::parse("create_booking");
        assert!(exact.matches("create_booking"));
        assert!(!exact.matches("create_booking_v2"));
    }

    #[test]
    fn context_platform_is_reachable_from_conditions() {
        let mut policy = block_policy("whatsapp-only-block", 20, None);
        policy.rules[0].conditions =
            vec![condition_eq("context.platform", json!("whatsapp"))];
        let engine = PolicyEngine::new(vec![policy]);

        let whatsapp_request =
            ActionRequest::tool_call("create_booking", json!({}), PlatformId::Whatsapp);
        assert!(matches!(engine.evaluate(&whatsapp_request), PolicyDecision::Block { .. }));

        let web_request = ActionRequest::tool_call("create_booking", json!({}), PlatformId::Web);
        assert_eq!(engine.evaluate(&web_request), PolicyDecision::Allow { rule: None });
    }

    #[test]
    fn rule_sets_load_from_legacy_json_shape() {
        let raw = r#"[
            {
                "name": "blocked-centers",
                "priority": 112,
                "rules": [
                    {
                        "actionType": "tool_call",
                        "targetPattern": "create_booking",
                        "conditions": [
                            {"field": "params.center", "operator": "eq", "value": "norte"},
                            {"field": "params.duration_minutes", "operator": "gt", "value": 90}
                        ],
                        "effect": "block",
                        "reason": "center norte is closed for maintenance"
                    }
                ]
            }
        ]"#;

        let engine = PolicyEngine::from_json(raw).expect("rule set should parse");
        let request = ActionRequest::tool_call(
            "create_booking",
            json!({"center": "norte", "duration_minutes": 120}),
            PlatformId::Whatsapp,
        );
        let decision = engine.evaluate(&request);
        assert!(
            matches!(decision, PolicyDecision::Block { ref reason, .. }
                if reason.as_deref() == Some("center norte is closed for maintenance"))
        );

        // Shorter booking fails the gt condition, so the rule does not apply.
        let short_request = ActionRequest::tool_call(
            "create_booking",
            json!({"center": "norte", "duration_minutes": 60}),
            PlatformId::Whatsapp,
        );
        assert_eq!(engine.evaluate(&short_request), PolicyDecision::Allow { rule: None });
    }

    #[test]
    fn unknown_operator_is_a_load_error() {
        let raw = r#"[
            {
                "name": "broken",
                "priority": 1,
                "rules": [
                    {
                        "actionType": "tool_call",
                        "targetPattern": "*",
                        "conditions": [
                            {"field": "params.center", "operator": "matches_regex", "value": ".*"}
                        ],
                        "effect": "block"
                    }
                ]
            }
        ]"#;

        assert!(PolicyEngine::from_json(raw).is_err());
    }

    #[test]
    fn remaining_operators_compare_as_expected() {
        let envelope_request = |value: serde_json::Value| {
            ActionRequest::tool_call("create_booking", value, PlatformId::Whatsapp)
        };
        let engine_with = |condition: Condition| {
            PolicyEngine::new(vec![block_policy("operator-check", 10, Some(condition))])
        };

        let blocked = |engine: &PolicyEngine, request: &ActionRequest| {
            matches!(engine.evaluate(request), PolicyDecision::Block { .. })
        };

        let ne = engine_with(Condition {
            field: "params.center".to_owned(),
            predicate: Predicate::Ne(json!("norte")),
        });
        assert!(blocked(&ne, &envelope_request(json!({"center": "sur"}))));
        assert!(!blocked(&ne, &envelope_request(json!({"center": "norte"}))));

        let lte = engine_with(Condition {
            field: "params.players".to_owned(),
            predicate: Predicate::Lte(2.0),
        });
        assert!(blocked(&lte, &envelope_request(json!({"players": 2}))));
        assert!(!blocked(&lte, &envelope_request(json!({"players": 3}))));

        let contains = engine_with(Condition {
            field: "params.notes".to_owned(),
            predicate: Predicate::Contains("vip".to_owned()),
        });
        assert!(blocked(&contains, &envelope_request(json!({"notes": "vip lane"}))));
        assert!(!blocked(&contains, &envelope_request(json!({"notes": "standard"}))));

        let within = engine_with(Condition {
            field: "params.center".to_owned(),
            predicate: Predicate::In(vec![json!("norte"), json!("sur")]),
        });
        assert!(blocked(&within, &envelope_request(json!({"center": "sur"}))));
        assert!(!blocked(&within, &envelope_request(json!({"center": "este"}))));
    }

    fn condition_eq(field: &str, value: serde_json::Value) -> Condition {
        Condition { field: field.to_owned(), predicate: Predicate::Eq(value) }
    }

    fn block_policy(name: &str, priority: i64, condition: Option<Condition>) -> Policy {
        Policy {
            name: name.to_owned(),
            priority,
            rules: vec![PolicyRule {
                action_type: "tool_call".to_owned(),
                target_pattern: TargetPattern::parse("create_booking"),
                conditions: condition.into_iter().collect(),
                effect: Effect::Block,
                reason: None,
            }],
        }
    }

    fn allow_policy(name: &str, priority: i64) -> Policy {
        Policy {
            name: name.to_owned(),
            priority,
            rules: vec![PolicyRule {
                action_type: "tool_call".to_owned(),
                target_pattern: TargetPattern::parse("create_booking"),
                conditions: Vec::new(),
                effect: Effect::Allow,
                reason: None,
            }],
        }
    }
}
