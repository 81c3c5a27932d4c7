use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Comparison applied between a context field and the condition value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Between,
    IsNull,
    IsNotNull,
}

/// Combinator for a condition group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogicalOperator {
    And,
    Or,
}

/// Single field comparison inside a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

/// Group of conditions combined with a logical operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub operator: LogicalOperator,
    pub conditions: Vec<Condition>,
}

/// Effect fired when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleActionKind {
    Forbid,
    Warn,
    Log,
    Notify,
}

impl RuleActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forbid => "FORBID",
            Self::Warn => "WARN",
            Self::Log => "LOG",
            Self::Notify => "NOTIFY",
        }
    }
}

/// Action attached to a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub kind: RuleActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Declarative planning rule evaluated against a context object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub rule_type: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub condition_groups: Vec<ConditionGroup>,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Returns `true` when the rule applies to the given planning context label.
    ///
    /// An empty contexts list means the rule applies everywhere.
    pub fn applies_to(&self, context: &str) -> bool {
        self.contexts.is_empty() || self.contexts.iter().any(|value| value == context)
    }
}

/// Outcome of evaluating one condition, kept for simulation traces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionTrace {
    pub field: String,
    pub operator: ConditionOperator,
    pub expected: Value,
    pub actual: Value,
    pub passed: bool,
}

/// Outcome of evaluating one rule against a context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleEvaluation {
    pub rule_id: String,
    pub rule_name: String,
    pub rule_type: String,
    pub priority: i64,
    pub matched: bool,
    /// Actions fired because the rule matched; empty when it did not.
    pub fired_actions: Vec<RuleAction>,
    pub traces: Vec<ConditionTrace>,
}

impl RuleEvaluation {
    /// Returns `true` when a matched rule carries a `FORBID` action.
    pub fn is_violation(&self) -> bool {
        self.matched
            && self
                .fired_actions
                .iter()
                .any(|action| action.kind == RuleActionKind::Forbid)
    }

    /// Returns `true` when a matched rule carries a `WARN` action but no `FORBID`.
    pub fn is_warning(&self) -> bool {
        self.matched
            && !self.is_violation()
            && self
                .fired_actions
                .iter()
                .any(|action| action.kind == RuleActionKind::Warn)
    }
}

/// Aggregate pass/fail verdict over a rule set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleCheckOutcome {
    pub passed: bool,
    pub violations: Vec<RuleEvaluation>,
    pub warnings: Vec<RuleEvaluation>,
}

/// Errors raised while evaluating rules.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleEngineError {
    #[error("context field not found: {0}")]
    UnknownField(String),
    #[error("BETWEEN requires a two-element array value on field {0}")]
    InvalidBetween(String),
}

/// Linear rule evaluator.
///
/// Rules are visited in descending priority order; there is no solver and no
/// backtracking. In strict mode a condition referencing a field absent from
/// the context is an error instead of a non-match.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleEngine {
    strict: bool,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strict(strict: bool) -> Self {
        Self { strict }
    }

    /// Evaluates every enabled rule against the context.
    ///
    /// `rule_types` optionally restricts evaluation to rules of the listed
    /// types. Disabled rules are skipped entirely.
    pub fn evaluate(
        &self,
        rules: &[Rule],
        context: &Value,
        rule_types: Option<&[String]>,
    ) -> Result<Vec<RuleEvaluation>, RuleEngineError> {
        let mut selected: Vec<&Rule> = rules
            .iter()
            .filter(|rule| rule.enabled)
            .filter(|rule| {
                rule_types
                    .map(|types| types.iter().any(|t| *t == rule.rule_type))
                    .unwrap_or(true)
            })
            .collect();
        selected.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut evaluations = Vec::with_capacity(selected.len());
        for rule in selected {
            evaluations.push(self.evaluate_rule(rule, context)?);
        }
        Ok(evaluations)
    }

    /// Evaluates the rules and folds the results into an aggregate verdict.
    pub fn check(
        &self,
        rules: &[Rule],
        context: &Value,
    ) -> Result<RuleCheckOutcome, RuleEngineError> {
        let evaluations = self.evaluate(rules, context, None)?;
        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        for evaluation in evaluations {
            if evaluation.is_violation() {
                violations.push(evaluation);
            } else if evaluation.is_warning() {
                warnings.push(evaluation);
            }
        }
        Ok(RuleCheckOutcome {
            passed: violations.is_empty(),
            violations,
            warnings,
        })
    }

    fn evaluate_rule(&self, rule: &Rule, context: &Value) -> Result<RuleEvaluation, RuleEngineError> {
        let mut traces = Vec::new();

        let matched = if rule.condition_groups.is_empty() {
            // A rule without groups ANDs its flat condition list.
            self.evaluate_conditions(
                &rule.conditions,
                LogicalOperator::And,
                context,
                &mut traces,
            )?
        } else {
            // Groups themselves combine with AND.
            let mut all = true;
            for group in &rule.condition_groups {
                let group_result = self.evaluate_conditions(
                    &group.conditions,
                    group.operator,
                    context,
                    &mut traces,
                )?;
                if !group_result {
                    all = false;
                }
            }
            all
        };

        Ok(RuleEvaluation {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            rule_type: rule.rule_type.clone(),
            priority: rule.priority,
            matched,
            fired_actions: if matched {
                rule.actions.clone()
            } else {
                Vec::new()
            },
            traces,
        })
    }

    fn evaluate_conditions(
        &self,
        conditions: &[Condition],
        operator: LogicalOperator,
        context: &Value,
        traces: &mut Vec<ConditionTrace>,
    ) -> Result<bool, RuleEngineError> {
        // An empty condition list matches, mirroring the AND identity.
        let mut result = matches!(operator, LogicalOperator::And);
        for condition in conditions {
            let passed = self.evaluate_condition(condition, context, traces)?;
            match operator {
                LogicalOperator::And => {
                    if !passed {
                        return Ok(false);
                    }
                    result = true;
                }
                LogicalOperator::Or => {
                    if passed {
                        return Ok(true);
                    }
                    result = false;
                }
            }
        }
        Ok(result)
    }

    fn evaluate_condition(
        &self,
        condition: &Condition,
        context: &Value,
        traces: &mut Vec<ConditionTrace>,
    ) -> Result<bool, RuleEngineError> {
        let actual = lookup_path(context, &condition.field);

        if actual.is_none() && self.strict {
            return Err(RuleEngineError::UnknownField(condition.field.clone()));
        }

        let passed = match condition.operator {
            ConditionOperator::IsNull => actual.map(Value::is_null).unwrap_or(true),
            ConditionOperator::IsNotNull => actual.map(|v| !v.is_null()).unwrap_or(false),
            operator => match actual {
                Some(actual) => compare(operator, actual, &condition.value, &condition.field)?,
                None => false,
            },
        };

        traces.push(ConditionTrace {
            field: condition.field.clone(),
            operator: condition.operator,
            expected: condition.value.clone(),
            actual: actual.cloned().unwrap_or(Value::Null),
            passed,
        });

        Ok(passed)
    }
}

/// Resolves a dotted path (`user.role`, `leave.counted_days`) inside the context.
fn lookup_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn compare(
    operator: ConditionOperator,
    actual: &Value,
    expected: &Value,
    field: &str,
) -> Result<bool, RuleEngineError> {
    let result = match operator {
        ConditionOperator::Equals => values_equal(actual, expected),
        ConditionOperator::NotEquals => !values_equal(actual, expected),
        ConditionOperator::GreaterThan => numeric_cmp(actual, expected, |a, b| a > b),
        ConditionOperator::LessThan => numeric_cmp(actual, expected, |a, b| a < b),
        ConditionOperator::GreaterThanOrEqual => numeric_cmp(actual, expected, |a, b| a >= b),
        ConditionOperator::LessThanOrEqual => numeric_cmp(actual, expected, |a, b| a <= b),
        ConditionOperator::Contains => contains(actual, expected),
        ConditionOperator::NotContains => !contains(actual, expected),
        ConditionOperator::StartsWith => {
            string_pair(actual, expected).map_or(false, |(a, b)| a.starts_with(b))
        }
        ConditionOperator::EndsWith => {
            string_pair(actual, expected).map_or(false, |(a, b)| a.ends_with(b))
        }
        ConditionOperator::In => expected
            .as_array()
            .map_or(false, |items| items.iter().any(|item| values_equal(actual, item))),
        ConditionOperator::NotIn => expected
            .as_array()
            .map_or(true, |items| !items.iter().any(|item| values_equal(actual, item))),
        ConditionOperator::Between => {
            let bounds = expected
                .as_array()
                .filter(|items| items.len() == 2)
                .ok_or_else(|| RuleEngineError::InvalidBetween(field.to_string()))?;
            numeric_cmp(actual, &bounds[0], |a, lo| a >= lo)
                && numeric_cmp(actual, &bounds[1], |a, hi| a <= hi)
        }
        ConditionOperator::IsNull | ConditionOperator::IsNotNull => unreachable!(),
    };
    Ok(result)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn numeric_cmp(actual: &Value, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => cmp(a, b),
        // Dates and other ordered strings compare lexicographically.
        _ => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(b)) => cmp_strings(a, b, cmp),
            _ => false,
        },
    }
}

fn cmp_strings(a: &str, b: &str, cmp: impl Fn(f64, f64) -> bool) -> bool {
    let ordering = a.cmp(b) as i8 as f64;
    cmp(ordering, 0.0)
}

fn contains(actual: &Value, expected: &Value) -> bool {
    if let Some(items) = actual.as_array() {
        return items.iter().any(|item| values_equal(item, expected));
    }
    string_pair(actual, expected).map_or(false, |(a, b)| a.contains(b))
}

fn string_pair<'a>(a: &'a Value, b: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((a.as_str()?, b.as_str()?))
}
