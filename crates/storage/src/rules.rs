use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use anesth_roster_core::rules::{Condition, ConditionGroup, Rule, RuleAction};

use crate::to_rfc3339;

/// Parameters required to create a planning rule.
pub struct NewPlanningRule<'a> {
    pub name: &'a str,
    pub rule_type: &'a str,
    pub description: Option<&'a str>,
    pub priority: i64,
    pub enabled: bool,
    pub contexts: Vec<String>,
    pub conditions: Vec<Condition>,
    pub condition_groups: Vec<ConditionGroup>,
    pub actions: Vec<RuleAction>,
    pub created_at: DateTime<Utc>,
}

/// Optional field updates applied to an existing rule.
#[derive(Default)]
pub struct PlanningRuleUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub priority: Option<i64>,
    pub enabled: Option<bool>,
    pub contexts: Option<Vec<String>>,
    pub conditions: Option<Vec<Condition>>,
    pub condition_groups: Option<Vec<ConditionGroup>>,
    pub actions: Option<Vec<RuleAction>>,
}

/// Errors raised while reading or mutating planning rules.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("planning rule not found")]
    NotFound,
    #[error("failed to decode rule JSON column: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    id: String,
    name: String,
    rule_type: String,
    description: Option<String>,
    priority: i64,
    enabled: i64,
    contexts: String,
    conditions: String,
    condition_groups: String,
    actions: String,
}

impl RuleRow {
    fn into_domain(self) -> Result<(Rule, Option<String>), RuleError> {
        let rule = Rule {
            id: self.id,
            name: self.name,
            rule_type: self.rule_type,
            priority: self.priority,
            enabled: self.enabled != 0,
            contexts: serde_json::from_str(&self.contexts)?,
            conditions: serde_json::from_str(&self.conditions)?,
            condition_groups: serde_json::from_str(&self.condition_groups)?,
            actions: serde_json::from_str(&self.actions)?,
        };
        Ok((rule, self.description))
    }
}

/// Repository for the `planning_rules` table.
#[derive(Clone)]
pub struct RuleRepository {
    pool: SqlitePool,
}

impl RuleRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a new rule and returns its generated identifier.
    pub async fn insert(&self, rule: NewPlanningRule<'_>) -> Result<String, RuleError> {
        let id = Uuid::new_v4().to_string();
        let now = to_rfc3339(rule.created_at);
        sqlx::query(
            "INSERT INTO planning_rules \
             (id, name, rule_type, description, priority, enabled, contexts, conditions, \
              condition_groups, actions, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(rule.name)
        .bind(rule.rule_type)
        .bind(rule.description)
        .bind(rule.priority)
        .bind(rule.enabled as i64)
        .bind(serde_json::to_string(&rule.contexts)?)
        .bind(serde_json::to_string(&rule.conditions)?)
        .bind(serde_json::to_string(&rule.condition_groups)?)
        .bind(serde_json::to_string(&rule.actions)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Fetches one rule with its description.
    pub async fn fetch(&self, id: &str) -> Result<(Rule, Option<String>), RuleError> {
        let row = sqlx::query_as::<_, RuleRow>(
            "SELECT id, name, rule_type, description, priority, enabled, contexts, conditions, \
             condition_groups, actions FROM planning_rules WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RuleError::NotFound)?;
        row.into_domain()
    }

    /// Lists rules, optionally only enabled ones, highest priority first.
    pub async fn list(&self, enabled_only: bool) -> Result<Vec<Rule>, RuleError> {
        let sql = if enabled_only {
            "SELECT id, name, rule_type, description, priority, enabled, contexts, conditions, \
             condition_groups, actions FROM planning_rules WHERE enabled = 1 \
             ORDER BY priority DESC, name"
        } else {
            "SELECT id, name, rule_type, description, priority, enabled, contexts, conditions, \
             condition_groups, actions FROM planning_rules ORDER BY priority DESC, name"
        };
        let rows = sqlx::query_as::<_, RuleRow>(sql).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| row.into_domain().map(|(rule, _)| rule))
            .collect()
    }

    /// Loads enabled rules of the given types.
    pub async fn list_by_types(&self, types: &[String]) -> Result<Vec<Rule>, RuleError> {
        let all = self.list(true).await?;
        Ok(all
            .into_iter()
            .filter(|rule| types.iter().any(|t| *t == rule.rule_type))
            .collect())
    }

    /// Applies a partial update; unset fields keep their current value.
    pub async fn update(
        &self,
        id: &str,
        update: PlanningRuleUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<(Rule, Option<String>), RuleError> {
        let (current, description) = self.fetch(id).await?;

        sqlx::query(
            "UPDATE planning_rules SET name = ?, description = ?, priority = ?, enabled = ?, \
             contexts = ?, conditions = ?, condition_groups = ?, actions = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(update.name.as_deref().unwrap_or(&current.name))
        .bind(update.description.unwrap_or(description))
        .bind(update.priority.unwrap_or(current.priority))
        .bind(update.enabled.unwrap_or(current.enabled) as i64)
        .bind(serde_json::to_string(
            &update.contexts.unwrap_or(current.contexts),
        )?)
        .bind(serde_json::to_string(
            &update.conditions.unwrap_or(current.conditions),
        )?)
        .bind(serde_json::to_string(
            &update.condition_groups.unwrap_or(current.condition_groups),
        )?)
        .bind(serde_json::to_string(
            &update.actions.unwrap_or(current.actions),
        )?)
        .bind(to_rfc3339(updated_at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.fetch(id).await
    }

    /// Deletes one rule.
    pub async fn delete(&self, id: &str) -> Result<(), RuleError> {
        let result = sqlx::query("DELETE FROM planning_rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RuleError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::setup_db;
    use anesth_roster_core::rules::{ConditionOperator, RuleActionKind};
    use serde_json::json;

    fn sample_rule<'a>() -> NewPlanningRule<'a> {
        NewPlanningRule {
            name: "max leave duration",
            rule_type: "LEAVE",
            description: Some("caps consecutive leave days"),
            priority: 10,
            enabled: true,
            contexts: vec!["leave.create".to_string()],
            conditions: vec![Condition {
                field: "leave.counted_days".to_string(),
                operator: ConditionOperator::GreaterThan,
                value: json!(15),
            }],
            condition_groups: Vec::new(),
            actions: vec![RuleAction {
                kind: RuleActionKind::Forbid,
                message: Some("too long".to_string()),
            }],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_round_trips_json_columns() {
        let db = setup_db().await;
        let repo = db.rules();

        let id = repo.insert(sample_rule()).await.expect("insert");
        let (rule, description) = repo.fetch(&id).await.expect("fetch");

        assert_eq!(rule.name, "max leave duration");
        assert_eq!(rule.conditions.len(), 1);
        assert_eq!(rule.conditions[0].operator, ConditionOperator::GreaterThan);
        assert_eq!(rule.actions[0].kind, RuleActionKind::Forbid);
        assert_eq!(description.as_deref(), Some("caps consecutive leave days"));
    }

    #[tokio::test]
    async fn list_filters_disabled_rules() {
        let db = setup_db().await;
        let repo = db.rules();

        let id = repo.insert(sample_rule()).await.expect("insert");
        repo.update(
            &id,
            PlanningRuleUpdate {
                enabled: Some(false),
                ..PlanningRuleUpdate::default()
            },
            Utc::now(),
        )
        .await
        .expect("disable");

        assert!(repo.list(true).await.expect("list").is_empty());
        assert_eq!(repo.list(false).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn list_by_types_selects_matching_rules() {
        let db = setup_db().await;
        let repo = db.rules();

        repo.insert(sample_rule()).await.expect("insert");
        let mut supervision = sample_rule();
        supervision.name = "supervision cap";
        supervision.rule_type = "SUPERVISION";
        repo.insert(supervision).await.expect("insert");

        let rules = repo
            .list_by_types(&["SUPERVISION".to_string()])
            .await
            .expect("list");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule_type, "SUPERVISION");
    }

    #[tokio::test]
    async fn delete_removes_rule() {
        let db = setup_db().await;
        let repo = db.rules();

        let id = repo.insert(sample_rule()).await.expect("insert");
        repo.delete(&id).await.expect("delete");
        assert!(matches!(repo.fetch(&id).await, Err(RuleError::NotFound)));
        assert!(matches!(repo.delete(&id).await, Err(RuleError::NotFound)));
    }
}
