//! The Policy Engine: decides whether a task submission is allowed, given
//! the submitting actor's capability set and that task type's rate-limit,
//! concurrency, and resource-cap rules.
//!
//! Checks run in a fixed order -- capability, rate, concurrency, resource
//! caps, approval -- and the first failing check is the one reported. This
//! is a composed pipeline of plain functions rather than an exception-style
//! early-return chain, so each check stays independently testable.

use std::collections::HashSet;

use chrono::{Duration as ChronoDuration, Timelike, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use taskforge_db::models::{PolicyLevel, RiskClass, TaskType};
use taskforge_db::queries::tasks::{count_active, count_since};

/// The stale-task guard used to exclude crashed/stuck rows from a user's
/// concurrency count: large enough to avoid undercounting live work, small
/// enough to free a stuck user within the hour.
fn stale_task_guard() -> ChronoDuration {
    ChronoDuration::hours(1)
}

/// Resource caps checked against the submission's `input` payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLimits {
    pub max_parts: Option<i64>,
    pub max_batch_size: Option<i64>,
    pub max_capabilities: Option<i64>,
}

/// One policy row: the descriptive level/risk class a task type is defined
/// at, the capabilities an actor must hold in full, and its optional
/// rate/concurrency/resource caps. A missing cap means "skip this check",
/// not "zero".
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub level: PolicyLevel,
    pub risk: RiskClass,
    pub required: &'static [&'static str],
    pub max_concurrent: Option<i64>,
    pub rate_per_hour: Option<i64>,
    pub rate_per_day: Option<i64>,
    pub resource_limits: ResourceLimits,
    pub requires_approval: bool,
}

/// Look up the policy rule for `task_type`. Every `TaskType` variant has an
/// entry. The eight supplier-facing fetch/validation/notification types
/// without an explicit row upstream share one low-risk, generous-allowance
/// row, per the table's note that the remainder "follow the same shape".
pub fn rule_for(task_type: TaskType) -> PolicyRule {
    use PolicyLevel::*;
    use RiskClass::*;
    use TaskType::*;

    match task_type {
        PartEnrichment => PolicyRule {
            level: User,
            risk: Medium,
            required: &["parts:write", "tasks:user"],
            max_concurrent: Some(3),
            rate_per_hour: Some(30),
            rate_per_day: Some(150),
            resource_limits: ResourceLimits {
                max_parts: Some(1),
                max_batch_size: None,
                max_capabilities: Some(5),
            },
            requires_approval: false,
        },
        BulkEnrichment => PolicyRule {
            level: PowerUser,
            risk: High,
            required: &["parts:write", "tasks:power_user"],
            max_concurrent: Some(2),
            rate_per_hour: Some(50),
            rate_per_day: Some(200),
            resource_limits: ResourceLimits {
                max_parts: Some(50),
                max_batch_size: Some(10),
                max_capabilities: None,
            },
            requires_approval: false,
        },
        FileImportEnrichment => PolicyRule {
            level: PowerUser,
            risk: High,
            required: &["parts:write", "csv:import", "tasks:power_user"],
            max_concurrent: Some(2),
            rate_per_hour: Some(20),
            rate_per_day: Some(100),
            resource_limits: ResourceLimits {
                max_parts: Some(1000),
                max_batch_size: None,
                max_capabilities: None,
            },
            requires_approval: false,
        },
        PriceUpdate => PolicyRule {
            level: PowerUser,
            risk: Medium,
            required: &["parts:write", "pricing:update", "tasks:power_user"],
            max_concurrent: Some(1),
            rate_per_hour: Some(5),
            rate_per_day: Some(20),
            resource_limits: ResourceLimits::default(),
            requires_approval: false,
        },
        DatabaseCleanup => PolicyRule {
            level: Admin,
            risk: Critical,
            required: &["admin", "database:cleanup", "tasks:admin"],
            max_concurrent: Some(1),
            rate_per_hour: Some(1),
            rate_per_day: Some(3),
            resource_limits: ResourceLimits::default(),
            requires_approval: false,
        },
        BackupCreation => PolicyRule {
            level: Admin,
            risk: High,
            required: &["admin", "backup:create", "tasks:admin"],
            max_concurrent: Some(1),
            rate_per_hour: Some(2),
            rate_per_day: Some(5),
            resource_limits: ResourceLimits::default(),
            requires_approval: false,
        },
        BackupRestore => PolicyRule {
            level: Admin,
            risk: Critical,
            required: &["admin", "backup:restore", "tasks:admin"],
            max_concurrent: Some(1),
            rate_per_hour: Some(1),
            rate_per_day: Some(3),
            resource_limits: ResourceLimits::default(),
            requires_approval: false,
        },
        BackupScheduled => PolicyRule {
            level: System,
            risk: High,
            required: &["system"],
            max_concurrent: Some(1),
            rate_per_hour: None,
            rate_per_day: None,
            resource_limits: ResourceLimits::default(),
            requires_approval: false,
        },
        BackupRetention => PolicyRule {
            level: System,
            risk: Medium,
            required: &["system"],
            max_concurrent: Some(1),
            rate_per_hour: None,
            rate_per_day: None,
            resource_limits: ResourceLimits::default(),
            requires_approval: false,
        },
        InventoryAudit => PolicyRule {
            level: System,
            risk: Low,
            required: &["system", "inventory:audit"],
            max_concurrent: Some(1),
            rate_per_hour: None,
            rate_per_day: None,
            resource_limits: ResourceLimits::default(),
            requires_approval: false,
        },
        ReportGeneration => PolicyRule {
            level: User,
            risk: Low,
            required: &["tasks:user", "reports:read"],
            max_concurrent: Some(2),
            rate_per_hour: Some(20),
            rate_per_day: Some(100),
            resource_limits: ResourceLimits::default(),
            requires_approval: false,
        },
        FetchImage | FetchPricing | FetchStock | FetchSpecifications | PartValidation
        | EmailNotification | PrinterDiscovery | DatasheetDownload => PolicyRule {
            level: User,
            risk: Low,
            required: &["tasks:user"],
            max_concurrent: Some(10),
            rate_per_hour: None,
            rate_per_day: None,
            resource_limits: ResourceLimits::default(),
            requires_approval: false,
        },
        FetchDatasheet => PolicyRule {
            level: User,
            risk: Low,
            required: &["tasks:user"],
            max_concurrent: Some(10),
            rate_per_hour: None,
            rate_per_day: None,
            resource_limits: ResourceLimits::default(),
            requires_approval: false,
        },
    }
}

/// Why a submission was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDenial(pub String);

impl std::fmt::Display for PolicyDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Evaluate whether `actor` (holding `actor_capabilities`) may submit a
/// `task_type` task carrying `input` right now. Checks run capability
/// (every required string present), then rate (admins exempt), then
/// concurrency, then resource caps, then approval, in that fixed order;
/// the first failure wins.
pub async fn evaluate(
    pool: &PgPool,
    actor: Uuid,
    actor_capabilities: &HashSet<String>,
    task_type: TaskType,
    input: &Value,
) -> anyhow::Result<Result<(), PolicyDenial>> {
    let rule = rule_for(task_type);

    if let Some(denial) = check_capabilities(&rule, actor_capabilities) {
        return Ok(Err(denial));
    }

    if !actor_capabilities.contains("admin") {
        if let Some(limit) = rule.rate_per_hour {
            let since = Utc::now() - ChronoDuration::hours(1);
            let count = count_since(pool, actor, task_type, since).await?;
            if count >= limit {
                let now = Utc::now();
                let minutes_left = 60 - now.minute();
                return Ok(Err(PolicyDenial(format!(
                    "Hourly rate limit exceeded ({count}/{limit}). Try again in {minutes_left} minutes."
                ))));
            }
        }

        if let Some(limit) = rule.rate_per_day {
            let since = Utc::now() - ChronoDuration::days(1);
            let count = count_since(pool, actor, task_type, since).await?;
            if count >= limit {
                return Ok(Err(PolicyDenial(format!(
                    "Daily rate limit exceeded ({count}/{limit}). Try again tomorrow."
                ))));
            }
        }
    }

    if let Some(cap) = rule.max_concurrent {
        let active = count_active(pool, actor, task_type, Some(stale_task_guard())).await?;
        if active >= cap {
            return Ok(Err(PolicyDenial(format!(
                "too many active {task_type} tasks ({active}/{cap})"
            ))));
        }
    }

    if let Some(denial) = check_resource_limits(&rule.resource_limits, input) {
        return Ok(Err(denial));
    }

    if rule.requires_approval {
        return Ok(Err(PolicyDenial("approval pending".to_string())));
    }

    Ok(Ok(()))
}

/// Denies naming every capability `rule.required` lists that `actor` lacks.
fn check_capabilities(rule: &PolicyRule, actor: &HashSet<String>) -> Option<PolicyDenial> {
    let missing: Vec<&str> = rule
        .required
        .iter()
        .copied()
        .filter(|cap| !actor.contains(*cap))
        .collect();

    if missing.is_empty() {
        None
    } else {
        Some(PolicyDenial(format!(
            "missing required capabilities: {}",
            missing.join(", ")
        )))
    }
}

fn check_resource_limits(limits: &ResourceLimits, input: &Value) -> Option<PolicyDenial> {
    if let Some(cap) = limits.max_parts {
        let requested = part_count(input);
        if requested > cap {
            return Some(PolicyDenial(format!(
                "too many parts requested ({requested}/{cap})"
            )));
        }
    }

    if let Some(cap) = limits.max_batch_size {
        let batch_size = input.get("batch_size").and_then(Value::as_i64).unwrap_or(1);
        if batch_size > cap {
            return Some(PolicyDenial(format!(
                "batch size too large ({batch_size}/{cap})"
            )));
        }
    }

    if let Some(cap) = limits.max_capabilities {
        let requested = input
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|a| a.len() as i64)
            .unwrap_or(0);
        if requested > cap {
            return Some(PolicyDenial(format!(
                "too many capabilities requested ({requested}/{cap})"
            )));
        }
    }

    None
}

/// `part_ids` (array) takes precedence; a single `part_id` counts as 1;
/// absence of either counts as 0 (no parts named, trivially within cap).
fn part_count(input: &Value) -> i64 {
    if let Some(ids) = input.get("part_ids").and_then(Value::as_array) {
        ids.len() as i64
    } else if input.get("part_id").is_some() {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn caps(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn every_task_type_has_a_rule() {
        for t in TaskType::ALL {
            let rule = rule_for(*t);
            assert!(!rule.required.is_empty(), "{t} has no required capabilities");
        }
    }

    #[test]
    fn missing_capability_is_named_in_the_denial() {
        let rule = rule_for(TaskType::PartEnrichment);
        let denial = check_capabilities(&rule, &caps(&["parts:write"])).unwrap();
        assert!(denial.0.contains("tasks:user"));
    }

    #[test]
    fn holding_every_required_capability_passes() {
        let rule = rule_for(TaskType::PartEnrichment);
        assert!(check_capabilities(&rule, &caps(&["parts:write", "tasks:user"])).is_none());
    }

    #[test]
    fn max_parts_is_checked_against_part_ids_length() {
        let limits = ResourceLimits {
            max_parts: Some(1),
            max_batch_size: None,
            max_capabilities: None,
        };
        let denial = check_resource_limits(&limits, &json!({ "part_ids": ["P-1", "P-2"] })).unwrap();
        assert!(denial.0.contains("2/1"));
    }

    #[test]
    fn a_single_part_id_counts_as_one() {
        let limits = ResourceLimits {
            max_parts: Some(1),
            max_batch_size: None,
            max_capabilities: None,
        };
        assert!(check_resource_limits(&limits, &json!({ "part_id": "P-1" })).is_none());
    }

    #[test]
    fn batch_size_defaults_to_one_when_absent() {
        let limits = ResourceLimits {
            max_parts: None,
            max_batch_size: Some(1),
            max_capabilities: None,
        };
        assert!(check_resource_limits(&limits, &json!({})).is_none());
    }

    #[test]
    fn batch_size_over_cap_is_denied() {
        let limits = ResourceLimits {
            max_parts: None,
            max_batch_size: Some(5),
            max_capabilities: None,
        };
        let denial = check_resource_limits(&limits, &json!({ "batch_size": 11 })).unwrap();
        assert!(denial.0.contains("11/5"));
    }

    #[test]
    fn no_cap_never_denies_regardless_of_payload_shape() {
        let limits = ResourceLimits::default();
        let huge: Vec<i64> = (0..9999).collect();
        assert!(check_resource_limits(&limits, &json!({ "part_ids": huge })).is_none());
    }
}
