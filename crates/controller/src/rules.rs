//! Condition/action rule evaluation.
//!
//! Rules run highest priority first.  A rule's conditions are ANDed and
//! short-circuit; a condition whose register cannot be read aborts the rule.
//! Actions of a fired rule are written independently of one another.  A
//! fired rule with `stop_on_trigger` ends the cycle.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{self, SharedBus};
use crate::db::{Register, Rule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl Operator {
    pub fn holds(self, left: f64, right: f64) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Ne => left != right,
            Self::Gt => left > right,
            Self::Lt => left < right,
            Self::Ge => left >= right,
            Self::Le => left <= right,
        }
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "==" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            ">" => Ok(Self::Gt),
            "<" => Ok(Self::Lt),
            ">=" => Ok(Self::Ge),
            "<=" => Ok(Self::Le),
            other => Err(format!("unknown operator '{other}'")),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
        })
    }
}

/// A rule that cannot be evaluated as configured.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("condition {condition}: {reason}")]
    BadOperator { condition: i64, reason: String },
    #[error("condition {0} compares against a register, which is not supported")]
    RegisterComparison(i64),
    #[error("register {0} does not exist")]
    UnknownRegister(i64),
    #[error("action {action}: register '{register}' is not writable")]
    NotWritable { action: i64, register: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Condition at this position (0-based) was false.
    NotMet { condition: usize },
    /// Reading the condition's register failed; the rule was abandoned.
    ReadFailed { condition: usize },
    Fired { executed: usize, failed: usize },
    /// Configuration fault; nothing was read or written.
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub rule_id: i64,
    pub rule: String,
    pub outcome: Outcome,
}

impl RuleOutcome {
    pub fn conditions_met(&self) -> bool {
        matches!(self.outcome, Outcome::Fired { .. })
    }

    pub fn actions_executed(&self) -> i64 {
        match self.outcome {
            Outcome::Fired { executed, .. } => executed as i64,
            _ => 0,
        }
    }
}

/// A write that reached the device.
#[derive(Debug, Clone, PartialEq)]
pub struct Written {
    pub rule_id: i64,
    pub register_id: i64,
    pub value: f64,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcomes: Vec<RuleOutcome>,
    pub writes: Vec<Written>,
    /// Rule whose `stop_on_trigger` ended the cycle.
    pub stopped_by: Option<i64>,
}

impl CycleReport {
    pub fn fired(&self) -> usize {
        self.outcomes.iter().filter(|o| o.conditions_met()).count()
    }
}

/// A condition with its register looked up.
struct Check<'a> {
    register: &'a Register,
    operator: Operator,
    value: f64,
}

struct Step<'a> {
    register: &'a Register,
    value: f64,
}

fn lookup(registers: &HashMap<i64, Register>, id: i64) -> Result<&Register, RuleError> {
    registers.get(&id).ok_or(RuleError::UnknownRegister(id))
}

/// Check the whole rule against the register table before any I/O.
fn prepare<'a>(
    rule: &Rule,
    registers: &'a HashMap<i64, Register>,
) -> Result<(Vec<Check<'a>>, Vec<Step<'a>>), RuleError> {
    let mut checks = Vec::with_capacity(rule.conditions.len());
    for c in &rule.conditions {
        if c.right_is_register {
            return Err(RuleError::RegisterComparison(c.id));
        }
        let operator = c.operator.parse::<Operator>().map_err(|reason| RuleError::BadOperator {
            condition: c.id,
            reason,
        })?;
        checks.push(Check {
            register: lookup(registers, c.left_register_id)?,
            operator,
            value: c.right_value,
        });
    }

    let mut steps = Vec::with_capacity(rule.actions.len());
    for a in &rule.actions {
        let register = lookup(registers, a.target_register_id)?;
        if !register.kind().is_some_and(|k| k.is_writable()) {
            return Err(RuleError::NotWritable {
                action: a.id,
                register: register.name.clone(),
            });
        }
        steps.push(Step {
            register,
            value: a.write_value,
        });
    }
    Ok((checks, steps))
}

async fn evaluate_rule(
    bus: &SharedBus,
    rule: &Rule,
    registers: &HashMap<i64, Register>,
    writes: &mut Vec<Written>,
) -> Result<Outcome, RuleError> {
    let (checks, steps) = prepare(rule, registers)?;

    for (i, check) in checks.iter().enumerate() {
        let reg = check.register;
        let left = match bus::read_value(bus, reg).await {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    rule = %rule.name,
                    register = %reg.name,
                    slave = reg.slave_id,
                    address = reg.address,
                    "condition read failed, rule skipped: {e}"
                );
                return Ok(Outcome::ReadFailed { condition: i });
            }
        };
        if !check.operator.holds(left, check.value) {
            debug!(rule = %rule.name, register = %reg.name, left, op = %check.operator, right = check.value, "condition not met");
            return Ok(Outcome::NotMet { condition: i });
        }
    }

    let mut executed = 0;
    let mut failed = 0;
    for step in &steps {
        let reg = step.register;
        match bus::write_value(bus, reg, step.value).await {
            Ok(()) => {
                executed += 1;
                writes.push(Written {
                    rule_id: rule.id,
                    register_id: reg.id,
                    value: step.value,
                });
            }
            Err(e) => {
                failed += 1;
                warn!(
                    rule = %rule.name,
                    register = %reg.name,
                    slave = reg.slave_id,
                    address = reg.address,
                    "action write failed: {e}"
                );
            }
        }
    }
    Ok(Outcome::Fired { executed, failed })
}

/// Evaluate `rules` in the given order (highest priority first).
pub async fn evaluate_rules(
    bus: &SharedBus,
    rules: &[Rule],
    registers: &HashMap<i64, Register>,
) -> CycleReport {
    let mut report = CycleReport::default();

    for rule in rules {
        let outcome = match evaluate_rule(bus, rule, registers, &mut report.writes).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(rule = %rule.name, "rule skipped: {e}");
                Outcome::Skipped(e.to_string())
            }
        };

        let fired = matches!(outcome, Outcome::Fired { .. });
        if let Outcome::Fired { executed, failed } = outcome {
            info!(rule = %rule.name, priority = rule.priority, executed, failed, "rule fired");
        }
        report.outcomes.push(RuleOutcome {
            rule_id: rule.id,
            rule: rule.name.clone(),
            outcome,
        });

        if fired && rule.stop_on_trigger {
            info!(rule = %rule.name, "stop_on_trigger set, remaining rules skipped");
            report.stopped_by = Some(rule.id);
            break;
        }
    }

    report
}

// ===========================================================================
// Tests
// ===========================================================================
