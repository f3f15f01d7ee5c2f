//! Compiled statement sequences and the per-statement execution states.

use std::fmt;

use crate::dsl::FieldPath;
use crate::error::{Error, Result};
use crate::value::{FieldType, Param};

/// What a statement hands back to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// DDL or DML; yields an affected-row count.
    Execute,
    /// Yields the first column of the first row as an integer.
    Scalar,
    /// Yields rows. Only the last statement of a plan may be a query.
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn holds(&self, left: i64, right: i64) -> bool {
        match self {
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
        }
    }
}

/// Gate a statement on what the previous one produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreCheck {
    /// Previous result compared against a constant. A failed or
    /// result-less predecessor never satisfies it.
    Result { op: CompareOp, value: i64 },
    /// Previous statement ran and did not fail.
    PreviousSucceeded,
}

impl PreCheck {
    pub fn result(op: CompareOp, value: i64) -> Self {
        PreCheck::Result { op, value }
    }

    pub fn allows(&self, previous: &Outcome) -> bool {
        if previous.failed {
            return false;
        }
        match self {
            PreCheck::Result { op, value } => previous
                .result
                .map(|r| op.holds(r, *value))
                .unwrap_or(false),
            PreCheck::PreviousSucceeded => true,
        }
    }
}

/// Result of one statement as seen by the next statement's pre-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outcome {
    pub result: Option<i64>,
    pub failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementState {
    Pending,
    Executed,
    Skipped,
    Failed,
}

impl fmt::Display for StatementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatementState::Pending => "pending",
            StatementState::Executed => "executed",
            StatementState::Skipped => "skipped",
            StatementState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    Running,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
    pub kind: StatementKind,
    pub pre_check: Option<PreCheck>,
    pub ignore_error: bool,
}

impl Statement {
    pub fn execute(sql: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            sql: sql.into(),
            params,
            kind: StatementKind::Execute,
            pre_check: None,
            ignore_error: false,
        }
    }

    pub fn scalar(sql: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            kind: StatementKind::Scalar,
            ..Self::execute(sql, params)
        }
    }

    pub fn query(sql: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            kind: StatementKind::Query,
            ..Self::execute(sql, params)
        }
    }

    pub fn pre_check(mut self, check: PreCheck) -> Self {
        self.pre_check = Some(check);
        self
    }

    pub fn ignore_error(mut self) -> Self {
        self.ignore_error = true;
        self
    }

    /// SQL plus bound parameters, for debug-mode error messages.
    pub fn describe(&self) -> String {
        if self.params.is_empty() {
            return self.sql.clone();
        }
        let params: Vec<String> = self.params.iter().map(Param::describe).collect();
        format!("{} [{}]", self.sql, params.join(", "))
    }
}

/// How the executor turns a selected column back into document data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decode {
    /// Fixed column with a logical type.
    Fixed(FieldType),
    /// The extension blob; its keys merge into the enclosing document.
    Ext,
    /// A JSON value extracted from a blob.
    Json,
    /// Aggregate result; integral floats collapse to integers.
    Number,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    /// Column label in the result set.
    pub label: String,
    /// Document key; dotted names nest.
    pub output: String,
    pub decode: Decode,
    /// Join alias the value belongs under, if any.
    pub join: Option<String>,
}

impl OutputColumn {
    pub fn new(label: impl Into<String>, output: impl Into<String>, decode: Decode) -> Self {
        Self {
            label: label.into(),
            output: output.into(),
            decode,
            join: None,
        }
    }

    pub fn joined(mut self, alias: impl Into<String>) -> Self {
        self.join = Some(alias.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentFormat {
    pub columns: Vec<OutputColumn>,
    /// Removed after decoding, for exclusion projections.
    pub exclude: Vec<FieldPath>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum RowFormat {
    /// No rows; the last statement's affected count is the result.
    #[default]
    Affected,
    /// The last statement's scalar is the result.
    Scalar,
    Documents(DocumentFormat),
    /// Rows returned as-is, columns mapped to JSON by their wire type.
    Raw,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlPlan {
    pub statements: Vec<Statement>,
    /// Owned leases wrap the plan in a transaction. Off for statements
    /// that cannot run inside one (SQLite ATTACH/DETACH).
    pub transactional: bool,
    pub row_format: RowFormat,
}

impl Default for SqlPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlPlan {
    pub fn new() -> Self {
        Self {
            statements: Vec::new(),
            transactional: true,
            row_format: RowFormat::Affected,
        }
    }

    pub fn single(statement: Statement) -> Self {
        let mut plan = Self::new();
        plan.statements.push(statement);
        plan
    }

    pub fn push(mut self, statement: Statement) -> Self {
        self.statements.push(statement);
        self
    }

    pub fn add(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    pub fn rows(mut self, format: RowFormat) -> Self {
        self.row_format = format;
        self
    }

    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }

    /// Whether an owned lease should open a transaction for this plan.
    /// Read-only plans run in auto-commit.
    pub fn needs_transaction(&self) -> bool {
        self.transactional
            && self
                .statements
                .iter()
                .any(|s| s.kind == StatementKind::Execute)
    }

    pub fn validate(&self) -> Result<()> {
        if self.statements.is_empty() {
            return Err(Error::invalid("empty SQL plan"));
        }
        let last = self.statements.len() - 1;
        for (i, statement) in self.statements.iter().enumerate() {
            if statement.kind == StatementKind::Query && i != last {
                return Err(Error::invalid(format!(
                    "statement {} returns rows but is not the last statement",
                    i
                )));
            }
        }
        if self.statements[0].pre_check.is_some() {
            return Err(Error::invalid("first statement cannot have a pre-check"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_check_gates_on_previous_result() {
        let check = PreCheck::result(CompareOp::Eq, 0);
        assert!(check.allows(&Outcome {
            result: Some(0),
            failed: false
        }));
        assert!(!check.allows(&Outcome {
            result: Some(1),
            failed: false
        }));
        assert!(!check.allows(&Outcome {
            result: None,
            failed: false
        }));
        assert!(!check.allows(&Outcome {
            result: Some(0),
            failed: true
        }));
        assert!(PreCheck::PreviousSucceeded.allows(&Outcome::default()));
    }

    #[test]
    fn test_validate_query_must_be_last() {
        let plan = SqlPlan::new()
            .push(Statement::query("SELECT 1", vec![]))
            .push(Statement::execute("SELECT 2", vec![]));
        assert!(plan.validate().is_err());

        let plan = SqlPlan::new()
            .push(Statement::scalar("SELECT COUNT(*) FROM t", vec![]))
            .push(
                Statement::execute("CREATE INDEX i ON t (a)", vec![])
                    .pre_check(PreCheck::result(CompareOp::Eq, 0))
                    .ignore_error(),
            );
        assert!(plan.validate().is_ok());
        assert!(SqlPlan::new().validate().is_err());
    }

    #[test]
    fn test_describe_includes_params() {
        let stmt = Statement::execute(
            "UPDATE t SET a = ? WHERE _id = ?",
            vec![Param::Int(1), Param::Str("x".into())],
        );
        assert_eq!(stmt.describe(), "UPDATE t SET a = ? WHERE _id = ? [1, \"x\"]");
    }
}
