//! Runs a [`SqlPlan`] statement by statement on one connection.

use tracing::{debug, warn};

use crate::db::{CellValue, Connection, RawRow};
use crate::error::Result;
use crate::plan::{Outcome, SqlPlan, StatementKind, StatementState};

/// What a finished plan produced.
#[derive(Debug, Default)]
pub struct PlanRun {
    pub states: Vec<StatementState>,
    /// Affected rows of the last statement; 0 when it was skipped or failed.
    pub affected: u64,
    pub scalar: Option<i64>,
    pub rows: Vec<RawRow>,
}

/// Execute every statement in order.
///
/// A statement whose pre-check rejects the previous outcome is skipped and
/// counts as a success. A failing statement marked `ignore_error` is
/// recorded as failed and the plan continues; any other error aborts the
/// plan. In debug mode the error carries the statement and its parameters.
pub async fn run_plan(conn: &mut dyn Connection, plan: &SqlPlan, debug_mode: bool) -> Result<PlanRun> {
    plan.validate()?;
    let mut run = PlanRun {
        states: vec![StatementState::Pending; plan.statements.len()],
        ..Default::default()
    };
    let mut previous = Outcome::default();

    for (i, statement) in plan.statements.iter().enumerate() {
        run.affected = 0;
        if let Some(check) = &statement.pre_check {
            if !check.allows(&previous) {
                run.states[i] = StatementState::Skipped;
                debug!(index = i, ?check, "statement skipped by pre-check");
                previous = Outcome::default();
                continue;
            }
        }

        debug!(index = i, sql = %statement.sql, params = statement.params.len(), "executing");
        let result = match statement.kind {
            StatementKind::Execute => conn
                .execute(&statement.sql, &statement.params)
                .await
                .map(|affected| {
                    run.affected = affected;
                    Some(affected as i64)
                }),
            StatementKind::Scalar => conn.query(&statement.sql, &statement.params).await.map(|rows| {
                let value = rows.first().and_then(RawRow::first).and_then(CellValue::as_i64);
                run.scalar = value;
                value
            }),
            StatementKind::Query => conn.query(&statement.sql, &statement.params).await.map(|rows| {
                let count = rows.len() as i64;
                run.rows = rows;
                Some(count)
            }),
        };

        match result {
            Ok(value) => {
                run.states[i] = StatementState::Executed;
                previous = Outcome {
                    result: value,
                    failed: false,
                };
            }
            Err(e) if statement.ignore_error => {
                warn!(index = i, error = %e, "ignoring statement failure");
                run.states[i] = StatementState::Failed;
                previous = Outcome {
                    result: None,
                    failed: true,
                };
            }
            Err(e) => {
                run.states[i] = StatementState::Failed;
                debug!(index = i, error = %e, "statement failed");
                return Err(if debug_mode {
                    e.with_statement(|| statement.describe())
                } else {
                    e
                });
            }
        }
    }
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ErrorCategory, Pool, SqlitePool};
    use crate::config::DriverConfig;
    use crate::error::Error;
    use crate::plan::{CompareOp, PreCheck, Statement};
    use crate::value::Param;

    async fn conn() -> Box<dyn Connection> {
        let pool = SqlitePool::open(&DriverConfig::sqlite_memory()).unwrap();
        let mut conn = pool.acquire().await.unwrap();
        conn.execute("CREATE TABLE t (a INTEGER PRIMARY KEY)", &[]).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_pre_check_skips_and_ignored_error_continues() {
        let mut conn = conn().await;
        let plan = SqlPlan::new()
            .push(Statement::scalar("SELECT COUNT(*) FROM t", vec![]))
            .push(
                Statement::execute("INSERT INTO t VALUES (1)", vec![])
                    .pre_check(PreCheck::result(CompareOp::Gt, 0)),
            )
            .push(Statement::execute("INSERT INTO t VALUES (2)", vec![]))
            .push(Statement::execute("INSERT INTO t VALUES (2)", vec![]).ignore_error())
            .push(
                Statement::execute("INSERT INTO t VALUES (3)", vec![])
                    .pre_check(PreCheck::PreviousSucceeded),
            );
        let run = run_plan(conn.as_mut(), &plan, false).await.unwrap();
        assert_eq!(
            run.states,
            vec![
                StatementState::Executed,
                StatementState::Skipped,
                StatementState::Executed,
                StatementState::Failed,
                StatementState::Skipped,
            ]
        );
        assert_eq!(run.scalar, Some(0));
        assert_eq!(run.affected, 0);
    }

    #[tokio::test]
    async fn test_query_rows_and_affected_count() {
        let mut conn = conn().await;
        let insert = SqlPlan::single(Statement::execute(
            "INSERT INTO t VALUES (?), (?)",
            vec![Param::Int(1), Param::Int(2)],
        ));
        assert_eq!(run_plan(conn.as_mut(), &insert, false).await.unwrap().affected, 2);

        let select = SqlPlan::single(Statement::query("SELECT a FROM t ORDER BY a", vec![]));
        let run = run_plan(conn.as_mut(), &select, false).await.unwrap();
        assert_eq!(run.rows.len(), 2);
    }

    #[tokio::test]
    async fn test_debug_mode_attaches_statement() {
        let mut conn = conn().await;
        let plan = SqlPlan::single(Statement::execute(
            "INSERT INTO t VALUES (?), (?)",
            vec![Param::Int(1), Param::Int(1)],
        ));
        let err = run_plan(conn.as_mut(), &plan, true).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Execution);
        match err {
            Error::Execution { statement, .. } => {
                assert_eq!(statement.as_deref(), Some("INSERT INTO t VALUES (?), (?) [1, 1]"));
            }
            other => panic!("unexpected error {:?}", other),
        }

        let err = run_plan(conn.as_mut(), &plan, false).await.unwrap_err();
        assert!(matches!(err, Error::Execution { statement: None, .. }));
    }
}
