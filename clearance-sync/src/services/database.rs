//! Database service for clearance-sync.

use crate::models::{
    AuditEntry, AuditFilter, AuditOutcome, Clearance, ClearanceAssignment, DesiredSnapshot,
    DesiredState, LiaisonPermission, NewAssignment, RunTrigger, SyncAction, SyncCounts, SyncRun,
    SyncRunStatus, Watermark,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{
    forbidden, unknown_clearance, AuditSink, RunRepository, StateStore, INTERRUPTED_RUN_MESSAGE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

#[derive(FromRow)]
struct AssignmentRow {
    assignment_id: Uuid,
    person_id: String,
    clearance_id: String,
    clearance_name: String,
    desired_state: String,
    assigner_id: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    modified_utc: DateTime<Utc>,
    change_seq: i64,
}

impl From<AssignmentRow> for ClearanceAssignment {
    fn from(r: AssignmentRow) -> Self {
        Self {
            assignment_id: r.assignment_id,
            person_id: r.person_id,
            clearance_id: r.clearance_id,
            clearance_name: r.clearance_name,
            desired_state: DesiredState::from_str(&r.desired_state),
            assigner_id: r.assigner_id,
            start_time: r.start_time,
            end_time: r.end_time,
            modified_utc: r.modified_utc,
            change_seq: r.change_seq,
        }
    }
}

#[derive(FromRow)]
struct AuditRow {
    entry_id: Uuid,
    run_id: Uuid,
    person_id: String,
    clearance_id: String,
    clearance_name: String,
    assigner_id: Option<String>,
    action: String,
    outcome: String,
    error_detail: Option<String>,
    attempts: i32,
    message: String,
    recorded_utc: DateTime<Utc>,
}

impl From<AuditRow> for AuditEntry {
    fn from(r: AuditRow) -> Self {
        Self {
            entry_id: r.entry_id,
            run_id: r.run_id,
            person_id: r.person_id,
            clearance_id: r.clearance_id,
            clearance_name: r.clearance_name,
            assigner_id: r.assigner_id,
            action: SyncAction::from_str(&r.action),
            outcome: AuditOutcome::from_str(&r.outcome),
            error_detail: r.error_detail,
            attempts: r.attempts,
            message: r.message,
            recorded_utc: r.recorded_utc,
        }
    }
}

#[derive(FromRow)]
struct RunRow {
    run_id: Uuid,
    run_trigger: String,
    status: String,
    started_utc: DateTime<Utc>,
    finished_utc: Option<DateTime<Utc>>,
    grants_applied: i64,
    revokes_applied: i64,
    errors: i64,
    not_attempted: i64,
    error_message: Option<String>,
    change_cursor: Option<i64>,
}

impl From<RunRow> for SyncRun {
    fn from(r: RunRow) -> Self {
        Self {
            run_id: r.run_id,
            trigger: RunTrigger::from_str(&r.run_trigger),
            status: SyncRunStatus::from_str(&r.status),
            started_utc: r.started_utc,
            finished_utc: r.finished_utc,
            counts: SyncCounts {
                grants_applied: r.grants_applied,
                revokes_applied: r.revokes_applied,
                errors: r.errors,
                not_attempted: r.not_attempted,
            },
            error_message: r.error_message,
            change_cursor: r.change_cursor,
        }
    }
}

const RUN_COLUMNS: &str = "run_id, run_trigger, status, started_utc, finished_utc, grants_applied, revokes_applied, errors, not_attempted, error_message, change_cursor";

/// Oldest transaction id still in flight. Every write by a transaction below
/// it is committed and visible, and every later write carries an id at or
/// above it.
const CHANGE_CURSOR_QUERY: &str = "SELECT pg_snapshot_xmin(pg_current_snapshot())::text::bigint";

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "clearance-sync"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

// =========================================================================
// Desired State
// =========================================================================

#[async_trait]
impl StateStore for Database {
    #[instrument(skip(self))]
    async fn list_desired_assignments(
        &self,
        since: Option<&Watermark>,
        now: DateTime<Utc>,
    ) -> Result<DesiredSnapshot, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_desired_assignments"])
            .start_timer();

        // Taken before the read so writes committing during it are seen again.
        let (change_cursor,): (i64,) = sqlx::query_as(CHANGE_CURSOR_QUERY)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("Failed to read change cursor", e))?;

        let rows = sqlx::query_as::<_, AssignmentRow>(
            r#"
            SELECT a.assignment_id, a.person_id, a.clearance_id, c.name AS clearance_name,
                   a.desired_state, a.assigner_id, a.start_time, a.end_time, a.modified_utc,
                   a.change_xid::text::bigint AS change_seq
            FROM clearance_assignments a
            JOIN clearances c ON c.clearance_id = a.clearance_id
            WHERE c.enabled
              AND ($1::bigint IS NULL
                   OR a.change_xid >= $1::bigint::text::xid8
                   OR (a.start_time > $2 AND a.start_time <= $3)
                   OR (a.end_time > $2 AND a.end_time <= $3))
            ORDER BY a.person_id, a.clearance_id
            "#,
        )
        .bind(since.map(|w| w.change_cursor))
        .bind(since.map(|w| w.since))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list desired assignments", e))?;

        timer.observe_duration();
        info!(
            count = rows.len(),
            change_cursor = change_cursor,
            incremental = since.is_some(),
            "Loaded desired assignments"
        );

        Ok(DesiredSnapshot {
            assignments: rows.into_iter().map(Into::into).collect(),
            change_cursor,
        })
    }

    #[instrument(skip(self, clearance), fields(clearance_id = %clearance.clearance_id))]
    async fn upsert_clearance(&self, clearance: &Clearance) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_clearance"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO clearances (clearance_id, name, enabled)
            VALUES ($1, $2, $3)
            ON CONFLICT (clearance_id) DO UPDATE
            SET name = EXCLUDED.name, enabled = EXCLUDED.enabled, updated_utc = NOW()
            "#,
        )
        .bind(&clearance.clearance_id)
        .bind(&clearance.name)
        .bind(clearance.enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to upsert clearance", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn grant_liaison_permission(
        &self,
        liaison_id: &str,
        clearance_id: &str,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["grant_liaison_permission"])
            .start_timer();

        let exists: Option<(String,)> =
            sqlx::query_as("SELECT clearance_id FROM clearances WHERE clearance_id = $1")
                .bind(clearance_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error("Failed to look up clearance", e))?;
        if exists.is_none() {
            return Err(unknown_clearance(clearance_id));
        }

        sqlx::query(
            r#"
            INSERT INTO liaison_clearance_permissions (liaison_id, clearance_id)
            VALUES ($1, $2)
            ON CONFLICT (liaison_id, clearance_id) DO NOTHING
            "#,
        )
        .bind(liaison_id)
        .bind(clearance_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to grant liaison permission", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn revoke_liaison_permission(
        &self,
        liaison_id: &str,
        clearance_id: &str,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["revoke_liaison_permission"])
            .start_timer();

        let result = sqlx::query(
            "DELETE FROM liaison_clearance_permissions WHERE liaison_id = $1 AND clearance_id = $2",
        )
        .bind(liaison_id)
        .bind(clearance_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to revoke liaison permission", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn liaison_permissions(
        &self,
        liaison_id: &str,
    ) -> Result<Vec<LiaisonPermission>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["liaison_permissions"])
            .start_timer();

        let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT liaison_id, clearance_id, granted_utc
            FROM liaison_clearance_permissions
            WHERE liaison_id = $1
            ORDER BY clearance_id
            "#,
        )
        .bind(liaison_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list liaison permissions", e))?;

        timer.observe_duration();

        Ok(rows
            .into_iter()
            .map(|(liaison_id, clearance_id, granted_utc)| LiaisonPermission {
                liaison_id,
                clearance_id,
                granted_utc,
            })
            .collect())
    }

    #[instrument(skip(self, assignment), fields(
        liaison_id = %assignment.liaison_id,
        person_id = %assignment.person_id,
        clearance_id = %assignment.clearance_id,
    ))]
    async fn record_assignment(
        &self,
        assignment: &NewAssignment,
    ) -> Result<ClearanceAssignment, AppError> {
        assignment.validate()?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_assignment"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let clearance: Option<(String,)> =
            sqlx::query_as("SELECT name FROM clearances WHERE clearance_id = $1")
                .bind(&assignment.clearance_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to look up clearance", e))?;
        let (clearance_name,) = clearance.ok_or_else(|| unknown_clearance(&assignment.clearance_id))?;

        let permitted: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT clearance_id FROM liaison_clearance_permissions
            WHERE liaison_id = $1 AND clearance_id = $2
            "#,
        )
        .bind(&assignment.liaison_id)
        .bind(&assignment.clearance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to check liaison permission", e))?;
        if permitted.is_none() {
            warn!("Liaison attempted to assign a clearance outside their permissions");
            return Err(forbidden(&assignment.liaison_id, &assignment.clearance_id));
        }

        sqlx::query("INSERT INTO personnel (person_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(&assignment.person_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to register person", e))?;

        let row = sqlx::query_as::<_, AssignmentRow>(
            r#"
            INSERT INTO clearance_assignments
                (assignment_id, person_id, clearance_id, desired_state, assigner_id, start_time, end_time, modified_utc, change_xid)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), pg_current_xact_id())
            ON CONFLICT (person_id, clearance_id) DO UPDATE
            SET desired_state = EXCLUDED.desired_state,
                assigner_id = EXCLUDED.assigner_id,
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                modified_utc = NOW(),
                change_xid = pg_current_xact_id()
            RETURNING assignment_id, person_id, clearance_id, $8::varchar AS clearance_name,
                      desired_state, assigner_id, start_time, end_time, modified_utc,
                      change_xid::text::bigint AS change_seq
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&assignment.person_id)
        .bind(&assignment.clearance_id)
        .bind(assignment.desired_state.as_str())
        .bind(&assignment.liaison_id)
        .bind(assignment.start_time)
        .bind(assignment.end_time)
        .bind(&clearance_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to record assignment", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit assignment", e))?;

        timer.observe_duration();
        info!(desired_state = %row.desired_state, "Assignment recorded");

        Ok(row.into())
    }
}

// =========================================================================
// Audit Trail
// =========================================================================

#[async_trait]
impl AuditSink for Database {
    #[instrument(skip(self, entry), fields(run_id = %entry.run_id, person_id = %entry.person_id))]
    async fn append(&self, entry: &AuditEntry) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_audit_entry"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO audit_entries
                (entry_id, run_id, person_id, clearance_id, clearance_name, assigner_id,
                 action, outcome, error_detail, attempts, message, recorded_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (entry_id) DO NOTHING
            "#,
        )
        .bind(entry.entry_id)
        .bind(entry.run_id)
        .bind(&entry.person_id)
        .bind(&entry.clearance_id)
        .bind(&entry.clearance_name)
        .bind(&entry.assigner_id)
        .bind(entry.action.as_str())
        .bind(entry.outcome.as_str())
        .bind(&entry.error_detail)
        .bind(entry.attempts)
        .bind(&entry.message)
        .bind(entry.recorded_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to append audit entry", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_audit_entries"])
            .start_timer();

        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT entry_id, run_id, person_id, clearance_id, clearance_name, assigner_id, \
             action, outcome, error_detail, attempts, message, recorded_utc \
             FROM audit_entries WHERE 1=1",
        );

        if let Some(person_id) = &filter.person_id {
            query.push(" AND person_id = ").push_bind(person_id);
        }
        if let Some(assigner_id) = &filter.assigner_id {
            query.push(" AND assigner_id = ").push_bind(assigner_id);
        }
        if let Some(clearance_id) = &filter.clearance_id {
            query.push(" AND clearance_id = ").push_bind(clearance_id);
        }
        if let Some(name) = &filter.clearance_name {
            query
                .push(" AND clearance_name ILIKE ")
                .push_bind(like_pattern(name));
        }
        if let Some(message) = &filter.message {
            query
                .push(" AND message ILIKE ")
                .push_bind(like_pattern(message));
        }
        if let Some(run_id) = filter.run_id {
            query.push(" AND run_id = ").push_bind(run_id);
        }
        if let Some(from) = filter.from_utc {
            query.push(" AND recorded_utc >= ").push_bind(from);
        }
        if let Some(to) = filter.to_utc {
            query.push(" AND recorded_utc < ").push_bind(to);
        }

        query
            .push(" ORDER BY recorded_utc DESC, entry_id OFFSET ")
            .push_bind(filter.skip.max(0))
            .push(" LIMIT ")
            .push_bind(filter.effective_limit());

        let rows = query
            .build_query_as::<AuditRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list audit entries", e))?;

        timer.observe_duration();

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Substring pattern for ILIKE with the wildcard characters escaped.
fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

// =========================================================================
// Sync Runs
// =========================================================================

#[async_trait]
impl RunRepository for Database {
    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    async fn create_run(&self, run: &SyncRun) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_run"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO sync_runs (run_id, run_trigger, status, started_utc)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(run.run_id)
        .bind(run.trigger.as_str())
        .bind(run.status.as_str())
        .bind(run.started_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!("A sync run is already in progress"))
            }
            _ => db_error("Failed to create sync run", e),
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id, status = run.status.as_str()))]
    async fn finish_run(&self, run: &SyncRun) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finish_run"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = $2, finished_utc = $3, grants_applied = $4, revokes_applied = $5,
                errors = $6, not_attempted = $7, error_message = $8, change_cursor = $9
            WHERE run_id = $1
            "#,
        )
        .bind(run.run_id)
        .bind(run.status.as_str())
        .bind(run.finished_utc)
        .bind(run.counts.grants_applied)
        .bind(run.counts.revokes_applied)
        .bind(run.counts.errors)
        .bind(run.counts.not_attempted)
        .bind(&run.error_message)
        .bind(run.change_cursor)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to finish sync run", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Run {} not found",
                run.run_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: Uuid) -> Result<Option<SyncRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_run"])
            .start_timer();

        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM sync_runs WHERE run_id = $1",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get sync run", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn latest_run(&self) -> Result<Option<SyncRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_run"])
            .start_timer();

        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM sync_runs ORDER BY started_utc DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get latest sync run", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn watermark(&self) -> Result<Option<Watermark>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["watermark"])
            .start_timer();

        let row: Option<(DateTime<Utc>, i64)> = sqlx::query_as(
            r#"
            SELECT started_utc, change_cursor FROM sync_runs
            WHERE status = 'succeeded' AND not_attempted = 0 AND change_cursor IS NOT NULL
            ORDER BY change_cursor DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to read watermark", e))?;

        timer.observe_duration();
        Ok(row.map(|(since, change_cursor)| Watermark {
            since,
            change_cursor,
        }))
    }

    #[instrument(skip(self))]
    async fn fail_interrupted_runs(&self) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["fail_interrupted_runs"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = 'failed', finished_utc = NOW(), error_message = $1
            WHERE status = 'running'
            "#,
        )
        .bind(INTERRUPTED_RUN_MESSAGE)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to close interrupted runs", e))?;

        timer.observe_duration();

        let closed = result.rows_affected();
        if closed > 0 {
            warn!(closed = closed, "Closed runs interrupted by a previous shutdown");
        }
        Ok(closed)
    }
}
