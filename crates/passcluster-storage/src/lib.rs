//! SQLite access for passes, task status and cluster assignments.

use std::str::FromStr;

use passcluster_core::{
    ClusterAssignment, FeatureColumn, ParentJobs, Pass, PassMetrics, QualityThresholds,
    TaskStatus, UnknownTaskStatus,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

const CREATE_ASSIGNMENTS_TABLE: &str = "CREATE TABLE IF NOT EXISTS passes_clusters (
    id_task INTEGER NOT NULL,
    id_pass INTEGER NOT NULL,
    cluster INTEGER NOT NULL,
    PRIMARY KEY (id_task, id_pass)
)";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store location {location:?}: {source}")]
    Location {
        location: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("connecting to store {location:?}: {source}")]
    Connect {
        location: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("task {0} not found")]
    TaskNotFound(i64),
    #[error("task {id_task} has invalid status: {source}")]
    InvalidStatus {
        id_task: i64,
        #[source]
        source: UnknownTaskStatus,
    },
    #[error("pass {id_pass} has no value for {column}")]
    MissingMetric { id_pass: i64, column: &'static str },
    #[error("assignment for task {found} cannot be written under task {expected}")]
    TaskMismatch { expected: i64, found: i64 },
    #[error("{context}: {source}")]
    Query {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

fn query_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Query { context, source }
}

/// Scoped handle on the pass store. Release it with [`PassStore::close`].
#[derive(Debug, Clone)]
pub struct PassStore {
    pool: SqlitePool,
}

impl PassStore {
    /// Opens an existing database given as a file path or a `sqlite:` URL.
    pub async fn connect(location: &str) -> Result<Self, StoreError> {
        let options = connect_options(location)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Connect {
                location: location.to_string(),
                source,
            })?;
        debug!(location, "connected to pass store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub async fn mark_task(&self, id_task: i64, status: TaskStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tasks SET status = ? WHERE id_task = ?")
            .bind(status.as_str())
            .bind(id_task)
            .execute(&self.pool)
            .await
            .map_err(query_err("updating task status"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id_task));
        }
        debug!(id_task, %status, "task status updated");
        Ok(())
    }

    /// Current status of a task; `None` when the status column is NULL.
    pub async fn task_status(&self, id_task: i64) -> Result<Option<TaskStatus>, StoreError> {
        let status: Option<Option<String>> =
            sqlx::query_scalar("SELECT status FROM tasks WHERE id_task = ?")
                .bind(id_task)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_err("reading task status"))?;
        match status {
            None => Err(StoreError::TaskNotFound(id_task)),
            Some(None) => Ok(None),
            Some(Some(text)) => TaskStatus::from_str(&text)
                .map(Some)
                .map_err(|source| StoreError::InvalidStatus { id_task, source }),
        }
    }

    /// Loads profitable passes of the parent jobs that reach every threshold.
    pub async fn load_candidate_passes(
        &self,
        parent_jobs: &ParentJobs,
        thresholds: &QualityThresholds,
    ) -> Result<Vec<Pass>, StoreError> {
        let span = info_span!("load_candidate_passes", parent_jobs = %parent_jobs);
        let sql = candidate_passes_sql(parent_jobs.ids().len());
        let mut query = sqlx::query(&sql);
        for id_job in parent_jobs.ids() {
            query = query.bind(*id_job);
        }
        let rows = query
            .bind(thresholds.min_custom_ontester)
            .bind(thresholds.min_trades)
            .bind(thresholds.min_sharpe_ratio)
            .fetch_all(&self.pool)
            .instrument(span.clone())
            .await
            .map_err(query_err("loading candidate passes"))?;

        let passes = rows.iter().map(pass_from_row).collect::<Result<Vec<_>, _>>()?;
        span.in_scope(|| debug!(rows = passes.len(), "candidate passes loaded"));
        Ok(passes)
    }

    /// Replaces every assignment of `id_task` and sets its final status in one
    /// transaction. Nothing is kept from a failed attempt.
    pub async fn replace_assignments(
        &self,
        id_task: i64,
        assignments: &[ClusterAssignment],
        final_status: TaskStatus,
    ) -> Result<(), StoreError> {
        if let Some(foreign) = assignments.iter().find(|a| a.id_task != id_task) {
            return Err(StoreError::TaskMismatch {
                expected: id_task,
                found: foreign.id_task,
            });
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_err("opening result transaction"))?;

        sqlx::query(CREATE_ASSIGNMENTS_TABLE)
            .execute(&mut *tx)
            .await
            .map_err(query_err("creating passes_clusters"))?;

        let cleared = sqlx::query("DELETE FROM passes_clusters WHERE id_task = ?")
            .bind(id_task)
            .execute(&mut *tx)
            .await
            .map_err(query_err("clearing previous assignments"))?;

        for assignment in assignments {
            sqlx::query("INSERT INTO passes_clusters (id_task, id_pass, cluster) VALUES (?, ?, ?)")
                .bind(assignment.id_task)
                .bind(assignment.id_pass)
                .bind(assignment.cluster)
                .execute(&mut *tx)
                .await
                .map_err(query_err("inserting assignment"))?;
        }

        let updated = sqlx::query("UPDATE tasks SET status = ? WHERE id_task = ?")
            .bind(final_status.as_str())
            .bind(id_task)
            .execute(&mut *tx)
            .await
            .map_err(query_err("updating task status"))?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id_task));
        }

        tx.commit()
            .await
            .map_err(query_err("committing assignments"))?;
        debug!(
            id_task,
            cleared = cleared.rows_affected(),
            inserted = assignments.len(),
            status = %final_status,
            "assignments replaced"
        );
        Ok(())
    }

    pub async fn assignments_for_task(
        &self,
        id_task: i64,
    ) -> Result<Vec<ClusterAssignment>, StoreError> {
        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
            "SELECT id_task, id_pass, cluster FROM passes_clusters WHERE id_task = ? ORDER BY cluster, id_pass",
        )
        .bind(id_task)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("reading assignments"))?;
        Ok(rows
            .into_iter()
            .map(|(id_task, id_pass, cluster)| ClusterAssignment {
                id_task,
                id_pass,
                cluster,
            })
            .collect())
    }
}

fn connect_options(location: &str) -> Result<SqliteConnectOptions, StoreError> {
    let trimmed = location.trim();
    let options = if trimmed.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(trimmed).map_err(|source| StoreError::Location {
            location: location.to_string(),
            source,
        })?
    } else if trimmed.is_empty() {
        return Err(StoreError::Location {
            location: location.to_string(),
            source: sqlx::Error::Configuration("empty database path".into()),
        });
    } else {
        SqliteConnectOptions::new().filename(trimmed)
    };
    Ok(options.create_if_missing(false))
}

/// Quality filter query with one placeholder per parent job.
fn candidate_passes_sql(job_count: usize) -> String {
    let features = FeatureColumn::ALL
        .iter()
        .map(|column| format!("CAST(p.{0} AS REAL) AS {0}", column.column_name()))
        .collect::<Vec<_>>()
        .join(",\n       ");
    let placeholders = vec!["?"; job_count].join(", ");
    format!(
        "SELECT p.id_pass, p.id_task, t.id_job,
       {features}
FROM passes p
    JOIN tasks t ON t.id_task = p.id_task
    JOIN jobs j ON j.id_job = t.id_job
WHERE p.profit > 0
  AND j.id_job IN ({placeholders})
  AND p.custom_ontester >= ?
  AND p.trades >= ?
  AND p.sharpe_ratio >= ?
ORDER BY p.id_pass"
    )
}

fn pass_from_row(row: &SqliteRow) -> Result<Pass, StoreError> {
    let id_pass: i64 = row
        .try_get("id_pass")
        .map_err(query_err("decoding candidate pass"))?;
    let id_task: i64 = row
        .try_get("id_task")
        .map_err(query_err("decoding candidate pass"))?;
    let id_job: i64 = row
        .try_get("id_job")
        .map_err(query_err("decoding candidate pass"))?;

    let mut metrics = PassMetrics::default();
    for column in FeatureColumn::ALL {
        let value: Option<f64> = row
            .try_get(column.column_name())
            .map_err(query_err("decoding pass metric"))?;
        *column.slot_mut(&mut metrics) = value.ok_or(StoreError::MissingMetric {
            id_pass,
            column: column.column_name(),
        })?;
    }

    Ok(Pass {
        id_pass,
        id_task,
        id_job,
        metrics,
    })
}
