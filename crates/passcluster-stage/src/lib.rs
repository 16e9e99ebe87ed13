//! Clustering stage: reduce a task's candidate passes to one representative per cluster.

pub mod kmeans;
pub mod select;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use passcluster_core::{ClusterAssignment, ParentJobs, Pass, QualityThresholds, TaskStatus};
use passcluster_storage::PassStore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub use kmeans::{KMeans, KMeansConfig, KMeansFit, NInit};
pub use select::select_representatives;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("n_clusters must be at least 1")]
    ZeroClusters,
    #[error("max_iter must be at least 1")]
    ZeroIterations,
    #[error("tolerance must be finite and not negative, got {0}")]
    InvalidTolerance(f64),
    #[error("quality thresholds must be finite")]
    NonFiniteThreshold,
}

#[derive(Debug, Clone)]
pub struct StageConfig {
    /// SQLite file path or `sqlite:` URL.
    pub database: String,
    pub id_task: i64,
    pub parent_jobs: ParentJobs,
    pub thresholds: QualityThresholds,
    pub kmeans: KMeansConfig,
    pub report_dir: Option<PathBuf>,
}

impl StageConfig {
    pub fn new(database: impl Into<String>, id_task: i64, parent_jobs: ParentJobs) -> Self {
        Self {
            database: database.into(),
            id_task,
            parent_jobs,
            thresholds: QualityThresholds::default(),
            kmeans: KMeansConfig::default(),
            report_dir: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kmeans.n_clusters == 0 {
            return Err(ConfigError::ZeroClusters);
        }
        if self.kmeans.max_iter == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if !self.kmeans.tol.is_finite() || self.kmeans.tol < 0.0 {
            return Err(ConfigError::InvalidTolerance(self.kmeans.tol));
        }
        if !self.thresholds.is_finite() {
            return Err(ConfigError::NonFiniteThreshold);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRunSummary {
    pub run_id: Uuid,
    pub id_task: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidate_passes: usize,
    pub clusters_requested: usize,
    pub clusters_used: usize,
    pub representatives: usize,
    pub iterations: usize,
    pub inertia: f64,
    pub assignments_sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRun {
    pub summary: StageRunSummary,
    pub assignments: Vec<ClusterAssignment>,
}

pub struct ClusterStage {
    config: StageConfig,
}

impl ClusterStage {
    pub fn new(config: StageConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Marks the task Processing, clusters its candidate passes and replaces
    /// its assignments while moving it to Done. On error the task stays
    /// Processing.
    pub async fn run(&self, store: &PassStore) -> Result<StageRun> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let id_task = self.config.id_task;
        let span = info_span!("cluster_stage", %run_id, id_task);

        async move {
            store
                .mark_task(id_task, TaskStatus::Processing)
                .await
                .context("marking task as processing")?;

            let passes = store
                .load_candidate_passes(&self.config.parent_jobs, &self.config.thresholds)
                .await
                .with_context(|| {
                    format!("loading passes of parent jobs {}", self.config.parent_jobs)
                })?;
            info!(candidates = passes.len(), "candidate passes loaded");

            let fit = cluster_passes(&passes, self.config.kmeans);
            info!(
                clusters_used = fit.effective_k,
                populated = fit.populated_clusters(),
                iterations = fit.iterations,
                inertia = fit.inertia,
                "clustering finished"
            );

            let assignments = select_representatives(id_task, &passes, &fit.labels);
            for assignment in &assignments {
                debug!(
                    cluster = assignment.cluster,
                    id_pass = assignment.id_pass,
                    "representative selected"
                );
            }

            store
                .replace_assignments(id_task, &assignments, TaskStatus::Done)
                .await
                .context("persisting cluster assignments")?;

            let summary = StageRunSummary {
                run_id,
                id_task,
                started_at,
                finished_at: Utc::now(),
                candidate_passes: passes.len(),
                clusters_requested: self.config.kmeans.n_clusters,
                clusters_used: fit.effective_k,
                representatives: assignments.len(),
                iterations: fit.iterations,
                inertia: fit.inertia,
                assignments_sha256: assignments_digest(&assignments),
            };
            info!(
                representatives = summary.representatives,
                sha256 = %summary.assignments_sha256,
                "task done"
            );

            Ok(StageRun {
                summary,
                assignments,
            })
        }
        .instrument(span)
        .await
    }
}

pub fn cluster_passes(passes: &[Pass], config: KMeansConfig) -> KMeansFit {
    let vectors: Vec<_> = passes.iter().map(Pass::feature_vector).collect();
    KMeans::new(config).fit(&vectors)
}

/// SHA-256 over `id_task,id_pass,cluster` lines, for comparing reruns.
pub fn assignments_digest(assignments: &[ClusterAssignment]) -> String {
    let mut sorted = assignments.to_vec();
    sorted.sort_by_key(|a| (a.cluster, a.id_pass));
    let mut hasher = Sha256::new();
    for a in &sorted {
        hasher.update(format!("{},{},{}\n", a.id_task, a.id_pass, a.cluster).as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Writes `<report_dir>/task-<id_task>/cluster_report.json`.
pub async fn write_run_report(report_dir: &Path, run: &StageRun) -> Result<PathBuf> {
    let task_dir = report_dir.join(format!("task-{}", run.summary.id_task));
    fs::create_dir_all(&task_dir)
        .await
        .with_context(|| format!("creating {}", task_dir.display()))?;

    let path = task_dir.join("cluster_report.json");
    let bytes = serde_json::to_vec_pretty(run).context("serializing cluster report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Connects to the store, runs the stage once and releases the store.
pub async fn run_cluster_stage(config: StageConfig) -> Result<StageRun> {
    let stage = ClusterStage::new(config).context("invalid stage configuration")?;
    let store = PassStore::connect(&stage.config().database)
        .await
        .context("opening pass store")?;

    let result = stage.run(&store).await;
    store.close().await;
    let run = result?;

    if let Some(report_dir) = &stage.config().report_dir {
        let path = write_run_report(report_dir, &run).await?;
        info!(path = %path.display(), "cluster report written");
    }
    Ok(run)
}
