use std::collections::HashSet;
use std::path::{Path, PathBuf};

use passcluster_core::{ClusterAssignment, ParentJobs, TaskStatus};
use passcluster_stage::{run_cluster_stage, ClusterStage, StageConfig};
use passcluster_storage::PassStore;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::{tempdir, TempDir};

const SCHEMA: &str = "
CREATE TABLE jobs (id_job INTEGER PRIMARY KEY);
CREATE TABLE tasks (id_task INTEGER PRIMARY KEY, id_job INTEGER, status TEXT);
CREATE TABLE passes (
    id_pass INTEGER PRIMARY KEY AUTOINCREMENT,
    id_task INTEGER,
    pass INTEGER,
    is_optimization INTEGER,
    is_forward INTEGER,
    initial_deposit REAL,
    withdrawal REAL,
    profit REAL,
    gross_profit REAL,
    gross_loss REAL,
    balance_dd_relative REAL,
    equity_dd_relative REAL,
    expected_payoff REAL,
    profit_factor REAL,
    recovery_factor REAL,
    sharpe_ratio REAL,
    trades REAL,
    complex_criterion REAL,
    custom_ontester REAL,
    params TEXT
);
INSERT INTO jobs (id_job) VALUES (7), (8), (9);
INSERT INTO tasks (id_task, id_job, status) VALUES
    (1, 7, 'Done'), (2, 7, 'Done'), (3, 8, 'Done'),
    (42, 9, 'Pending'), (43, 9, 'Pending');
";

/// (id_pass, id_task, profit, trades, sharpe_ratio, custom_ontester)
type Row = (i64, i64, f64, f64, f64, f64);

/// Three groups of passes from job 7 separated by profit, plus passes that
/// the quality filter must drop.
const PASSES: &[Row] = &[
    (1, 1, 100.0, 50.0, 1.0, 1.0),
    (2, 1, 101.0, 52.0, 1.1, 4.0),
    (3, 2, 102.0, 51.0, 1.0, 2.0),
    (4, 2, 103.0, 50.0, 0.9, 3.0),
    (5, 1, 5000.0, 60.0, 1.5, 2.0),
    (6, 2, 5002.0, 61.0, 1.4, 2.5),
    (7, 1, 5001.0, 60.0, 1.5, 6.0),
    (8, 2, 20000.0, 80.0, 2.0, 9.0),
    (9, 1, 20003.0, 81.0, 2.1, 1.0),
    (10, 2, 20001.0, 80.0, 2.0, 8.0),
    // dropped: not profitable, too few trades, low sharpe, negative ontester, other job
    (11, 1, -50.0, 90.0, 3.0, 50.0),
    (12, 1, 20002.0, 39.0, 2.0, 50.0),
    (13, 2, 5003.0, 60.0, 0.69, 50.0),
    (14, 2, 102.5, 50.0, 1.0, -1.0),
    (15, 3, 20000.0, 80.0, 2.0, 99.0),
];

const ELIGIBLE: [i64; 10] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

struct Fixture {
    _dir: TempDir,
    db_path: PathBuf,
}

impl Fixture {
    async fn new(rows: &[Row]) -> Self {
        let dir = tempdir().expect("tempdir");
        let db_path = dir.path().join("pipeline.sqlite");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(&db_path)
                    .create_if_missing(true),
            )
            .await
            .expect("seed pool");
        sqlx::raw_sql(SCHEMA).execute(&pool).await.expect("schema");
        for &(id_pass, id_task, profit, trades, sharpe, ontester) in rows {
            sqlx::query(
                "INSERT INTO passes (id_pass, id_task, pass, is_optimization, is_forward,
                    initial_deposit, withdrawal, profit, gross_profit, gross_loss,
                    balance_dd_relative, equity_dd_relative, expected_payoff, profit_factor,
                    recovery_factor, sharpe_ratio, trades, complex_criterion, custom_ontester, params)
                 VALUES (?, ?, ?, 1, 0, 10000, 0, ?, ?, ?, 5, 6, ?, 1.5, 2, ?, ?, 50, ?, 'x=1')",
            )
            .bind(id_pass)
            .bind(id_task)
            .bind(id_pass)
            .bind(profit)
            .bind(profit * 1.5)
            .bind(-profit * 0.5)
            .bind(profit / trades)
            .bind(sharpe)
            .bind(trades)
            .bind(ontester)
            .execute(&pool)
            .await
            .expect("insert pass");
        }
        pool.close().await;
        Self { _dir: dir, db_path }
    }

    fn location(&self) -> String {
        self.db_path.display().to_string()
    }

    fn config(&self, id_task: i64, n_clusters: usize) -> StageConfig {
        let mut config = StageConfig::new(self.location(), id_task, parent_jobs("7"));
        config.kmeans.n_clusters = n_clusters;
        config
    }

    async fn store(&self) -> PassStore {
        PassStore::connect(&self.location()).await.expect("connect")
    }

    async fn execute(&self, sql: &str) {
        let store_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().filename(&self.db_path))
            .await
            .expect("pool");
        sqlx::raw_sql(sql).execute(&store_pool).await.expect("execute");
        store_pool.close().await;
    }
}

fn parent_jobs(text: &str) -> ParentJobs {
    text.parse().expect("parent jobs")
}

fn pass_ids(assignments: &[ClusterAssignment]) -> HashSet<i64> {
    assignments.iter().map(|a| a.id_pass).collect()
}

#[tokio::test]
async fn three_natural_groups_yield_their_best_passes() {
    let fixture = Fixture::new(PASSES).await;
    let store = fixture.store().await;

    let stage = ClusterStage::new(fixture.config(42, 3)).expect("stage");
    let run = stage.run(&store).await.expect("run");

    assert_eq!(run.summary.candidate_passes, 10);
    assert_eq!(run.summary.clusters_used, 3);
    assert_eq!(run.assignments.len(), 3);
    assert_eq!(pass_ids(&run.assignments), HashSet::from([2, 7, 8]));
    assert!(run.assignments.iter().all(|a| a.id_task == 42));

    let clusters: HashSet<i64> = run.assignments.iter().map(|a| a.cluster).collect();
    assert_eq!(clusters.len(), 3);
    assert!(clusters.iter().all(|c| (0..3).contains(c)));

    let persisted = store.assignments_for_task(42).await.expect("persisted");
    assert_eq!(persisted, run.assignments);
    assert_eq!(
        store.task_status(42).await.expect("status"),
        Some(TaskStatus::Done)
    );
    store.close().await;
}

#[tokio::test]
async fn one_assignment_per_populated_cluster() {
    let fixture = Fixture::new(PASSES).await;
    let store = fixture.store().await;

    let run = ClusterStage::new(fixture.config(42, 256))
        .expect("stage")
        .run(&store)
        .await
        .expect("run");

    // fewer distinct rows than clusters: every eligible pass represents itself
    assert_eq!(run.summary.clusters_used, 10);
    assert_eq!(run.assignments.len(), 10);
    assert_eq!(pass_ids(&run.assignments), HashSet::from(ELIGIBLE));
    assert!(run.assignments.iter().all(|a| a.cluster < 256));
    store.close().await;
}

#[tokio::test]
async fn rerun_with_same_input_is_identical() {
    let fixture = Fixture::new(PASSES).await;
    let store = fixture.store().await;
    let stage = ClusterStage::new(fixture.config(42, 4)).expect("stage");

    let first = stage.run(&store).await.expect("first run");
    let first_rows = store.assignments_for_task(42).await.expect("rows");
    let second = stage.run(&store).await.expect("second run");
    let second_rows = store.assignments_for_task(42).await.expect("rows");

    assert_eq!(first_rows, second_rows);
    assert_eq!(
        first.summary.assignments_sha256,
        second.summary.assignments_sha256
    );
    assert_ne!(first.summary.run_id, second.summary.run_id);
    store.close().await;
}

#[tokio::test]
async fn rerun_after_data_change_replaces_previous_rows() {
    let fixture = Fixture::new(PASSES).await;
    let stage = ClusterStage::new(fixture.config(42, 3)).expect("stage");

    let store = fixture.store().await;
    stage.run(&store).await.expect("first run");
    store.close().await;

    fixture
        .execute("DELETE FROM passes WHERE id_pass IN (8, 9, 10); UPDATE passes SET custom_ontester = 40 WHERE id_pass = 1;")
        .await;

    let store = fixture.store().await;
    let run = stage.run(&store).await.expect("second run");
    let persisted = store.assignments_for_task(42).await.expect("rows");

    assert_eq!(persisted, run.assignments);
    let ids = pass_ids(&persisted);
    assert!(ids.contains(&1));
    assert!(ids.is_disjoint(&HashSet::from([8, 9, 10])));
    assert!(persisted.len() <= 3);
    assert!(ids.iter().all(|id| (1..=7).contains(id)));
    store.close().await;
}

#[tokio::test]
async fn single_candidate_yields_single_assignment() {
    let fixture = Fixture::new(&[PASSES[0], PASSES[10], PASSES[14]]).await;
    let store = fixture.store().await;

    let run = ClusterStage::new(fixture.config(42, 256))
        .expect("stage")
        .run(&store)
        .await
        .expect("run");

    assert_eq!(
        run.assignments,
        vec![ClusterAssignment {
            id_task: 42,
            id_pass: 1,
            cluster: 0
        }]
    );
    assert_eq!(
        store.task_status(42).await.expect("status"),
        Some(TaskStatus::Done)
    );
    store.close().await;
}

#[tokio::test]
async fn empty_candidate_set_still_completes() {
    let fixture = Fixture::new(&[PASSES[10], PASSES[11], PASSES[14]]).await;
    let store = fixture.store().await;

    let run = ClusterStage::new(fixture.config(42, 256))
        .expect("stage")
        .run(&store)
        .await
        .expect("run");

    assert_eq!(run.summary.candidate_passes, 0);
    assert!(run.assignments.is_empty());
    assert!(store.assignments_for_task(42).await.expect("rows").is_empty());
    assert_eq!(
        store.task_status(42).await.expect("status"),
        Some(TaskStatus::Done)
    );
    store.close().await;
}

#[tokio::test]
async fn every_representative_passes_the_quality_filter() {
    let fixture = Fixture::new(PASSES).await;
    let store = fixture.store().await;

    let mut config = fixture.config(42, 256);
    config.parent_jobs = parent_jobs("7, 8");
    config.thresholds.min_custom_ontester = 2.0;
    config.thresholds.min_trades = 60.0;
    let run = ClusterStage::new(config)
        .expect("stage")
        .run(&store)
        .await
        .expect("run");

    // 15 joins through task 3 / job 8; 5, 6, 7, 8 and 10 are job 7 survivors
    assert_eq!(pass_ids(&run.assignments), HashSet::from([5, 6, 7, 8, 10, 15]));
    store.close().await;
}

#[tokio::test]
async fn tasks_keep_separate_assignments() {
    let fixture = Fixture::new(PASSES).await;
    let store = fixture.store().await;

    ClusterStage::new(fixture.config(42, 3))
        .expect("stage")
        .run(&store)
        .await
        .expect("task 42");
    let mut other = fixture.config(43, 256);
    other.parent_jobs = parent_jobs("8");
    ClusterStage::new(other)
        .expect("stage")
        .run(&store)
        .await
        .expect("task 43");

    assert_eq!(store.assignments_for_task(42).await.expect("rows").len(), 3);
    assert_eq!(
        store.assignments_for_task(43).await.expect("rows"),
        vec![ClusterAssignment {
            id_task: 43,
            id_pass: 15,
            cluster: 0
        }]
    );
    store.close().await;
}

#[tokio::test]
async fn failure_after_start_leaves_task_processing() {
    let fixture = Fixture::new(PASSES).await;
    fixture.execute("DROP TABLE passes;").await;
    let store = fixture.store().await;

    let err = ClusterStage::new(fixture.config(42, 3))
        .expect("stage")
        .run(&store)
        .await
        .expect_err("passes table is gone");
    assert!(format!("{err:#}").contains("loading passes of parent jobs 7"));
    assert_eq!(
        store.task_status(42).await.expect("status"),
        Some(TaskStatus::Processing)
    );
    store.close().await;
}

#[tokio::test]
async fn unknown_task_is_refused_before_any_write() {
    let fixture = Fixture::new(PASSES).await;
    let store = fixture.store().await;

    let err = ClusterStage::new(fixture.config(404, 3))
        .expect("stage")
        .run(&store)
        .await
        .expect_err("unknown task");
    assert!(format!("{err:#}").contains("task 404 not found"));
    assert!(store.assignments_for_task(404).await.is_err());
    store.close().await;
}

#[tokio::test]
async fn missing_database_is_fatal() {
    let dir = tempdir().expect("tempdir");
    let missing = dir.path().join("nope.sqlite");
    let config = StageConfig::new(missing.display().to_string(), 42, parent_jobs("7"));
    let err = run_cluster_stage(config).await.expect_err("missing db");
    assert!(format!("{err:#}").contains("opening pass store"));
    assert!(!missing.exists());
}

#[tokio::test]
async fn full_run_writes_report() {
    let fixture = Fixture::new(PASSES).await;
    let reports = tempdir().expect("reports");
    let mut config = fixture.config(42, 3);
    config.report_dir = Some(reports.path().to_path_buf());

    let run = run_cluster_stage(config).await.expect("run");

    let report = report_path(reports.path(), 42);
    let value: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&report).expect("report")).expect("json");
    assert_eq!(value["summary"]["representatives"], 3);
    assert_eq!(
        value["summary"]["assignments_sha256"],
        run.summary.assignments_sha256.as_str()
    );
    assert_eq!(value["assignments"].as_array().map(Vec::len), Some(3));
}

fn report_path(root: &Path, id_task: i64) -> PathBuf {
    root.join(format!("task-{id_task}")).join("cluster_report.json")
}
