use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use passcluster_core::{ParentJobs, QualityThresholds, DEFAULT_N_CLUSTERS};
use passcluster_stage::kmeans::{DEFAULT_MAX_ITER, DEFAULT_SEED};
use passcluster_stage::{run_cluster_stage, KMeansConfig, StageConfig};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "passcluster")]
#[command(about = "Clustering passes for previous job(s)")]
struct Cli {
    /// Path to the SQLite database file (or a sqlite: URL)
    db_path: String,

    /// ID of the current task
    id_task: i64,

    /// ID(s) of the parent job(s), e.g. "7" or "7,8"
    #[arg(long = "id-parent-job", alias = "id_parent_job")]
    id_parent_job: ParentJobs,

    /// Number of clusters
    #[arg(long = "n-clusters", alias = "n_clusters", default_value_t = DEFAULT_N_CLUSTERS)]
    n_clusters: usize,

    /// Min value for `custom_ontester`
    #[arg(
        long = "min-custom-ontester",
        alias = "min_custom_ontester",
        default_value_t = 0.0,
        allow_negative_numbers = true
    )]
    min_custom_ontester: f64,

    /// Min value for `trades`
    #[arg(
        long = "min-trades",
        alias = "min_trades",
        default_value_t = 40.0,
        allow_negative_numbers = true
    )]
    min_trades: f64,

    /// Min value for `sharpe_ratio`
    #[arg(
        long = "min-sharpe-ratio",
        alias = "min_sharpe_ratio",
        default_value_t = 0.7,
        allow_negative_numbers = true
    )]
    min_sharpe_ratio: f64,

    /// Seed for k-means initialization
    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// Maximum Lloyd iterations per initialization
    #[arg(long = "max-iter", default_value_t = DEFAULT_MAX_ITER)]
    max_iter: usize,

    /// Directory for a JSON report of the run
    #[arg(long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn stage_config(self) -> StageConfig {
        let mut config = StageConfig::new(self.db_path, self.id_task, self.id_parent_job);
        config.thresholds = QualityThresholds {
            min_custom_ontester: self.min_custom_ontester,
            min_trades: self.min_trades,
            min_sharpe_ratio: self.min_sharpe_ratio,
        };
        config.kmeans = KMeansConfig {
            n_clusters: self.n_clusters,
            seed: self.seed,
            max_iter: self.max_iter,
            ..KMeansConfig::default()
        };
        config.report_dir = self.report_dir;
        config
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "passcluster={log_level},passcluster_stage={log_level},passcluster_storage={log_level},sqlx=warn"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let run = run_cluster_stage(cli.stage_config()).await?;
    let summary = &run.summary;
    println!(
        "clustering complete: id_task={} candidates={} clusters={} representatives={} sha256={}",
        summary.id_task,
        summary.candidate_passes,
        summary.clusters_used,
        summary.representatives,
        summary.assignments_sha256
    );

    Ok(())
}
