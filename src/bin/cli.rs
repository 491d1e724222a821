//! snapverify CLI

use clap::{Parser, Subcommand};
use snapverify::ops::{check_work_dir, generate_snapshot, GenerateOptions};
use snapverify::verify::CheckOptions;
use snapverify::Config;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "snapverify")]
#[command(about = "Cluster-wide snapshot verification")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cluster work directory, one sub-directory per node
    #[arg(long, global = true, default_value = "./snapverify-data")]
    work_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic replicated snapshot
    Generate {
        /// Snapshot name
        name: String,

        /// Consistent ids of the nodes (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "node-1,node-2,node-3")]
        nodes: Vec<String>,

        /// Cache groups (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "default")]
        groups: Vec<String>,

        /// Partitions per cache group
        #[arg(long, default_value = "16")]
        partitions: u32,

        /// Backup copies per partition
        #[arg(long, default_value = "1")]
        backups: usize,

        /// Keys per cache group
        #[arg(long, default_value = "1000")]
        keys: usize,

        /// Incremental snapshots to add
        #[arg(long, default_value = "0")]
        increments: i32,
    },

    /// Check a snapshot across every node of the work directory
    Check {
        /// Snapshot name
        name: String,

        /// Validate page checksums and compare partition content
        #[arg(long)]
        full: bool,

        /// Only check these cache groups (comma-separated)
        #[arg(long, value_delimiter = ',')]
        groups: Vec<String>,

        /// Check incremental snapshot N instead of the full one
        #[arg(long)]
        incremental: Option<i32>,

        /// Run every registered snapshot handler
        #[arg(long)]
        all_handlers: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Snapshot location overriding the configured one
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Generate {
            name,
            nodes,
            groups,
            partitions,
            backups,
            keys,
            increments,
        } => {
            let options = GenerateOptions {
                name,
                nodes,
                groups,
                partitions,
                backups,
                keys,
                increments,
                ..Default::default()
            };
            let report = generate_snapshot(&cli.work_dir, &config.storage, &options)?;
            println!("Snapshot '{}' generated:", options.name);
            println!("  Instances: {}", report.instances);
            println!("  Partition files: {}", report.partition_files);
            println!(
                "  Written: {}",
                snapverify::common::format_bytes(report.bytes_written)
            );
            println!("  Incremental segments: {}", report.segments);
        }

        Commands::Check {
            name,
            full,
            groups,
            incremental,
            all_handlers,
            json,
            path,
        } => {
            let mut options = CheckOptions::new()
                .full_check(full || config.check.full_check)
                .groups(groups)
                .incremental(incremental.unwrap_or(0))
                .all_handlers(all_handlers);
            if let Some(path) = path {
                options = options.path(path);
            }

            let report = check_work_dir(&cli.work_dir, &config, &name, options).await?;
            if json {
                println!("{}", report.to_json()?);
            } else {
                println!("{}", report);
            }

            if !report.is_clean() {
                std::process::exit(2);
            }
        }
    }

    Ok(())
}
