use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sluice_client::{NodeArgs, NodeConfig};
use sluice_logging::LogOutput;
use sluice_modeling::{split_pretrained_model, uniform_ratio, validate_ratio, SplitConfig, SplitOutcome};
use time::OffsetDateTime;
use tokio::runtime::Builder;
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[allow(clippy::large_enum_variant)] // it's only used at startup, we don't care.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Joins the group, fetches this node's shard and generates from a prompt.
    Run {
        #[clap(flatten)]
        args: NodeArgs,
    },
    /// Splits a pretrained model into per-node shards without running it.
    Split {
        #[clap(long, env)]
        model_path: PathBuf,

        /// Relative paths are resolved against `--model-path`.
        #[clap(long, env, default_value = "split")]
        save_dir: PathBuf,

        #[clap(long, env, default_value_t = 1)]
        world_size: usize,

        #[clap(long, env, value_delimiter = ',')]
        split_ratio: Option<Vec<f64>>,

        #[clap(long, env)]
        force_split: bool,
    },
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Run { args } => {
            sluice_logging::logging()
                .with_output(args.logs)
                .with_level(args.log_level)
                .with_log_file(args.write_log.clone())
                .init()?;

            info!(
                "============ Node Startup at {} ============",
                OffsetDateTime::now_utc()
            );

            let config = NodeConfig::try_from(args).context("invalid startup parameters")?;
            let rank = config.rank;
            if let Err(err) = sluice_client::run(config).await {
                error!(rank, "node failed: {err:#}");
                return Err(err);
            }
            Ok(())
        }
        Commands::Split {
            model_path,
            save_dir,
            world_size,
            split_ratio,
            force_split,
        } => {
            sluice_logging::logging()
                .with_output(LogOutput::Console)
                .with_level(Level::INFO)
                .init()?;

            let ratio = split_ratio.unwrap_or_else(|| uniform_ratio(world_size));
            validate_ratio(world_size, &ratio)?;
            let config = SplitConfig {
                save_dir: model_path.join(save_dir),
                model_dir: model_path,
                ratio,
                force: force_split,
            };
            match split_pretrained_model(&config)? {
                SplitOutcome::Written { files } => {
                    info!(files, dir = %config.save_dir.display(), "split complete")
                }
                SplitOutcome::Skipped => info!(
                    dir = %config.save_dir.display(),
                    "shards already exist, pass --force-split to redo them"
                ),
            }
            Ok(())
        }
    }
}

fn main() -> Result<()> {
    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .max_blocking_threads(8192)
        .thread_stack_size(10 * 1024 * 1024)
        .build()?;
    runtime.block_on(async_main())
}
