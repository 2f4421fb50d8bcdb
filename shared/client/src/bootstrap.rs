use anyhow::{Context, Result};
use sluice_modeling::{split_pretrained_model, Collective, SplitOutcome};
use sluice_network::{
    download_shard, CancellationToken, FileServer, RetryPolicy, TcpCollective,
};
use tracing::info;

use crate::NodeConfig;

/// Brings the group up and makes sure every node holds its shard.
///
/// Two barriers order the exchange: after the first, rank 0's file server is
/// accepting requests; after the second, every peer has its files and the
/// server can go away.
pub async fn bootstrap(config: &NodeConfig) -> Result<TcpCollective> {
    match config.rank {
        0 => bootstrap_coordinator(config).await,
        _ => bootstrap_peer(config).await,
    }
}

async fn bootstrap_coordinator(config: &NodeConfig) -> Result<TcpCollective> {
    let comm = TcpCollective::coordinator(config.control_addr, config.world_size)
        .await
        .context("failed to bind the collective channel")?;

    let split = config.split_config();
    let outcome = tokio::task::spawn_blocking(move || split_pretrained_model(&split))
        .await?
        .context("failed to split the pretrained model")?;
    match outcome {
        SplitOutcome::Written { files } => info!(
            files,
            dir = %config.split_root.display(),
            "split pretrained weights"
        ),
        SplitOutcome::Skipped => info!(
            dir = %config.split_root.display(),
            "reusing existing shards"
        ),
    }

    let server = FileServer::bind(config.file_addr, &config.split_root)
        .await
        .context("failed to bind the shard file server")?;
    let cancel = CancellationToken::new();
    let serving = tokio::spawn(server.serve(cancel.clone()));

    let stop = cancel.drop_guard();
    let delivered = async {
        comm.barrier().wait_async().await?;
        info!("file server ready, waiting for peers to download");
        comm.barrier().wait_async().await
    }
    .await;
    drop(stop);
    serving.await?;
    delivered.context("a peer left before every shard was delivered")?;
    info!("all peers have their shards");
    Ok(comm)
}

async fn bootstrap_peer(config: &NodeConfig) -> Result<TcpCollective> {
    let comm = TcpCollective::connect(
        config.control_addr,
        config.rank,
        config.world_size,
        RetryPolicy::default(),
    )
    .await
    .context("failed to join the collective channel")?;

    comm.barrier().wait_async().await?;
    let shard_dir = config.shard_dir();
    if !shard_dir.exists() || config.force_download {
        download_shard(
            config.file_addr,
            config.rank,
            &config.split_root,
            RetryPolicy::default(),
        )
        .await
        .with_context(|| format!("failed to download shard for rank {}", config.rank))?;
    } else {
        info!(dir = %shard_dir.display(), "reusing local shard");
    }
    comm.barrier().wait_async().await?;
    Ok(comm)
}
