use std::{io::Write, sync::Arc};

use anyhow::{Context, Result};
use sluice_modeling::{
    set_torch_rng_seed, Collective, ForwardPipeline, LlamaConfig, PipelineOptions, CONFIG_FILE,
};
use tracing::info;

use crate::{bootstrap, generate, NodeConfig, RootPrompt};

/// Runs one node from bootstrap to the end of generation.
pub async fn run(config: NodeConfig) -> Result<()> {
    set_torch_rng_seed(config.generation.seed);
    let comm = Arc::new(bootstrap(&config).await?);

    let shard_dir = config.shard_dir();
    let model = LlamaConfig::from_file(&shard_dir.join(CONFIG_FILE))
        .context("failed to read the shard's model config")?;
    config.check_model(&model)?;
    info!(
        rank = config.rank,
        world_size = config.world_size,
        layers = model.num_hidden_layers,
        window = config.memory_window,
        device = ?config.device,
        "shard ready"
    );

    let options = PipelineOptions {
        shard_dir,
        memory_window: config.memory_window,
        kind: config.kind,
        device: config.device,
    };
    let group: Arc<dyn Collective> = comm.clone();
    let summary = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut root = match config.rank {
            0 => Some(RootPrompt::load(&config, &model)?),
            _ => None,
        };
        let mut pipeline = ForwardPipeline::load(&options, group)?;
        let mut stdout = std::io::stdout();
        let mut on_text = |text: &str| {
            let _ = write!(stdout, "{text}");
            let _ = stdout.flush();
        };
        let summary = generate(
            &mut pipeline,
            root.as_mut(),
            &config.generation,
            model.max_position_embeddings,
            &mut on_text,
        )?;
        if config.rank == 0 {
            println!();
        }
        Ok(summary)
    })
    .await??;
    info!(
        prompt_tokens = summary.prompt_tokens,
        generated = summary.tokens.len(),
        peak_resident_bytes = summary.peak_resident_bytes,
        "generation finished"
    );

    comm.peers_closed().await;
    Ok(())
}
