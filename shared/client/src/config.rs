use std::{net::SocketAddr, path::PathBuf};

use sluice_modeling::{
    node_dir, uniform_ratio, validate_ratio, LlamaConfig, ModelKind, ModelLoadError, SplitConfig,
    SplitError, CONFIG_FILE,
};
use tch::{Device, Kind};
use thiserror::Error;

use crate::NodeArgs;

/// Hard cap on generated tokens when the model doesn't say how long its
/// context is.
pub const MAX_LENGTH: usize = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("memory window must hold at least 2 blocks, got {0}")]
    WindowTooSmall(usize),

    #[error("world size must be at least 1")]
    EmptyWorld,

    #[error("rank {rank} is out of range for a world of {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },

    #[error("model path {} does not exist, download the pretrained weights first", .0.display())]
    ModelDirMissing(PathBuf),

    #[error("the number of nodes ({world_size}) can't exceed the number of kv heads ({kv_heads})")]
    KvHeadsLessThanWorld { kv_heads: usize, world_size: usize },

    #[error(transparent)]
    Ratio(#[from] SplitError),

    #[error(transparent)]
    Model(#[from] ModelLoadError),
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub prompt: Option<String>,
    pub prefix: String,
    pub length: i64,
    pub temperature: f64,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub seed: u64,
}

/// Startup parameters after validation.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub rank: usize,
    pub world_size: usize,
    pub control_addr: SocketAddr,
    pub file_addr: SocketAddr,
    pub model_path: PathBuf,
    pub split_root: PathBuf,
    pub ratio: Vec<f64>,
    pub memory_window: usize,
    pub force_split: bool,
    pub force_download: bool,
    pub model_kind: ModelKind,
    pub device: Device,
    pub kind: Kind,
    pub generation: GenerationConfig,
}

impl TryFrom<NodeArgs> for NodeConfig {
    type Error = ConfigError;

    fn try_from(args: NodeArgs) -> Result<Self, Self::Error> {
        if args.world_size == 0 {
            return Err(ConfigError::EmptyWorld);
        }
        if args.rank >= args.world_size {
            return Err(ConfigError::RankOutOfRange {
                rank: args.rank,
                world_size: args.world_size,
            });
        }
        if args.memory_window < 2 {
            return Err(ConfigError::WindowTooSmall(args.memory_window));
        }
        let ratio = args
            .split_ratio
            .unwrap_or_else(|| uniform_ratio(args.world_size));
        validate_ratio(args.world_size, &ratio)?;
        let model_kind = args.model_type.parse::<ModelKind>()?;

        let config = NodeConfig {
            rank: args.rank,
            world_size: args.world_size,
            control_addr: SocketAddr::new(args.master_addr, args.control_port),
            file_addr: SocketAddr::new(args.master_addr, args.file_port),
            split_root: args.model_path.join(&args.save_dir),
            model_path: args.model_path,
            ratio,
            memory_window: args.memory_window,
            force_split: args.force_split,
            force_download: args.force_download,
            model_kind,
            device: args.device.0,
            kind: args.dtype.0,
            generation: GenerationConfig {
                prompt: args.prompt,
                prefix: args.prefix,
                length: args.length,
                temperature: args.temperature,
                top_k: args.top_k,
                top_p: args.top_p,
                seed: args.seed,
            },
        };

        if config.rank == 0 {
            if !config.model_path.is_dir() {
                return Err(ConfigError::ModelDirMissing(config.model_path));
            }
            let model = LlamaConfig::from_file(&config.model_path.join(CONFIG_FILE))?;
            config.check_model(&model)?;
        }
        Ok(config)
    }
}

impl NodeConfig {
    /// Checks that the model can be run by this group. Rank 0 does this before
    /// splitting; peers once their shard has arrived.
    pub fn check_model(&self, model: &LlamaConfig) -> Result<(), ConfigError> {
        let model_kind = model.model_kind()?;
        if model_kind != self.model_kind {
            return Err(ModelLoadError::UnsupportedModelType(model_kind.to_string()).into());
        }
        let kv_heads = model.num_key_value_heads();
        if kv_heads < self.world_size {
            return Err(ConfigError::KvHeadsLessThanWorld {
                kv_heads,
                world_size: self.world_size,
            });
        }
        Ok(())
    }

    pub fn split_config(&self) -> SplitConfig {
        SplitConfig {
            model_dir: self.model_path.clone(),
            save_dir: self.split_root.clone(),
            ratio: self.ratio.clone(),
            force: self.force_split,
        }
    }

    pub fn shard_dir(&self) -> PathBuf {
        node_dir(&self.split_root, self.rank)
    }

    pub fn tokenizer_path(&self) -> PathBuf {
        self.model_path.join("tokenizer.json")
    }
}

/// Number of tokens to generate. A negative request means "as long as the
/// model allows"; no request may exceed the model's context.
pub fn adjust_length_to_model(length: i64, max_sequence_length: usize) -> usize {
    match (length, max_sequence_length) {
        (length, max) if length < 0 && max > 0 => max,
        (length, max) if max > 0 && length as usize > max => max,
        (length, _) if length < 0 => MAX_LENGTH,
        (length, _) => length as usize,
    }
}
