use std::{collections::HashMap, path::PathBuf, sync::Arc};

use tch::{Device, Kind, TchError, Tensor};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    ArenaBuilder, BlockId, BroadcastValue, Collective, CollectiveError, KvCache, Llama,
    LlamaConfig, MemoryProbe, MemoryUsageSample, MemoryWindowScheduler, ModelLoadError,
    ProcessMemoryProbe, ShardInfo, ShardManifest, SplitError, StreamingError, WeightStreamer,
    CONFIG_FILE,
};

const HIDDEN_STATES: &str = "hidden_states";
const COS: &str = "cos";
const SIN: &str = "sin";
const CACHE_POSITION: &str = "cache_position";
const CAUSAL_MASK: &str = "causal_mask";

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Streaming(#[from] StreamingError),

    #[error(transparent)]
    Collective(#[from] CollectiveError),

    #[error("rank 0 must be given input ids")]
    MissingInput,

    #[error("rank 0 has no embedding or output head loaded")]
    NotRoot,

    #[error("forward inputs broadcast from rank 0 are incomplete: {0}")]
    BroadcastMismatch(String),

    #[error(transparent)]
    Tch(#[from] TchError),
}

#[derive(Debug, Error)]
pub enum PipelineLoadError {
    #[error(transparent)]
    Model(#[from] ModelLoadError),

    #[error(transparent)]
    Shard(#[from] SplitError),

    #[error(transparent)]
    Streaming(#[from] StreamingError),

    #[error("shard in {} was split for rank {found} of {found_world}, this node is rank {expected} of {expected_world}", dir.display())]
    RankMismatch {
        dir: PathBuf,
        expected: usize,
        expected_world: usize,
        found: usize,
        found_world: usize,
    },
}

/// How a node builds its pipeline from a downloaded shard.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub shard_dir: PathBuf,
    pub memory_window: usize,
    pub kind: Kind,
    pub device: Device,
}

/// Everything rank 0 computes once per pass and every rank needs.
struct ForwardInputs {
    hidden: Tensor,
    cos: Tensor,
    sin: Tensor,
    mask: Option<Tensor>,
}

impl ForwardInputs {
    fn into_unit(self, cache_position: Tensor) -> BroadcastValue {
        let mut unit = vec![
            (HIDDEN_STATES.to_string(), self.hidden),
            (COS.to_string(), self.cos),
            (SIN.to_string(), self.sin),
            (CACHE_POSITION.to_string(), cache_position),
        ];
        if let Some(mask) = self.mask {
            unit.push((CAUSAL_MASK.to_string(), mask));
        }
        BroadcastValue::Tensors(unit)
    }

    /// Rebuilds the inputs from a broadcast unit, checking it is complete and
    /// consistent with this rank's cache.
    fn from_unit(
        unit: Vec<(String, Tensor)>,
        past: i64,
        device: Device,
    ) -> Result<Self, ForwardError> {
        let mut unit: HashMap<String, Tensor> = unit
            .into_iter()
            .map(|(name, tensor)| (name, tensor.to_device(device)))
            .collect();
        let mut take = |name: &str| {
            unit.remove(name)
                .ok_or_else(|| ForwardError::BroadcastMismatch(format!("missing {name}")))
        };
        let hidden = take(HIDDEN_STATES)?;
        let cos = take(COS)?;
        let sin = take(SIN)?;
        let positions = take(CACHE_POSITION)?;
        let mask = take(CAUSAL_MASK).ok();

        let hidden_size = hidden.size();
        if hidden_size.len() != 3 {
            return Err(ForwardError::BroadcastMismatch(format!(
                "hidden states have shape {hidden_size:?}"
            )));
        }
        let t = hidden_size[1];
        if cos.size() != sin.size() || cos.size().get(1) != Some(&t) {
            return Err(ForwardError::BroadcastMismatch(format!(
                "rotary tables {:?}/{:?} do not cover {t} positions",
                cos.size(),
                sin.size()
            )));
        }
        if positions.size() != [t] || positions.f_int64_value(&[0])? != past {
            return Err(ForwardError::BroadcastMismatch(format!(
                "cache positions {:?} do not continue from {past}",
                positions.size()
            )));
        }
        if t > 1 && mask.is_none() {
            return Err(ForwardError::BroadcastMismatch(format!(
                "missing {CAUSAL_MASK} for {t} new positions"
            )));
        }
        Ok(Self {
            hidden,
            cos,
            sin,
            mask,
        })
    }
}

/// Runs one rank's share of the forward pass.
///
/// The pass walks the model's block sequence in order. Before each block is
/// read, the streamer is told to track it; the disk work for the following
/// block is done while the all-reduce of the current one is in flight.
pub struct ForwardPipeline {
    model: Llama,
    streamer: WeightStreamer,
    comm: Arc<dyn Collective>,
    cache: KvCache,
}

impl ForwardPipeline {
    pub fn new(model: Llama, streamer: WeightStreamer, comm: Arc<dyn Collective>) -> Self {
        let cache = KvCache::new(model.num_layers());
        Self {
            model,
            streamer,
            comm,
            cache,
        }
    }

    /// Builds the model, its parameter arena and the streaming worker from a
    /// node's shard directory.
    pub fn load(
        options: &PipelineOptions,
        comm: Arc<dyn Collective>,
    ) -> Result<Self, PipelineLoadError> {
        Self::load_with_probe(options, comm, Box::new(ProcessMemoryProbe::new()))
    }

    pub fn load_with_probe(
        options: &PipelineOptions,
        comm: Arc<dyn Collective>,
        probe: Box<dyn MemoryProbe>,
    ) -> Result<Self, PipelineLoadError> {
        let dir = &options.shard_dir;
        let config = LlamaConfig::from_file(&dir.join(CONFIG_FILE))?;
        let shard = ShardInfo::read(dir)?;
        if shard.rank != comm.rank() || shard.world_size != comm.world_size() {
            return Err(PipelineLoadError::RankMismatch {
                dir: dir.clone(),
                expected: comm.rank(),
                expected_world: comm.world_size(),
                found: shard.rank,
                found_world: shard.world_size,
            });
        }

        let mut builder = ArenaBuilder::new(options.kind, options.device);
        let model = Llama::declare(&config, &shard, &mut builder)?;
        let arena = builder.finish();
        let manifest = ShardManifest::from_dir(dir.clone(), model.sequence());
        manifest.verify()?;
        let scheduler = MemoryWindowScheduler::new(
            model.sequence().clone(),
            manifest,
            arena,
            options.memory_window,
            probe,
        )?;
        info!(
            rank = shard.rank,
            heads = shard.num_heads,
            kv_heads = shard.num_kv_heads,
            intermediate = shard.intermediate_size,
            window = options.memory_window,
            "loaded shard layout"
        );
        let streamer = WeightStreamer::spawn(scheduler)?;
        Ok(Self::new(model, streamer, comm))
    }

    pub fn model(&self) -> &Llama {
        &self.model
    }

    pub fn streamer(&self) -> &WeightStreamer {
        &self.streamer
    }

    pub fn comm(&self) -> &Arc<dyn Collective> {
        &self.comm
    }

    pub fn past_len(&self) -> i64 {
        self.cache.past_len()
    }

    pub fn memory_history(&self) -> Result<Vec<MemoryUsageSample>, StreamingError> {
        self.streamer.memory_history()
    }

    /// Drops cached keys and values so the next pass starts a new sequence.
    pub fn reset(&mut self) {
        self.cache.clear();
    }

    /// One forward pass over `input_ids` (`[batch, seq_len]`, rank 0 only).
    ///
    /// Rank 0 returns the logits of the last position, `[batch, vocab]`. Other
    /// ranks return `None`.
    pub fn forward(&mut self, input_ids: Option<&Tensor>) -> Result<Option<Tensor>, ForwardError> {
        let _guard = tch::no_grad_guard();
        let rank = self.comm.rank();
        let sequence = self.model.sequence().clone();

        self.streamer.track(BlockId::Input)?;
        let past = self.cache.past_len();
        let unit = match rank {
            0 => Some(self.prepare_inputs(input_ids.ok_or(ForwardError::MissingInput)?, past)?),
            _ => None,
        };
        let unit = self.comm.broadcast(0, unit).wait()?.into_tensors()?;
        let ForwardInputs {
            mut hidden,
            cos,
            sin,
            mask,
        } = ForwardInputs::from_unit(unit, past, self.model.device())?;
        debug!(rank, past, positions = hidden.size()[1], "forward pass inputs ready");

        for layer in 0..self.model.num_layers() {
            let Some(block) = self.model.layer(layer) else {
                break;
            };

            self.streamer.track(BlockId::Attention(layer))?;
            let attn = block
                .attention
                .forward(&hidden, &cos, &sin, mask.as_ref(), &mut self.cache);
            let reduce = self.comm.all_reduce(&attn);
            self.streamer.track(BlockId::Mlp(layer))?;
            reduce.wait()?;
            hidden = hidden + attn;

            let mlp = block.mlp.forward(&hidden);
            let reduce = self.comm.all_reduce(&mlp);
            self.streamer.track(sequence.after_mlp(layer))?;
            reduce.wait()?;
            hidden = hidden + mlp;
        }

        if rank != 0 {
            return Ok(None);
        }
        let head = self.model.head().ok_or(ForwardError::NotRoot)?;
        let t = hidden.size()[1];
        let last = hidden.narrow(1, t - 1, 1);
        let logits = head.forward(&last).squeeze_dim(1).to_kind(Kind::Float);
        Ok(Some(logits))
    }

    fn prepare_inputs(&self, input_ids: &Tensor, past: i64) -> Result<BroadcastValue, ForwardError> {
        let embedding = self.model.embedding().ok_or(ForwardError::NotRoot)?;
        let device = self.model.device();
        let input_ids = input_ids.to_device(device);
        let hidden = embedding.forward(&input_ids);
        let t = input_ids.size().last().copied().unwrap_or_default();

        let positions = Tensor::arange_start(past, past + t, (Kind::Int64, device));
        let (cos, sin) = self.model.rotary(&positions.unsqueeze(0), hidden.kind());
        let mask = (t > 1).then(|| {
            let keys = Tensor::arange(past + t, (Kind::Int64, device)).view([1, -1]);
            keys.le_tensor(&positions.view([-1, 1]))
                .view([1, 1, t, past + t])
        });
        let inputs = ForwardInputs {
            hidden,
            cos,
            sin,
            mask,
        };
        Ok(inputs.into_unit(positions))
    }
}
