mod arena;
mod attention;
mod block;
mod device_utils;
mod manifest;
mod memory;
mod models;
mod parallelism;
mod pipeline;
mod rms_norm;
mod rope;
mod sampling;
mod scheduler;
mod splitter;
mod streamer;
mod token_output_stream;

pub use arena::{ArenaBuilder, ArenaError, ParameterArena, ParameterEntry, ParameterId};
pub use attention::{repeat_kv, AttentionBlock, AttentionDims, KvCache};
pub use block::{BlockId, BlockSequence, UnknownBlockName};
pub use device_utils::{get_optimal_device, ComputeDevice, ComputeDtype, DeviceParseError};
pub use manifest::{node_dir, ManifestEntry, ShardManifest};
pub use memory::{
    render_series, MemoryHistory, MemoryProbe, MemoryUsageSample, ProcessMemoryProbe,
};
pub use models::*;
pub use parallelism::{
    BroadcastValue, Collective, CollectiveError, CollectiveHandle, CollectiveOp,
    CollectiveReply, CollectiveResult, ColumnParallelLinear, Contribution, IssueOrder,
    LocalGroup, PendingCollective, Rendezvous, RendezvousMessage, RowParallelLinear,
};
pub use pipeline::{ForwardError, ForwardPipeline, PipelineLoadError, PipelineOptions};
pub use rms_norm::RMSNorm;
pub use rope::{apply_rotary_emb, default_rope, rotate_half, RoPECache, RoPEConfig, RoPEType};
pub use sampling::{LogitsProcessor, Sampling, SamplingError};
pub use scheduler::{MemoryWindowScheduler, StreamingError};
pub use splitter::{
    random_checkpoint, split_dims, split_heads, split_pretrained_model, uniform_ratio,
    validate_ratio, HeadSplit, ShardInfo, ShardPlan, SplitConfig, SplitError, SplitOutcome,
    CONFIG_FILE, SHARD_INFO_FILE,
};
pub use streamer::{TrackHandle, WeightStreamer};
pub use token_output_stream::TokenOutputStream;

/// Seeds libtorch's global generator.
pub fn set_torch_rng_seed(seed: u64) {
    tch::manual_seed(seed as i64);
}
