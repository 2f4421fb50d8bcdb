use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use tch::{Kind, TchError, Tensor};
use thiserror::Error;
use tracing::{debug, info};

use crate::{node_dir, BlockId, LlamaConfig, ModelLoadError};

/// Per-node shard description, written as `shard.json` next to the block files.
pub const SHARD_INFO_FILE: &str = "shard.json";
pub const CONFIG_FILE: &str = "config.json";

const RATIO_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("model directory {} does not exist, download the pretrained weights first", .0.display())]
    ModelDirMissing(PathBuf),

    #[error("invalid split ratio: {0}")]
    InvalidRatio(String),

    #[error("model has {kv} key/value heads, fewer than the {world} nodes it must be split across")]
    KvHeadsLessThanWorld { kv: usize, world: usize },

    #[error("{heads} attention heads are not divisible by {kv} key/value heads")]
    HeadsNotDivisible { heads: usize, kv: usize },

    #[error("split sizes {sizes:?} do not add up to dimension {dim}")]
    SplitSizeMismatch { dim: usize, sizes: Vec<usize> },

    #[error("model is missing tensor {0}")]
    MissingTensor(String),

    #[error("failed to parse {}: {source}", path.display())]
    ShardInfo {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Config(#[from] ModelLoadError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tch(#[from] TchError),
}

pub fn uniform_ratio(world_size: usize) -> Vec<f64> {
    vec![1.0 / world_size as f64; world_size]
}

pub fn validate_ratio(world_size: usize, ratio: &[f64]) -> Result<(), SplitError> {
    if ratio.len() != world_size {
        return Err(SplitError::InvalidRatio(format!(
            "{} entries for {world_size} nodes",
            ratio.len()
        )));
    }
    if let Some(bad) = ratio.iter().find(|r| !r.is_finite() || **r <= 0.0) {
        return Err(SplitError::InvalidRatio(format!(
            "entry {bad} is not a positive number"
        )));
    }
    let sum: f64 = ratio.iter().sum();
    if (sum - 1.0).abs() > RATIO_TOLERANCE {
        return Err(SplitError::InvalidRatio(format!("entries sum to {sum}, not 1")));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadSplit {
    pub heads: Vec<usize>,
    pub kv_heads: Vec<usize>,
}

/// Partitions key/value heads across nodes in proportion to `ratio`, giving
/// every node at least one. Query heads follow their key/value group.
///
/// Rounding uses the largest-remainder method: nodes start at the floor of
/// their quota, then the heads left over go to the nodes furthest below their
/// quota (or are taken back from the nodes furthest above it when the
/// one-head minimum overshoots). Ties go to the lower rank.
pub fn split_heads(
    world_size: usize,
    ratio: &[f64],
    num_heads: usize,
    num_kv_heads: usize,
) -> Result<HeadSplit, SplitError> {
    validate_ratio(world_size, ratio)?;
    if num_kv_heads < world_size {
        return Err(SplitError::KvHeadsLessThanWorld {
            kv: num_kv_heads,
            world: world_size,
        });
    }
    if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
        return Err(SplitError::HeadsNotDivisible {
            heads: num_heads,
            kv: num_kv_heads,
        });
    }

    let quotas: Vec<f64> = ratio.iter().map(|r| r * num_kv_heads as f64).collect();
    let mut kv_heads: Vec<usize> = quotas
        .iter()
        .map(|q| (q.floor() as usize).max(1))
        .collect();

    let mut total: usize = kv_heads.iter().sum();
    while total > num_kv_heads {
        let node = pick(&kv_heads, |i| {
            (kv_heads[i] > 1).then(|| kv_heads[i] as f64 - quotas[i])
        });
        let Some(node) = node else { break };
        kv_heads[node] -= 1;
        total -= 1;
    }
    while total < num_kv_heads {
        let node = pick(&kv_heads, |i| Some(quotas[i] - kv_heads[i] as f64));
        let Some(node) = node else { break };
        kv_heads[node] += 1;
        total += 1;
    }

    let group = num_heads / num_kv_heads;
    let heads = kv_heads.iter().map(|kv| kv * group).collect();
    Ok(HeadSplit { heads, kv_heads })
}

/// Index with the largest score, lowest index on ties.
fn pick(values: &[usize], score: impl Fn(usize) -> Option<f64>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for i in 0..values.len() {
        let Some(s) = score(i) else { continue };
        match best {
            Some((_, b)) if s <= b => {}
            _ => best = Some((i, s)),
        }
    }
    best.map(|(i, _)| i)
}

/// Splits `dim` in proportion to `parts` (floor of `parts_i * dim / sum`).
pub fn split_dims(parts: &[usize], dim: usize) -> Result<Vec<usize>, SplitError> {
    let total: usize = parts.iter().sum();
    if total == 0 {
        return Err(SplitError::SplitSizeMismatch {
            dim,
            sizes: parts.to_vec(),
        });
    }
    let sizes: Vec<usize> = parts.iter().map(|p| p * dim / total).collect();
    if sizes.iter().sum::<usize>() != dim {
        return Err(SplitError::SplitSizeMismatch { dim, sizes });
    }
    Ok(sizes)
}

/// What one node holds of the full model.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ShardInfo {
    pub rank: usize,
    pub world_size: usize,
    pub ratio: Vec<f64>,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub intermediate_size: usize,
    pub head_dim: usize,
}

impl ShardInfo {
    pub fn read(dir: &Path) -> Result<Self, SplitError> {
        let path = dir.join(SHARD_INFO_FILE);
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|source| SplitError::ShardInfo { path, source })
    }

    fn write(&self, dir: &Path) -> Result<(), SplitError> {
        let path = dir.join(SHARD_INFO_FILE);
        let raw = serde_json::to_string_pretty(self)
            .map_err(|source| SplitError::ShardInfo {
                path: path.clone(),
                source,
            })?;
        fs::write(path, raw)?;
        Ok(())
    }
}

/// Head and feature partition of a model across all nodes.
#[derive(Debug, Clone)]
pub struct ShardPlan {
    pub ratio: Vec<f64>,
    pub head_dim: usize,
    pub heads: HeadSplit,
    pub intermediate: Vec<usize>,
}

impl ShardPlan {
    pub fn new(config: &LlamaConfig, ratio: &[f64]) -> Result<Self, SplitError> {
        let world_size = ratio.len();
        let heads = split_heads(
            world_size,
            ratio,
            config.num_attention_heads,
            config.num_key_value_heads(),
        )?;
        let intermediate = split_dims(&heads.heads, config.intermediate_size)?;
        Ok(Self {
            ratio: ratio.to_vec(),
            head_dim: config.head_dim(),
            heads,
            intermediate,
        })
    }

    pub fn world_size(&self) -> usize {
        self.ratio.len()
    }

    pub fn shard_info(&self, rank: usize) -> ShardInfo {
        ShardInfo {
            rank,
            world_size: self.world_size(),
            ratio: self.ratio.clone(),
            num_heads: self.heads.heads[rank],
            num_kv_heads: self.heads.kv_heads[rank],
            intermediate_size: self.intermediate[rank],
            head_dim: self.head_dim,
        }
    }

    fn q_rows(&self) -> Vec<i64> {
        self.heads
            .heads
            .iter()
            .map(|h| (h * self.head_dim) as i64)
            .collect()
    }

    fn kv_rows(&self) -> Vec<i64> {
        self.heads
            .kv_heads
            .iter()
            .map(|h| (h * self.head_dim) as i64)
            .collect()
    }

    fn mlp_rows(&self) -> Vec<i64> {
        self.intermediate.iter().map(|i| *i as i64).collect()
    }
}

#[derive(Debug, Clone)]
pub struct SplitConfig {
    pub model_dir: PathBuf,
    pub save_dir: PathBuf,
    pub ratio: Vec<f64>,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    Written { files: usize },
    Skipped,
}

type NodeFiles = Vec<Vec<(String, Tensor)>>;

/// Splits a pretrained checkpoint into per-node, per-block shard files under
/// `save_dir/node_<rank>/`.
///
/// Nothing is written until the whole partition has been validated. An existing
/// `save_dir` is left alone unless `force` is set.
pub fn split_pretrained_model(config: &SplitConfig) -> Result<SplitOutcome, SplitError> {
    if !config.model_dir.is_dir() {
        return Err(SplitError::ModelDirMissing(config.model_dir.clone()));
    }
    let model_config = LlamaConfig::from_file(&config.model_dir.join(CONFIG_FILE))?;
    model_config.model_kind()?;
    let plan = ShardPlan::new(&model_config, &config.ratio)?;

    if config.save_dir.exists() {
        if !config.force {
            info!(dir = %config.save_dir.display(), "split weights already present, skipping");
            return Ok(SplitOutcome::Skipped);
        }
        fs::remove_dir_all(&config.save_dir)?;
    }

    let tensors = read_checkpoint(&config.model_dir)?;
    let world_size = plan.world_size();
    let mut files = 0;

    for rank in 0..world_size {
        fs::create_dir_all(node_dir(&config.save_dir, rank))?;
    }

    let input = input_files(&tensors, world_size)?;
    files += write_block(&config.save_dir, BlockId::Input, input)?;

    for layer in 0..model_config.num_hidden_layers {
        let attn = attention_files(&tensors, &plan, layer)?;
        files += write_block(&config.save_dir, BlockId::Attention(layer), attn)?;
        let mlp = mlp_files(&tensors, &plan, layer)?;
        files += write_block(&config.save_dir, BlockId::Mlp(layer), mlp)?;
    }

    let output = output_files(&tensors, world_size)?;
    files += write_block(&config.save_dir, BlockId::Output, output)?;

    for rank in 0..world_size {
        let dir = node_dir(&config.save_dir, rank);
        plan.shard_info(rank).write(&dir)?;
        fs::copy(config.model_dir.join(CONFIG_FILE), dir.join(CONFIG_FILE))?;
    }

    info!(
        dir = %config.save_dir.display(),
        nodes = world_size,
        files,
        "split pretrained weights"
    );
    Ok(SplitOutcome::Written { files })
}

fn read_checkpoint(model_dir: &Path) -> Result<HashMap<String, Tensor>, SplitError> {
    let mut paths = fs::read_dir(model_dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    paths.retain(|p| p.extension().is_some_and(|ext| ext == "safetensors"));
    paths.sort();

    let mut tensors = HashMap::new();
    for path in paths {
        debug!(path = %path.display(), "reading checkpoint file");
        tensors.extend(Tensor::read_safetensors(&path)?);
    }
    Ok(tensors)
}

fn get<'a>(tensors: &'a HashMap<String, Tensor>, name: &str) -> Result<&'a Tensor, SplitError> {
    tensors
        .get(name)
        .ok_or_else(|| SplitError::MissingTensor(name.to_string()))
}

fn input_files(tensors: &HashMap<String, Tensor>, world_size: usize) -> Result<NodeFiles, SplitError> {
    let name = "model.embed_tokens.weight";
    let embed = get(tensors, name)?;
    let mut files: NodeFiles = (0..world_size).map(|_| Vec::new()).collect();
    files[0].push((name.to_string(), embed.shallow_clone()));
    Ok(files)
}

fn output_files(tensors: &HashMap<String, Tensor>, world_size: usize) -> Result<NodeFiles, SplitError> {
    let norm = get(tensors, "model.norm.weight")?;
    let lm_head = match tensors.get("lm_head.weight") {
        Some(lm_head) => lm_head,
        None => get(tensors, "model.embed_tokens.weight")?,
    };
    let mut files: NodeFiles = (0..world_size).map(|_| Vec::new()).collect();
    files[0].push(("model.norm.weight".to_string(), norm.shallow_clone()));
    files[0].push(("lm_head.weight".to_string(), lm_head.shallow_clone()));
    Ok(files)
}

fn attention_files(
    tensors: &HashMap<String, Tensor>,
    plan: &ShardPlan,
    layer: usize,
) -> Result<NodeFiles, SplitError> {
    let prefix = format!("model.layers.{layer}");
    let mut files = replicated(
        tensors,
        &format!("{prefix}.input_layernorm.weight"),
        plan.world_size(),
    )?;
    for (proj, rows) in [
        ("q_proj", plan.q_rows()),
        ("k_proj", plan.kv_rows()),
        ("v_proj", plan.kv_rows()),
    ] {
        let name = format!("{prefix}.self_attn.{proj}");
        column_parallel(tensors, &name, &rows, &mut files)?;
    }
    row_parallel(
        tensors,
        &format!("{prefix}.self_attn.o_proj"),
        &plan.q_rows(),
        &mut files,
    )?;
    Ok(files)
}

fn mlp_files(
    tensors: &HashMap<String, Tensor>,
    plan: &ShardPlan,
    layer: usize,
) -> Result<NodeFiles, SplitError> {
    let prefix = format!("model.layers.{layer}");
    let mut files = replicated(
        tensors,
        &format!("{prefix}.post_attention_layernorm.weight"),
        plan.world_size(),
    )?;
    let rows = plan.mlp_rows();
    for proj in ["gate_proj", "up_proj"] {
        column_parallel(tensors, &format!("{prefix}.mlp.{proj}"), &rows, &mut files)?;
    }
    row_parallel(tensors, &format!("{prefix}.mlp.down_proj"), &rows, &mut files)?;
    Ok(files)
}

fn replicated(
    tensors: &HashMap<String, Tensor>,
    name: &str,
    world_size: usize,
) -> Result<NodeFiles, SplitError> {
    let tensor = get(tensors, name)?;
    Ok((0..world_size)
        .map(|_| vec![(name.to_string(), tensor.shallow_clone())])
        .collect())
}

/// Output features are split: weight rows and bias entries.
fn column_parallel(
    tensors: &HashMap<String, Tensor>,
    name: &str,
    sizes: &[i64],
    files: &mut NodeFiles,
) -> Result<(), SplitError> {
    let weight_name = format!("{name}.weight");
    let pieces = get(tensors, &weight_name)?.f_split_with_sizes(sizes, 0)?;
    for (file, piece) in files.iter_mut().zip(pieces) {
        file.push((weight_name.clone(), piece));
    }
    let bias_name = format!("{name}.bias");
    if let Some(bias) = tensors.get(&bias_name) {
        for (file, piece) in files.iter_mut().zip(bias.f_split_with_sizes(sizes, 0)?) {
            file.push((bias_name.clone(), piece));
        }
    }
    Ok(())
}

/// Input features are split: weight columns. The bias is added once, on node 0;
/// every other node gets zeros so the all-reduced sum matches the full layer.
fn row_parallel(
    tensors: &HashMap<String, Tensor>,
    name: &str,
    sizes: &[i64],
    files: &mut NodeFiles,
) -> Result<(), SplitError> {
    let weight_name = format!("{name}.weight");
    let pieces = get(tensors, &weight_name)?.f_split_with_sizes(sizes, 1)?;
    for (file, piece) in files.iter_mut().zip(pieces) {
        file.push((weight_name.clone(), piece));
    }
    let bias_name = format!("{name}.bias");
    if let Some(bias) = tensors.get(&bias_name) {
        for (rank, file) in files.iter_mut().enumerate() {
            let piece = match rank {
                0 => bias.shallow_clone(),
                _ => bias.f_zeros_like()?,
            };
            file.push((bias_name.clone(), piece));
        }
    }
    Ok(())
}

fn write_block(save_dir: &Path, block: BlockId, files: NodeFiles) -> Result<usize, SplitError> {
    let mut written = 0;
    for (rank, tensors) in files.into_iter().enumerate() {
        let tensors = tensors
            .into_iter()
            .map(|(name, t)| Ok((name, t.f_contiguous()?)))
            .collect::<Result<Vec<_>, TchError>>()?;
        let path = node_dir(save_dir, rank).join(block.file_name());
        Tensor::write_safetensors(&tensors, &path)?;
        debug!(block = %block, rank, tensors = tensors.len(), "wrote shard file");
        written += 1;
    }
    Ok(written)
}

#[doc(hidden)]
pub fn random_checkpoint(config: &LlamaConfig, dir: &Path, seed: i64) -> Result<(), SplitError> {
    tch::manual_seed(seed);
    let opts = (Kind::Float, tch::Device::Cpu);
    let hidden = config.hidden_size as i64;
    let q = (config.num_attention_heads * config.head_dim()) as i64;
    let kv = (config.num_key_value_heads() * config.head_dim()) as i64;
    let inter = config.intermediate_size as i64;
    let vocab = config.vocab_size as i64;

    let mut tensors: Vec<(String, Tensor)> = vec![
        ("model.embed_tokens.weight".into(), Tensor::randn([vocab, hidden], opts)),
        ("model.norm.weight".into(), Tensor::rand([hidden], opts) + 0.5),
    ];
    if !config.tie_word_embeddings {
        tensors.push(("lm_head.weight".into(), Tensor::randn([vocab, hidden], opts) * 0.2));
    }
    for l in 0..config.num_hidden_layers {
        let p = format!("model.layers.{l}");
        let mut push = |name: String, shape: &[i64]| {
            tensors.push((name, Tensor::randn(shape, opts) * 0.2));
        };
        push(format!("{p}.self_attn.q_proj.weight"), &[q, hidden]);
        push(format!("{p}.self_attn.k_proj.weight"), &[kv, hidden]);
        push(format!("{p}.self_attn.v_proj.weight"), &[kv, hidden]);
        push(format!("{p}.self_attn.o_proj.weight"), &[hidden, q]);
        push(format!("{p}.mlp.gate_proj.weight"), &[inter, hidden]);
        push(format!("{p}.mlp.up_proj.weight"), &[inter, hidden]);
        push(format!("{p}.mlp.down_proj.weight"), &[hidden, inter]);
        if config.attention_bias.unwrap_or(false) {
            push(format!("{p}.self_attn.q_proj.bias"), &[q]);
            push(format!("{p}.self_attn.k_proj.bias"), &[kv]);
            push(format!("{p}.self_attn.v_proj.bias"), &[kv]);
            push(format!("{p}.self_attn.o_proj.bias"), &[hidden]);
        }
        tensors.push((format!("{p}.input_layernorm.weight"), Tensor::rand([hidden], opts) + 0.5));
        tensors.push((
            format!("{p}.post_attention_layernorm.weight"),
            Tensor::rand([hidden], opts) + 0.5,
        ));
    }

    fs::create_dir_all(dir)?;
    let (first, second) = tensors.split_at(tensors.len() / 2);
    Tensor::write_safetensors(first, dir.join("model-00001-of-00002.safetensors"))?;
    Tensor::write_safetensors(second, dir.join("model-00002-of-00002.safetensors"))?;
    let raw = serde_json::to_string_pretty(config).map_err(|source| SplitError::ShardInfo {
        path: dir.join(CONFIG_FILE),
        source,
    })?;
    fs::write(dir.join(CONFIG_FILE), raw)?;
    Ok(())
}
