use std::path::Path;

use tch::{nn::Module, Device, Kind, Tensor};

use crate::{
    default_rope, ArenaBuilder, ArenaError, AttentionBlock, AttentionDims, BlockId,
    BlockSequence, ColumnParallelLinear, EosToks, ModelKind, ModelLoadError, RMSNorm, RoPECache,
    RoPEConfig, RowParallelLinear, ShardInfo,
};

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LlamaConfig {
    #[serde(default)]
    pub model_type: Option<String>,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    /// Defaults to `hidden_size / num_attention_heads`.
    #[serde(default)]
    pub head_dim: Option<usize>,
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope")]
    pub rope_theta: f32,
    pub bos_token_id: Option<i64>,
    pub eos_token_id: Option<EosToks>,
    pub rope_scaling: Option<RoPEConfig>,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    pub attention_bias: Option<bool>,
    pub mlp_bias: Option<bool>,
}

impl LlamaConfig {
    pub fn from_file(path: &Path) -> Result<Self, ModelLoadError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ModelLoadError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ModelLoadError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Model family named by `model_type`. Configs without one are treated as llama.
    pub fn model_kind(&self) -> Result<ModelKind, ModelLoadError> {
        self.model_type
            .as_deref()
            .unwrap_or("llama")
            .parse::<ModelKind>()
    }

    pub fn num_key_value_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    pub fn dummy() -> Self {
        Self {
            model_type: Some("llama".to_string()),
            hidden_size: 16,
            intermediate_size: 32,
            vocab_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            head_dim: None,
            rms_norm_eps: 0.00001,
            rope_theta: 10000.0,
            bos_token_id: Some(1),
            eos_token_id: Some(EosToks::Single(2)),
            rope_scaling: None,
            max_position_embeddings: 64,
            tie_word_embeddings: false,
            attention_bias: None,
            mlp_bias: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MlpDims {
    pub hidden_size: i64,
    pub local_intermediate_size: i64,
    pub bias: bool,
    pub rms_norm_eps: f64,
}

/// Post-attention norm plus a SwiGLU feed-forward over this rank's slice of
/// the intermediate dimension.
#[derive(Debug)]
pub struct MlpBlock {
    layer: usize,
    post_attention_layernorm: RMSNorm,
    gate_proj: ColumnParallelLinear,
    up_proj: ColumnParallelLinear,
    down_proj: RowParallelLinear,
    parameter_names: Vec<String>,
}

impl MlpBlock {
    pub fn declare(
        builder: &mut ArenaBuilder,
        layer: usize,
        dims: &MlpDims,
    ) -> Result<Self, ArenaError> {
        let prefix = format!("model.layers.{layer}");
        let mut parameter_names = Vec::new();
        let mut declare = |name: String, shape: &[i64]| {
            parameter_names.push(name.clone());
            builder.declare(name, shape)
        };

        let norm_weight = declare(
            format!("{prefix}.post_attention_layernorm.weight"),
            &[dims.hidden_size],
        )?;
        let mut projection = |proj: &str, out: i64, inp: i64| {
            let weight = declare(format!("{prefix}.mlp.{proj}.weight"), &[out, inp])?;
            let bias = match dims.bias {
                true => Some(declare(format!("{prefix}.mlp.{proj}.bias"), &[out])?),
                false => None,
            };
            Ok::<_, ArenaError>((weight, bias))
        };
        let (gate_w, gate_b) =
            projection("gate_proj", dims.local_intermediate_size, dims.hidden_size)?;
        let (up_w, up_b) = projection("up_proj", dims.local_intermediate_size, dims.hidden_size)?;
        let (down_w, down_b) =
            projection("down_proj", dims.hidden_size, dims.local_intermediate_size)?;

        Ok(Self {
            layer,
            post_attention_layernorm: RMSNorm::new(norm_weight, dims.rms_norm_eps),
            gate_proj: ColumnParallelLinear::new(gate_w, gate_b),
            up_proj: ColumnParallelLinear::new(up_w, up_b),
            down_proj: RowParallelLinear::new(down_w, down_b),
            parameter_names,
        })
    }

    pub fn block(&self) -> BlockId {
        BlockId::Mlp(self.layer)
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    /// Partial sum of the MLP output; still has to be all-reduced.
    pub fn forward(&self, xs: &Tensor) -> Tensor {
        let h = self.post_attention_layernorm.forward(xs);
        let gated = self.gate_proj.forward(&h).silu() * self.up_proj.forward(&h);
        self.down_proj.forward(&gated)
    }
}

#[derive(Debug)]
pub struct Embedding {
    weight: Tensor,
}

impl Embedding {
    pub fn declare(builder: &mut ArenaBuilder, config: &LlamaConfig) -> Result<Self, ArenaError> {
        let weight = builder.declare(
            "model.embed_tokens.weight",
            &[config.vocab_size as i64, config.hidden_size as i64],
        )?;
        Ok(Self { weight })
    }

    pub fn forward(&self, input_ids: &Tensor) -> Tensor {
        Tensor::embedding(&self.weight, input_ids, -1, false, false)
    }
}

#[derive(Debug)]
pub struct OutputHead {
    norm: RMSNorm,
    lm_head: Tensor,
}

impl OutputHead {
    pub fn declare(builder: &mut ArenaBuilder, config: &LlamaConfig) -> Result<Self, ArenaError> {
        let hidden = config.hidden_size as i64;
        let norm = builder.declare("model.norm.weight", &[hidden])?;
        let lm_head = builder.declare("lm_head.weight", &[config.vocab_size as i64, hidden])?;
        Ok(Self {
            norm: RMSNorm::new(norm, config.rms_norm_eps),
            lm_head,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        self.norm.forward(xs).linear::<Tensor>(&self.lm_head, None)
    }
}

#[derive(Debug)]
pub struct DecoderLayer {
    pub attention: AttentionBlock,
    pub mlp: MlpBlock,
}

/// One rank's slice of a Llama model.
///
/// Every parameter is declared in the arena at construction time and starts
/// out non-resident; the memory window scheduler fills and empties them as the
/// forward pass moves through the blocks. Only rank 0 owns the embedding and
/// the output head.
#[derive(Debug)]
pub struct Llama {
    config: LlamaConfig,
    rank: usize,
    sequence: BlockSequence,
    embedding: Option<Embedding>,
    layers: Vec<DecoderLayer>,
    head: Option<OutputHead>,
    rope: RoPECache,
}

impl Llama {
    pub fn declare(
        config: &LlamaConfig,
        shard: &ShardInfo,
        builder: &mut ArenaBuilder,
    ) -> Result<Self, ModelLoadError> {
        config.model_kind()?;
        let head_dim = config.head_dim();
        if shard.head_dim != head_dim {
            return Err(ModelLoadError::ShardShape {
                what: "head dim",
                local: shard.head_dim,
                total: head_dim,
            });
        }
        if shard.num_kv_heads == 0 || shard.num_kv_heads > config.num_key_value_heads() {
            return Err(ModelLoadError::ShardShape {
                what: "key/value heads",
                local: shard.num_kv_heads,
                total: config.num_key_value_heads(),
            });
        }
        if shard.num_heads > config.num_attention_heads
            || shard.num_heads % shard.num_kv_heads != 0
        {
            return Err(ModelLoadError::ShardShape {
                what: "attention heads",
                local: shard.num_heads,
                total: config.num_attention_heads,
            });
        }
        if shard.intermediate_size > config.intermediate_size {
            return Err(ModelLoadError::ShardShape {
                what: "intermediate features",
                local: shard.intermediate_size,
                total: config.intermediate_size,
            });
        }

        let embedding = match shard.rank {
            0 => Some(Embedding::declare(builder, config)?),
            _ => None,
        };
        let attention = AttentionDims {
            hidden_size: config.hidden_size as i64,
            local_heads: shard.num_heads as i64,
            local_kv_heads: shard.num_kv_heads as i64,
            head_dim: head_dim as i64,
            bias: config.attention_bias.unwrap_or(false),
            rms_norm_eps: config.rms_norm_eps,
        };
        let mlp = MlpDims {
            hidden_size: config.hidden_size as i64,
            local_intermediate_size: shard.intermediate_size as i64,
            bias: config.mlp_bias.unwrap_or(false),
            rms_norm_eps: config.rms_norm_eps,
        };
        let layers = (0..config.num_hidden_layers)
            .map(|layer| {
                Ok(DecoderLayer {
                    attention: AttentionBlock::declare(builder, layer, &attention)?,
                    mlp: MlpBlock::declare(builder, layer, &mlp)?,
                })
            })
            .collect::<Result<Vec<_>, ArenaError>>()?;
        let head = match shard.rank {
            0 => Some(OutputHead::declare(builder, config)?),
            _ => None,
        };
        let rope = RoPECache::new(
            &config.rope_scaling,
            head_dim,
            config.rope_theta,
            builder.device(),
        );

        Ok(Self {
            config: config.clone(),
            rank: shard.rank,
            sequence: BlockSequence::new(config.num_hidden_layers),
            embedding,
            layers,
            head,
            rope,
        })
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn sequence(&self) -> &BlockSequence {
        &self.sequence
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn embedding(&self) -> Option<&Embedding> {
        self.embedding.as_ref()
    }

    pub fn layer(&self, layer: usize) -> Option<&DecoderLayer> {
        self.layers.get(layer)
    }

    pub fn head(&self) -> Option<&OutputHead> {
        self.head.as_ref()
    }

    /// Rotary tables for `position_ids` of shape `[batch, seq_len]`.
    pub fn rotary(&self, position_ids: &Tensor, kind: Kind) -> (Tensor, Tensor) {
        self.rope.cos_sin(position_ids, kind)
    }

    pub fn device(&self) -> Device {
        self.rope.inv_freq.device()
    }
}
