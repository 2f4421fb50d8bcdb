use tch::{nn::Module, Tensor};

use crate::{
    apply_rotary_emb, ArenaBuilder, ArenaError, BlockId, ColumnParallelLinear, RMSNorm,
    RowParallelLinear,
};

pub fn repeat_kv(hidden_states: &Tensor, n_rep: i64) -> Tensor {
    if n_rep == 1 {
        return hidden_states.shallow_clone();
    }
    let size = hidden_states.size();
    let (batch, num_key_value_heads, slen, head_dim) = (size[0], size[1], size[2], size[3]);

    let hidden_states = hidden_states
        .unsqueeze(2)
        .expand([batch, num_key_value_heads, n_rep, slen, head_dim], false);

    hidden_states.reshape([batch, num_key_value_heads * n_rep, slen, head_dim])
}

/// Per-rank key/value cache. Holds only this rank's key/value heads.
#[derive(Debug)]
pub struct KvCache {
    layers: Vec<Option<(Tensor, Tensor)>>,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| None).collect(),
        }
    }

    /// Number of positions already cached.
    pub fn past_len(&self) -> i64 {
        match self.layers.first() {
            Some(Some((k, _))) => k.size()[2],
            _ => 0,
        }
    }

    /// Appends new keys/values for `layer` along the sequence dimension and
    /// returns the full cached tensors.
    pub fn append(&mut self, layer: usize, k: Tensor, v: Tensor) -> (Tensor, Tensor) {
        let (k, v) = match self.layers[layer].take() {
            Some((past_k, past_v)) => (
                Tensor::cat(&[&past_k, &k], 2),
                Tensor::cat(&[&past_v, &v], 2),
            ),
            None => (k, v),
        };
        self.layers[layer] = Some((k.shallow_clone(), v.shallow_clone()));
        (k, v)
    }

    pub fn clear(&mut self) {
        for layer in self.layers.iter_mut() {
            *layer = None;
        }
    }
}

/// Shapes of this rank's slice of an attention block.
#[derive(Debug, Clone, Copy)]
pub struct AttentionDims {
    pub hidden_size: i64,
    pub local_heads: i64,
    pub local_kv_heads: i64,
    pub head_dim: i64,
    pub bias: bool,
    pub rms_norm_eps: f64,
}

/// Input norm plus self-attention over this rank's heads. The output is a
/// partial sum that still has to be all-reduced across ranks.
#[derive(Debug)]
pub struct AttentionBlock {
    layer: usize,
    input_layernorm: RMSNorm,
    q_proj: ColumnParallelLinear,
    k_proj: ColumnParallelLinear,
    v_proj: ColumnParallelLinear,
    o_proj: RowParallelLinear,
    local_heads: i64,
    local_kv_heads: i64,
    head_dim: i64,
    parameter_names: Vec<String>,
}

impl AttentionBlock {
    pub fn declare(
        builder: &mut ArenaBuilder,
        layer: usize,
        dims: &AttentionDims,
    ) -> Result<Self, ArenaError> {
        let prefix = format!("model.layers.{layer}");
        let size_q = dims.local_heads * dims.head_dim;
        let size_kv = dims.local_kv_heads * dims.head_dim;
        let mut parameter_names = Vec::new();
        let mut declare = |name: String, shape: &[i64]| {
            parameter_names.push(name.clone());
            builder.declare(name, shape)
        };

        let norm_weight = declare(
            format!("{prefix}.input_layernorm.weight"),
            &[dims.hidden_size],
        )?;
        let mut projection = |proj: &str, out: i64, inp: i64, bias_len: i64| {
            let weight = declare(format!("{prefix}.self_attn.{proj}.weight"), &[out, inp])?;
            let bias = match dims.bias {
                true => Some(declare(
                    format!("{prefix}.self_attn.{proj}.bias"),
                    &[bias_len],
                )?),
                false => None,
            };
            Ok::<_, ArenaError>((weight, bias))
        };
        let (q_w, q_b) = projection("q_proj", size_q, dims.hidden_size, size_q)?;
        let (k_w, k_b) = projection("k_proj", size_kv, dims.hidden_size, size_kv)?;
        let (v_w, v_b) = projection("v_proj", size_kv, dims.hidden_size, size_kv)?;
        let (o_w, o_b) = projection("o_proj", dims.hidden_size, size_q, dims.hidden_size)?;

        Ok(Self {
            layer,
            input_layernorm: RMSNorm::new(norm_weight, dims.rms_norm_eps),
            q_proj: ColumnParallelLinear::new(q_w, q_b),
            k_proj: ColumnParallelLinear::new(k_w, k_b),
            v_proj: ColumnParallelLinear::new(v_w, v_b),
            o_proj: RowParallelLinear::new(o_w, o_b),
            local_heads: dims.local_heads,
            local_kv_heads: dims.local_kv_heads,
            head_dim: dims.head_dim,
            parameter_names,
        })
    }

    pub fn block(&self) -> BlockId {
        BlockId::Attention(self.layer)
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    /// `xs` is `[batch, seq_len, hidden]`; `cos`/`sin` are `[batch, seq_len,
    /// head_dim]`; `mask`, when present, is a boolean `[1, 1, seq_len,
    /// past + seq_len]` tensor that is true where attention is allowed.
    pub fn forward(
        &self,
        xs: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: Option<&Tensor>,
        cache: &mut KvCache,
    ) -> Tensor {
        let size = xs.size();
        let (b, t) = (size[0], size[1]);
        let kind = xs.kind();

        let h = self.input_layernorm.forward(xs);
        let q = self
            .q_proj
            .forward(&h)
            .reshape([b, t, self.local_heads, self.head_dim])
            .transpose(1, 2);
        let k = self
            .k_proj
            .forward(&h)
            .reshape([b, t, self.local_kv_heads, self.head_dim])
            .transpose(1, 2);
        let v = self
            .v_proj
            .forward(&h)
            .reshape([b, t, self.local_kv_heads, self.head_dim])
            .transpose(1, 2);

        let q = apply_rotary_emb(&q, cos, sin).to_kind(kind);
        let k = apply_rotary_emb(&k, cos, sin).to_kind(kind);
        let (k, v) = cache.append(self.layer, k, v);

        let n_rep = self.local_heads / self.local_kv_heads;
        let k = repeat_kv(&k, n_rep);
        let v = repeat_kv(&v, n_rep);

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let y = Tensor::scaled_dot_product_attention(
            &q,
            &k,
            &v,
            mask,
            0.0,
            false,
            Some(scale),
            false,
        );
        let y = y
            .transpose(1, 2)
            .contiguous()
            .reshape([b, t, self.local_heads * self.head_dim]);
        self.o_proj.forward(&y)
    }
}
