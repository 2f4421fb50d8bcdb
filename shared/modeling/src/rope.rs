use std::f32::consts::PI;

use tch::{Device, Kind, Tensor};

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, Default, PartialEq)]
pub enum RoPEType {
    #[serde(rename = "llama3")]
    Llama3,
    #[default]
    #[serde(rename = "default")]
    Default,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, Default)]
pub struct RoPEConfig {
    pub factor: Option<f32>,
    pub low_freq_factor: Option<f32>,
    pub high_freq_factor: Option<f32>,
    pub original_max_position_embeddings: Option<usize>,
    #[serde(alias = "type")]
    pub rope_type: RoPEType,
}

pub fn default_rope() -> f32 {
    10_000.0
}

fn calculate_default_inv_freq(head_dim: usize, rope_theta: f32) -> Vec<f32> {
    (0..head_dim)
        .step_by(2)
        .map(|i| 1f32 / rope_theta.powf(i as f32 / head_dim as f32))
        .collect()
}

fn llama3_inv_freq(config: &RoPEConfig, inv_freq: Vec<f32>) -> Vec<f32> {
    let original_max_position_embeddings =
        config.original_max_position_embeddings.unwrap_or(8192) as f32;
    let factor = config.factor.unwrap_or(8.0);
    let low_freq_factor = config.low_freq_factor.unwrap_or(1.0);
    let high_freq_factor = config.high_freq_factor.unwrap_or(4.0);
    let low_freq_wavelen = original_max_position_embeddings / low_freq_factor;
    let high_freq_wavelen = original_max_position_embeddings / high_freq_factor;

    inv_freq
        .into_iter()
        .map(|freq| {
            let wavelen = 2. * PI / freq;
            if wavelen < high_freq_wavelen {
                freq
            } else if wavelen > low_freq_wavelen {
                freq / factor
            } else {
                let smooth = (original_max_position_embeddings / wavelen - low_freq_factor)
                    / (high_freq_factor - low_freq_factor);
                (1. - smooth) * freq / factor + smooth * freq
            }
        })
        .collect()
}

/// Inverse frequencies for rotary position embeddings.
///
/// Only the coordinating rank evaluates them; the resulting cos/sin tables are
/// shipped to the other ranks with the rest of the forward inputs.
#[derive(Debug)]
pub struct RoPECache {
    pub inv_freq: Tensor,
}

impl RoPECache {
    pub fn new(
        rope_config: &Option<RoPEConfig>,
        head_dim: usize,
        rope_theta: f32,
        device: Device,
    ) -> Self {
        let inv_freq = calculate_default_inv_freq(head_dim, rope_theta);
        let inv_freq = match rope_config {
            Some(config @ RoPEConfig {
                rope_type: RoPEType::Llama3,
                ..
            }) => llama3_inv_freq(config, inv_freq),
            _ => inv_freq,
        };
        Self {
            inv_freq: Tensor::from_slice(&inv_freq).to(device),
        }
    }

    /// cos/sin tables of shape `[batch, seq_len, head_dim]` for `position_ids`
    /// of shape `[batch, seq_len]`.
    pub fn cos_sin(&self, position_ids: &Tensor, kind: Kind) -> (Tensor, Tensor) {
        let inv_freq = self
            .inv_freq
            .to_kind(Kind::Float)
            .to_device(position_ids.device())
            .view([1, 1, -1]);
        let freqs = position_ids.to_kind(Kind::Float).unsqueeze(-1) * inv_freq;
        let emb = Tensor::cat(&[&freqs, &freqs], -1);
        (emb.cos().to_kind(kind), emb.sin().to_kind(kind))
    }
}

pub fn rotate_half(xs: &Tensor) -> Tensor {
    let last_dim = xs.size().last().copied().unwrap_or_default();
    let xs1 = xs.narrow(-1, 0, last_dim / 2);
    let xs2 = xs.narrow(-1, last_dim / 2, last_dim - last_dim / 2);
    Tensor::cat(&[&xs2.neg(), &xs1], -1)
}

/// Rotates `xs` of shape `[batch, heads, seq_len, head_dim]`.
pub fn apply_rotary_emb(xs: &Tensor, cos: &Tensor, sin: &Tensor) -> Tensor {
    let cos = cos.unsqueeze(1);
    let sin = sin.unsqueeze(1);
    xs * cos + rotate_half(xs) * sin
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_zero_is_identity() {
        let cache = RoPECache::new(&None, 8, default_rope(), Device::Cpu);
        let positions = Tensor::zeros([1, 1], (Kind::Int64, Device::Cpu));
        let (cos, sin) = cache.cos_sin(&positions, Kind::Float);
        assert_eq!(cos.size(), vec![1, 1, 8]);
        let xs = Tensor::randn([1, 2, 1, 8], (Kind::Float, Device::Cpu));
        let rotated = apply_rotary_emb(&xs, &cos, &sin);
        assert!(rotated.allclose(&xs, 1e-6, 1e-6, false));
    }

    #[test]
    fn rotation_preserves_norm() {
        let cache = RoPECache::new(&None, 16, default_rope(), Device::Cpu);
        let positions = Tensor::arange(5, (Kind::Int64, Device::Cpu)).unsqueeze(0);
        let (cos, sin) = cache.cos_sin(&positions, Kind::Float);
        let xs = Tensor::randn([1, 3, 5, 16], (Kind::Float, Device::Cpu));
        let rotated = apply_rotary_emb(&xs, &cos, &sin);
        let before = (&xs * &xs).sum_dim_intlist(-1, false, Kind::Float);
        let after = (&rotated * &rotated).sum_dim_intlist(-1, false, Kind::Float);
        assert!(before.allclose(&after, 1e-4, 1e-5, false));
    }

    #[test]
    fn llama3_scaling_slows_low_frequencies() {
        let config = RoPEConfig {
            factor: Some(8.0),
            low_freq_factor: Some(1.0),
            high_freq_factor: Some(4.0),
            original_max_position_embeddings: Some(8192),
            rope_type: RoPEType::Llama3,
        };
        let plain = RoPECache::new(&None, 128, 500_000.0, Device::Cpu);
        let scaled = RoPECache::new(&Some(config), 128, 500_000.0, Device::Cpu);
        let plain = Vec::<f32>::try_from(&plain.inv_freq).unwrap();
        let scaled = Vec::<f32>::try_from(&scaled.inv_freq).unwrap();
        assert_eq!(plain[0], scaled[0]);
        assert!((plain[63] / scaled[63] - 8.0).abs() < 1e-3);
    }
}
