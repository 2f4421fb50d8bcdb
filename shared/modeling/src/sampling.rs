use rand::{
    distr::{weighted::WeightedIndex, Distribution},
    rngs::StdRng,
    SeedableRng,
};
use tch::{Kind, TchError, Tensor};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Sampling {
    ArgMax,
    All { temperature: f64 },
    TopK { k: usize, temperature: f64 },
    TopP { p: f64, temperature: f64 },
    TopKThenTopP { k: usize, p: f64, temperature: f64 },
}

impl Sampling {
    /// Picks the strategy implied by the generation flags. A temperature of
    /// zero (or less) means greedy decoding.
    pub fn from_params(temperature: f64, top_k: Option<usize>, top_p: Option<f64>) -> Self {
        if temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        match (top_k, top_p) {
            (None, None) => Sampling::All { temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        }
    }
}

#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("logits are empty")]
    Empty,

    #[error("no token has a positive probability: {0}")]
    Weights(#[from] rand::distr::weighted::Error),

    #[error(transparent)]
    Tch(#[from] TchError),
}

/// Seeded next-token sampler over a 1-d logits tensor.
pub struct LogitsProcessor {
    rng: StdRng,
    sampling: Sampling,
}

impl LogitsProcessor {
    pub fn from_sampling(seed: u64, sampling: Sampling) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            sampling,
        }
    }

    pub fn sample(&mut self, logits: &Tensor) -> Result<u32, SamplingError> {
        let logits: Vec<f32> = Vec::<f32>::try_from(
            &logits.f_to_kind(Kind::Float)?.f_flatten(0, -1)?,
        )?;
        if logits.is_empty() {
            return Err(SamplingError::Empty);
        }
        match self.sampling.clone() {
            Sampling::ArgMax => Ok(argmax(&logits)),
            Sampling::All { temperature } => {
                let probs = softmax(&logits, temperature);
                self.sample_multinomial(&probs)
            }
            Sampling::TopK { k, temperature } => {
                let mut probs = softmax(&logits, temperature);
                keep_top_k(&mut probs, k);
                self.sample_multinomial(&probs)
            }
            Sampling::TopP { p, temperature } => {
                let mut probs = softmax(&logits, temperature);
                keep_top_p(&mut probs, p);
                self.sample_multinomial(&probs)
            }
            Sampling::TopKThenTopP { k, p, temperature } => {
                let mut probs = softmax(&logits, temperature);
                keep_top_k(&mut probs, k);
                keep_top_p(&mut probs, p);
                self.sample_multinomial(&probs)
            }
        }
    }

    fn sample_multinomial(&mut self, probs: &[f32]) -> Result<u32, SamplingError> {
        let distr = WeightedIndex::new(probs)?;
        Ok(distr.sample(&mut self.rng) as u32)
    }
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    for (i, v) in logits.iter().enumerate() {
        if *v > logits[best] {
            best = i;
        }
    }
    best as u32
}

fn softmax(logits: &[f32], temperature: f64) -> Vec<f32> {
    let temperature = temperature as f32;
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = logits
        .iter()
        .map(|v| ((v - max) / temperature).exp())
        .collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|v| v / sum).collect()
}

/// Indices sorted by descending probability.
fn ranked(probs: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|a, b| probs[*b].total_cmp(&probs[*a]));
    order
}

fn keep_top_k(probs: &mut [f32], k: usize) {
    if k >= probs.len() {
        return;
    }
    for i in ranked(probs).into_iter().skip(k.max(1)) {
        probs[i] = 0.0;
    }
}

/// Zeroes every token outside the smallest set whose mass reaches `p`.
fn keep_top_p(probs: &mut [f32], p: f64) {
    if p <= 0.0 || p >= 1.0 {
        return;
    }
    let total: f32 = probs.iter().sum();
    let threshold = p as f32 * total;
    let mut cumulative = 0.0;
    let mut cut = false;
    for i in ranked(probs) {
        if cut {
            probs[i] = 0.0;
            continue;
        }
        cumulative += probs[i];
        if cumulative >= threshold {
            cut = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn logits() -> Tensor {
        Tensor::from_slice(&[0.1f32, 3.0, 0.2, 2.9, -1.0])
    }

    #[test]
    fn argmax_is_greedy() {
        let mut processor = LogitsProcessor::from_sampling(0, Sampling::ArgMax);
        assert_eq!(processor.sample(&logits()).unwrap(), 1);
    }

    #[test]
    fn zero_temperature_falls_back_to_argmax() {
        assert_eq!(Sampling::from_params(0.0, Some(5), Some(0.9)), Sampling::ArgMax);
        assert_eq!(
            Sampling::from_params(0.7, Some(5), None),
            Sampling::TopK {
                k: 5,
                temperature: 0.7
            }
        );
    }

    #[test]
    fn top_k_only_returns_the_best_tokens() {
        let mut processor = LogitsProcessor::from_sampling(
            42,
            Sampling::TopK {
                k: 2,
                temperature: 1.0,
            },
        );
        for _ in 0..50 {
            let token = processor.sample(&logits()).unwrap();
            assert!(token == 1 || token == 3, "sampled {token}");
        }
    }

    #[test]
    fn top_p_cuts_the_tail() {
        let mut probs = vec![0.5, 0.3, 0.15, 0.05];
        keep_top_p(&mut probs, 0.75);
        assert_eq!(probs, vec![0.5, 0.3, 0.0, 0.0]);
    }

    #[test]
    fn same_seed_same_tokens() {
        let sampling = Sampling::All { temperature: 1.5 };
        let mut a = LogitsProcessor::from_sampling(7, sampling.clone());
        let mut b = LogitsProcessor::from_sampling(7, sampling);
        let xs: Vec<u32> = (0..20).map(|_| a.sample(&logits()).unwrap()).collect();
        let ys: Vec<u32> = (0..20).map(|_| b.sample(&logits()).unwrap()).collect();
        assert_eq!(xs, ys);
    }
}
