use std::io::Write;

use anyhow::{Context, Result};
use sluice_modeling::{
    render_series, Collective, EosToks, ForwardPipeline, LlamaConfig, LogitsProcessor, Sampling,
    TokenOutputStream,
};
use tch::Tensor;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::{adjust_length_to_model, GenerationConfig, NodeConfig};

/// What only rank 0 has: the tokenizer and the encoded prompt.
pub struct RootPrompt {
    pub ids: Vec<u32>,
    pub stream: TokenOutputStream,
    pub eos: Option<EosToks>,
}

impl RootPrompt {
    pub fn new(tokenizer: Tokenizer, text: &str, eos: Option<EosToks>) -> Result<Self> {
        let ids = tokenizer
            .encode(text, false)
            .map_err(anyhow::Error::msg)
            .context("failed to encode prompt")?
            .get_ids()
            .to_vec();
        Ok(Self {
            ids,
            stream: TokenOutputStream::new(tokenizer),
            eos,
        })
    }

    /// Loads the tokenizer next to the model and reads the prompt from the
    /// command line, or from stdin when none was given.
    pub fn load(config: &NodeConfig, model: &LlamaConfig) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(config.tokenizer_path())
            .map_err(anyhow::Error::msg)
            .with_context(|| {
                format!(
                    "failed to load tokenizer from {}",
                    config.tokenizer_path().display()
                )
            })?;
        let prompt = match &config.generation.prompt {
            Some(prompt) => prompt.clone(),
            None => read_prompt()?,
        };
        let text = format!("{}{}", config.generation.prefix, prompt);
        Self::new(tokenizer, &text, model.eos_token_id.clone())
    }
}

fn read_prompt() -> Result<String> {
    print!("User prompt >>> ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationSummary {
    pub prompt_tokens: usize,
    /// Sampled tokens. Empty on peers.
    pub tokens: Vec<u32>,
    pub peak_resident_bytes: u64,
}

/// Rank 0 publishes a value, everyone else receives it.
fn exchange(comm: &dyn Collective, value: u64) -> Result<u64> {
    let handle = match comm.rank() {
        0 => comm.send_scalar(value),
        _ => comm.request_scalar(),
    };
    Ok(handle.wait()?)
}

/// Autoregressive decoding across the group. Every rank calls this; rank 0
/// passes its prompt and gets the sampled text through `on_text`.
///
/// Rank 0 first shares the prompt length and the step budget. After each
/// step it publishes whether to continue, so peers stop together with it on
/// an end-of-sequence token.
pub fn generate(
    pipeline: &mut ForwardPipeline,
    mut root: Option<&mut RootPrompt>,
    generation: &GenerationConfig,
    max_position: usize,
    on_text: &mut dyn FnMut(&str),
) -> Result<GenerationSummary> {
    let comm = pipeline.comm().clone();
    let rank = comm.rank();

    let prompt_len = root.as_ref().map(|root| root.ids.len()).unwrap_or_default();
    let prompt_len = exchange(comm.as_ref(), prompt_len as u64)? as usize;
    let steps = match max_position {
        0 => adjust_length_to_model(generation.length, 0),
        max => adjust_length_to_model(generation.length, max).min(max.saturating_sub(prompt_len)),
    };
    let steps = exchange(comm.as_ref(), steps as u64)? as usize;
    info!(rank, prompt_len, steps, "starting generation");
    if prompt_len == 0 || steps == 0 {
        warn!(rank, prompt_len, steps, "nothing to generate");
        return Ok(GenerationSummary {
            prompt_tokens: prompt_len,
            ..Default::default()
        });
    }

    let mut processor = LogitsProcessor::from_sampling(
        generation.seed,
        Sampling::from_params(generation.temperature, generation.top_k, generation.top_p),
    );
    let mut input = root.as_ref().map(|root| {
        let ids: Vec<i64> = root.ids.iter().map(|&id| id as i64).collect();
        Tensor::from_slice(&ids).view([1, -1])
    });
    let mut tokens = Vec::new();

    for step in 0..steps {
        let logits = pipeline.forward(input.as_ref())?;
        let proceed = match (root.as_deref_mut(), logits) {
            (Some(root), Some(logits)) => {
                let token = processor.sample(&logits)?;
                tokens.push(token);
                if let Some(text) = root.stream.next_token(token).map_err(anyhow::Error::msg)? {
                    on_text(&text);
                }
                input = Some(Tensor::from_slice(&[token as i64]).view([1, 1]));
                let eos = root
                    .eos
                    .as_ref()
                    .is_some_and(|eos| eos.contains(token as i64));
                !eos && step + 1 < steps
            }
            _ => true,
        };
        if exchange(comm.as_ref(), proceed as u64)? == 0 {
            debug!(rank, step, "generation stopped");
            break;
        }
    }

    if let Some(root) = root {
        if let Some(rest) = root.stream.decode_rest().map_err(anyhow::Error::msg)? {
            on_text(&rest);
        }
    }

    let history = pipeline.memory_history()?;
    let (timestamps, megabytes) = render_series(&history);
    let peak_resident_bytes = history
        .iter()
        .map(|sample| sample.resident_bytes)
        .max()
        .unwrap_or_default();
    info!(
        rank,
        samples = history.len(),
        peak_mib = peak_resident_bytes / (1024 * 1024),
        "memory usage over the run"
    );
    debug!(rank, "memory timestamps: [{timestamps}]");
    debug!(rank, "memory MiB: [{megabytes}]");

    Ok(GenerationSummary {
        prompt_tokens: prompt_len,
        tokens,
        peak_resident_bytes,
    })
}
