use std::{path::Path, sync::Arc, thread};

use pretty_assertions::assert_eq;
use sluice_client::{generate, GenerationConfig, GenerationSummary, RootPrompt};
use sluice_modeling::{
    node_dir, random_checkpoint, split_pretrained_model, uniform_ratio, Collective, EosToks,
    ForwardPipeline, LlamaConfig, LocalGroup, PipelineOptions, SplitConfig,
};
use tch::{Device, Kind};
use tokenizers::Tokenizer;

fn word_tokenizer(vocab_size: usize) -> Tokenizer {
    let vocab: serde_json::Map<String, serde_json::Value> = (0..vocab_size)
        .map(|id| (format!("t{id}"), serde_json::Value::from(id)))
        .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "t0" }
    });
    Tokenizer::from_bytes(serde_json::to_vec(&json).unwrap()).unwrap()
}

fn generation(length: i64) -> GenerationConfig {
    GenerationConfig {
        prompt: None,
        prefix: String::new(),
        length,
        temperature: 0.0,
        top_k: None,
        top_p: None,
        seed: 7,
    }
}

fn split(model_dir: &Path, save_dir: &Path, world_size: usize) {
    split_pretrained_model(&SplitConfig {
        model_dir: model_dir.to_path_buf(),
        save_dir: save_dir.to_path_buf(),
        ratio: uniform_ratio(world_size),
        force: false,
    })
    .unwrap();
}

/// Runs generation on `world_size` threads and returns rank 0's summary and text.
fn run(
    split_dir: &Path,
    world_size: usize,
    length: i64,
    eos: Option<EosToks>,
) -> (GenerationSummary, String) {
    let config = LlamaConfig::dummy();
    let handles: Vec<_> = LocalGroup::new(world_size)
        .unwrap()
        .into_iter()
        .map(|group| {
            let rank = group.rank();
            let options = PipelineOptions {
                shard_dir: node_dir(split_dir, rank),
                memory_window: 3,
                kind: Kind::Float,
                device: Device::Cpu,
            };
            let eos = eos.clone();
            let max_position = config.max_position_embeddings;
            thread::spawn(move || {
                let comm: Arc<dyn Collective> = Arc::new(group);
                let mut pipeline = ForwardPipeline::load(&options, comm).unwrap();
                let mut root = (rank == 0)
                    .then(|| RootPrompt::new(word_tokenizer(32), "t1 t5 t7", eos).unwrap());
                let mut text = String::new();
                let summary = generate(
                    &mut pipeline,
                    root.as_mut(),
                    &generation(length),
                    max_position,
                    &mut |piece: &str| text.push_str(piece),
                )
                .unwrap();
                (rank, summary, text)
            })
        })
        .collect();

    let mut root = None;
    for handle in handles {
        let (rank, summary, text) = handle.join().unwrap();
        assert_eq!(summary.prompt_tokens, 3);
        match rank {
            0 => root = Some((summary, text)),
            _ => assert!(summary.tokens.is_empty()),
        }
    }
    root.unwrap()
}

#[test]
fn greedy_generation_is_the_same_on_one_or_two_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let model_dir = dir.path().join("model");
    random_checkpoint(&LlamaConfig::dummy(), &model_dir, 13).unwrap();
    split(&model_dir, &dir.path().join("split_1"), 1);
    split(&model_dir, &dir.path().join("split_2"), 2);

    let (single, single_text) = run(&dir.path().join("split_1"), 1, 4, None);
    let (parallel, parallel_text) = run(&dir.path().join("split_2"), 2, 4, None);
    assert_eq!(single.tokens.len(), 4);
    assert_eq!(parallel.tokens, single.tokens);
    assert_eq!(parallel_text, single_text);
    assert!(!single_text.is_empty());
    assert!(single.peak_resident_bytes > 0);
}

#[test]
fn every_rank_stops_on_end_of_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let model_dir = dir.path().join("model");
    random_checkpoint(&LlamaConfig::dummy(), &model_dir, 29).unwrap();
    let split_dir = dir.path().join("split");
    split(&model_dir, &split_dir, 2);

    let (free, _) = run(&split_dir, 2, 5, None);
    let first = free.tokens[0] as i64;
    let (stopped, _) = run(&split_dir, 2, 5, Some(EosToks::Single(first)));
    assert_eq!(stopped.tokens, vec![first as u32]);
}

#[test]
fn negative_length_is_bounded_by_the_context() {
    let dir = tempfile::tempdir().unwrap();
    let model_dir = dir.path().join("model");
    random_checkpoint(&LlamaConfig::dummy(), &model_dir, 31).unwrap();
    let split_dir = dir.path().join("split");
    split(&model_dir, &split_dir, 1);

    let (summary, _) = run(&split_dir, 1, -1, Some(EosToks::Multiple(vec![])));
    let max_position = LlamaConfig::dummy().max_position_embeddings;
    assert_eq!(summary.tokens.len(), max_position - 3);
}
