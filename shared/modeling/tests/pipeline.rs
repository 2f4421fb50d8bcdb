use std::{path::Path, sync::Arc, thread};

use pretty_assertions::assert_eq;
use sluice_modeling::{
    node_dir, random_checkpoint, split_pretrained_model, uniform_ratio, Collective,
    ForwardPipeline, LlamaConfig, LocalGroup, PipelineOptions, SplitConfig, SplitOutcome,
};
use tch::{Device, Kind, Tensor};

fn split(model_dir: &Path, save_dir: &Path, world_size: usize) {
    let outcome = split_pretrained_model(&SplitConfig {
        model_dir: model_dir.to_path_buf(),
        save_dir: save_dir.to_path_buf(),
        ratio: uniform_ratio(world_size),
        force: false,
    })
    .unwrap();
    assert!(matches!(outcome, SplitOutcome::Written { .. }));
}

/// Runs prefill on `prompt` followed by one decode step of `next` across
/// `world_size` in-process ranks and returns rank 0's logits for both passes.
fn run(split_dir: &Path, world_size: usize, window: usize) -> (Tensor, Tensor) {
    let groups = LocalGroup::new(world_size).unwrap();
    let handles = groups
        .into_iter()
        .map(|group| {
            let rank = group.rank();
            let options = PipelineOptions {
                shard_dir: node_dir(split_dir, rank),
                memory_window: window,
                kind: Kind::Float,
                device: Device::Cpu,
            };
            thread::spawn(move || {
                let comm: Arc<dyn Collective> = Arc::new(group);
                let mut pipeline = ForwardPipeline::load(&options, comm).unwrap();
                let prompt = Tensor::from_slice(&[1i64, 5, 7, 3, 11]).view([1, -1]);
                let next = Tensor::from_slice(&[9i64]).view([1, 1]);
                let (prompt, next) = match rank {
                    0 => (Some(prompt), Some(next)),
                    _ => (None, None),
                };

                let prefill = pipeline.forward(prompt.as_ref()).unwrap();
                assert!(pipeline.streamer().resident_blocks().unwrap().len() <= window);
                assert_eq!(pipeline.past_len(), 5);
                let decode = pipeline.forward(next.as_ref()).unwrap();
                assert!(pipeline.streamer().resident_blocks().unwrap().len() <= window);
                assert_eq!(pipeline.past_len(), 6);

                let history = pipeline.memory_history().unwrap();
                assert!(history.len() > 2 * pipeline.model().sequence().len());
                match rank {
                    0 => Some((prefill.unwrap(), decode.unwrap())),
                    _ => {
                        assert!(prefill.is_none() && decode.is_none());
                        None
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    let mut root = None;
    for handle in handles {
        if let Some(logits) = handle.join().unwrap() {
            root = Some(logits);
        }
    }
    root.unwrap()
}

#[test]
fn tensor_parallel_matches_single_node() {
    let dir = tempfile::tempdir().unwrap();
    let config = LlamaConfig::dummy();
    let model_dir = dir.path().join("model");
    random_checkpoint(&config, &model_dir, 17).unwrap();
    split(&model_dir, &dir.path().join("split_1"), 1);
    split(&model_dir, &dir.path().join("split_2"), 2);

    let (single_prefill, single_decode) = run(&dir.path().join("split_1"), 1, 2);
    let (tp_prefill, tp_decode) = run(&dir.path().join("split_2"), 2, 2);

    assert_eq!(single_prefill.size(), vec![1, config.vocab_size as i64]);
    assert!(tp_prefill.allclose(&single_prefill, 1e-4, 1e-5, false));
    assert!(tp_decode.allclose(&single_decode, 1e-4, 1e-5, false));
}

#[test]
fn window_size_does_not_change_results() {
    let dir = tempfile::tempdir().unwrap();
    let config = LlamaConfig::dummy();
    let model_dir = dir.path().join("model");
    random_checkpoint(&config, &model_dir, 3).unwrap();
    let split_dir = dir.path().join("split");
    split(&model_dir, &split_dir, 2);

    let (narrow_prefill, narrow_decode) = run(&split_dir, 2, 2);
    let (wide_prefill, wide_decode) = run(&split_dir, 2, 5);
    assert!(narrow_prefill.equal(&wide_prefill));
    assert!(narrow_decode.equal(&wide_decode));
}

#[test]
fn shard_for_another_rank_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let model_dir = dir.path().join("model");
    random_checkpoint(&LlamaConfig::dummy(), &model_dir, 5).unwrap();
    let split_dir = dir.path().join("split");
    split(&model_dir, &split_dir, 2);

    let comm: Arc<dyn Collective> = Arc::new(LocalGroup::new(1).unwrap().remove(0));
    let options = PipelineOptions {
        shard_dir: node_dir(&split_dir, 1),
        memory_window: 2,
        kind: Kind::Float,
        device: Device::Cpu,
    };
    assert!(matches!(
        ForwardPipeline::load(&options, comm),
        Err(sluice_modeling::PipelineLoadError::RankMismatch { found: 1, .. })
    ));
}
