use std::{collections::HashMap, path::Path};

use pretty_assertions::assert_eq;
use sluice_modeling::{
    node_dir, random_checkpoint, split_pretrained_model, ArenaBuilder, BlockId, BlockSequence,
    Llama, LlamaConfig, MemoryWindowScheduler, ShardInfo, ShardManifest, SplitConfig, SplitError,
    SplitOutcome, StreamingError, WeightStreamer,
};
use tch::{Device, Kind, Tensor};

fn read_all(path: &Path) -> HashMap<String, Tensor> {
    Tensor::read_safetensors(path).unwrap().into_iter().collect()
}

fn checkpoint(dir: &Path) -> HashMap<String, Tensor> {
    let mut tensors = HashMap::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|ext| ext == "safetensors") {
            tensors.extend(read_all(&path));
        }
    }
    tensors
}

fn split_config(model_dir: &Path, save_dir: &Path, ratio: Vec<f64>, force: bool) -> SplitConfig {
    SplitConfig {
        model_dir: model_dir.to_path_buf(),
        save_dir: save_dir.to_path_buf(),
        ratio,
        force,
    }
}

#[test]
fn split_pieces_reassemble_to_the_source() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = LlamaConfig::dummy();
    config.attention_bias = Some(true);
    let model_dir = dir.path().join("model");
    let save_dir = dir.path().join("split");
    random_checkpoint(&config, &model_dir, 11).unwrap();

    let outcome = split_pretrained_model(&split_config(&model_dir, &save_dir, vec![0.5, 0.5], false))
        .unwrap();
    assert_eq!(outcome, SplitOutcome::Written { files: 2 * (2 + 2 * 2) });

    let source = checkpoint(&model_dir);
    let nodes: Vec<_> = (0..2).map(|rank| node_dir(&save_dir, rank)).collect();
    for layer in 0..config.num_hidden_layers {
        let attn: Vec<_> = nodes
            .iter()
            .map(|dir| read_all(&dir.join(BlockId::Attention(layer).file_name())))
            .collect();
        let mlp: Vec<_> = nodes
            .iter()
            .map(|dir| read_all(&dir.join(BlockId::Mlp(layer).file_name())))
            .collect();

        let concat = |files: &[HashMap<String, Tensor>], name: &str, dim: i64| {
            let pieces: Vec<&Tensor> = files.iter().map(|f| &f[name]).collect();
            Tensor::cat(&pieces, dim)
        };
        let p = format!("model.layers.{layer}");
        for (name, dim) in [
            (format!("{p}.self_attn.q_proj.weight"), 0),
            (format!("{p}.self_attn.k_proj.weight"), 0),
            (format!("{p}.self_attn.v_proj.weight"), 0),
            (format!("{p}.self_attn.q_proj.bias"), 0),
            (format!("{p}.self_attn.o_proj.weight"), 1),
        ] {
            assert!(concat(&attn, &name, dim).equal(&source[&name]), "{name}");
        }
        for (name, dim) in [
            (format!("{p}.mlp.gate_proj.weight"), 0),
            (format!("{p}.mlp.up_proj.weight"), 0),
            (format!("{p}.mlp.down_proj.weight"), 1),
        ] {
            assert!(concat(&mlp, &name, dim).equal(&source[&name]), "{name}");
        }

        let o_bias = format!("{p}.self_attn.o_proj.bias");
        assert!(attn[0][&o_bias].equal(&source[&o_bias]));
        assert_eq!(attn[1][&o_bias].abs().sum(Kind::Float).double_value(&[]), 0.0);

        let norm = format!("{p}.input_layernorm.weight");
        assert!(attn[0][&norm].equal(&source[&norm]));
        assert!(attn[1][&norm].equal(&source[&norm]));
    }

    let root_input = read_all(&nodes[0].join("input.bin"));
    assert!(root_input["model.embed_tokens.weight"].equal(&source["model.embed_tokens.weight"]));
    assert!(read_all(&nodes[1].join("input.bin")).is_empty());
    assert!(nodes[0].join("output.bin").is_file());
    assert!(read_all(&nodes[1].join("output.bin")).is_empty());

    let info = ShardInfo::read(&nodes[1]).unwrap();
    assert_eq!(info.rank, 1);
    assert_eq!(info.num_heads, 2);
    assert_eq!(info.num_kv_heads, 1);
    assert_eq!(info.intermediate_size, 16);
}

#[test]
fn tied_embeddings_become_the_output_head() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = LlamaConfig::dummy();
    config.tie_word_embeddings = true;
    let model_dir = dir.path().join("model");
    let save_dir = dir.path().join("split");
    random_checkpoint(&config, &model_dir, 2).unwrap();
    split_pretrained_model(&split_config(&model_dir, &save_dir, vec![1.0], false)).unwrap();

    let output = read_all(&node_dir(&save_dir, 0).join("output.bin"));
    let input = read_all(&node_dir(&save_dir, 0).join("input.bin"));
    assert!(output["lm_head.weight"].equal(&input["model.embed_tokens.weight"]));
}

#[test]
fn existing_split_is_kept_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let model_dir = dir.path().join("model");
    let save_dir = dir.path().join("split");
    random_checkpoint(&LlamaConfig::dummy(), &model_dir, 4).unwrap();

    let first = split_pretrained_model(&split_config(&model_dir, &save_dir, vec![0.5, 0.5], false));
    assert!(matches!(first, Ok(SplitOutcome::Written { .. })));
    let again = split_pretrained_model(&split_config(&model_dir, &save_dir, vec![0.5, 0.5], false));
    assert_eq!(again.unwrap(), SplitOutcome::Skipped);
    let forced = split_pretrained_model(&split_config(&model_dir, &save_dir, vec![1.0], true));
    assert_eq!(forced.unwrap(), SplitOutcome::Written { files: 6 });
    assert!(!node_dir(&save_dir, 1).exists());
}

#[test]
fn invalid_plan_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let model_dir = dir.path().join("model");
    let save_dir = dir.path().join("split");
    random_checkpoint(&LlamaConfig::dummy(), &model_dir, 4).unwrap();

    let result = split_pretrained_model(&split_config(
        &model_dir,
        &save_dir,
        vec![0.25, 0.25, 0.25, 0.25],
        false,
    ));
    assert!(matches!(
        result,
        Err(SplitError::KvHeadsLessThanWorld { kv: 2, world: 4 })
    ));
    assert!(!save_dir.exists());
}

fn streamer_for(split_dir: &Path, window: usize) -> WeightStreamer {
    let dir = node_dir(split_dir, 0);
    let config = LlamaConfig::from_file(&dir.join("config.json")).unwrap();
    let shard = ShardInfo::read(&dir).unwrap();
    let mut builder = ArenaBuilder::new(Kind::Float, Device::Cpu);
    let model = Llama::declare(&config, &shard, &mut builder).unwrap();
    let manifest = ShardManifest::from_dir(dir, model.sequence());
    manifest.verify().unwrap();
    let scheduler = MemoryWindowScheduler::new(
        model.sequence().clone(),
        manifest,
        builder.finish(),
        window,
        Box::new(|| 1024u64),
    )
    .unwrap();
    WeightStreamer::spawn(scheduler).unwrap()
}

#[test]
fn streamer_tracks_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let model_dir = dir.path().join("model");
    let save_dir = dir.path().join("split");
    random_checkpoint(&LlamaConfig::dummy(), &model_dir, 8).unwrap();
    split_pretrained_model(&split_config(&model_dir, &save_dir, vec![0.5, 0.5], false)).unwrap();

    let streamer = streamer_for(&save_dir, 3);
    streamer.track_block("input", false).unwrap().wait().unwrap();
    assert_eq!(
        streamer.resident_blocks().unwrap(),
        vec![BlockId::Input, BlockId::Attention(0), BlockId::Mlp(0)]
    );

    let pending = streamer.track_block("self_attn.0", true).unwrap();
    assert_eq!(pending.block(), BlockId::Attention(0));
    pending.wait().unwrap();
    streamer.track_block("mlp.0", false).unwrap().wait().unwrap();
    assert_eq!(
        streamer.resident_blocks().unwrap(),
        vec![BlockId::Mlp(0), BlockId::Attention(1), BlockId::Mlp(1)]
    );

    assert!(matches!(
        streamer.track_block("lm_head", false),
        Err(StreamingError::UnknownBlock(_))
    ));
    assert!(matches!(
        streamer.track_block("mlp.7", false),
        Err(StreamingError::BlockOutOfRange { .. })
    ));

    let history = streamer.memory_history().unwrap();
    assert_eq!(history.len(), 4);
    assert!(history.iter().all(|s| s.resident_bytes == 1024));
    assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let scheduler = streamer.shutdown().unwrap();
    assert_eq!(scheduler.window().len(), 3);
}

#[test]
fn streamer_serializes_async_calls() {
    let dir = tempfile::tempdir().unwrap();
    let model_dir = dir.path().join("model");
    let save_dir = dir.path().join("split");
    random_checkpoint(&LlamaConfig::dummy(), &model_dir, 9).unwrap();
    split_pretrained_model(&split_config(&model_dir, &save_dir, vec![1.0], false)).unwrap();

    let streamer = streamer_for(&save_dir, 2);
    let sequence = BlockSequence::new(2);
    let handles: Vec<_> = sequence
        .iter()
        .map(|block| streamer.track_async(block).unwrap())
        .collect();
    for handle in handles {
        handle.wait().unwrap();
    }
    assert_eq!(streamer.resident_blocks().unwrap(), vec![BlockId::Output]);
}
