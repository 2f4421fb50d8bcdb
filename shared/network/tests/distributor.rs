use std::net::SocketAddr;

use pretty_assertions::assert_eq;
use sluice_modeling::{node_dir, random_checkpoint, split_pretrained_model, LlamaConfig, SplitConfig};
use sluice_network::{
    download_shard, CancellationToken, DistributorError, FileServer, RetryPolicy,
};

fn listing(dir: &std::path::Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            (name, std::fs::read(&path).unwrap())
        })
        .collect();
    files.sort();
    files
}

#[tokio::test(flavor = "multi_thread")]
async fn peers_download_exactly_their_shard() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let model_dir = dir.path().join("model");
    let split_dir = dir.path().join("split");
    random_checkpoint(&LlamaConfig::dummy(), &model_dir, 6)?;
    split_pretrained_model(&SplitConfig {
        model_dir,
        save_dir: split_dir.clone(),
        ratio: vec![0.5, 0.5],
        force: false,
    })?;

    let server = FileServer::bind("127.0.0.1:0".parse::<SocketAddr>()?, &split_dir).await?;
    let addr = server.local_addr()?;
    let cancel = CancellationToken::new();
    let serving = tokio::spawn(server.serve(cancel.clone()));

    let dest = dir.path().join("downloaded");
    let summary = download_shard(addr, 1, &dest, RetryPolicy::default()).await?;
    let expected = listing(&node_dir(&split_dir, 1));
    assert_eq!(summary.files, expected.len());
    assert_eq!(
        summary.bytes,
        expected.iter().map(|(_, bytes)| bytes.len() as u64).sum::<u64>()
    );
    assert_eq!(listing(&node_dir(&dest, 1)), expected);
    assert!(!node_dir(&dest, 0).exists());

    let missing = download_shard(addr, 5, &dest, RetryPolicy::default()).await;
    assert!(matches!(missing, Err(DistributorError::MissingShard(5))));

    cancel.cancel();
    serving.await?;
    Ok(())
}
