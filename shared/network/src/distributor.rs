use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sluice_modeling::node_dir;
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{connect_with_retry, decode, encode, framed, FramedStream, RetryPolicy};

const CHUNK_SIZE: usize = 1 << 20;
const PARTIAL_SUFFIX: &str = ".part";

#[derive(Debug, Error)]
pub enum DistributorError {
    #[error("server has no shard for rank {0}")]
    MissingShard(usize),

    #[error("refusing to write file named {0:?}")]
    BadFileName(String),

    #[error("expected {expected}, got {found}")]
    UnexpectedFrame {
        expected: &'static str,
        found: &'static str,
    },

    #[error("connection closed during transfer")]
    ConnectionClosed,

    #[error("{name} is {expected} bytes but {received} arrived")]
    ShortFile {
        name: String,
        expected: u64,
        received: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileRequest {
    pub rank: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum FileFrame {
    File { name: String, len: u64 },
    Chunk(Vec<u8>),
    Done,
    Missing { rank: usize },
}

impl FileFrame {
    fn name(&self) -> &'static str {
        match self {
            FileFrame::File { .. } => "file header",
            FileFrame::Chunk(_) => "chunk",
            FileFrame::Done => "done",
            FileFrame::Missing { .. } => "missing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadSummary {
    pub files: usize,
    pub bytes: u64,
}

/// Serves the per-node shard directories under a split root to peers that ask
/// for their rank's files.
pub struct FileServer {
    listener: TcpListener,
    split_root: PathBuf,
}

impl FileServer {
    pub async fn bind(addr: SocketAddr, split_root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let split_root = split_root.into();
        info!(address = %listener.local_addr()?, root = %split_root.display(), "shard file server listening");
        Ok(Self {
            listener,
            split_root,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts requests until `cancel` fires. Each connection is served on its
    /// own task.
    pub async fn serve(self, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, remote) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("failed to accept shard request: {err}");
                    continue;
                }
            };
            let root = self.split_root.clone();
            tokio::spawn(async move {
                match serve_request(framed(stream), &root).await {
                    Ok(Some(summary)) => info!(
                        %remote,
                        files = summary.files,
                        bytes = summary.bytes,
                        "sent shard"
                    ),
                    Ok(None) => debug!(%remote, "shard request closed without asking"),
                    Err(err) => error!(%remote, "failed to send shard: {err}"),
                }
            });
        }
        debug!("shard file server stopped");
    }
}

async fn shard_files(dir: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            files.push((name.to_string(), entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

async fn serve_request(
    mut stream: FramedStream,
    root: &Path,
) -> Result<Option<DownloadSummary>, DistributorError> {
    let Some(frame) = stream.next().await else {
        return Ok(None);
    };
    let FileRequest { rank } = decode(&frame?)?;
    let dir = node_dir(root, rank);
    if !dir.is_dir() {
        warn!(rank, dir = %dir.display(), "no shard for requested rank");
        stream.send(encode(&FileFrame::Missing { rank })?).await?;
        return Ok(None);
    }

    let mut summary = DownloadSummary::default();
    let mut buf = vec![0u8; CHUNK_SIZE];
    for (name, path) in shard_files(&dir).await? {
        let mut file = File::open(&path).await?;
        let len = file.metadata().await?.len();
        stream.send(encode(&FileFrame::File { name, len })?).await?;
        let mut sent = 0u64;
        while sent < len {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            stream
                .send(encode(&FileFrame::Chunk(buf[..read].to_vec()))?)
                .await?;
            sent += read as u64;
        }
        summary.files += 1;
        summary.bytes += sent;
    }
    stream.send(encode(&FileFrame::Done)?).await?;
    Ok(Some(summary))
}

fn checked_name(name: &str) -> Result<&str, DistributorError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.ends_with(PARTIAL_SUFFIX);
    match valid {
        true => Ok(name),
        false => Err(DistributorError::BadFileName(name.to_string())),
    }
}

async fn next_frame(stream: &mut FramedStream) -> Result<FileFrame, DistributorError> {
    match stream.next().await {
        Some(frame) => Ok(decode(&frame?)?),
        None => Err(DistributorError::ConnectionClosed),
    }
}

async fn receive_file(
    stream: &mut FramedStream,
    dest: &Path,
    name: &str,
    len: u64,
) -> Result<u64, DistributorError> {
    let partial = dest.join(format!("{name}{PARTIAL_SUFFIX}"));
    let mut file = File::create(&partial).await?;
    let mut received = 0u64;
    while received < len {
        match next_frame(stream).await? {
            FileFrame::Chunk(bytes) => {
                file.write_all(&bytes).await?;
                received += bytes.len() as u64;
            }
            other => {
                return Err(DistributorError::UnexpectedFrame {
                    expected: "chunk",
                    found: other.name(),
                })
            }
        }
    }
    if received != len {
        return Err(DistributorError::ShortFile {
            name: name.to_string(),
            expected: len,
            received,
        });
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&partial, dest.join(name)).await?;
    Ok(received)
}

/// Fetches rank `rank`'s shard from the file server at `addr` into
/// `node_dir(dest_root, rank)`. Files are written under a temporary name and
/// renamed once complete, so a directory never holds a truncated block file.
pub async fn download_shard(
    addr: SocketAddr,
    rank: usize,
    dest_root: &Path,
    retry: RetryPolicy,
) -> Result<DownloadSummary, DistributorError> {
    let mut stream = framed(connect_with_retry(addr, retry).await?);
    stream.send(encode(&FileRequest { rank })?).await?;

    let dest = node_dir(dest_root, rank);
    tokio::fs::create_dir_all(&dest).await?;
    let mut summary = DownloadSummary::default();
    loop {
        match next_frame(&mut stream).await? {
            FileFrame::File { name, len } => {
                let name = checked_name(&name)?;
                match receive_file(&mut stream, &dest, name, len).await {
                    Ok(bytes) => {
                        debug!(rank, file = name, bytes, "received shard file");
                        summary.files += 1;
                        summary.bytes += bytes;
                    }
                    Err(err) => {
                        let _ = tokio::fs::remove_file(dest.join(format!("{name}{PARTIAL_SUFFIX}"))).await;
                        return Err(err);
                    }
                }
            }
            FileFrame::Done => break,
            FileFrame::Missing { rank } => return Err(DistributorError::MissingShard(rank)),
            other => {
                return Err(DistributorError::UnexpectedFrame {
                    expected: "file header",
                    found: other.name(),
                })
            }
        }
    }
    info!(
        rank,
        files = summary.files,
        bytes = summary.bytes,
        dir = %dest.display(),
        "downloaded shard"
    );
    Ok(summary)
}
