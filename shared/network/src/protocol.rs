use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sluice_modeling::CollectiveError;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info};

use crate::wire::{WireOp, WireResult};

/// Largest single frame. Broadcast units carry a full prompt's hidden states.
pub const MAX_FRAME_LENGTH: usize = 1 << 30;

pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Messages exchanged on the collective channel between a peer and rank 0.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// First frame a peer sends after connecting.
    Hello { rank: usize, world_size: usize },
    Contribute { seq: u64, op: WireOp },
    Complete {
        seq: u64,
        result: Result<WireResult, CollectiveError>,
    },
}

pub fn framed(stream: TcpStream) -> FramedStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(stream, codec)
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, postcard::Error> {
    postcard::to_stdvec(message).map(Bytes::from)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, postcard::Error> {
    postcard::from_bytes(bytes)
}

/// How long a node keeps knocking on a listener that isn't up yet.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 120,
            delay: Duration::from_millis(500),
        }
    }
}

pub async fn connect_with_retry(
    addr: SocketAddr,
    retry: RetryPolicy,
) -> std::io::Result<TcpStream> {
    let mut attempt = 1;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                info!(%addr, attempt, "connected");
                return Ok(stream);
            }
            Err(err) if attempt < retry.attempts => {
                debug!(%addr, attempt, "connect failed, retrying: {err}");
                attempt += 1;
                tokio::time::sleep(retry.delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
