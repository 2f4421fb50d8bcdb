mod collective;
mod distributor;
mod protocol;
mod wire;

pub use collective::{ChannelError, TcpCollective};
pub use distributor::{
    download_shard, DistributorError, DownloadSummary, FileFrame, FileRequest, FileServer,
};
pub use protocol::{
    connect_with_retry, decode, encode, framed, ControlMessage, FramedStream, RetryPolicy,
    MAX_FRAME_LENGTH,
};
pub use tokio_util::sync::CancellationToken;
pub use wire::{WireError, WireKind, WireOp, WireResult, WireTensor, WireValue};
