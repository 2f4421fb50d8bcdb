use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use sluice_modeling::{
    Collective, CollectiveError, CollectiveOp, CollectiveReply, CollectiveResult, Contribution,
    IssueOrder, PendingCollective, Rendezvous, RendezvousMessage,
};
use thiserror::Error;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    protocol::{connect_with_retry, decode, encode, framed, ControlMessage, FramedStream, RetryPolicy},
    wire::{WireOp, WireResult},
};

const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("rank {rank} is not a peer rank in a world of {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

#[derive(Default)]
struct PendingReplies {
    closed: bool,
    waiting: HashMap<u64, flume::Sender<CollectiveReply>>,
}

impl PendingReplies {
    fn fail_all(&mut self, err: CollectiveError) {
        self.closed = true;
        for (_, reply) in self.waiting.drain() {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

enum Route {
    /// Rank 0 hands its contributions straight to the rendezvous it hosts.
    Hub(flume::Sender<RendezvousMessage>),
    /// Other ranks submit over TCP and wait for rank 0's answer.
    Link {
        outbox: mpsc::UnboundedSender<ControlMessage>,
        pending: Arc<Mutex<PendingReplies>>,
    },
}

/// Collective channel over TCP. Rank 0 runs the rendezvous and every other
/// rank holds one connection to it.
pub struct TcpCollective {
    rank: usize,
    world_size: usize,
    order: Arc<IssueOrder>,
    route: Route,
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    admission: CancellationToken,
    peers_alive: Mutex<Option<mpsc::Receiver<()>>>,
}

impl TcpCollective {
    /// Binds the coordinator's listener and starts admitting peers. Collectives
    /// issued before every peer has joined simply wait for them.
    pub async fn coordinator(addr: SocketAddr, world_size: usize) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (hub, _worker) = Rendezvous::spawn(world_size)?;
        let cancel = CancellationToken::new();
        let admission = cancel.child_token();
        let (alive, peers_alive) = mpsc::channel(1);
        info!(address = %local_addr, world_size, "collective coordinator listening");

        tokio::spawn(accept_peers(
            listener,
            world_size,
            hub.clone(),
            Admission {
                stop: admission.clone(),
                cancel: cancel.clone(),
                alive,
            },
        ));
        Ok(Self {
            rank: 0,
            world_size,
            order: Arc::new(IssueOrder::new()),
            route: Route::Hub(hub),
            local_addr: Some(local_addr),
            cancel,
            admission,
            peers_alive: Mutex::new(Some(peers_alive)),
        })
    }

    /// Joins the coordinator at `addr` as `rank`, retrying while it isn't up.
    pub async fn connect(
        addr: SocketAddr,
        rank: usize,
        world_size: usize,
        retry: RetryPolicy,
    ) -> Result<Self, ChannelError> {
        if rank == 0 || rank >= world_size {
            return Err(ChannelError::InvalidRank { rank, world_size });
        }
        let mut stream = framed(connect_with_retry(addr, retry).await?);
        stream
            .send(encode(&ControlMessage::Hello { rank, world_size })?)
            .await?;

        let pending = Arc::new(Mutex::new(PendingReplies::default()));
        let (outbox, inbox) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_link(
            stream,
            inbox,
            pending.clone(),
            cancel.clone(),
        ));
        info!(rank, world_size, coordinator = %addr, "joined collective group");
        Ok(Self {
            rank,
            world_size,
            order: Arc::new(IssueOrder::new()),
            route: Route::Link { outbox, pending },
            local_addr: None,
            admission: cancel.child_token(),
            cancel,
            peers_alive: Mutex::new(None),
        })
    }

    /// Address the coordinator listens on. `None` on peers.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// On the coordinator, resolves once every peer that joined has hung up
    /// and all results queued for them are sent. Returns at once on peers.
    pub async fn peers_closed(&self) {
        let alive = self
            .peers_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut alive) = alive {
            alive.recv().await;
        }
    }

    /// Drops every connection now, failing anything still in flight.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TcpCollective {
    fn drop(&mut self) {
        match self.route {
            // peers keep their connections until they hang up
            Route::Hub(_) => self.admission.cancel(),
            Route::Link { .. } => self.cancel.cancel(),
        }
    }
}

fn lock(pending: &Mutex<PendingReplies>) -> MutexGuard<'_, PendingReplies> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Collective for TcpCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn issue(&self, op: CollectiveOp) -> PendingCollective {
        let seq = self.order.next_seq();
        let (reply, rx) = flume::bounded(1);
        match &self.route {
            Route::Hub(hub) => Contribution {
                rank: self.rank,
                seq,
                op,
                reply,
            }
            .submit(hub),
            Route::Link { outbox, pending } => {
                let op = match WireOp::try_from(&op) {
                    Ok(op) => op,
                    Err(err) => {
                        // keep the group's sequence numbers aligned; the
                        // substituted barrier fails as a mismatch elsewhere
                        error!(seq, op = op.name(), "can't encode collective: {err}");
                        let _ = reply.send(Err(err.into()));
                        let _ = outbox.send(ControlMessage::Contribute {
                            seq,
                            op: WireOp::Barrier,
                        });
                        return PendingCollective::new(seq, rx, self.order.clone());
                    }
                };
                let mut waiting = lock(pending);
                if waiting.closed {
                    let _ = reply.send(Err(CollectiveError::Disconnected));
                } else {
                    waiting.waiting.insert(seq, reply);
                    drop(waiting);
                    if outbox.send(ControlMessage::Contribute { seq, op }).is_err() {
                        if let Some(reply) = lock(pending).waiting.remove(&seq) {
                            let _ = reply.send(Err(CollectiveError::Disconnected));
                        }
                    }
                }
            }
        }
        PendingCollective::new(seq, rx, self.order.clone())
    }
}

async fn read_hello(stream: &mut FramedStream, world_size: usize) -> Result<usize, ChannelError> {
    let frame = match tokio::time::timeout(HELLO_TIMEOUT, stream.next()).await {
        Ok(Some(frame)) => frame?,
        Ok(None) => return Err(ChannelError::Handshake("closed before hello".to_string())),
        Err(_) => return Err(ChannelError::Handshake("timed out waiting for hello".to_string())),
    };
    match decode::<ControlMessage>(&frame)? {
        ControlMessage::Hello {
            rank,
            world_size: theirs,
        } => {
            if theirs != world_size {
                return Err(ChannelError::Handshake(format!(
                    "peer expects a world of {theirs}, coordinator has {world_size}"
                )));
            }
            if rank == 0 || rank >= world_size {
                return Err(ChannelError::InvalidRank { rank, world_size });
            }
            Ok(rank)
        }
        other => Err(ChannelError::Handshake(format!(
            "expected hello, got {other:?}"
        ))),
    }
}

struct Admission {
    stop: CancellationToken,
    cancel: CancellationToken,
    /// Cloned into every peer task; the receiver sees the channel close once
    /// admission and all peer tasks are over.
    alive: mpsc::Sender<()>,
}

async fn accept_peers(
    listener: TcpListener,
    world_size: usize,
    hub: flume::Sender<RendezvousMessage>,
    admission: Admission,
) {
    let mut joined = vec![false; world_size];
    if let Some(root) = joined.first_mut() {
        *root = true;
    }
    while joined.iter().any(|joined| !joined) {
        let accepted = tokio::select! {
            _ = admission.stop.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("failed to accept peer: {err}");
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            warn!(%remote, "failed to set TCP_NODELAY: {err}");
        }
        let mut stream = framed(stream);
        let rank = match read_hello(&mut stream, world_size).await {
            Ok(rank) => rank,
            Err(err) => {
                warn!(%remote, "rejected peer: {err}");
                continue;
            }
        };
        if joined[rank] {
            warn!(%remote, rank, "rejected peer: rank already joined");
            continue;
        }
        joined[rank] = true;
        info!(%remote, rank, "peer joined");
        let alive = admission.alive.clone();
        let cancel = admission.cancel.clone();
        let hub = hub.clone();
        tokio::spawn(async move {
            serve_peer(rank, stream, hub, cancel).await;
            drop(alive);
        });
    }
    info!(world_size, "all peers joined");
}

/// Coordinator side of one peer's connection: feeds its contributions into the
/// rendezvous and sends each completed result back.
///
/// A connection that ends without `cancel` means the peer is gone, and the
/// rendezvous is told so that no rank keeps waiting on it.
async fn serve_peer(
    rank: usize,
    stream: FramedStream,
    hub: flume::Sender<RendezvousMessage>,
    cancel: CancellationToken,
) {
    let departures = hub.clone();
    let (mut sink, mut frames) = stream.split();
    let (outbox, mut inbox) = mpsc::unbounded_channel::<ControlMessage>();

    let writer = async move {
        while let Some(message) = inbox.recv().await {
            sink.send(encode(&message)?).await?;
        }
        Ok::<_, ChannelError>(())
    };
    let reader = async move {
        while let Some(frame) = frames.next().await {
            let (seq, op) = match decode::<ControlMessage>(&frame?)? {
                ControlMessage::Contribute { seq, op } => (seq, op),
                other => {
                    warn!(rank, "ignoring unexpected message {other:?}");
                    continue;
                }
            };
            let op = CollectiveOp::try_from(&op).unwrap_or_else(|err| {
                error!(rank, seq, "can't decode contribution: {err}");
                CollectiveOp::Barrier
            });
            trace!(rank, seq, op = op.name(), "contribution received");

            let (reply, replies) = flume::bounded(1);
            Contribution {
                rank,
                seq,
                op,
                reply,
            }
            .submit(&hub);
            let outbox = outbox.clone();
            tokio::spawn(async move {
                let result = replies
                    .recv_async()
                    .await
                    .unwrap_or(Err(CollectiveError::Disconnected))
                    .and_then(|result| WireResult::try_from(&result).map_err(CollectiveError::from));
                let _ = outbox.send(ControlMessage::Complete { seq, result });
            });
        }
        Ok::<_, ChannelError>(())
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(rank, "peer connection cancelled");
            return;
        }
        outcome = reader => outcome,
        outcome = writer => outcome,
    };
    match outcome {
        Ok(()) => info!(rank, "peer connection closed"),
        Err(err) => error!(rank, "peer connection failed: {err}"),
    }
    let _ = departures.send(RendezvousMessage::Depart { rank });
}

/// Peer side of the connection to rank 0.
async fn run_link(
    stream: FramedStream,
    mut inbox: mpsc::UnboundedReceiver<ControlMessage>,
    pending: Arc<Mutex<PendingReplies>>,
    cancel: CancellationToken,
) {
    let (mut sink, mut frames) = stream.split();
    let writer = async move {
        while let Some(message) = inbox.recv().await {
            sink.send(encode(&message)?).await?;
        }
        Ok::<_, ChannelError>(())
    };
    let replies = pending.clone();
    let reader = async move {
        while let Some(frame) = frames.next().await {
            let (seq, result) = match decode::<ControlMessage>(&frame?)? {
                ControlMessage::Complete { seq, result } => (seq, result),
                other => {
                    warn!("ignoring unexpected message {other:?}");
                    continue;
                }
            };
            let Some(reply) = lock(&replies).waiting.remove(&seq) else {
                debug!(seq, "no one waiting on collective");
                continue;
            };
            let result = result
                .and_then(|result| CollectiveResult::try_from(&result).map_err(CollectiveError::from));
            let _ = reply.send(result);
        }
        Ok::<_, ChannelError>(())
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        outcome = reader => outcome,
        outcome = writer => outcome,
    };
    let err = match outcome {
        Ok(()) => {
            info!("collective link closed");
            CollectiveError::Disconnected
        }
        Err(err) => {
            error!("collective link failed: {err}");
            CollectiveError::Transport(err.to_string())
        }
    };
    lock(&pending).fail_all(err);
}
