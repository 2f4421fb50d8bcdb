use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use serde::{Deserialize, Serialize};
use tch::{nn::Module, Tensor};
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectiveError {
    #[error("collective #{seq} does not match across ranks: {detail}")]
    Mismatch { seq: u64, detail: String },

    #[error("waited on collective #{found} while #{expected} is still outstanding, handles must be waited in issue order")]
    OutOfOrderWait { expected: u64, found: u64 },

    #[error("expected a {expected} result, got {found}")]
    UnexpectedResult { expected: String, found: String },

    #[error("tensor operation failed: {0}")]
    Tensor(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("collective channel closed")]
    Disconnected,

    #[error("rank {rank} left the group")]
    RankLost { rank: usize },
}

/// Payload of a broadcast. Tensor payloads travel as one unit: receivers get
/// every named tensor of the unit or an error, never a subset.
#[derive(Debug)]
pub enum BroadcastValue {
    Tensors(Vec<(String, Tensor)>),
    Scalar(u64),
}

impl BroadcastValue {
    pub fn deep_copy(&self) -> Self {
        match self {
            BroadcastValue::Tensors(tensors) => BroadcastValue::Tensors(
                tensors
                    .iter()
                    .map(|(name, tensor)| (name.clone(), tensor.copy()))
                    .collect(),
            ),
            BroadcastValue::Scalar(value) => BroadcastValue::Scalar(*value),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            BroadcastValue::Tensors(_) => "tensors",
            BroadcastValue::Scalar(_) => "scalar",
        }
    }

    pub fn into_tensors(self) -> Result<Vec<(String, Tensor)>, CollectiveError> {
        match self {
            BroadcastValue::Tensors(tensors) => Ok(tensors),
            other => Err(CollectiveError::UnexpectedResult {
                expected: "tensors".to_string(),
                found: other.kind_name().to_string(),
            }),
        }
    }

    pub fn into_scalar(self) -> Result<u64, CollectiveError> {
        match self {
            BroadcastValue::Scalar(value) => Ok(value),
            other => Err(CollectiveError::UnexpectedResult {
                expected: "scalar".to_string(),
                found: other.kind_name().to_string(),
            }),
        }
    }
}

#[derive(Debug)]
pub enum CollectiveOp {
    /// Sum across ranks.
    AllReduce(Tensor),
    /// Only `root` supplies a value.
    Broadcast {
        root: usize,
        value: Option<BroadcastValue>,
    },
    Barrier,
}

impl CollectiveOp {
    pub fn name(&self) -> &'static str {
        match self {
            CollectiveOp::AllReduce(_) => "all-reduce",
            CollectiveOp::Broadcast { .. } => "broadcast",
            CollectiveOp::Barrier => "barrier",
        }
    }
}

#[derive(Debug)]
pub enum CollectiveResult {
    Reduced(Tensor),
    Broadcast(BroadcastValue),
    Barrier,
}

impl CollectiveResult {
    pub fn name(&self) -> &'static str {
        match self {
            CollectiveResult::Reduced(_) => "all-reduce",
            CollectiveResult::Broadcast(_) => "broadcast",
            CollectiveResult::Barrier => "barrier",
        }
    }
}

pub type CollectiveReply = Result<CollectiveResult, CollectiveError>;

/// Per-rank sequence numbers for issued collectives, and the check that they
/// are waited on in the order they were issued.
#[derive(Debug, Default)]
pub struct IssueOrder {
    issued: AtomicU64,
    waited: AtomicU64,
}

impl IssueOrder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_seq(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst)
    }

    fn complete(&self, seq: u64) -> Result<(), CollectiveError> {
        self.waited
            .compare_exchange(seq, seq + 1, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|expected| CollectiveError::OutOfOrderWait {
                expected,
                found: seq,
            })
    }
}

/// A collective that has been issued but whose result hasn't been consumed.
#[derive(Debug)]
pub struct PendingCollective {
    seq: u64,
    rx: flume::Receiver<CollectiveReply>,
    order: Arc<IssueOrder>,
}

impl PendingCollective {
    pub fn new(seq: u64, rx: flume::Receiver<CollectiveReply>, order: Arc<IssueOrder>) -> Self {
        Self { seq, rx, order }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    fn wait(self) -> CollectiveReply {
        self.order.complete(self.seq)?;
        self.rx.recv().map_err(|_| CollectiveError::Disconnected)?
    }

    async fn wait_async(self) -> CollectiveReply {
        self.order.complete(self.seq)?;
        self.rx
            .recv_async()
            .await
            .map_err(|_| CollectiveError::Disconnected)?
    }
}

type Finish<T> = Box<dyn FnOnce(CollectiveResult) -> Result<T, CollectiveError> + Send>;

/// Handle to an in-flight collective. Completes exactly once; `wait` consumes it.
#[must_use = "collectives must be waited on in the order they were issued"]
pub struct CollectiveHandle<T> {
    pending: PendingCollective,
    finish: Finish<T>,
}

impl<T> CollectiveHandle<T> {
    pub fn new(
        pending: PendingCollective,
        finish: impl FnOnce(CollectiveResult) -> Result<T, CollectiveError> + Send + 'static,
    ) -> Self {
        Self {
            pending,
            finish: Box::new(finish),
        }
    }

    pub fn seq(&self) -> u64 {
        self.pending.seq()
    }

    pub fn wait(self) -> Result<T, CollectiveError> {
        let result = self.pending.wait()?;
        (self.finish)(result)
    }

    pub async fn wait_async(self) -> Result<T, CollectiveError> {
        let result = self.pending.wait_async().await?;
        (self.finish)(result)
    }
}

fn unexpected(expected: &'static str, found: &CollectiveResult) -> CollectiveError {
    CollectiveError::UnexpectedResult {
        expected: expected.to_string(),
        found: found.name().to_string(),
    }
}

/// Group communication between the ranks of one tensor-parallel model.
///
/// Every operation is issued immediately and returns a handle; callers may do
/// unrelated work (such as loading the next weight block) before waiting.
/// All ranks must issue the same sequence of operations.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn issue(&self, op: CollectiveOp) -> PendingCollective;

    /// Sums `tensor` across ranks, writing the result into it on `wait`.
    fn all_reduce(&self, tensor: &Tensor) -> CollectiveHandle<()> {
        let mut target = tensor.shallow_clone();
        let pending = self.issue(CollectiveOp::AllReduce(tensor.shallow_clone()));
        CollectiveHandle::new(pending, move |result| match result {
            CollectiveResult::Reduced(sum) => {
                let _guard = tch::no_grad_guard();
                target
                    .f_copy_(&sum)
                    .map_err(|err| CollectiveError::Tensor(err.to_string()))
            }
            other => Err(unexpected("all-reduce", &other)),
        })
    }

    /// `value` must be `Some` on `root` and `None` everywhere else.
    fn broadcast(
        &self,
        root: usize,
        value: Option<BroadcastValue>,
    ) -> CollectiveHandle<BroadcastValue> {
        let pending = self.issue(CollectiveOp::Broadcast { root, value });
        CollectiveHandle::new(pending, |result| match result {
            CollectiveResult::Broadcast(value) => Ok(value),
            other => Err(unexpected("broadcast", &other)),
        })
    }

    fn barrier(&self) -> CollectiveHandle<()> {
        let pending = self.issue(CollectiveOp::Barrier);
        CollectiveHandle::new(pending, |result| match result {
            CollectiveResult::Barrier => Ok(()),
            other => Err(unexpected("barrier", &other)),
        })
    }

    /// Publishes a handshake value from this rank; peers pick it up with
    /// [`Collective::request_scalar`].
    fn send_scalar(&self, value: u64) -> CollectiveHandle<u64> {
        self.scalar(self.rank(), Some(value))
    }

    /// Pulls the handshake value published by rank 0.
    fn request_scalar(&self) -> CollectiveHandle<u64> {
        self.scalar(0, None)
    }

    #[doc(hidden)]
    fn scalar(&self, root: usize, value: Option<u64>) -> CollectiveHandle<u64> {
        let pending = self.issue(CollectiveOp::Broadcast {
            root,
            value: value.map(BroadcastValue::Scalar),
        });
        CollectiveHandle::new(pending, |result| match result {
            CollectiveResult::Broadcast(value) => value.into_scalar(),
            other => Err(unexpected("broadcast", &other)),
        })
    }
}

/// One rank's submission to the rendezvous.
pub struct Contribution {
    pub rank: usize,
    pub seq: u64,
    pub op: CollectiveOp,
    pub reply: flume::Sender<CollectiveReply>,
}

impl Contribution {
    /// Hands the contribution to a rendezvous, failing it at once if the
    /// rendezvous is gone.
    pub fn submit(self, hub: &flume::Sender<RendezvousMessage>) {
        if let Err(flume::SendError(RendezvousMessage::Contribute(contribution))) =
            hub.send(RendezvousMessage::Contribute(self))
        {
            let _ = contribution.reply.send(Err(CollectiveError::Disconnected));
        }
    }
}

pub enum RendezvousMessage {
    Contribute(Contribution),
    /// `rank` can no longer contribute. Every collective still pending, and
    /// every one issued afterwards, fails with [`CollectiveError::RankLost`].
    Depart { rank: usize },
}

type Slot = Option<(CollectiveOp, flume::Sender<CollectiveReply>)>;

/// Matches contributions from every rank by sequence number and completes each
/// collective once all ranks have submitted it.
///
/// Reductions sum in rank order, so results are identical no matter when
/// each rank gets around to waiting.
pub struct Rendezvous {
    world_size: usize,
    pending: BTreeMap<u64, Vec<Slot>>,
    lost: Option<usize>,
}

impl Rendezvous {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            pending: BTreeMap::new(),
            lost: None,
        }
    }

    /// Runs a rendezvous on its own thread until every sender is dropped.
    pub fn spawn(
        world_size: usize,
    ) -> std::io::Result<(flume::Sender<RendezvousMessage>, JoinHandle<()>)> {
        let (tx, rx) = flume::unbounded::<RendezvousMessage>();
        let worker = std::thread::Builder::new()
            .name("sluice-rendezvous".to_string())
            .spawn(move || {
                let mut rendezvous = Rendezvous::new(world_size);
                while let Ok(message) = rx.recv() {
                    match message {
                        RendezvousMessage::Contribute(contribution) => {
                            rendezvous.contribute(contribution)
                        }
                        RendezvousMessage::Depart { rank } => rendezvous.depart(rank),
                    }
                }
                if !rendezvous.pending.is_empty() {
                    warn!(
                        outstanding = rendezvous.pending.len(),
                        "rendezvous closed with incomplete collectives"
                    );
                }
            })?;
        Ok((tx, worker))
    }

    pub fn contribute(&mut self, contribution: Contribution) {
        let Contribution {
            rank,
            seq,
            op,
            reply,
        } = contribution;
        if rank >= self.world_size {
            let _ = reply.send(Err(CollectiveError::Mismatch {
                seq,
                detail: format!("rank {rank} is outside a world of {}", self.world_size),
            }));
            return;
        }
        if let Some(lost) = self.lost {
            let _ = reply.send(Err(CollectiveError::RankLost { rank: lost }));
            return;
        }

        let world_size = self.world_size;
        let slots = self
            .pending
            .entry(seq)
            .or_insert_with(|| (0..world_size).map(|_| None).collect());
        if slots[rank].is_some() {
            let _ = reply.send(Err(CollectiveError::Mismatch {
                seq,
                detail: format!("rank {rank} submitted twice"),
            }));
            return;
        }
        trace!(rank, seq, op = op.name(), "contribution received");
        slots[rank] = Some((op, reply));

        if slots.iter().all(Option::is_some) {
            if let Some(slots) = self.pending.remove(&seq) {
                let (ops, replies): (Vec<_>, Vec<_>) = slots.into_iter().flatten().unzip();
                match combine(seq, ops) {
                    Ok(results) => {
                        for (reply, result) in replies.into_iter().zip(results) {
                            let _ = reply.send(Ok(result));
                        }
                    }
                    Err(err) => {
                        warn!("collective #{seq} failed: {err}");
                        for reply in replies {
                            let _ = reply.send(Err(err.clone()));
                        }
                    }
                }
            }
        }
    }

    /// Fails everything outstanding once `rank` is gone. Only the first
    /// departure is reported.
    pub fn depart(&mut self, rank: usize) {
        if self.lost.is_some() {
            return;
        }
        self.lost = Some(rank);
        let err = CollectiveError::RankLost { rank };
        if !self.pending.is_empty() {
            warn!(rank, outstanding = self.pending.len(), "rank left with collectives in flight");
        }
        for (_, slots) in std::mem::take(&mut self.pending) {
            for (_, reply) in slots.into_iter().flatten() {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }
}

enum OpShape {
    AllReduce,
    Broadcast(usize),
    Barrier,
}

fn combine(seq: u64, ops: Vec<CollectiveOp>) -> Result<Vec<CollectiveResult>, CollectiveError> {
    let world_size = ops.len();
    let mismatch = |detail: String| CollectiveError::Mismatch { seq, detail };
    let tensor_err = |err: tch::TchError| CollectiveError::Tensor(err.to_string());
    let shape = match ops.first() {
        Some(CollectiveOp::AllReduce(_)) => OpShape::AllReduce,
        Some(CollectiveOp::Broadcast { root, .. }) => OpShape::Broadcast(*root),
        Some(CollectiveOp::Barrier) => OpShape::Barrier,
        None => return Ok(Vec::new()),
    };
    let _guard = tch::no_grad_guard();

    match shape {
        OpShape::AllReduce => {
            let mut tensors = Vec::with_capacity(world_size);
            for (rank, op) in ops.into_iter().enumerate() {
                match op {
                    CollectiveOp::AllReduce(tensor) => tensors.push(tensor),
                    other => {
                        return Err(mismatch(format!(
                            "rank 0 issued all-reduce, rank {rank} issued {}",
                            other.name()
                        )))
                    }
                }
            }
            let (size, kind, device) = (tensors[0].size(), tensors[0].kind(), tensors[0].device());
            for (rank, tensor) in tensors.iter().enumerate().skip(1) {
                if tensor.size() != size || tensor.kind() != kind {
                    return Err(mismatch(format!(
                        "rank 0 reduces {kind:?}{size:?}, rank {rank} reduces {:?}{:?}",
                        tensor.kind(),
                        tensor.size()
                    )));
                }
            }
            let mut sum = tensors[0].copy();
            for tensor in &tensors[1..] {
                sum.f_add_(&tensor.to_device(device)).map_err(tensor_err)?;
            }
            Ok((0..world_size)
                .map(|_| CollectiveResult::Reduced(sum.shallow_clone()))
                .collect())
        }
        OpShape::Broadcast(root) => {
            if root >= world_size {
                return Err(mismatch(format!(
                    "broadcast root {root} is outside a world of {world_size}"
                )));
            }
            let mut payload = None;
            for (rank, op) in ops.into_iter().enumerate() {
                match op {
                    CollectiveOp::Broadcast { root: other, value } if other == root => {
                        match (rank == root, value) {
                            (true, Some(value)) => payload = Some(value),
                            (true, None) => {
                                return Err(mismatch(format!("root rank {root} supplied no value")))
                            }
                            (false, Some(_)) => {
                                return Err(mismatch(format!(
                                    "rank {rank} supplied a value to a broadcast rooted at {root}"
                                )))
                            }
                            (false, None) => {}
                        }
                    }
                    CollectiveOp::Broadcast { root: other, .. } => {
                        return Err(mismatch(format!(
                            "rank 0 broadcasts from {root}, rank {rank} from {other}"
                        )))
                    }
                    other => {
                        return Err(mismatch(format!(
                            "rank 0 issued broadcast, rank {rank} issued {}",
                            other.name()
                        )))
                    }
                }
            }
            let payload =
                payload.ok_or_else(|| mismatch(format!("root rank {root} supplied no value")))?;
            Ok((0..world_size)
                .map(|_| CollectiveResult::Broadcast(payload.deep_copy()))
                .collect())
        }
        OpShape::Barrier => {
            for (rank, op) in ops.iter().enumerate() {
                if !matches!(op, CollectiveOp::Barrier) {
                    return Err(mismatch(format!(
                        "rank 0 issued barrier, rank {rank} issued {}",
                        op.name()
                    )));
                }
            }
            Ok((0..world_size).map(|_| CollectiveResult::Barrier).collect())
        }
    }
}

/// A group of ranks living in one process, typically one thread per rank.
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    hub: flume::Sender<RendezvousMessage>,
    order: Arc<IssueOrder>,
}

impl LocalGroup {
    /// Creates every rank of a new group; hand one to each thread.
    pub fn new(world_size: usize) -> Result<Vec<LocalGroup>, CollectiveError> {
        let (hub, _worker) =
            Rendezvous::spawn(world_size).map_err(|err| CollectiveError::Transport(err.to_string()))?;
        Ok((0..world_size)
            .map(|rank| LocalGroup {
                rank,
                world_size,
                hub: hub.clone(),
                order: Arc::new(IssueOrder::new()),
            })
            .collect())
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn issue(&self, op: CollectiveOp) -> PendingCollective {
        let seq = self.order.next_seq();
        let (reply, rx) = flume::bounded(1);
        Contribution {
            rank: self.rank,
            seq,
            op,
            reply,
        }
        .submit(&self.hub);
        PendingCollective::new(seq, rx, self.order.clone())
    }
}

/// Linear layer whose output features are split across ranks. Its output is
/// the local slice and needs no communication.
#[derive(Debug)]
pub struct ColumnParallelLinear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl ColumnParallelLinear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self { weight, bias }
    }
}

impl Module for ColumnParallelLinear {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.linear(&self.weight, self.bias.as_ref())
    }
}

/// Linear layer whose input features are split across ranks. Each rank
/// produces a partial sum; the caller all-reduces it.
///
/// Only one rank carries a non-zero bias, so the reduced sum includes it once.
#[derive(Debug)]
pub struct RowParallelLinear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl RowParallelLinear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self { weight, bias }
    }
}

impl Module for RowParallelLinear {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.linear(&self.weight, self.bias.as_ref())
    }
}
