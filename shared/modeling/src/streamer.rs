use std::thread::JoinHandle;

use tracing::{debug, error};

use crate::{BlockId, BlockSequence, MemoryUsageSample, MemoryWindowScheduler, StreamingError};

/// Depth of the command queue in front of the streaming worker.
const COMMAND_QUEUE_DEPTH: usize = 16;

enum StreamerCommand {
    Track {
        block: BlockId,
        reply: flume::Sender<Result<(), StreamingError>>,
    },
    History {
        reply: flume::Sender<Vec<MemoryUsageSample>>,
    },
    Window {
        reply: flume::Sender<Vec<BlockId>>,
    },
}

/// Pending `track` call. Dropping it without waiting still lets the load run.
#[must_use = "a track handle must be waited on before the block is read"]
pub struct TrackHandle {
    block: BlockId,
    state: TrackState,
}

enum TrackState {
    Pending(flume::Receiver<Result<(), StreamingError>>),
    Done,
}

impl TrackHandle {
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Blocks until the worker has finished this `track` call.
    pub fn wait(self) -> Result<(), StreamingError> {
        match self.state {
            TrackState::Pending(rx) => rx.recv().map_err(|_| StreamingError::WorkerGone)?,
            TrackState::Done => Ok(()),
        }
    }
}

/// Owns a [`MemoryWindowScheduler`] on a single dedicated worker thread.
///
/// Every block load and release runs on that thread, one `track` call at a
/// time, in the order the calls were made. Compute never touches the disk.
pub struct WeightStreamer {
    sequence: BlockSequence,
    tx: Option<flume::Sender<StreamerCommand>>,
    worker: Option<JoinHandle<MemoryWindowScheduler>>,
}

impl WeightStreamer {
    pub fn spawn(scheduler: MemoryWindowScheduler) -> Result<Self, StreamingError> {
        let sequence = scheduler.sequence().clone();
        let (tx, rx) = flume::bounded::<StreamerCommand>(COMMAND_QUEUE_DEPTH);
        let worker = std::thread::Builder::new()
            .name("sluice-streamer".to_string())
            .spawn(move || {
                let mut scheduler = scheduler;
                while let Ok(command) = rx.recv() {
                    match command {
                        StreamerCommand::Track { block, reply } => {
                            let result = scheduler.track(block);
                            if let Err(err) = &result {
                                error!(block = %block, "track failed: {err}");
                            }
                            let _ = reply.send(result);
                        }
                        StreamerCommand::History { reply } => {
                            let _ = reply.send(scheduler.history().samples().to_vec());
                        }
                        StreamerCommand::Window { reply } => {
                            let _ = reply.send(scheduler.window());
                        }
                    }
                }
                debug!("streaming worker shutting down");
                scheduler
            })
            .map_err(StreamingError::Spawn)?;
        Ok(Self {
            sequence,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn sequence(&self) -> &BlockSequence {
        &self.sequence
    }

    /// Tracks `block` and waits for the loads it triggers.
    pub fn track(&self, block: BlockId) -> Result<(), StreamingError> {
        self.track_async(block)?.wait()
    }

    /// Queues a `track` call on the worker and returns immediately.
    ///
    /// Blocks outside the model's sequence are rejected here rather than on the
    /// worker.
    pub fn track_async(&self, block: BlockId) -> Result<TrackHandle, StreamingError> {
        if !self.sequence.contains(block) {
            return Err(StreamingError::BlockOutOfRange {
                block,
                num_layers: self.sequence.num_layers(),
            });
        }
        let (reply, rx) = flume::bounded(1);
        self.send(StreamerCommand::Track { block, reply })?;
        Ok(TrackHandle {
            block,
            state: TrackState::Pending(rx),
        })
    }

    /// Name-based entry point: `input`, `self_attn.<l>`, `mlp.<l>` or `output`.
    pub fn track_block(&self, name: &str, async_op: bool) -> Result<TrackHandle, StreamingError> {
        let block = name.parse::<BlockId>()?;
        let handle = self.track_async(block)?;
        if async_op {
            return Ok(handle);
        }
        handle.wait()?;
        Ok(TrackHandle {
            block,
            state: TrackState::Done,
        })
    }

    pub fn memory_history(&self) -> Result<Vec<MemoryUsageSample>, StreamingError> {
        let (reply, rx) = flume::bounded(1);
        self.send(StreamerCommand::History { reply })?;
        rx.recv().map_err(|_| StreamingError::WorkerGone)
    }

    pub fn resident_blocks(&self) -> Result<Vec<BlockId>, StreamingError> {
        let (reply, rx) = flume::bounded(1);
        self.send(StreamerCommand::Window { reply })?;
        rx.recv().map_err(|_| StreamingError::WorkerGone)
    }

    /// Stops the worker after it drains queued calls and hands back the scheduler.
    pub fn shutdown(mut self) -> Result<MemoryWindowScheduler, StreamingError> {
        self.tx.take();
        let worker = self.worker.take().ok_or(StreamingError::WorkerGone)?;
        worker.join().map_err(|_| StreamingError::WorkerGone)
    }

    fn send(&self, command: StreamerCommand) -> Result<(), StreamingError> {
        self.tx
            .as_ref()
            .ok_or(StreamingError::WorkerGone)?
            .send(command)
            .map_err(|_| StreamingError::WorkerGone)
    }
}

impl Drop for WeightStreamer {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
