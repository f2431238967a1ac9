use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use tokio_graceful_shutdown::SubsystemHandle;

use divolte_core::record::AppendRecord;

/// Advisory outcome of a strategy operation.
///
/// The strategy manages its own alive/broken state. Drivers use the
/// result only to decide whether records may be appended or whether to
/// keep heartbeating until the strategy reports recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResult {
    Success,
    Failure,
}

/// Contract between the flusher driver and a file strategy.
///
/// A single owning task calls exactly one `setup()` before anything else,
/// then any interleaving of `append` (one per dequeued record) and
/// `heartbeat` (the queue was empty, or a periodic tick fired), and
/// exactly one `cleanup()` at shutdown. Calling `append` after the
/// strategy reported `Failure` and before it reported recovery is a
/// programming error.
pub trait FileFlushStrategy {
    fn setup(&mut self) -> FlushResult;

    fn append(&mut self, record: &AppendRecord) -> FlushResult;

    fn heartbeat(&mut self) -> FlushResult;

    fn cleanup(&mut self);
}

/// Driver feeding dequeued records and heartbeats into a strategy.
///
/// The flusher owns the strategy for its entire lifetime and makes every
/// strategy call from the task running `run`, so the strategy needs no
/// internal synchronization.
pub struct Flusher<S: FileFlushStrategy> {
    strategy: S,

    /// Upstream record queue.
    receiver: async_channel::Receiver<AppendRecord>,

    /// How long the queue may stay empty before a heartbeat is issued.
    heartbeat_interval: Duration,

    /// Most recent result reported by the strategy.
    last_result: FlushResult,
}

impl<S: FileFlushStrategy> Flusher<S> {
    pub fn new(
        strategy: S,
        receiver: async_channel::Receiver<AppendRecord>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            strategy,
            receiver,
            heartbeat_interval,
            last_result: FlushResult::Success,
        }
    }

    /// Run until the record channel closes or shutdown is requested.
    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<()> {
        self.last_result = self.strategy.setup();

        loop {
            tokio::select! {
                received = tokio::time::timeout(self.heartbeat_interval, self.receiver.recv()) => {
                    match received {
                        Ok(Ok(record)) => self.process(&record),
                        Ok(Err(_)) => {
                            info!("record channel closed, flusher shutting down");
                            break;
                        }
                        // Nothing dequeued within the heartbeat interval.
                        Err(_) => {
                            self.last_result = self.strategy.heartbeat();
                        }
                    }
                },
                _ = subsys.on_shutdown_requested() => {
                    info!("flusher shutdown requested");
                    break;
                }
            }
        }

        self.strategy.cleanup();

        Ok(())
    }

    fn process(&mut self, record: &AppendRecord) {
        match self.last_result {
            FlushResult::Success => {
                self.last_result = self.strategy.append(record);
            }
            FlushResult::Failure => {
                // Appending into a broken strategy is forbidden. Delivery
                // is best effort, so the record is dropped and the
                // heartbeat gives the strategy a chance to reconnect.
                warn!(
                    "dropping record received while the sink is broken, session: {}",
                    record.session_id()
                );
                self.last_result = self.strategy.heartbeat();
            }
        }
    }
}
