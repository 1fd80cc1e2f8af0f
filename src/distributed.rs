//! Epoch-end output exchange between data-parallel replicas
//!
//! Each replica holds a [`ReplicaHandle`]. At the end of an evaluation epoch
//! every rank calls [`ReplicaHandle::gather_and_aggregate`] with its local
//! outputs: rank 0 collects all contributions, aggregates (and persists)
//! them, then releases the other ranks. Every wait is bounded by the group's
//! timeout.

use crate::error::{ExpertError, Result};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};

/// Default bound on any single exchange wait
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Failed,
}

struct Contribution<T> {
    epoch: u64,
    rank: usize,
    outputs: Vec<T>,
}

pub struct ReplicaHandle<T> {
    rank: usize,
    world_size: usize,
    epoch: u64,
    wait: Duration,
    to_root: mpsc::UnboundedSender<Contribution<T>>,
    /// Rank 0 only
    inbox: Option<mpsc::UnboundedReceiver<Contribution<T>>>,
    /// Contributions that arrived for a later epoch (rank 0 only)
    early: Vec<Contribution<T>>,
    done_tx: Option<watch::Sender<(u64, Outcome)>>,
    done_rx: watch::Receiver<(u64, Outcome)>,
}

/// Handles for `world_size` replicas; index = rank
pub fn replica_group<T>(world_size: usize, wait: Duration) -> Result<Vec<ReplicaHandle<T>>> {
    if world_size == 0 {
        return Err(ExpertError::config("world size must be >= 1"));
    }
    let (to_root, inbox) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = watch::channel((0, Outcome::Done));
    let mut inbox = Some(inbox);
    let mut done_tx = Some(done_tx);
    let handles = (0..world_size)
        .map(|rank| ReplicaHandle {
            rank,
            world_size,
            epoch: 0,
            wait,
            to_root: to_root.clone(),
            inbox: if rank == 0 { inbox.take() } else { None },
            early: Vec::new(),
            done_tx: if rank == 0 { done_tx.take() } else { None },
            done_rx: done_rx.clone(),
        })
        .collect();
    info!("Created replica group of {} (timeout {:?})", world_size, wait);
    Ok(handles)
}

impl<T> ReplicaHandle<T> {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    /// Exchange this epoch's outputs.
    ///
    /// Rank 0 receives every rank's outputs ordered by rank, runs
    /// `aggregate` and returns `Some(result)`. Other ranks return `None`
    /// once rank 0 has finished; they see an error if its aggregation failed.
    pub async fn gather_and_aggregate<A>(
        &mut self,
        outputs: Vec<T>,
        aggregate: impl FnOnce(Vec<Vec<T>>) -> Result<A>,
    ) -> Result<Option<A>> {
        self.epoch += 1;
        let epoch = self.epoch;
        if self.rank != 0 {
            self.to_root
                .send(Contribution {
                    epoch,
                    rank: self.rank,
                    outputs,
                })
                .map_err(|_| ExpertError::TransientIo("rank 0 left the replica group".into()))?;
            self.wait_for_root(epoch).await?;
            return Ok(None);
        }

        let gathered = self.collect(epoch, outputs).await;
        let result = gathered.and_then(aggregate);
        let outcome = if result.is_ok() { Outcome::Done } else { Outcome::Failed };
        if let Some(tx) = &self.done_tx {
            // Only fails when every other rank has dropped its handle
            let _ = tx.send((epoch, outcome));
        }
        match &result {
            Ok(_) => info!("Epoch {} aggregated across {} replicas", epoch, self.world_size),
            Err(e) => warn!("Epoch {} aggregation failed: {}", epoch, e),
        }
        result.map(Some)
    }

    async fn collect(&mut self, epoch: u64, own: Vec<T>) -> Result<Vec<Vec<T>>> {
        let mut slots: Vec<Option<Vec<T>>> = (0..self.world_size).map(|_| None).collect();
        slots[0] = Some(own);
        for c in std::mem::take(&mut self.early) {
            if c.epoch == epoch {
                slots[c.rank] = Some(c.outputs);
            } else {
                self.early.push(c);
            }
        }
        let deadline = Instant::now() + self.wait;
        let inbox = self
            .inbox
            .as_mut()
            .ok_or_else(|| ExpertError::state("rank 0 has no inbox"))?;
        while slots.iter().any(Option::is_none) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let received = timeout(remaining, inbox.recv()).await.map_err(|_| {
                let missing: Vec<usize> = (0..slots.len()).filter(|r| slots[*r].is_none()).collect();
                ExpertError::TransientIo(format!(
                    "timed out after {:?} waiting for ranks {:?} in epoch {}",
                    self.wait, missing, epoch
                ))
            })?;
            let c = received.ok_or_else(|| ExpertError::TransientIo("replica channel closed".into()))?;
            debug!("Rank 0 received epoch {} outputs from rank {}", c.epoch, c.rank);
            if c.epoch == epoch && c.rank < slots.len() {
                slots[c.rank] = Some(c.outputs);
            } else if c.epoch > epoch {
                self.early.push(c);
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }

    async fn wait_for_root(&mut self, epoch: u64) -> Result<()> {
        let outcome = {
            let seen = timeout(self.wait, self.done_rx.wait_for(|(e, _)| *e >= epoch))
                .await
                .map_err(|_| {
                    ExpertError::TransientIo(format!(
                        "rank {} timed out after {:?} waiting for rank 0 in epoch {}",
                        self.rank, self.wait, epoch
                    ))
                })?
                .map_err(|_| ExpertError::TransientIo("rank 0 left the replica group".into()))?;
            seen.1
        };
        match outcome {
            Outcome::Done => Ok(()),
            Outcome::Failed => Err(ExpertError::state(format!("rank 0 failed to aggregate epoch {}", epoch))),
        }
    }
}
