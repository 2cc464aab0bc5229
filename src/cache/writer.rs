//! Batched write path for the cache store.
//!
//! All mutations funnel through a single [`BatchWriter`] task.  The first
//! write to arrive opens a commit window of `commit_delay`; everything that
//! lands inside the window is applied in one redb write transaction, and
//! every caller is acknowledged only after that transaction commits.
//!
//! Because the writer is the sole committer, writes to the same key are
//! applied in arrival order and the last committed `set` wins.  A crash
//! inside the window loses the uncommitted batch; entries are rebuilt by
//! the next evaluation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

use super::envelope::{self, Decoded};

/// The single table holding cache entries.
pub const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// A mutation queued for the next commit.
#[derive(Debug)]
pub enum WriteOp {
    Put { key: String, value: Vec<u8> },
    Remove { key: String },
    /// Remove `key` only if the value committed under it is no longer live
    /// at `now_ms`.  A newer `set` that commits first survives.
    RemoveIfStale { key: String, now_ms: u64 },
    /// Commits nothing; acknowledged once everything queued before it is durable.
    Barrier,
}

struct PendingWrite {
    op: WriteOp,
    done: oneshot::Sender<Result<(), String>>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable sender side of the writer task.
#[derive(Debug, Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<PendingWrite>,
}

impl WriteHandle {
    /// Queue `op` and wait until the batch containing it has committed.
    pub async fn submit(&self, op: WriteOp) -> Result<()> {
        let (done, committed) = oneshot::channel();
        self.tx
            .send(PendingWrite { op, done })
            .map_err(|_| anyhow!("cache writer has shut down"))?;
        committed
            .await
            .context("cache writer dropped a pending write")?
            .map_err(|e| anyhow!(e))
    }

    /// A handle whose writer is already gone; every submit fails.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { tx }
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

pub struct BatchWriter {
    db: Arc<Database>,
    rx: mpsc::UnboundedReceiver<PendingWrite>,
    commit_delay: Duration,
}

impl BatchWriter {
    /// Spawn the writer on the current tokio runtime.
    ///
    /// The task runs until every [`WriteHandle`] has been dropped, committing
    /// whatever is still queued before it exits.
    pub fn spawn(db: Arc<Database>, commit_delay: Duration) -> WriteHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = Self {
            db,
            rx,
            commit_delay,
        };
        tokio::spawn(writer.run());
        WriteHandle { tx }
    }

    async fn run(mut self) {
        while let Some(first) = self.rx.recv().await {
            let mut batch = vec![first];

            let window = tokio::time::sleep(self.commit_delay);
            tokio::pin!(window);
            loop {
                tokio::select! {
                    () = &mut window => break,
                    next = self.rx.recv() => match next {
                        Some(pending) => batch.push(pending),
                        None => break,
                    },
                }
            }

            self.commit(batch).await;
        }
        debug!("cache writer stopped");
    }

    async fn commit(&self, batch: Vec<PendingWrite>) {
        let (ops, acks): (Vec<WriteOp>, Vec<_>) =
            batch.into_iter().map(|p| (p.op, p.done)).unzip();
        let count = ops.len();

        let db = Arc::clone(&self.db);
        let result = tokio::task::spawn_blocking(move || commit_ops(&db, &ops))
            .await
            .map_err(|e| anyhow!("commit task panicked: {e}"))
            .and_then(|r| r);

        let outcome = match result {
            Ok(()) => {
                trace!(count, "cache batch committed");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, count, "cache batch commit failed");
                Err(format!("{e:#}"))
            }
        };

        for ack in acks {
            // The caller may have given up waiting; nothing to do then.
            let _ = ack.send(outcome.clone());
        }
    }
}

fn commit_ops(db: &Database, ops: &[WriteOp]) -> Result<()> {
    let txn = db
        .begin_write()
        .context("failed to begin write transaction")?;
    {
        let mut table = txn
            .open_table(ENTRIES)
            .context("failed to open entries table")?;
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    table
                        .insert(key.as_str(), value.as_slice())
                        .with_context(|| format!("failed to insert key {key}"))?;
                }
                WriteOp::Remove { key } => {
                    table
                        .remove(key.as_str())
                        .with_context(|| format!("failed to remove key {key}"))?;
                }
                WriteOp::RemoveIfStale { key, now_ms } => {
                    let stale = table
                        .get(key.as_str())
                        .with_context(|| format!("failed to read key {key}"))?
                        .is_some_and(|current| {
                            !matches!(envelope::decode(current.value(), *now_ms), Decoded::Live(_))
                        });
                    if stale {
                        table
                            .remove(key.as_str())
                            .with_context(|| format!("failed to remove key {key}"))?;
                    }
                }
                WriteOp::Barrier => {}
            }
        }
    }
    txn.commit().context("failed to commit write transaction")?;
    Ok(())
}
