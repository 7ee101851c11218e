//! WorkerGroup - 複数ワーカーで pending task を消化する
//!
//! - `request_shutdown()` で新しい claim を止める（実行中の task は完走）
//! - `abort()` は実行中の task もキャンセルする（mount は必ず解放される）
//! - `shutdown_and_join()` で全ワーカーの終了を待てる

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::app::orchestrator::TaskOrchestrator;
use crate::cancel::{CancelHandle, CancelSignal};
use crate::domain::WorkerId;

/// Idle wait between `claim_next` attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    cancel: CancelHandle,
    workers: Vec<WorkerId>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers.
    pub fn spawn(n: usize, orchestrator: Arc<TaskOrchestrator>, poll_interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cancel = CancelHandle::new();

        let mut workers = Vec::with_capacity(n);
        let mut joins = Vec::with_capacity(n);
        for _ in 0..n {
            let worker = orchestrator.ids().generate_worker_id();
            let o = Arc::clone(&orchestrator);
            let mut rx = shutdown_rx.clone();
            let signal = cancel.signal();
            let id = worker.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(id, o, &mut rx, signal, poll_interval).await;
            }));
            workers.push(worker);
        }

        Self {
            shutdown_tx,
            cancel,
            workers,
            joins,
        }
    }

    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.workers
    }

    /// Stop taking new tasks.
    pub fn request_shutdown(&self) {
        // receiver が既に drop されていても構わない
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop taking new tasks and cancel the ones in flight.
    pub fn abort(&self) {
        self.request_shutdown();
        self.cancel.cancel();
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}

async fn worker_loop(
    worker: WorkerId,
    orchestrator: Arc<TaskOrchestrator>,
    shutdown_rx: &mut watch::Receiver<bool>,
    cancel: CancelSignal,
    poll_interval: Duration,
) {
    info!(%worker, "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let now = orchestrator.clock.now();
        let claimed = match orchestrator.store().claim_next(&worker, now).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(%worker, error = %e, "claim failed");
                None
            }
        };

        let Some(task) = claimed else {
            // 何もないので少し待つ。shutdown が来たら即座に抜ける
            // (WorkerGroup が drop された場合も同様)
            tokio::select! {
                r = shutdown_rx.changed() => {
                    if r.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
            continue;
        };

        let id = task.id().clone();
        match orchestrator.execute(task, &cancel).await {
            Ok(done) => debug!(%worker, task_id = %id, status = %done.status(), "task finished"),
            Err(e) => error!(%worker, task_id = %id, error = %e, "could not record task result"),
        }
    }
    info!(%worker, "worker stopped");
}
