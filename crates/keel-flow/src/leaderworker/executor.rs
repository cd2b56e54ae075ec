//! Worker-side task listener.
//!
//! Each registered worker watches its own assignment prefix. A new key starts
//! the worker's handlers with a [`TaskContext`] whose token lives as long as
//! the key; deleting the key cancels it. When the handlers return, the worker
//! deletes the key itself, which is what frees the task on the leader.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use keel_core::coord::watch::{PrefixEvent, spawn_prefix_watch};
use keel_core::coord::{KeyValue, WatchEventKind};
use keel_core::observability::dispatch_span;
use keel_core::LogicTaskId;

use super::LeaderWorker;
use super::types::{LogicTask, TaskContext, Worker};

const TASK_WATCH_CAPACITY: usize = 256;

struct RunningTask {
    generation: u64,
    cancel: CancellationToken,
}

struct Completion {
    task: LogicTaskId,
    generation: u64,
}

impl LeaderWorker {
    /// Runs until `token` is cancelled, executing every task assigned to `worker`.
    pub(crate) async fn run_task_listener(self: Arc<Self>, worker: Worker, token: CancellationToken) {
        let prefix = self.keys.worker_tasks_prefix(&worker.id);
        let mut events = spawn_prefix_watch(
            Arc::clone(&self.store),
            prefix,
            TASK_WATCH_CAPACITY,
            self.config.store_retry_interval,
            token.clone(),
        );
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut running: HashMap<LogicTaskId, RunningTask> = HashMap::new();
        let mut next_generation = 0_u64;

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                Some(done) = done_rx.recv() => {
                    if running.get(&done.task).is_some_and(|r| r.generation == done.generation) {
                        running.remove(&done.task);
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        PrefixEvent::Snapshot(kvs) => {
                            let present: Vec<LogicTaskId> = kvs
                                .iter()
                                .filter_map(|kv| self.keys.parse_assignment_key(&kv.key))
                                .map(|(_, task)| task)
                                .collect();
                            running.retain(|task, run| {
                                let keep = present.contains(task);
                                if !keep {
                                    run.cancel.cancel();
                                }
                                keep
                            });
                            for kv in kvs {
                                self.start_if_idle(&worker, &token, &done_tx, &mut running, &mut next_generation, kv);
                            }
                        }
                        PrefixEvent::Change(change) => match change.kind {
                            WatchEventKind::Put => {
                                self.start_if_idle(&worker, &token, &done_tx, &mut running, &mut next_generation, change.kv);
                            }
                            WatchEventKind::Delete => {
                                if let Some((_, task)) = self.keys.parse_assignment_key(&change.kv.key) {
                                    if let Some(run) = running.remove(&task) {
                                        tracing::info!(logic_task_id = %task, "assignment removed, cancelling task");
                                        run.cancel.cancel();
                                    }
                                }
                            }
                        },
                    }
                }
            }
        }

        for (_, run) in running {
            run.cancel.cancel();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn start_if_idle(
        self: &Arc<Self>,
        worker: &Worker,
        token: &CancellationToken,
        done_tx: &mpsc::UnboundedSender<Completion>,
        running: &mut HashMap<LogicTaskId, RunningTask>,
        next_generation: &mut u64,
        kv: KeyValue,
    ) {
        let Some((_, task_id)) = self.keys.parse_assignment_key(&kv.key) else {
            tracing::warn!(key = %kv.key, "ignoring unparsable assignment key");
            return;
        };
        if running.contains_key(&task_id) {
            // Overwrites of an in-flight assignment are idempotent.
            return;
        }

        *next_generation += 1;
        let generation = *next_generation;
        let cancel = token.child_token();
        running.insert(
            task_id.clone(),
            RunningTask {
                generation,
                cancel: cancel.clone(),
            },
        );

        let this = Arc::clone(self);
        let handlers = worker.handlers().to_vec();
        let ctx = TaskContext::new(worker.id.clone(), cancel);
        let task = LogicTask::new(task_id.clone(), kv.value);
        let done_tx = done_tx.clone();
        let span = dispatch_span("execute", task_id.as_str());

        tokio::spawn(
            async move {
                tracing::info!("task started");
                for handler in &handlers {
                    if ctx.is_cancelled() {
                        break;
                    }
                    if let Err(e) = handler.handle(ctx.clone(), task.clone()).await {
                        tracing::error!(error = %e, "task handler failed");
                    }
                }

                if ctx.is_cancelled() {
                    tracing::info!("task cancelled");
                } else {
                    this.release_assignment(&ctx, &task.id).await;
                    tracing::info!("task finished");
                }
                let _ = done_tx.send(Completion {
                    task: task.id,
                    generation,
                });
            }
            .instrument(span),
        );
    }

    /// Deletes the assignment key once the task is done, retrying transient failures.
    async fn release_assignment(&self, ctx: &TaskContext, task: &LogicTaskId) {
        let key = self.keys.assignment_key(ctx.worker_id(), task);
        let cancel = ctx.cancellation_token();
        loop {
            match self.store.delete(&key).await {
                Ok(_) => return,
                Err(e) => tracing::warn!(error = %e, "failed to delete assignment key, retrying"),
            }
            if super::registry::sleep_or_cancel(self.config.store_retry_interval, cancel).await {
                return;
            }
        }
    }
}
