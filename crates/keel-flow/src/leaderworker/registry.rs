//! Worker registration, heartbeats, promotion and liveness probing.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use keel_core::coord::{Compare, KeyValue, Txn, TxnOp};
use keel_core::observability::worker_span;
use keel_core::WorkerId;

use super::LeaderWorker;
use super::types::{Worker, WorkerType};
use crate::error::{Error, Result};

/// Handle of a worker registered by this process.
#[derive(Debug, Clone)]
pub struct RegisteredWorker {
    id: WorkerId,
    kind: watch::Receiver<WorkerType>,
    token: CancellationToken,
}

impl RegisteredWorker {
    /// The worker's ID.
    #[must_use]
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// The worker's current registration stage.
    #[must_use]
    pub fn worker_type(&self) -> WorkerType {
        *self.kind.borrow()
    }

    /// Waits until the worker has been promoted to official.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the worker stops first.
    pub async fn wait_official(&self) -> Result<()> {
        let mut kind = self.kind.clone();
        tokio::select! {
            () = self.token.cancelled() => Err(Error::Cancelled),
            changed = kind.wait_for(|k| *k == WorkerType::Official) => {
                changed.map(|_| ()).map_err(|_| Error::Cancelled)
            }
        }
    }

    /// Completes once the worker has stopped: evicted from the registry or shut down.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }

    /// Returns true once the worker has stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A worker entry that failed its readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Unready {
    /// Payload unreadable or missing fields.
    Malformed { key: String },
    /// Heartbeat older than the death threshold (or absent for too long).
    Stale { worker_id: WorkerId },
}

/// Renders a heartbeat timestamp: unix seconds with a millisecond fraction.
pub(crate) fn format_heartbeat(now: DateTime<Utc>) -> String {
    format!("{}.{:03}", now.timestamp(), now.timestamp_subsec_millis())
}

/// Parses a heartbeat timestamp. Integer seconds are accepted too.
pub(crate) fn parse_heartbeat(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let (secs, frac) = value.split_once('.').unwrap_or((value, ""));
    let secs: i64 = secs.parse().ok()?;
    let millis = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().chain("000".chars()).take(3).collect();
        digits.parse::<u32>().ok()?
    };
    DateTime::from_timestamp(secs, millis * 1_000_000)
}

impl LeaderWorker {
    /// Registers a local worker as a candidate.
    ///
    /// Writes the heartbeat and the candidate key (retrying transient store
    /// failures until they succeed), then starts the heartbeat loop, the
    /// promotion timer and the task listener. The returned handle reports
    /// promotion and eviction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires before registration
    /// completes.
    pub async fn register_candidate_worker(
        self: &Arc<Self>,
        worker: Worker,
        cancel: CancellationToken,
    ) -> Result<RegisteredWorker> {
        let worker = worker.with_type(WorkerType::Candidate);
        let id = worker.id.clone();
        let span = worker_span("register", id.as_str());

        async {
            let heartbeat_key = self.keys.heartbeat_key(&id);
            self.retry_until_ok(&cancel, "write initial heartbeat", || {
                self.store
                    .put(&heartbeat_key, Bytes::from(format_heartbeat(Utc::now())))
            })
            .await?;

            let candidate_key = self.keys.worker_key(WorkerType::Candidate, &id);
            let record = worker.to_json()?;
            self.retry_until_ok(&cancel, "write candidate key", || {
                self.store.put(&candidate_key, record.clone())
            })
            .await?;
            tracing::info!("registered candidate worker");
            Ok::<_, Error>(())
        }
        .instrument(span)
        .await?;

        let token = cancel.child_token();
        let (kind_tx, kind_rx) = watch::channel(WorkerType::Candidate);

        tokio::spawn(
            Arc::clone(self)
                .heartbeat_loop(id.clone(), token.clone())
                .instrument(worker_span("heartbeat", id.as_str())),
        );
        tokio::spawn(
            Arc::clone(self)
                .promotion_timer(worker.clone(), kind_tx, token.clone())
                .instrument(worker_span("promote", id.as_str())),
        );
        tokio::spawn(
            Arc::clone(self)
                .run_task_listener(worker, token.clone())
                .instrument(worker_span("execute", id.as_str())),
        );

        Ok(RegisteredWorker {
            id,
            kind: kind_rx,
            token,
        })
    }

    /// Retries a store operation on transient failure until it succeeds.
    async fn retry_until_ok<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = keel_core::Result<T>>,
    {
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "failed to {what}, retrying");
                }
                Err(e) => return Err(e.into()),
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(self.config.store_retry_interval) => {}
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, id: WorkerId, token: CancellationToken) {
        let heartbeat_key = self.keys.heartbeat_key(&id);
        let mut ticker = tokio::time::interval(self.config.heartbeat_report_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The initial heartbeat was written during registration.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.is_registered(&id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::error!(worker_id = %id, "worker no longer registered, stopping");
                    self.metrics.record_worker_evicted("self_check");
                    token.cancel();
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to check registration");
                    continue;
                }
            }

            if let Err(e) = self
                .store
                .put(&heartbeat_key, Bytes::from(format_heartbeat(Utc::now())))
                .await
            {
                tracing::warn!(error = %e, "failed to report heartbeat");
            }
        }
    }

    /// Candidate key first, then official: promotion moves the key atomically,
    /// so one of the two reads observes it.
    async fn is_registered(&self, id: &WorkerId) -> keel_core::Result<bool> {
        if self
            .store
            .get(&self.keys.worker_key(WorkerType::Candidate, id))
            .await?
            .is_some()
        {
            return Ok(true);
        }
        Ok(self
            .store
            .get(&self.keys.worker_key(WorkerType::Official, id))
            .await?
            .is_some())
    }

    async fn promotion_timer(
        self: Arc<Self>,
        worker: Worker,
        kind: watch::Sender<WorkerType>,
        token: CancellationToken,
    ) {
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(self.config.candidate_promotion_threshold) => {}
        }

        let candidate_key = self.keys.worker_key(WorkerType::Candidate, &worker.id);
        let official_key = self.keys.worker_key(WorkerType::Official, &worker.id);
        let record = match worker.with_type(WorkerType::Official).to_json() {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode official record");
                return;
            }
        };
        let promote = Txn::new()
            .when(Compare::Exists(candidate_key))
            .then(TxnOp::Delete {
                key: self.keys.worker_key(WorkerType::Candidate, &worker.id),
            })
            .then(TxnOp::put(official_key, record));

        match self
            .retry_until_ok(&token, "promote worker", || self.store.txn(promote.clone()))
            .await
        {
            Ok(result) if result.succeeded => {
                tracing::info!("promoted worker to official");
                self.metrics.record_worker_promotion();
                kind.send_replace(WorkerType::Official);
            }
            Ok(_) => {
                tracing::warn!("candidate key vanished before promotion");
            }
            Err(Error::Cancelled) => {}
            Err(e) => tracing::error!(error = %e, "failed to promote worker"),
        }
    }

    /// Lists registered workers of the given types that pass the readiness check.
    ///
    /// Entries that fail it (malformed records, stale heartbeats) are deleted
    /// from the store in the background.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a listing fails.
    pub async fn list_workers(self: &Arc<Self>, types: &[WorkerType]) -> Result<Vec<Worker>> {
        let (ready, unready) = self.list_workers_checked(types).await?;
        if !unready.is_empty() {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.remove_unready(unready).await });
        }
        Ok(ready)
    }

    /// Looks up a worker by ID; official first, then candidate.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a read fails or the record is malformed.
    pub async fn get_worker(&self, id: &WorkerId) -> Result<Option<Worker>> {
        for worker_type in [WorkerType::Official, WorkerType::Candidate] {
            let key = self.keys.worker_key(worker_type, id);
            if let Some(kv) = self.store.get(&key).await? {
                return Ok(Some(Worker::from_json(&key, &kv.value)?));
            }
        }
        Ok(None)
    }

    /// Returns true if the worker is official and its heartbeat is fresh.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a read fails.
    pub async fn is_official_and_alive(&self, id: &WorkerId) -> Result<bool> {
        let key = self.keys.worker_key(WorkerType::Official, id);
        let Some(kv) = self.store.get(&key).await? else {
            return Ok(false);
        };
        let Ok(worker) = Worker::from_json(&key, &kv.value) else {
            return Ok(false);
        };
        Ok(!self.is_stale(&worker, Utc::now()).await?)
    }

    pub(crate) async fn list_workers_checked(
        &self,
        types: &[WorkerType],
    ) -> Result<(Vec<Worker>, Vec<Unready>)> {
        let now = Utc::now();
        let mut ready = Vec::new();
        let mut unready = Vec::new();
        for worker_type in types {
            let entries = self
                .store
                .list(&self.keys.worker_type_prefix(*worker_type))
                .await?;
            for kv in entries {
                match self.check_entry(&kv, now).await? {
                    Ok(worker) => ready.push(worker),
                    Err(reason) => unready.push(reason),
                }
            }
        }

        let count_of = |t: WorkerType| ready.iter().filter(|w| w.worker_type == t).count();
        for worker_type in types {
            self.metrics
                .set_workers(worker_type.as_str(), count_of(*worker_type));
        }
        Ok((ready, unready))
    }

    async fn check_entry(
        &self,
        kv: &KeyValue,
        now: DateTime<Utc>,
    ) -> Result<std::result::Result<Worker, Unready>> {
        let worker = match Worker::from_json(&kv.key, &kv.value) {
            Ok(worker) => worker,
            Err(e) => {
                tracing::warn!(key = %kv.key, error = %e, "malformed worker record");
                return Ok(Err(Unready::Malformed {
                    key: kv.key.clone(),
                }));
            }
        };
        if self.is_stale(&worker, now).await? {
            return Ok(Err(Unready::Stale {
                worker_id: worker.id,
            }));
        }
        Ok(Ok(worker))
    }

    async fn is_stale(&self, worker: &Worker, now: DateTime<Utc>) -> Result<bool> {
        let threshold = chrono::Duration::from_std(self.config.death_threshold())
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let last_seen = match self.store.get(&self.keys.heartbeat_key(&worker.id)).await? {
            Some(kv) => kv.value_str().ok().and_then(parse_heartbeat),
            None => None,
        };
        // Without a readable heartbeat, only workers that had time to write one are stale.
        let reference = last_seen.unwrap_or(worker.created_at);
        Ok(now.signed_duration_since(reference) > threshold)
    }

    pub(crate) async fn remove_unready(&self, unready: Vec<Unready>) {
        for entry in unready {
            let result = match &entry {
                Unready::Malformed { key } => self.store.delete(key).await.map(|_| ()),
                Unready::Stale { worker_id } => self.remove_worker_keys(worker_id).await,
            };
            match result {
                Ok(()) => {
                    let reason = match entry {
                        Unready::Malformed { .. } => "malformed",
                        Unready::Stale { .. } => "stale_heartbeat",
                    };
                    tracing::warn!(?entry, "removed unready worker entry");
                    self.metrics.record_worker_evicted(reason);
                }
                Err(e) => tracing::warn!(?entry, error = %e, "failed to remove unready worker entry"),
            }
        }
    }

    /// Deletes a worker's candidate, official and heartbeat keys in one transaction.
    pub(crate) async fn remove_worker_keys(&self, id: &WorkerId) -> keel_core::Result<()> {
        let txn = Txn::new()
            .then(TxnOp::delete(self.keys.worker_key(WorkerType::Candidate, id)))
            .then(TxnOp::delete(self.keys.worker_key(WorkerType::Official, id)))
            .then(TxnOp::delete(self.keys.heartbeat_key(id)));
        self.store.txn(txn).await.map(|_| ())
    }

    /// Leader loop: removes every worker whose heartbeat is stale.
    pub(crate) async fn run_liveness_probe(self: Arc<Self>, term: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.liveness_probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = term.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self
                .list_workers_checked(&[WorkerType::Candidate, WorkerType::Official])
                .await
            {
                Ok((_, unready)) if !unready.is_empty() => self.remove_unready(unready).await,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "liveness probe listing failed"),
            }
        }
    }
}

/// Sleeps for `duration` unless cancelled first. Returns true if cancelled.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(duration) => false,
    }
}
