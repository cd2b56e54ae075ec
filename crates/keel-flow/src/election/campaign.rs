//! Campaign loop: `NotLeader → Campaigning → Leader → NotLeader`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use keel_core::observability::leader_span;

use super::{LeaderElector, LeadershipResult, RenewalResult};
use crate::config::LeaderConfig;
use crate::metrics::EngineMetrics;

/// Leadership state of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    /// Not campaigning.
    NotLeader,
    /// Trying to acquire the election key.
    Campaigning,
    /// Holding the election key; leader callbacks are running.
    Leader,
}

impl LeaderState {
    /// Returns the state as a metrics label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotLeader => "not_leader",
            Self::Campaigning => "campaigning",
            Self::Leader => "leader",
        }
    }
}

type LeaderCallback = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs leader callbacks on at most one process at a time.
pub struct Campaign {
    elector: Arc<dyn LeaderElector>,
    lock_key: String,
    instance_id: String,
    config: LeaderConfig,
    metrics: EngineMetrics,
    callbacks: Mutex<Vec<LeaderCallback>>,
    state: watch::Sender<LeaderState>,
    terms: AtomicU64,
}

impl std::fmt::Debug for Campaign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Campaign")
            .field("lock_key", &self.lock_key)
            .field("instance_id", &self.instance_id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Campaign {
    /// Creates a campaign for `config.lock_key` under the given instance ID.
    #[must_use]
    pub fn new(
        elector: Arc<dyn LeaderElector>,
        instance_id: impl Into<String>,
        config: LeaderConfig,
        metrics: EngineMetrics,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(LeaderState::NotLeader);
        Arc::new(Self {
            elector,
            lock_key: config.lock_key.clone(),
            instance_id: instance_id.into(),
            config,
            metrics,
            callbacks: Mutex::new(Vec::new()),
            state,
            terms: AtomicU64::new(0),
        })
    }

    /// This process's election identity.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Registers a callback run at the start of every leadership term.
    ///
    /// The callback receives the term's token, which is cancelled when
    /// leadership is lost or the campaign shuts down. The next term starts
    /// only after the callback has returned. Callbacks registered during a
    /// term first run in the next one.
    pub fn on_leader<F, Fut>(&self, callback: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: LeaderCallback =
            Arc::new(move |term| -> BoxFuture<'static, ()> { Box::pin(callback(term)) });
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    /// Returns true while this process leads.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.state() == LeaderState::Leader
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    /// Number of terms this process has led so far.
    #[must_use]
    pub fn terms(&self) -> u64 {
        self.terms.load(Ordering::SeqCst)
    }

    fn transition(&self, state: LeaderState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = previous.as_str(), to = state.as_str(), "leader state changed");
            self.metrics.record_leader_transition(state.as_str());
        }
    }

    /// Campaigns until `shutdown` is cancelled.
    ///
    /// On shutdown while leading, the current term is torn down and the
    /// lease released so another process can take over at once.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            self.transition(LeaderState::Campaigning);
            match self
                .elector
                .try_acquire(&self.lock_key, &self.instance_id)
                .await
            {
                Ok(LeadershipResult::Acquired {
                    lease_token,
                    lease_duration,
                }) => {
                    let term = self.terms.fetch_add(1, Ordering::SeqCst) + 1;
                    self.lead(&lease_token, lease_duration, &shutdown)
                        .instrument(leader_span(term))
                        .await;
                    self.transition(LeaderState::NotLeader);
                }
                Ok(LeadershipResult::NotLeader { current_leader }) => {
                    tracing::trace!(?current_leader, "election key held elsewhere");
                }
                Err(e) => tracing::warn!(error = %e, "campaign attempt failed"),
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.campaign_retry_interval) => {}
            }
        }
        self.transition(LeaderState::NotLeader);
    }

    async fn lead(&self, lease_token: &str, lease_duration: Duration, shutdown: &CancellationToken) {
        let term = shutdown.child_token();
        self.transition(LeaderState::Leader);
        tracing::info!(instance_id = %self.instance_id, "became leader");

        let callbacks: Vec<LeaderCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let handles: Vec<_> = callbacks
            .iter()
            .map(|callback| tokio::spawn(callback(term.clone()).in_current_span()))
            .collect();

        let mut deadline = Instant::now() + lease_duration;
        let mut ticker = tokio::time::interval(self.config.renew_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = term.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let sent = Instant::now();
            match self.elector.renew(&self.lock_key, lease_token).await {
                Ok(RenewalResult::Renewed { lease_duration }) => deadline = sent + lease_duration,
                Ok(result) => {
                    tracing::warn!(?result, "leadership lost");
                    break;
                }
                Err(e) if Instant::now() >= deadline => {
                    tracing::warn!(error = %e, "lease deadline passed without renewal");
                    break;
                }
                Err(e) => tracing::warn!(error = %e, "lease renewal failed, retrying"),
            }
        }

        term.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "leader callback panicked");
            }
        }

        if shutdown.is_cancelled() {
            if let Err(e) = self.elector.release(&self.lock_key, lease_token).await {
                tracing::warn!(error = %e, "failed to release leadership");
            }
        }
        tracing::info!("leadership term ended");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use keel_core::coord::CoordinationStore;
    use keel_core::coord::memory::InMemoryCoordinationStore;

    use super::*;
    use crate::election::StoreLeaderElector;
    use crate::keys::KeyLayout;

    fn config() -> LeaderConfig {
        LeaderConfig {
            lease_ttl: Duration::from_millis(300),
            renew_interval: Duration::from_millis(50),
            campaign_retry_interval: Duration::from_millis(20),
            ..LeaderConfig::default()
        }
    }

    fn campaign(store: &Arc<InMemoryCoordinationStore>, id: &str) -> Arc<Campaign> {
        let elector = StoreLeaderElector::new(
            store.clone(),
            KeyLayout::new("/test").unwrap(),
            config().lease_ttl,
        );
        Campaign::new(Arc::new(elector), id, config(), EngineMetrics::new())
    }

    async fn wait_for(rx: &mut watch::Receiver<LeaderState>, state: LeaderState) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state reached in time")
            .expect("campaign alive");
    }

    #[tokio::test]
    async fn exactly_one_campaign_leads() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let a = campaign(&store, "a");
        let b = campaign(&store, "b");
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        for c in [&a, &b] {
            let active = active.clone();
            let max_active = max_active.clone();
            c.on_leader(move |term| {
                let active = active.clone();
                let max_active = max_active.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    term.cancelled().await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }

        let shutdown_a = CancellationToken::new();
        let shutdown_b = CancellationToken::new();
        let mut state_a = a.subscribe_state();
        let run_a = tokio::spawn(a.clone().run(shutdown_a.clone()));
        wait_for(&mut state_a, LeaderState::Leader).await;
        let run_b = tokio::spawn(b.clone().run(shutdown_b.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!b.is_leader());
        assert_eq!(b.state(), LeaderState::Campaigning);

        // Shutting the leader down hands leadership over.
        let mut state_b = b.subscribe_state();
        shutdown_a.cancel();
        run_a.await.unwrap();
        assert_eq!(a.state(), LeaderState::NotLeader);
        wait_for(&mut state_b, LeaderState::Leader).await;

        shutdown_b.cancel();
        run_b.await.unwrap();
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert_eq!(a.terms() + b.terms(), 2);
    }

    #[tokio::test]
    async fn lost_key_cancels_term_and_recampaigns() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let c = campaign(&store, "a");
        let (term_tx, mut term_rx) = tokio::sync::mpsc::unbounded_channel();
        c.on_leader(move |term| {
            let term_tx = term_tx.clone();
            async move {
                let _ = term_tx.send(term.clone());
                term.cancelled().await;
            }
        });

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(c.clone().run(shutdown.clone()));
        let first = tokio::time::timeout(Duration::from_secs(5), term_rx.recv())
            .await
            .unwrap()
            .unwrap();

        store.delete("/test/election/leader").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), first.cancelled())
            .await
            .expect("term cancelled after the key vanished");

        let second = tokio::time::timeout(Duration::from_secs(5), term_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!second.is_cancelled());
        assert_eq!(c.terms(), 2);

        shutdown.cancel();
        run.await.unwrap();
        assert!(second.is_cancelled());
    }
}
