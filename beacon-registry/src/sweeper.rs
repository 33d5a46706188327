//! Periodic staleness sweep
//!
//! Owned by the registry host, not by the store: the store only evicts when
//! asked, and this task is one of the things that asks.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::store::RegistryStore;

pub struct StaleSweeper {
    store: RegistryStore,
    max_age_secs: u64,
    period: Duration,
    cancel_token: CancellationToken,
}

impl StaleSweeper {
    #[must_use]
    pub fn new(store: RegistryStore, max_age_secs: u64, period: Duration) -> Self {
        Self {
            store,
            max_age_secs,
            period,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Use an externally owned token so the sweep stops with its owner
    #[must_use]
    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Spawn the sweep loop. The first sweep runs one `period` after start.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + self.period, self.period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                period_secs = self.period.as_secs(),
                max_age_secs = self.max_age_secs,
                "Stale service sweeper started"
            );

            loop {
                tokio::select! {
                    () = self.cancel_token.cancelled() => {
                        tracing::info!("Stale service sweeper shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        let evicted = self.store.remove_stale_services(self.max_age_secs);
                        if !evicted.is_empty() {
                            tracing::info!(count = evicted.len(), "Sweep evicted stale services");
                        }
                    }
                }
            }
        })
    }
}
