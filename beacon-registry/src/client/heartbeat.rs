//! Background heartbeat loop for a registered client

use chrono::{DateTime, Utc};
use reqwest::Client;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Outcome of one heartbeat tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    Sent {
        name: String,
        at: DateTime<Utc>,
    },
    /// The loop keeps running after a failure; the registry evicts the
    /// record on its own once heartbeats stay missing long enough.
    Failed {
        name: String,
        /// HTTP status when the registry answered, `None` on transport errors
        status: Option<u16>,
        error: String,
    },
}

impl HeartbeatEvent {
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

pub(crate) struct HeartbeatTask {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl HeartbeatTask {
    pub(crate) fn spawn(
        http: Client,
        url: Url,
        name: String,
        period: Duration,
        events: broadcast::Sender<HeartbeatEvent>,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let cancel = cancel_token.clone();

        let handle = tokio::spawn(async move {
            // Registration itself refreshed the timestamp, so the first beat waits a full period
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!(service = %name, "Heartbeat loop stopped");
                        return;
                    }
                    _ = timer.tick() => {
                        let event = send_heartbeat(&http, &url, &name).await;
                        if let HeartbeatEvent::Failed { status, error, .. } = &event {
                            tracing::warn!(service = %name, status = ?status, error = %error, "Heartbeat failed");
                        } else {
                            tracing::debug!(service = %name, "Heartbeat sent");
                        }
                        // No receivers is fine
                        let _ = events.send(event);
                    }
                }
            }
        });

        Self {
            cancel_token,
            handle,
        }
    }

    pub(crate) fn stop(self) {
        self.cancel_token.cancel();
        drop(self.handle);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn send_heartbeat(http: &Client, url: &Url, name: &str) -> HeartbeatEvent {
    match http.post(url.clone()).send().await {
        Ok(response) if response.status().is_success() => HeartbeatEvent::Sent {
            name: name.to_string(),
            at: Utc::now(),
        },
        Ok(response) => HeartbeatEvent::Failed {
            name: name.to_string(),
            status: Some(response.status().as_u16()),
            error: format!("registry answered {}", response.status()),
        },
        Err(e) => HeartbeatEvent::Failed {
            name: name.to_string(),
            status: None,
            error: e.to_string(),
        },
    }
}
