//! Registry client
//!
//! Façade a service uses to register itself, keep its record alive and find
//! its peers. Registry reachability problems are logged and swallowed so a
//! registry outage degrades discovery instead of failing the caller:
//!
//! - [`RegistryClient::register`] / [`RegistryClient::unregister`] report `false`
//! - [`RegistryClient::discover`] reports `None` for both "no such service" and
//!   "registry unreachable"; use [`RegistryClient::lookup`] to tell them apart
//! - [`RegistryClient::list_all`] reports an empty map

mod heartbeat;

pub use heartbeat::HeartbeatEvent;

use beacon_core::{ClientConfig, Error, Result};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use crate::types::{Metadata, RegisterRequest, ServiceRecord};
use heartbeat::HeartbeatTask;

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_EVENT_CAPACITY: usize = 64;

/// What a service announces about itself
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRegistration {
    pub name: String,
    pub url: String,
    pub health_check_url: Option<String>,
    pub metadata: Metadata,
}

impl ServiceRegistration {
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            health_check_url: None,
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn to_request(&self) -> RegisterRequest {
        RegisterRequest {
            name: Some(self.name.clone()),
            url: Some(self.url.clone()),
            health_check_url: self.health_check_url.clone(),
            metadata: Some(self.metadata.clone()),
        }
    }
}

pub struct RegistryClient {
    base_url: Url,
    http: Client,
    registration: ServiceRegistration,
    heartbeat_interval: Duration,
    registered: AtomicBool,
    heartbeat: Mutex<Option<HeartbeatTask>>,
    events: broadcast::Sender<HeartbeatEvent>,
}

impl RegistryClient {
    /// Create a client for the registry at `registry_url`
    pub fn new(registry_url: &str, registration: ServiceRegistration) -> Result<Self> {
        Self::build(registry_url, registration, DEFAULT_HEARTBEAT_INTERVAL, None)
    }

    pub fn from_config(config: &ClientConfig, registration: ServiceRegistration) -> Result<Self> {
        Self::build(
            &config.registry_url,
            registration,
            config.heartbeat_interval(),
            config.request_timeout(),
        )
    }

    fn build(
        registry_url: &str,
        registration: ServiceRegistration,
        heartbeat_interval: Duration,
        request_timeout: Option<Duration>,
    ) -> Result<Self> {
        let base_url = Url::parse(registry_url).map_err(|e| {
            Error::Configuration(format!("Invalid registry URL '{registry_url}': {e}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Configuration(format!(
                "Registry URL '{registry_url}' cannot be used as a base URL"
            )));
        }
        if heartbeat_interval.is_zero() {
            return Err(Error::Configuration(
                "Heartbeat interval must be greater than zero".to_string(),
            ));
        }

        let mut builder = Client::builder();
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {e}")))?;

        let (events, _) = broadcast::channel(HEARTBEAT_EVENT_CAPACITY);

        Ok(Self {
            base_url,
            http,
            registration,
            heartbeat_interval,
            registered: AtomicBool::new(false),
            heartbeat: Mutex::new(None),
            events,
        })
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.heartbeat_interval = interval;
        }
        self
    }

    #[must_use]
    pub fn registration(&self) -> &ServiceRegistration {
        &self.registration
    }

    /// Whether the last `register` succeeded and no `unregister` followed
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Whether the heartbeat loop is currently running
    #[must_use]
    pub fn is_heartbeating(&self) -> bool {
        self.heartbeat
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Subscribe to heartbeat outcomes
    #[must_use]
    pub fn heartbeat_events(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.events.subscribe()
    }

    /// Announce this service to the registry and start heartbeating.
    ///
    /// Returns `false` (after logging) on a non-success response or transport
    /// error. Nothing is retried.
    pub async fn register(&self) -> bool {
        let url = match self.endpoint(&["register"]) {
            Ok(url) => url,
            Err(e) => {
                warn!(service = %self.registration.name, error = %e, "Registration failed");
                return false;
            }
        };

        match self
            .http
            .post(url)
            .json(&self.registration.to_request())
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                self.registered.store(true, Ordering::SeqCst);
                self.start_heartbeat();
                info!(
                    service = %self.registration.name,
                    url = %self.registration.url,
                    "Registered with service registry"
                );
                true
            }
            Ok(response) => {
                warn!(
                    service = %self.registration.name,
                    status = %response.status(),
                    "Registry rejected registration"
                );
                false
            }
            Err(e) => {
                warn!(service = %self.registration.name, error = %e, "Registration failed");
                false
            }
        }
    }

    /// Fetch a service by name, `None` when it is absent or the registry is unreachable
    pub async fn discover(&self, name: &str) -> Option<ServiceRecord> {
        match self.lookup(name).await {
            Ok(record) => {
                if record.is_none() {
                    debug!(service = %name, "Service not found in registry");
                }
                record
            }
            Err(e) => {
                warn!(service = %name, error = %e, "Service discovery failed");
                None
            }
        }
    }

    /// Fetch a service by name, keeping "not found" (`Ok(None)`) apart from
    /// registry failures (`Err`)
    pub async fn lookup(&self, name: &str) -> Result<Option<ServiceRecord>> {
        let url = self.endpoint(&["services", name])?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::transport(format!("Registry request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<ServiceRecord>()
                .await
                .map(Some)
                .map_err(|e| Error::transport(format!("Invalid registry response: {e}"))),
            status => Err(Error::transport(format!("Registry returned status {status}"))),
        }
    }

    /// Fetch every registered service, empty on any failure
    pub async fn list_all(&self) -> HashMap<String, ServiceRecord> {
        match self.fetch_all().await {
            Ok(services) => services,
            Err(e) => {
                warn!(error = %e, "Failed to list services");
                HashMap::new()
            }
        }
    }

    async fn fetch_all(&self) -> Result<HashMap<String, ServiceRecord>> {
        let url = self.endpoint(&["services"])?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::transport(format!("Registry request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::transport(format!(
                "Registry returned status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::transport(format!("Invalid registry response: {e}")))
    }

    /// Stop heartbeating and delete this service's record.
    ///
    /// A no-op returning `true` when the client never registered. A record the
    /// registry already evicted (404) counts as removed.
    pub async fn unregister(&self) -> bool {
        self.stop_heartbeat();

        if !self.is_registered() {
            return true;
        }

        let url = match self.endpoint(&["services", &self.registration.name]) {
            Ok(url) => url,
            Err(e) => {
                warn!(service = %self.registration.name, error = %e, "Unregistration failed");
                return false;
            }
        };

        match self.http.delete(url).send().await {
            Ok(response)
                if response.status().is_success() || response.status() == StatusCode::NOT_FOUND =>
            {
                self.registered.store(false, Ordering::SeqCst);
                info!(service = %self.registration.name, "Unregistered from service registry");
                true
            }
            Ok(response) => {
                warn!(
                    service = %self.registration.name,
                    status = %response.status(),
                    "Registry rejected unregistration"
                );
                false
            }
            Err(e) => {
                warn!(service = %self.registration.name, error = %e, "Unregistration failed");
                false
            }
        }
    }

    /// Stop heartbeating without touching the registry record
    pub fn shutdown(&self) {
        self.stop_heartbeat();
    }

    fn start_heartbeat(&self) {
        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let url = match self.endpoint(&["heartbeat", &self.registration.name]) {
            Ok(url) => url,
            Err(e) => {
                warn!(service = %self.registration.name, error = %e, "Cannot start heartbeat loop");
                return;
            }
        };

        *heartbeat = Some(HeartbeatTask::spawn(
            self.http.clone(),
            url,
            self.registration.name.clone(),
            self.heartbeat_interval,
            self.events.clone(),
        ));
        debug!(
            service = %self.registration.name,
            interval_secs = self.heartbeat_interval.as_secs_f64(),
            "Heartbeat loop started"
        );
    }

    fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat.lock().take() {
            task.stop();
        }
    }

    /// Registry URL with `segments` appended, each percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Configuration("Registry URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

impl Drop for RegistryClient {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> RegistryClient {
        RegistryClient::new(base, ServiceRegistration::new("orders", "http://orders:4100")).unwrap()
    }

    #[test]
    fn test_endpoint_joins_and_encodes() {
        let c = client("http://registry:3000");
        assert_eq!(
            c.endpoint(&["services", "orders"]).unwrap().as_str(),
            "http://registry:3000/services/orders"
        );

        let c = client("http://registry:3000/api/");
        assert_eq!(
            c.endpoint(&["heartbeat", "a b/c"]).unwrap().as_str(),
            "http://registry:3000/api/heartbeat/a%20b%2Fc"
        );
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        let registration = ServiceRegistration::new("orders", "http://orders:4100");
        assert!(matches!(
            RegistryClient::new("not a url", registration.clone()),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            RegistryClient::new("mailto:ops@example.com", registration.clone()),
            Err(Error::Configuration(_))
        ));

        let config = ClientConfig {
            heartbeat_interval_secs: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(
            RegistryClient::from_config(&config, registration),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_registration_builder() {
        let registration = ServiceRegistration::new("orders", "http://orders:4100")
            .with_health_check_url("http://orders:4100/health")
            .with_metadata("version", "2.1.0")
            .with_metadata("replicas", 3);

        let request = registration.to_request();
        assert_eq!(request.name.as_deref(), Some("orders"));
        assert_eq!(
            request.health_check_url.as_deref(),
            Some("http://orders:4100/health")
        );
        let metadata = request.metadata.unwrap();
        assert_eq!(metadata["version"], "2.1.0");
        assert_eq!(metadata["replicas"], 3);
    }

    #[tokio::test]
    async fn test_unregister_without_register_is_noop() {
        // Nothing listens here; a request would fail
        let c = client("http://127.0.0.1:9");
        assert!(!c.is_registered());
        assert!(c.unregister().await);
    }
}
