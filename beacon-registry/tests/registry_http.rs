//! End-to-end tests: a real registry server on a loopback port driven by
//! `RegistryClient`, plus wiremock-backed failure cases.

use beacon_core::{RegistryConfig, ServerConfig};
use beacon_registry::{
    HeartbeatEvent, RegistryClient, RegistryServer, RegistryStore,
    ServiceRegistration,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn start_registry() -> (SocketAddr, CancellationToken, RegistryStore) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RegistryServer::new(ServerConfig::default(), RegistryConfig::default());
    let cancel = server.cancel_token();
    let store = server.store().clone();
    tokio::spawn(server.serve(listener));
    (addr, cancel, store)
}

async fn next_event(events: &mut broadcast::Receiver<HeartbeatEvent>) -> HeartbeatEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no heartbeat event within 5s")
        .expect("heartbeat channel closed")
}

#[tokio::test]
async fn register_discover_list_unregister() {
    let (addr, cancel, store) = start_registry().await;
    let base = format!("http://{addr}");

    let orders = RegistryClient::new(
        &base,
        ServiceRegistration::new("orders", "http://orders:4100")
            .with_health_check_url("http://orders:4100/health")
            .with_metadata("version", "2.1.0"),
    )
    .unwrap();
    let billing =
        RegistryClient::new(&base, ServiceRegistration::new("billing", "http://billing:4200"))
            .unwrap();

    assert!(orders.register().await);
    assert!(billing.register().await);
    assert!(orders.is_registered());
    assert_eq!(store.count(), 2);

    let found = billing.discover("orders").await.unwrap();
    assert_eq!(found.name, "orders");
    assert_eq!(found.url, "http://orders:4100");
    assert_eq!(
        found.health_check_url.as_deref(),
        Some("http://orders:4100/health")
    );
    assert_eq!(found.metadata["version"], "2.1.0");

    let all = orders.list_all().await;
    assert_eq!(all.len(), 2);
    assert!(all.contains_key("billing"));

    assert!(orders.unregister().await);
    assert!(!orders.is_registered());
    assert!(!orders.is_heartbeating());
    assert!(billing.discover("orders").await.is_none());
    assert_eq!(store.count(), 1);

    billing.shutdown();
    cancel.cancel();
}

#[tokio::test]
async fn heartbeat_loop_refreshes_record() {
    let (addr, cancel, store) = start_registry().await;

    let client = RegistryClient::new(
        &format!("http://{addr}"),
        ServiceRegistration::new("orders", "http://orders:4100"),
    )
    .unwrap()
    .with_heartbeat_interval(Duration::from_millis(50));
    let mut events = client.heartbeat_events();

    assert!(client.register().await);
    let registered_at = store.get("orders").unwrap().last_heartbeat;

    match next_event(&mut events).await {
        HeartbeatEvent::Sent { name, .. } => assert_eq!(name, "orders"),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(!next_event(&mut events).await.is_failure());

    let refreshed = store.get("orders").unwrap().last_heartbeat;
    assert!(refreshed >= registered_at);

    // A second register reuses the running loop
    assert!(client.register().await);
    assert!(client.is_heartbeating());

    assert!(client.unregister().await);
    cancel.cancel();
}

#[tokio::test]
async fn discover_unknown_and_unreachable_both_yield_none() {
    let (addr, cancel, _store) = start_registry().await;
    let client = RegistryClient::new(
        &format!("http://{addr}"),
        ServiceRegistration::new("orders", "http://orders:4100"),
    )
    .unwrap();

    assert!(client.discover("missing").await.is_none());
    assert!(client.lookup("missing").await.unwrap().is_none());

    // Closed port: bind, note the address, release it
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let offline = RegistryClient::new(
        &format!("http://{closed}"),
        ServiceRegistration::new("orders", "http://orders:4100"),
    )
    .unwrap();

    assert!(offline.discover("orders").await.is_none());
    assert!(offline.lookup("orders").await.is_err());
    assert!(offline.list_all().await.is_empty());
    assert!(!offline.register().await);
    assert!(!offline.is_registered());
    assert!(!offline.is_heartbeating());

    cancel.cancel();
}

#[tokio::test]
async fn rejected_registration_reports_false() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/register"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&mock)
        .await;

    let client = RegistryClient::new(
        &mock.uri(),
        ServiceRegistration::new("orders", "http://orders:4100"),
    )
    .unwrap();

    assert!(!client.register().await);
    assert!(!client.is_heartbeating());
}

#[tokio::test]
async fn failed_heartbeats_are_reported_and_loop_continues() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/register"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&mock)
        .await;
    Mock::given(method("POST"))
        .and(path("/heartbeat/orders"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/services/orders"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock)
        .await;

    let client = RegistryClient::new(
        &mock.uri(),
        ServiceRegistration::new("orders", "http://orders:4100"),
    )
    .unwrap()
    .with_heartbeat_interval(Duration::from_millis(30));
    let mut events = client.heartbeat_events();

    assert!(client.register().await);

    for _ in 0..2 {
        match next_event(&mut events).await {
            HeartbeatEvent::Failed { name, status, .. } => {
                assert_eq!(name, "orders");
                assert_eq!(status, Some(500));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(client.is_registered());
    assert!(client.is_heartbeating());

    // Already evicted on the registry side still counts as unregistered
    assert!(client.unregister().await);
    assert!(!client.is_heartbeating());
}

#[tokio::test]
async fn lookup_surfaces_registry_errors() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services/orders"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock)
        .await;

    let client = RegistryClient::new(
        &mock.uri(),
        ServiceRegistration::new("billing", "http://billing:4200"),
    )
    .unwrap();

    assert!(matches!(
        client.lookup("orders").await,
        Err(beacon_core::Error::Transport(_))
    ));
    assert!(client.discover("orders").await.is_none());
}
