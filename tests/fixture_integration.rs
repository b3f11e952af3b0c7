//! Integration tests for ServerFixture against real embedded servers
//!
//! These tests bind real loopback ports. Tests using literal ports run
//! serially so they never race each other for the same port.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use coord_testkit::config::ServerSettings;
use coord_testkit::{
    logging, ClientError, ClientState, CreationError, EmbeddedServerFactory, FixtureConfig,
    FixtureError, LifecyclePolicy, Port, RegistryError, RetryPolicy, ServerFactory,
    ServerFixture, SharedResourceRegistry,
};
use serial_test::serial;

const EXCLUSIVE_PORT: Port = Port::new(9500);
const SHARED_PORT: Port = Port::new(9510);
const CONCURRENT_PORT: Port = Port::new(9520);

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(10), 2)
}

fn factory() -> Arc<EmbeddedServerFactory> {
    Arc::new(EmbeddedServerFactory::with_cleanup(true))
}

fn fixture(config: FixtureConfig, factory: &Arc<EmbeddedServerFactory>) -> ServerFixture {
    let factory: Arc<dyn ServerFactory> = factory.clone();
    ServerFixture::new(config, factory)
}

// ============================================================================
// Exclusive Policy Tests
// ============================================================================

#[test]
#[serial(literal_ports)]
fn test_exclusive_double_bind_fails_until_release() {
    logging::try_init();
    let factory = factory();
    let config = FixtureConfig::default()
        .with_port(EXCLUSIVE_PORT)
        .exclusive();

    let a = fixture(config.clone(), &factory);
    a.before().expect("first exclusive fixture starts");

    let b = fixture(config.clone(), &factory);
    let err = b.before().unwrap_err();
    assert!(
        matches!(
            err,
            FixtureError::Registry(RegistryError::Creation(CreationError::Bind { .. }))
        ),
        "unexpected error: {err:?}"
    );
    b.after().expect("teardown of a failed fixture still succeeds");

    a.after().expect("first fixture tears down");

    let c = fixture(config, &factory);
    c.before().expect("port is free again after release");
    assert_eq!(c.bound_port().unwrap(), EXCLUSIVE_PORT);
    c.after().unwrap();
    assert!(factory.pending_cleanup().is_empty());
}

#[test]
fn test_exclusive_auto_ports_are_distinct() {
    let factory = factory();
    let config = FixtureConfig::default().with_port(Port::AUTO).exclusive();

    let a = fixture(config.clone(), &factory).start().unwrap();
    let b = fixture(config, &factory).start().unwrap();

    assert_ne!(a.bound_port().unwrap(), b.bound_port().unwrap());
    a.finish().unwrap();
    b.finish().unwrap();
}

// ============================================================================
// Shared Policy Tests
// ============================================================================

#[test]
#[serial(literal_ports)]
fn test_shared_fixtures_reuse_one_server() {
    logging::try_init();
    let registry = SharedResourceRegistry::global();
    let factory = factory();
    let config = FixtureConfig::default().with_port(SHARED_PORT).shared();

    let a = fixture(config.clone(), &factory);
    a.before().unwrap();
    assert_eq!(registry.refcount(SHARED_PORT), 1);

    let b = fixture(config, &factory);
    b.before().unwrap();
    assert_eq!(registry.refcount(SHARED_PORT), 2);
    assert_eq!(a.bound_port().unwrap(), b.bound_port().unwrap());

    b.after().unwrap();
    assert_eq!(registry.refcount(SHARED_PORT), 1);
    assert_eq!(factory.pending_cleanup().len(), 2, "server still running");

    a.after().unwrap();
    assert!(!registry.contains(SHARED_PORT));
    assert!(factory.pending_cleanup().is_empty());
}

#[test]
fn test_shared_auto_fixtures_get_distinct_servers() {
    let registry = Arc::new(SharedResourceRegistry::new());
    let factory = factory();
    let config = FixtureConfig::default()
        .with_port(Port::AUTO)
        .with_policy(LifecyclePolicy::shared_in(registry.clone()));

    let a = fixture(config.clone(), &factory).start().unwrap();
    let b = fixture(config, &factory).start().unwrap();

    let (pa, pb) = (a.bound_port().unwrap(), b.bound_port().unwrap());
    assert_ne!(pa, pb);
    assert_eq!(registry.refcount(pa), 1);
    assert_eq!(registry.refcount(pb), 1);

    drop(a);
    drop(b);
    assert!(registry.is_empty());
}

#[test]
#[serial(literal_ports)]
fn test_concurrent_shared_fixtures() {
    let registry = SharedResourceRegistry::global();
    let factory = factory();
    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let factory = factory.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let config = FixtureConfig::default().with_port(CONCURRENT_PORT).shared();
                let fixture = fixture(config, &factory);
                fixture.before().expect("shared acquisition never collides");
                let port = fixture.bound_port().unwrap();
                barrier.wait();
                fixture.after().expect("teardown");
                port
            })
        })
        .collect();

    for handle in handles {
        let port = handle.join().expect("Fixture thread panicked");
        assert_eq!(port, CONCURRENT_PORT);
    }
    assert!(!registry.contains(CONCURRENT_PORT));
    assert!(factory.pending_cleanup().is_empty());
}

// ============================================================================
// Client Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_client_round_trip() {
    let factory = factory();
    let config = FixtureConfig::default().with_port(Port::AUTO).exclusive();
    let fixture = fixture(config, &factory).start().unwrap();

    let client = fixture.client_with_retry(fast_retry()).await.unwrap();
    assert_eq!(client.namespace(), fixture.namespace());

    client.create("testpath", &[1]).await.unwrap();
    assert_eq!(client.get_data("testpath").await.unwrap(), vec![1]);
    client.delete("testpath").await.unwrap();
    assert!(!client.exists("testpath").await.unwrap());

    fixture.finish().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fixtures_on_shared_server_are_isolated() {
    let registry = Arc::new(SharedResourceRegistry::new());
    let factory = factory();
    let policy = LifecyclePolicy::shared_in(registry.clone());

    let a = fixture(
        FixtureConfig::default().with_port(Port::AUTO).with_policy(policy.clone()),
        &factory,
    )
    .start()
    .unwrap();
    // Join the server `a` was given by asking for its bound port.
    let b = fixture(
        FixtureConfig::default()
            .with_port(a.bound_port().unwrap())
            .with_policy(policy),
        &factory,
    )
    .start()
    .unwrap();
    assert_eq!(registry.refcount(a.bound_port().unwrap()), 2);

    let client_a = a.client_with_retry(fast_retry()).await.unwrap();
    let client_b = b.client_with_retry(fast_retry()).await.unwrap();

    client_a.create("node", &[7]).await.unwrap();
    assert!(!client_b.exists("node").await.unwrap());
    client_b.create("node", &[8]).await.unwrap();
    assert_eq!(client_a.get_data("node").await.unwrap(), vec![7]);

    b.finish().unwrap();
    assert_eq!(client_b.state(), ClientState::Closed);
    assert!(matches!(client_b.ping().await, Err(ClientError::Closed)));

    // `a` still holds the server.
    client_a.ping().await.unwrap();
    a.finish().unwrap();
    assert_eq!(client_a.state(), ClientState::Closed);
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fixture_connection_limit() {
    let factory = Arc::new(EmbeddedServerFactory::new(ServerSettings {
        cleanup_on_exit: true,
        max_connections: 1,
        ..ServerSettings::default()
    }));
    let fixture = fixture(
        FixtureConfig::default().with_port(Port::AUTO).exclusive(),
        &factory,
    )
    .start()
    .unwrap();

    let first = fixture.client_with_retry(fast_retry()).await.unwrap();
    first.ping().await.unwrap();

    let second = fixture
        .client_with_retry(RetryPolicy::never())
        .await
        .unwrap();
    assert!(second.ping().await.is_err());

    fixture.finish().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_clients_from_one_fixture() {
    let factory = factory();
    let fixture = fixture(
        FixtureConfig::default().with_port(Port::AUTO).exclusive(),
        &factory,
    )
    .start()
    .unwrap();

    let setup = fixture.client_with_retry(fast_retry()).await.unwrap();
    setup.create("workers", &[]).await.unwrap();

    let writes = (0..10u8).map(|i| {
        let fixture = &fixture;
        async move {
            let client = fixture.client_with_retry(fast_retry()).await?;
            client.create(&format!("workers/{i}"), &[i]).await?;
            Ok::<_, FixtureError>(())
        }
    });
    for result in futures::future::join_all(writes).await {
        result.unwrap();
    }

    let mut children = setup.children("workers").await.unwrap();
    children.sort_by_key(|name| name.parse::<u8>().unwrap());
    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(children, expected);

    fixture.finish().unwrap();
}
