use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use imp_rpc::{
    BreakerPhase, BreakerRegistry, BreakerSettings, CallError, Discovery, DiscoveryError,
    Endpoint, ResilientClient, RetryPolicy, RpcError, RpcSettings, StaticDiscovery,
};
use tracing::Span;

type Counter = Arc<AtomicU32>;

fn client(settings: RpcSettings, calls: &Counter) -> ResilientClient<Counter> {
    let discovery = Arc::new(StaticDiscovery::new([("gw", vec!["http://gw:8080"])]));
    let calls = Arc::clone(calls);
    ResilientClient::new(
        "gw",
        discovery,
        BreakerRegistry::new(settings.breaker.clone()),
        &settings,
        Span::none(),
        move |_: &Endpoint| Arc::clone(&calls),
    )
}

fn settings(max_attempts: u32, threshold: u32) -> RpcSettings {
    RpcSettings {
        retry: RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        },
        breaker: BreakerSettings {
            failure_threshold: threshold,
            failure_window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
        },
        call_timeout: Duration::from_secs(5),
    }
}

async fn unavailable(calls: Counter) -> Result<(), CallError> {
    calls.fetch_add(1, Ordering::SeqCst);
    Err(CallError::transient(anyhow::anyhow!("connection refused")))
}

async fn answered(calls: Counter) -> Result<&'static str, CallError> {
    calls.fetch_add(1, Ordering::SeqCst);
    Ok("ok")
}

#[tokio::test(start_paused = true)]
async fn breaker_fails_fast_and_admits_one_trial() {
    let calls = Counter::default();
    let client = client(settings(1, 3), &calls);

    for _ in 0..3 {
        let err = client.execute(unavailable).await.unwrap_err();
        assert!(matches!(err, RpcError::Transient { attempts: 1, .. }));
    }
    assert_eq!(client.breakers().phase("gw"), Some(BreakerPhase::Open));

    let err = client.execute(answered).await.unwrap_err();
    assert!(err.is_breaker_open());
    assert_eq!(calls.load(Ordering::SeqCst), 3, "open breaker must not touch the stub");

    tokio::time::advance(Duration::from_secs(30)).await;

    let trial_client = client.clone();
    let trial = tokio::spawn(async move {
        trial_client
            .execute(|calls: Counter| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, CallError>(())
            })
            .await
    });
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert_eq!(client.breakers().phase("gw"), Some(BreakerPhase::HalfOpen));
    let err = client.execute(answered).await.unwrap_err();
    assert!(err.is_breaker_open(), "only one trial while half-open");

    trial.await.unwrap().unwrap();
    assert_eq!(client.breakers().phase("gw"), Some(BreakerPhase::Closed));
    assert_eq!(client.execute(answered).await.unwrap(), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_until_exhausted() {
    let calls = Counter::default();
    let client = client(settings(3, 10), &calls);

    let err = client.execute(unavailable).await.unwrap_err();
    assert!(matches!(err, RpcError::Transient { attempts: 3, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn application_errors_are_neither_retried_nor_counted() {
    let calls = Counter::default();
    let client = client(settings(3, 1), &calls);

    let err = client
        .execute(|calls: Counter| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CallError::application(Some(404), "contact not found"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Application { status: Some(404), .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.breakers().phase("gw"), Some(BreakerPhase::Closed));
}

#[tokio::test(start_paused = true)]
async fn retries_stop_once_the_breaker_opens() {
    let calls = Counter::default();
    let client = client(settings(5, 2), &calls);

    let err = client.execute(unavailable).await.unwrap_err();
    assert!(err.is_breaker_open());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_calls_time_out_as_transient() {
    let calls = Counter::default();
    let mut cfg = settings(1, 5);
    cfg.call_timeout = Duration::from_millis(200);
    let client = client(cfg, &calls);

    let err = client
        .execute(|_calls: Counter| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, CallError>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Transient { .. }));
}

#[tokio::test]
async fn unknown_service_is_a_discovery_error() {
    let settings = RpcSettings::default();
    let client: ResilientClient<()> = ResilientClient::new(
        "missing",
        Arc::new(StaticDiscovery::default()),
        BreakerRegistry::default(),
        &settings,
        Span::none(),
        |_: &Endpoint| (),
    );
    let err = client
        .execute(|()| async { Ok::<_, CallError>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Discovery(_)));
}

struct CountingDiscovery {
    lookups: Counter,
}

#[async_trait::async_trait]
impl Discovery for CountingDiscovery {
    async fn resolve(&self, _service: &str) -> Result<Vec<Endpoint>, DiscoveryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Endpoint::new("http://gw:8080")])
    }
}

#[tokio::test(start_paused = true)]
async fn open_breaker_skips_discovery() {
    let lookups = Counter::default();
    let calls = Counter::default();
    let settings = settings(1, 1);
    let stub_calls = Arc::clone(&calls);
    let client = ResilientClient::new(
        "gw",
        Arc::new(CountingDiscovery {
            lookups: Arc::clone(&lookups),
        }),
        BreakerRegistry::new(settings.breaker.clone()),
        &settings,
        Span::none(),
        move |_: &Endpoint| Arc::clone(&stub_calls),
    );

    client.execute(unavailable).await.unwrap_err();
    assert_eq!(lookups.load(Ordering::SeqCst), 1);

    let err = client.execute(answered).await.unwrap_err();
    assert!(err.is_breaker_open());
    assert_eq!(lookups.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
