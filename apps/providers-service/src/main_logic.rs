use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::serve;
use imp_bus::{BusClient, NatsBusClient, NatsSubscriber};
use imp_provider_registry::{LoggingProvider, ProviderBuilder, ProviderRegistry};
use imp_rpc::{
    AuthService, BreakerRegistry, ConsulDiscovery, Discovery, GatewayApi, Messenger,
    MessengerService, StaticDiscovery,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{Span, info, info_span, warn};

use crate::config::ServiceConfig;
use crate::dispatcher::{Dispatcher, new_instance_id};
use crate::failure::BusFailureSink;
use crate::http::{WebhookState, build_router};

/// Gateway facades handed to platform adapters.
#[derive(Clone)]
pub struct GatewayServices {
    pub messenger: Arc<dyn Messenger>,
    pub auth: AuthService,
    pub breakers: BreakerRegistry,
}

impl GatewayServices {
    pub fn connect(config: &ServiceConfig, span: Span) -> Result<Self> {
        let discovery: Arc<dyn Discovery> = match &config.discovery.consul_addr {
            Some(addr) => Arc::new(ConsulDiscovery::new(addr)?),
            None => Arc::new(StaticDiscovery::new(config.discovery.endpoints.clone())),
        };
        let settings = config.rpc.settings();
        let breakers = BreakerRegistry::new(settings.breaker.clone());
        let gateway = GatewayApi::new(discovery, breakers.clone(), &settings, span.clone())?;
        Ok(Self {
            messenger: Arc::new(MessengerService::new(gateway.clone(), span)),
            auth: AuthService::new(gateway),
            breakers,
        })
    }
}

/// One adapter per configured provider key.
///
/// With a messenger, inbound webhook text is forwarded to the gateway.
pub fn build_registry(
    providers: &[String],
    messenger: Option<Arc<dyn Messenger>>,
) -> Result<ProviderRegistry> {
    let registry = ProviderRegistry::new(providers.iter().map(|key| {
        let mut provider = LoggingProvider::new(key.as_str());
        if let Some(messenger) = &messenger {
            provider = provider.with_messenger(Arc::clone(messenger));
        }
        ProviderBuilder::full(Arc::new(provider))
    }))?;
    Ok(registry)
}

/// Which halves stopped before the shared deadline.
#[derive(Debug, PartialEq, Eq)]
pub struct Drain {
    pub dispatcher: bool,
    pub http: bool,
}

/// Drains the dispatcher and the HTTP server concurrently under one deadline.
pub async fn drain_within<D, S>(grace: Duration, dispatcher: D, server: S) -> Result<Drain>
where
    D: Future<Output = bool>,
    S: Future<Output = Result<()>>,
{
    let deadline = tokio::time::Instant::now() + grace;
    let (dispatcher, server) = tokio::join!(
        tokio::time::timeout_at(deadline, dispatcher),
        tokio::time::timeout_at(deadline, server),
    );
    let http = match server {
        Ok(served) => {
            served?;
            true
        }
        Err(_) => false,
    };
    Ok(Drain {
        dispatcher: matches!(dispatcher, Ok(true)),
        http,
    })
}

/// Runs the service until SIGINT or SIGTERM.
pub async fn run(config: ServiceConfig) -> Result<()> {
    let _telemetry = imp_telemetry::install(&config.log)?;
    let span = info_span!("imp-providers-service", service_id = %config.service.id);

    let nats = async_nats::connect(&config.pubsub.broker_url)
        .await
        .with_context(|| format!("connecting to {}", config.pubsub.broker_url))?;
    let bus: Arc<dyn BusClient> = Arc::new(NatsBusClient::new(nats.clone()));
    let subscriber = NatsSubscriber::new(nats, span.clone());

    let gateway = GatewayServices::connect(&config, span.clone())?;
    let registry = Arc::new(build_registry(
        &config.providers,
        Some(Arc::clone(&gateway.messenger)),
    )?);

    let sink = Arc::new(BusFailureSink::new(bus, span.clone()));
    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        config.dispatch.clone(),
        sink,
        span.clone(),
    );
    let instance_id = new_instance_id();
    let pipelines = dispatcher
        .start(&subscriber, &config.pubsub.exchange, &instance_id)
        .await?;
    info!(
        parent: &span,
        instance_id = %instance_id,
        queues = ?pipelines.queues(),
        providers = ?config.providers,
        "dispatcher started"
    );

    let router = build_router(WebhookState {
        registry,
        span: span.clone(),
    });
    let listener = TcpListener::bind(config.service.http_addr)
        .await
        .with_context(|| format!("binding {}", config.service.http_addr))?;
    info!(parent: &span, "imp-providers-service listening on {}", config.service.http_addr);

    let stop = CancellationToken::new();
    let server = tokio::spawn(
        serve(listener, router)
            .with_graceful_shutdown(stop.clone().cancelled_owned())
            .into_future(),
    );

    shutdown_signal().await;
    info!(parent: &span, "shutdown requested");
    stop.cancel();

    let grace = config.service.shutdown_grace;
    let drain = drain_within(grace, pipelines.shutdown(grace), async {
        server.await.context("http server task")?.context("http server")
    })
    .await?;
    if !drain.dispatcher {
        warn!(parent: &span, ?grace, "dispatcher did not drain before the grace period ended");
    }
    if !drain.http {
        warn!(parent: &span, ?grace, "http server did not stop before the grace period ended");
    }
    info!(parent: &span, "imp-providers-service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
