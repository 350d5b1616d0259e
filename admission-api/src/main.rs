use std::sync::Arc;

use common_redis::RedisClient;
use envconfig::Envconfig;
use eyre::Result;
use health::HealthRegistry;
use limiters::{
    Controller, DynamicRates, MemoryExchange, PeerExchange, RedisExchange, UsageReconciler,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use admission_api::config::Config;
use admission_api::metrics::setup_metrics_recorder;
use admission_api::router::{router, AppState};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn exchange(config: &Config) -> Result<Arc<dyn PeerExchange>> {
    match &config.redis_url {
        Some(url) => {
            let client = RedisClient::with_config(
                url.clone(),
                Some(config.exchange_timeout.0),
                Some(config.redis_connection_timeout.0),
            )
            .await?;
            let exchange = RedisExchange::new(Arc::new(client), config.redis_exchange_config())
                .map_err(|e| eyre::eyre!(e))?;
            info!(key_prefix = %config.redis_key_prefix, "sharing usage through redis");
            Ok(Arc::new(exchange))
        }
        None => {
            warn!("REDIS_URL not set, usage is not shared with other instances");
            Ok(Arc::new(MemoryExchange::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()?;
    init_tracing(config.log_json);
    config.validate()?;

    let instance_id = config.instance_id();
    let rates = Arc::new(DynamicRates::from_static(&config.rates()));
    let controller = Arc::new(Controller::new(
        config.limiter_config(instance_id.clone()),
        rates.clone(),
    ));

    let liveness = HealthRegistry::new("liveness");
    let reconciler = UsageReconciler::new(
        controller.clone(),
        exchange(&config).await?,
        config.exchange_timeout.0,
    )
    .with_liveness(&liveness);
    let cancel = CancellationToken::new();
    let reconciler_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { reconciler.run(cancel).await })
    };

    let metrics = if config.export_prometheus {
        Some(setup_metrics_recorder()?)
    } else {
        None
    };
    let state = AppState {
        controller,
        rates,
        liveness,
        max_wait: config.max_wait.0,
    };
    let app = router(state, metrics);

    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let shutdown = {
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = term.recv() => {},
                _ = interrupt.recv() => {},
            };
            info!("Shutting down gracefully...");
            cancel.cancel();
        }
    };

    let listener = tokio::net::TcpListener::bind(config.bind()).await?;
    info!(bind = %config.bind(), instance_id = %instance_id, "admission api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    cancel.cancel();
    reconciler_task.await?;
    Ok(())
}
