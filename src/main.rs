use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    signal,
    sync::{mpsc, watch},
};
use tracing::{info, warn};

use storefront_api as api;
use api::{
    repositories::{
        InMemoryOrderRepository, InMemoryStockStore, OrderRepository, SeaOrmOrderRepository,
        SeaOrmStockStore, StockStore,
    },
    services::{
        catalog::{self, InMemoryCatalog},
        order_expiry::spawn_expiry_worker,
        payment_gateway::{StripeGateway, WebhookVerifier},
    },
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("loading configuration")?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);
    api::metrics::register_metrics();

    // Storage
    let mut db = None;
    let (stock, orders): (Arc<dyn StockStore>, Arc<dyn OrderRepository>) = if cfg.uses_database()
    {
        let pool = api::db::establish_connection_from_app_config(&cfg)
            .await
            .context("connecting to database")?;
        if cfg.auto_migrate {
            api::db::run_migrations(&pool)
                .await
                .context("running migrations")?;
        }
        let pool = Arc::new(pool);
        db = Some(pool.clone());
        (
            Arc::new(SeaOrmStockStore::new(pool.clone())),
            Arc::new(SeaOrmOrderRepository::new(pool)),
        )
    } else {
        warn!("using in-memory storage; orders and stock are lost on restart");
        (
            Arc::new(InMemoryStockStore::new()),
            Arc::new(InMemoryOrderRepository::new()),
        )
    };

    // Catalog
    let catalog = Arc::new(InMemoryCatalog::new());
    let seed_path = Path::new(&cfg.catalog_seed_path);
    if seed_path.exists() {
        let seed = catalog::load_seed(seed_path).context("loading catalog seed")?;
        catalog::seed_catalog(&catalog, stock.as_ref(), seed)
            .await
            .context("seeding catalog")?;
    } else {
        warn!(path = %seed_path.display(), "catalog seed not found; catalog is empty");
    }

    // Payment gateway
    if cfg.payment_webhook_secret.is_none() {
        warn!("payment webhook secret not configured; webhooks will be rejected");
    }
    let verifier = WebhookVerifier::new(
        cfg.payment_webhook_secret.clone(),
        Duration::from_secs(cfg.payment_webhook_tolerance_secs),
    );
    let gateway = Arc::new(
        StripeGateway::new(
            cfg.payment_gateway_url.clone(),
            cfg.payment_gateway_secret_key.clone(),
            verifier,
        )
        .context("building payment gateway client")?,
    );

    // Events
    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = api::events::EventSender::new(event_tx);
    tokio::spawn(api::events::process_events(event_rx));

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let sweep_interval = cfg.expiry_sweep_interval();
    let mut state = AppState::new(cfg, stock, orders, catalog, gateway, event_sender);
    if let Some(db) = db {
        state = state.with_database(db);
    }

    // Abandoned order sweep
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let expiry = spawn_expiry_worker(state.orders.clone(), sweep_interval, shutdown_rx);

    let app = api::app(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("storefront-api listening on http://{}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    let _ = shutdown_tx.send(true);
    if let Err(err) = expiry.await {
        warn!(error = %err, "expiry worker ended abnormally");
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
