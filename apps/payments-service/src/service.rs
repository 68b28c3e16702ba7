use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use paysettle::engine::{run_janitor, SettlementEngine};
use paysettle::lifecycle::InvoiceLifecycle;
use paysettle::notify::{StaticKeyring, WebhookNotifier};
use paysettle::rates::RateTable;
use paysettle::storage::SledStore;
use paysettle::store::{memory_store, Store};
use paysettle::timers::ExpiryTimers;
use paysettle::wallet::{HttpWallet, WalletGateway};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::{ServiceConfig, StoreKind};
use crate::server::{self, AppState};

/// Everything the service runs, wired from one configuration.
pub struct Components {
    pub store: Store,
    pub sled: Option<Arc<SledStore>>,
    pub timers: Arc<ExpiryTimers>,
    pub lifecycle: Arc<InvoiceLifecycle>,
    pub engine: Arc<SettlementEngine>,
    pub state: AppState,
}

pub async fn build(cfg: &ServiceConfig) -> anyhow::Result<Components> {
    let (store, sled): (Store, Option<Arc<SledStore>>) = match cfg.store {
        StoreKind::Memory => (memory_store(), None),
        StoreKind::Sled => {
            let sled = Arc::new(
                SledStore::open(&cfg.data_dir).with_context(|| format!("opening store {}", cfg.data_dir.display()))?,
            );
            (sled.clone(), Some(sled))
        }
    };

    let http_wallet = HttpWallet::new(cfg.wallet_url.clone(), cfg.master_key.as_bytes().to_vec(), cfg.request_timeout())?;
    let mut settings = cfg.settlement.clone();
    match http_wallet.info().await {
        Ok(info) => {
            settings.min_fee = settings.min_fee.max(info.node_fee);
            info!("wallet address={} node_fee={} min_fee={}", info.address, info.node_fee, settings.min_fee);
        }
        Err(err) => warn!("wallet info unavailable, using min_fee={}: {err}", settings.min_fee),
    }
    let settings = Arc::new(settings);
    let wallet: Arc<dyn WalletGateway> = Arc::new(http_wallet);

    let keyring = StaticKeyring::new(cfg.merchants.iter().map(|m| (m.public_key.clone(), m.secret.clone().into_bytes())));
    if keyring.is_empty() {
        warn!("no merchant webhook secrets configured, notifications will be dropped");
    }
    let notifier = Arc::new(WebhookNotifier::new(Arc::new(keyring), cfg.request_timeout())?);
    let rates = Arc::new(RateTable::new(cfg.rates.iter().map(|(code, rate)| (code.as_str(), *rate))));
    let timers = Arc::new(ExpiryTimers::new());

    let lifecycle = Arc::new(InvoiceLifecycle::new(
        store.clone(),
        wallet.clone(),
        notifier.clone(),
        timers.clone(),
        rates,
        settings.clone(),
    ));
    let engine = Arc::new(SettlementEngine::new(store.clone(), wallet, notifier, settings));
    let state = AppState::new(lifecycle.clone(), cfg.master_key.clone(), cfg.wallet_key().to_string());

    Ok(Components { store, sled, timers, lifecycle, engine, state })
}

/// Runs until Ctrl-C or SIGTERM. The HTTP server stops accepting first,
/// then the settlement loop finishes its current cycle.
pub async fn run(cfg: ServiceConfig) -> anyhow::Result<()> {
    let parts = build(&cfg).await?;
    parts.lifecycle.recover().context("recovering expiry timers")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = tokio::spawn(parts.engine.clone().run(shutdown_rx.clone()));
    let janitor = tokio::spawn(run_janitor(parts.store.clone(), cfg.purge_interval(), shutdown_rx));

    let listener = TcpListener::bind(&cfg.listen_addr).await.with_context(|| format!("binding {}", cfg.listen_addr))?;
    info!("listening addr={} store={:?} wallet={}", cfg.listen_addr, cfg.store, cfg.wallet_url);
    server::serve(listener, parts.state.clone(), shutdown_signal()).await?;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = engine.await;
    let _ = janitor.await;
    parts.timers.clear();
    if let Some(sled) = &parts.sled {
        sled.flush()?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler failed: {err}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!("SIGTERM handler failed: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
