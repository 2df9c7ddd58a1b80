use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use signal_trader::config::Config;
use signal_trader::engine::Engine;
use signal_trader::exchange::{BinanceClient, Gateway};
use signal_trader::hub::{HubClient, HubEvent};
use signal_trader::notify::{Notification, Notifier, NotifyLevel, NotifySink, RingBufferSink, TracingSink};
use signal_trader::ops::{self, AppState};
use signal_trader::queue::{TradeQueue, MIN_DISPATCH_GAP};
use signal_trader::store::StateStore;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Mirrors every notification into the state store's capped log table, which
/// backs the paged `/log?db=N` view.
struct StoreLogSink(Arc<StateStore>);

#[async_trait]
impl NotifySink for StoreLogSink {
    fn name(&self) -> &str {
        "store"
    }

    async fn deliver(&self, n: &Notification) -> Result<()> {
        self.0.append_log(&format!(
            "{} [{}] {}: {}",
            n.time.to_rfc3339(),
            n.level,
            n.subject,
            n.body
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting Signal Trader v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Arc::new(Config::load()?);
    config.validate()?;
    info!(
        primary_wallet = %config.trading.primary_wallet,
        long_funds = %config.trading.long_funds,
        "Configuration loaded"
    );

    // Wire the components
    let client = Arc::new(BinanceClient::new(&config.exchange)?);
    let gateway = Arc::new(Gateway::new(client, config.timing.balance_sync_delay_ms));
    let store = Arc::new(
        StateStore::open(&config.store.path, config.store.max_database_rows)
            .context("Failed to open the state store")?,
    );

    let ring = RingBufferSink::new(config.store.max_database_rows as usize);
    let mut notifier = Notifier::new(NotifyLevel::Info);
    notifier.register(Arc::new(TracingSink));
    notifier.register(ring.clone());
    notifier.register(Arc::new(StoreLogSink(Arc::clone(&store))));
    let notifier = Arc::new(notifier);

    let hub = Arc::new(HubClient::new(config.hub.clone())?);
    let (queue, _queue_worker) = TradeQueue::start(MIN_DISPATCH_GAP);

    let engine = Engine::new(
        Arc::clone(&config),
        gateway,
        Arc::clone(&store),
        notifier,
        hub.clone(),
        queue,
    );

    // Persist dirty state with a coalesced writer
    tokio::spawn(Arc::clone(&store).run_flusher(Arc::clone(&engine.meta)));

    // Background maintenance tick
    engine.spawn_background();

    // Operator surface
    let ops_state = AppState {
        engine: Arc::clone(&engine),
        ring,
    };
    let bind = config.ops.bind.clone();
    tokio::spawn(async move {
        if let Err(e) = ops::serve(ops_state, &bind).await {
            error!(error = %e, "Operator surface failed");
        }
    });

    // Hub connection and event loop
    let (events_tx, mut events) = mpsc::unbounded_channel();
    tokio::spawn(Arc::clone(&hub).run(events_tx));

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    HubEvent::StrategyList(payload) => {
                        if let Err(e) = engine.on_strategy_list(payload).await {
                            // Startup cannot proceed without markets and the
                            // hub trade list: flush what we have and exit.
                            error!(error = %e, "Startup reconciliation failed");
                            let meta = engine.meta.lock().await;
                            store.flush_all(&meta);
                            std::process::exit(1);
                        }
                    }
                    HubEvent::Buy(signal) => engine.on_buy_signal(signal).await,
                    HubEvent::Sell(signal) => engine.on_sell_signal(signal).await,
                    HubEvent::Close(signal) => engine.on_close_signal(signal).await,
                    HubEvent::Stop(signal) => engine.on_stop_signal(signal).await,
                    HubEvent::Connected => info!("Hub connected"),
                    HubEvent::Disconnected => warn!("Hub disconnected, waiting for reconnect"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, flushing state");
                {
                    let mut meta = engine.meta.lock().await;
                    meta.is_operational = false;
                    store.flush_all(&meta);
                }
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
