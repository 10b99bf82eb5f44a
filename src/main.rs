//! Perp Grid Controller - Main Entry Point
//!
//! Paper trading by default; set `LIVE_TRADING=true` to trade on Binance.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use perp_grid_controller::config::{AppConfig, MacdFilterConfig};
use perp_grid_controller::exchange::{
    with_timeout, BinanceFuturesClient, ExchangeGateway, PaperExchange,
};
use perp_grid_controller::grid::generate_levels;
use perp_grid_controller::persistence::PersistenceManager;
use perp_grid_controller::risk::compute_risk_summary_with;
use perp_grid_controller::runtime::{spawn_account, AccountRegistry};
use perp_grid_controller::strategy::{StrategyController, StrategyStatus};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Perp Grid Controller CLI
#[derive(Parser)]
#[command(name = "perp-grid-controller")]
#[command(version, about = "MACD-gated grid trading for perpetual futures")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller (default)
    Run {
        /// Start the strategy if it is stopped
        #[arg(short, long)]
        start: bool,
    },

    /// Print the ladder the configured strategy would place
    Preview {
        /// Reference price (default: current mark price)
        #[arg(short, long)]
        price: Option<Decimal>,
    },

    /// Print the risk summary of the configured strategy
    Risk,

    /// Show persisted controller state
    Status {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/grid_state.db")]
        db: String,

        /// Show recent order records
        #[arg(short, long)]
        verbose: bool,
    },
}

/// Trading mode: Live (real money) or Paper.
#[derive(Debug, Clone, Copy, PartialEq)]
enum TradingMode {
    Live,
    Paper,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Some(Commands::Preview { price }) => return show_preview(price).await,
        Some(Commands::Risk) => return show_risk(),
        Some(Commands::Status { db, verbose }) => return show_status(&db, verbose),
        Some(Commands::Run { start }) => run(start).await,
        None => run(false).await,
    }
}

async fn run(auto_start: bool) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║          Perp Grid Controller v{}                       ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let trading_mode = if std::env::var("LIVE_TRADING").unwrap_or_default() == "true" {
        warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
        TradingMode::Live
    } else {
        info!("📝 PAPER TRADING MODE - Orders are simulated");
        TradingMode::Paper
    };

    let config = AppConfig::load()?;
    config.validate()?;
    log_config(&config);

    let binance = Arc::new(BinanceFuturesClient::new(&config.binance)?);
    let settings = config.controller.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut mirror = None;

    let exchange: Arc<dyn ExchangeGateway> = match trading_mode {
        TradingMode::Live => {
            anyhow::ensure!(
                !config.binance.api_key.is_empty() && !config.binance.secret_key.is_empty(),
                "live trading requires GRID_BINANCE__API_KEY and GRID_BINANCE__SECRET_KEY"
            );
            binance.clone()
        }
        TradingMode::Paper => {
            let seed = with_timeout(
                settings.exchange_timeout(),
                binance.get_market_snapshot(&settings.symbol, &config.strategy.macd_filter),
            )
            .await
            .context("Failed to fetch initial market snapshot")?;

            let paper = Arc::new(PaperExchange::new(
                &settings.symbol,
                settings.paper_balance,
                seed.price,
            ));
            paper.set_funding_rate_percent(seed.funding_rate_percent).await;
            paper.set_macd(seed.macd).await;
            info!(
                "💵 Paper balance ${} | {} @ {}",
                settings.paper_balance, settings.symbol, seed.price
            );

            mirror = Some(tokio::spawn(mirror_market(
                binance.clone(),
                paper.clone(),
                settings.symbol.clone(),
                config.strategy.macd_filter.clone(),
                settings.poll_interval(),
                shutdown_rx,
            )));
            paper
        }
    };

    let store = Arc::new(
        PersistenceManager::new(&settings.db_path).context("Failed to initialize persistence")?,
    );
    let controller = StrategyController::load(
        settings.clone(),
        config.risk,
        config.strategy.clone(),
        exchange.clone(),
        store,
    )?;

    let registry = AccountRegistry::new();
    let handle = registry
        .register(spawn_account(controller, exchange, &settings))
        .await?;

    let state = handle.state().await?;
    info!(
        "📂 Account {} restored in {} (cycle trades {}, PnL {})",
        handle.account_id(),
        state.status,
        state.cycle_trade_count,
        state.cycle_pnl
    );

    if auto_start && state.status == StrategyStatus::Stopped {
        match handle.start(None).await {
            Ok(state) => info!("🚀 Strategy started, now {}", state.status),
            Err(e) => error!("Failed to start strategy: {}", e),
        }
    }

    let mut status_timer = tokio::time::interval(Duration::from_secs(300));
    status_timer.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown signal received");
                break;
            }
            _ = status_timer.tick() => {
                match handle.state().await {
                    Ok(state) => info!(
                        status = %state.status,
                        cycle_trades = state.cycle_trade_count,
                        cycle_wins = state.cycle_win_count,
                        cycle_pnl = %state.cycle_pnl,
                        effective_tp = %state.effective_take_profit_percent,
                        "📊 Status"
                    ),
                    Err(e) => {
                        error!("Controller unavailable: {}", e);
                        break;
                    }
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(mirror) = mirror {
        let _ = mirror.await;
    }
    registry.shutdown_all().await;

    info!("👋 Perp Grid Controller shutdown complete");
    Ok(())
}

/// Copy live market data into the paper exchange so resting paper orders
/// fill against real prices.
async fn mirror_market(
    source: Arc<BinanceFuturesClient>,
    paper: Arc<PaperExchange>,
    symbol: String,
    macd: MacdFilterConfig,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match source.get_market_snapshot(&symbol, &macd).await {
                    Ok(market) => {
                        paper.set_funding_rate_percent(market.funding_rate_percent).await;
                        paper.set_macd(market.macd).await;
                        paper.set_price(market.price).await;
                    }
                    Err(e) => warn!("Market mirror fetch failed: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Initialize comprehensive logging with file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "grid-controller.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("perp_grid_controller=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &AppConfig) {
    let strategy = &config.strategy;
    info!("📋 Configuration:");
    info!("   Account: {} | Symbol: {}", config.controller.account_id, config.controller.symbol);
    info!(
        "   Position Size: ${} x {} orders @ {}x ({:?})",
        strategy.position_size_usdt, strategy.max_total_orders, strategy.leverage, strategy.margin_mode
    );
    info!(
        "   Spacing: {} {:?} | Range: ±{}% | Anchor: {:?}",
        strategy.spacing_value, strategy.spacing_type, strategy.range_percent, strategy.anchor_mode
    );
    info!(
        "   Take Profit: {}% | Dynamic TP: {}",
        strategy.take_profit_percent, strategy.dynamic_tp.enabled
    );
    info!(
        "   MACD Filter: {} ({}/{}/{} on {})",
        strategy.macd_filter.enabled,
        strategy.macd_filter.fast_period,
        strategy.macd_filter.slow_period,
        strategy.macd_filter.signal_period,
        strategy.macd_filter.timeframe
    );
    info!("   Reactivation: {:?}", strategy.reactivation_mode);
    info!(
        "   Poll: {}s | Drift Regenerate: {}%",
        config.controller.poll_interval_secs, config.controller.ladder_drift_percent
    );
}

/// Print the ladder for the configured strategy.
async fn show_preview(price: Option<Decimal>) -> Result<()> {
    let config = AppConfig::load()?;
    config.validate()?;

    let price = match price {
        Some(price) => price,
        None => {
            let client = BinanceFuturesClient::new(&config.binance)?;
            with_timeout(
                config.controller.exchange_timeout(),
                client.get_market_snapshot(&config.controller.symbol, &config.strategy.macd_filter),
            )
            .await
            .context("Failed to fetch market price")?
            .price
        }
    };

    let ladder = generate_levels(price, &config.strategy, config.controller.price_decimals)?;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              GRID PREVIEW                                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!("\n📐 {} @ {} (step {})", config.controller.symbol, ladder.reference_price, ladder.step);
    println!("   ├─ Buy levels:  {}", ladder.buy_count());
    println!("   └─ Sell levels: {}", ladder.sell_count());

    println!();
    for level in ladder.levels.iter().rev() {
        println!(
            "   {:>4}  {:<4}  {:>14}  {:>9}%",
            level.level_index,
            level.side.as_str(),
            level.price.to_string(),
            level.distance_from_current_percent.to_string()
        );
    }
    println!();
    Ok(())
}

/// Print the risk summary for the configured strategy.
fn show_risk() -> Result<()> {
    let config = AppConfig::load()?;
    config.validate()?;
    let summary = compute_risk_summary_with(&config.strategy, &config.risk);

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              RISK SUMMARY                                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!("\n⚖️  Exposure");
    println!("   ├─ Total Capital:       ${}", summary.total_capital);
    println!("   ├─ Notional per Order:  ${}", summary.notional_per_order);
    println!("   └─ Total Notional:      ${}", summary.total_notional);
    println!("\n⚠️  Liquidation (estimate)");
    println!("   ├─ Distance:            ~{}%", summary.liquidation_distance_percent);
    println!("   ├─ Risk Band:           {}", summary.liquidation_risk);
    println!("   └─ Max Loss per Trade:  ${}", summary.max_loss_per_trade);
    println!();
    Ok(())
}

/// Show persisted controller state.
fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              GRID CONTROLLER STATUS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The controller has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let persistence = PersistenceManager::new(db_path)?;
    let accounts = persistence.list_accounts()?;
    if accounts.is_empty() {
        println!("\n❌ No saved state found in database.");
        return Ok(());
    }

    for account_id in &accounts {
        let Some(state) = persistence.load_strategy_state(account_id)? else {
            continue;
        };

        println!("\n📊 Account {}", account_id);
        println!("   ├─ Status:           {}", state.status);
        println!("   ├─ Config Snapshot:  {}", state.config_snapshot_id);
        println!("   ├─ Effective TP:     {}%", state.effective_take_profit_percent);
        println!("   └─ Last Transition:  {}", state.last_transition_at.format("%Y-%m-%d %H:%M:%S UTC"));

        println!("\n📈 Cycle");
        match state.cycle_started_at {
            Some(started) => println!("   ├─ Started:          {}", started.format("%Y-%m-%d %H:%M:%S UTC")),
            None => println!("   ├─ Started:          -"),
        }
        println!("   ├─ Trades:           {} ({} wins)", state.cycle_trade_count, state.cycle_win_count);
        println!("   └─ PnL:              ${}", state.cycle_pnl);

        let open = persistence.load_open_orders(account_id)?;
        if !open.is_empty() {
            println!("\n🔓 Open Orders");
            for order in &open {
                println!(
                    "   ├─ L{:<4} {} {} @ {} [{}]{}",
                    order.level_index,
                    order.side,
                    order.quantity,
                    order.entry_price,
                    order.status.as_str(),
                    order
                        .tp_price
                        .map(|tp| format!(" TP {}", tp))
                        .unwrap_or_default()
                );
            }
        }

        if verbose {
            let recent = persistence.recent_orders(account_id, 20)?;
            if !recent.is_empty() {
                println!("\n📜 Recent Orders");
                for order in &recent {
                    println!(
                        "   ├─ {} L{} {} @ {} [{}] {}",
                        order.client_order_id,
                        order.level_index,
                        order.side,
                        order.entry_price,
                        order.status.as_str(),
                        order.created_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }
    }

    println!();
    Ok(())
}
