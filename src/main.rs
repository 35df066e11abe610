//! Titan: trend-following futures bot
//!
//! Trades one pair on Binance USD-M futures from an ADX/MACD/EMA trend
//! filter with ATR-based stops, and replays the same rules bar by bar over
//! history.

mod advisor;
mod api;
mod backtest;
mod bot;
mod config;
mod control;
mod db;
mod indicators;
mod metrics;
mod models;
mod notify;
mod strategy;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{BinanceClient, Exchange};
use crate::backtest::{load_bars_csv, Backtester, CommissionBasis};
use crate::bot::{LiveSinks, LiveTrader};
use crate::config::{ConfigSource, DEFAULT_CONFIG_PATH};
use crate::control::{Command, CommandSlot, StatusBoard};
use crate::db::Database;
use crate::notify::Notifier;
use crate::strategy::StrategyRegistry;

/// Trend-following futures bot CLI.
#[derive(Parser)]
#[command(name = "titan")]
#[command(about = "Trend-following futures bot with backtesting", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, env = "TITAN_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay the strategy over historical bars
    Backtest {
        /// CSV file (time,open,high,low,close,volume); fetched from the exchange when absent
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Strategy id (overrides the config)
        #[arg(short, long)]
        strategy: Option<String>,

        /// Starting balance (overrides the config)
        #[arg(short, long)]
        balance: Option<Decimal>,

        /// Commission per side as a fraction, e.g. 0.0005
        #[arg(long)]
        commission: Option<Decimal>,

        /// Commission basis: balance or notional
        #[arg(long)]
        basis: Option<String>,

        /// Bars to fetch when reading from the exchange
        #[arg(long, default_value = "1000")]
        limit: u32,

        /// Print every trade
        #[arg(long)]
        trades: bool,
    },

    /// Start live trading for every enabled account
    Run,

    /// Show the effective configuration
    Config {
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,
    },

    /// Show the last published status of each account
    Status,

    /// List logged trades and cumulative P&L
    Trades {
        #[arg(short, long)]
        account: Option<String>,

        #[arg(short, long)]
        symbol: Option<String>,

        #[arg(short = 'n', long, default_value = "20")]
        limit: u32,
    },

    /// Send a command to a running account (close-all, pause, resume).
    ///
    /// Pause and resume affect only the named account; set `system.running`
    /// in the config to stop every account.
    Command {
        account: String,
        action: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let source = ConfigSource::new(&cli.config);

    match cli.command {
        Commands::Backtest {
            csv,
            strategy,
            balance,
            commission,
            basis,
            limit,
            trades,
        } => {
            let mut config = source.load().await.unwrap_or_else(|e| {
                warn!(error = %e, "Using default configuration");
                Default::default()
            });
            if let Some(id) = strategy {
                config.strategy.id = id;
            }

            let mut bt_config = config.backtest_config();
            if let Some(balance) = balance {
                bt_config.initial_balance = balance;
            }
            if let Some(rate) = commission {
                bt_config.commission_rate = rate;
            }
            if let Some(basis) = basis {
                bt_config.commission_basis = match basis.to_lowercase().as_str() {
                    "balance" => CommissionBasis::Balance,
                    "notional" => CommissionBasis::Notional,
                    other => bail!("Unknown commission basis '{}' (balance, notional)", other),
                };
            }

            let generator = StrategyRegistry::builtin().build(&config.strategy)?;

            // 1. Load bars
            let bars = match csv {
                Some(path) => {
                    info!(path = ?path, "Loading bars from CSV");
                    load_bars_csv(&path)?
                }
                None => {
                    let base_url = config.accounts.first().and_then(|a| a.base_url.clone());
                    let client = BinanceClient::public(base_url.as_deref())?;
                    info!(
                        symbol = %config.pair.symbol,
                        interval = %config.system.interval,
                        limit = limit,
                        "Fetching bars from exchange"
                    );
                    client
                        .fetch_bars(&config.pair.symbol, &config.system.interval, limit)
                        .await?
                        .ok_or_else(|| anyhow!("Exchange returned no bars for {}", config.pair.symbol))?
                }
            };

            println!("\n=== Backtest ===");
            println!("Strategy:   {}", generator.id());
            println!("Bars:       {}", bars.len());
            if let (Some(first), Some(last)) = (bars.first(), bars.last()) {
                println!("Range:      {} -> {}", first.timestamp, last.timestamp);
            }
            println!("Balance:    {}", bt_config.initial_balance);
            println!(
                "Commission: {} per side ({:?})",
                bt_config.commission_rate, bt_config.commission_basis
            );

            // 2. Simulate
            let outcome = Backtester::new(bt_config).run(&bars, generator.as_ref());
            println!("{}", outcome);

            // 3. Trade list
            if trades {
                if let Some(report) = outcome.report() {
                    println!(
                        "\n{:<20} {:<6} {:>12} {:>12} {:>10} {:>12} {:<12}",
                        "EXIT TIME", "SIDE", "ENTRY", "EXIT", "QTY", "PNL", "REASON"
                    );
                    println!("{}", "-".repeat(90));
                    for trade in &report.trades {
                        println!(
                            "{:<20} {:<6} {:>12.2} {:>12.2} {:>10} {:>12.2} {:<12}",
                            trade.exit_time().format("%Y-%m-%d %H:%M"),
                            trade.side().as_str(),
                            trade.entry_price(),
                            trade.exit_price(),
                            trade.quantity(),
                            trade.realized_pnl(),
                            trade.exit_reason().as_str()
                        );
                    }
                }
            }
        }

        Commands::Run => {
            let config = source.load().await?;
            let accounts: Vec<_> = config.accounts.iter().filter(|a| a.enabled).cloned().collect();
            if accounts.is_empty() {
                println!("No enabled accounts in {:?}.", cli.config);
                return Ok(());
            }

            let db = Arc::new(Database::new(&config.system.database_url).await?);
            let notifier = Notifier::from_settings(&config.notifier);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutdown signal received");
                shutdown_tx.send(true).ok();
            });

            println!("\n=== Titan Live Trading ===");
            println!("Pair:      {}", config.pair.symbol);
            println!("Strategy:  {}", config.strategy.id);
            println!("Interval:  {}", config.system.interval);
            println!("Accounts:  {}", accounts.len());
            println!("Notifier:  {}", if notifier.is_enabled() { "on" } else { "off" });
            println!("Advisor:   {}", if config.strategy.use_advisor { "on" } else { "off" });
            println!("\nPress Ctrl+C to stop.\n");

            let mut handles = Vec::new();
            for account in &accounts {
                let client = match BinanceClient::from_env(
                    &account.api_key_env,
                    &account.api_secret_env,
                    account.base_url.as_deref(),
                ) {
                    Ok(client) => client.with_price_precision(config.pair.price_precision),
                    Err(e) => {
                        error!(account = %account.name, error = %e, "Account skipped");
                        continue;
                    }
                };

                let sinks = LiveSinks {
                    db: Some(db.clone()),
                    notifier: notifier.clone(),
                    advisor: advisor::from_settings(&config.advisor),
                };
                let trader = LiveTrader::new(
                    &account.name,
                    Box::new(client),
                    ConfigSource::with_snapshot(&cli.config, config.clone()),
                    &config,
                    sinks,
                    shutdown_rx.clone(),
                );
                handles.push(tokio::spawn(trader.run()));
            }

            if handles.is_empty() {
                bail!("No account could be started");
            }

            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Account loop panicked");
                }
            }
        }

        Commands::Config { init } => {
            if init {
                if source.path().exists() {
                    println!("{:?} already exists.", source.path());
                } else {
                    source.write_default().await?;
                    println!("Wrote default config to {:?}.", source.path());
                }
                return Ok(());
            }

            let config = source.load().await?;
            println!("\n=== Configuration ({:?}) ===\n", source.path());
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("\nKnown strategies: {}", StrategyRegistry::builtin().ids().join(", "));
        }

        Commands::Status => {
            let config = source.load().await?;
            let snapshots = StatusBoard::new(config.system.status_dir()).read_all().await?;
            if snapshots.is_empty() {
                println!("No status published yet. Start the bot with 'titan run'.");
                return Ok(());
            }

            println!(
                "\n{:<12} {:<10} {:<8} {:<6} {:>12} {:<6} {:>8} {:>12}  {}",
                "ACCOUNT", "SYMBOL", "RUNNING", "POS", "PRICE", "SIGNAL", "ADX", "BALANCE", "UPDATED"
            );
            println!("{}", "-".repeat(100));
            for s in &snapshots {
                println!(
                    "{:<12} {:<10} {:<8} {:<6} {:>12} {:<6} {:>8} {:>12}  {}",
                    s.account,
                    s.symbol,
                    if s.running { "yes" } else { "no" },
                    format!("{:?}", s.position).to_uppercase(),
                    s.price.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    s.signal.map(|d| d.as_str()).unwrap_or("-"),
                    s.indicator.map(|v| format!("{:.1}", v)).unwrap_or_else(|| "-".into()),
                    s.balance.map(|b| format!("{:.2}", b)).unwrap_or_else(|| "-".into()),
                    s.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
                if let Some(rationale) = &s.rationale {
                    println!("    {}", rationale);
                }
                if let Some(err) = &s.error {
                    println!("    error: {}", err);
                }
            }
        }

        Commands::Trades {
            account,
            symbol,
            limit,
        } => {
            let config = source.load().await?;
            let db = Database::new(&config.system.database_url).await?;

            let trades = db.recent_trades(account.as_deref(), symbol.as_deref(), limit).await?;
            if trades.is_empty() {
                println!("No trades logged.");
                return Ok(());
            }

            println!(
                "\n{:<10} {:<10} {:<6} {:>12} {:>12} {:>10} {:>12} {:<12} {}",
                "ACCOUNT", "SYMBOL", "SIDE", "ENTRY", "EXIT", "QTY", "PNL", "REASON", "EXIT TIME"
            );
            println!("{}", "-".repeat(110));
            for t in &trades {
                println!(
                    "{:<10} {:<10} {:<6} {:>12} {:>12} {:>10} {:>12} {:<12} {}",
                    t.account,
                    t.symbol,
                    t.side,
                    t.entry_price,
                    t.exit_price,
                    t.quantity,
                    t.pnl(),
                    t.exit_reason,
                    t.exit_time
                );
            }

            println!("\n--- Cumulative P&L ---");
            for (acct, sym) in db.series_keys().await? {
                if account.as_deref().is_some_and(|a| a != acct)
                    || symbol.as_deref().is_some_and(|s| s != sym)
                {
                    continue;
                }
                let series = db.cumulative_pnl(&acct, &sym).await?;
                if let Some(last) = series.last() {
                    println!("  {:<10} {:<10} {:>4} trades  {:>12}", acct, sym, series.len(), last.cumulative);
                }
            }
        }

        Commands::Command { account, action } => {
            let command: Command = action.parse()?;

            let config = source.load().await?;
            if config.account(&account).is_none() {
                bail!("Unknown account '{}'", account);
            }

            let slot = CommandSlot::for_account(&config.system.command_dir(), &account);
            if slot.post(command).await? {
                println!("Queued {:?} for {}.", command, account);
            } else {
                println!("A command is already pending for {}; try again after it is consumed.", account);
            }
        }
    }

    Ok(())
}
