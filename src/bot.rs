//! Live trader: one polling loop per exchange account.
//!
//! Each cycle:
//! 1. consume a pending operator command
//! 2. honor the run/pause flag from the freshly reloaded config
//! 3. reconcile local position state against the exchange (exchange wins)
//! 4. while a position is open, publish status and wait (flattening it first
//!    if its protective orders could not be placed)
//! 5. otherwise fetch bars, evaluate the strategy, consult the advisor, enter
//!
//! Any failure ends the cycle; the loop logs it and retries after a delay.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::advisor::AdvisoryFilter;
use crate::api::{Exchange, ExchangePosition, OrderSide, ProtectiveKind};
use crate::config::{AppConfig, ConfigSource};
use crate::control::{Command, CommandSlot, StatusBoard, StatusSnapshot};
use crate::db::Database;
use crate::models::{Bar, ExitReason, OpenPosition, Signal, Trade};
use crate::notify::Notifier;
use crate::strategy::StrategyRegistry;
use crate::trading::{attribute_exit, ExitFill, PositionSizer, PositionTracker};

/// Collaborators a live trader writes to besides the exchange.
pub struct LiveSinks {
    pub db: Option<Arc<Database>>,
    pub notifier: Notifier,
    pub advisor: Box<dyn AdvisoryFilter>,
}

/// Live execution for one account.
pub struct LiveTrader {
    account: String,
    exchange: Box<dyn Exchange>,
    config: ConfigSource,
    registry: StrategyRegistry,
    tracker: PositionTracker,
    /// Set when local state was taken over from the exchange and the
    /// protective levels are unknown
    adopted: bool,
    /// Set when the open position has no stop or target on the exchange
    unprotected: bool,
    commands: CommandSlot,
    status: StatusBoard,
    snapshot: StatusSnapshot,
    sinks: LiveSinks,
    shutdown: watch::Receiver<bool>,
}

impl LiveTrader {
    /// `initial` decides the command/status locations for the lifetime of the loop.
    pub fn new(
        account: &str,
        exchange: Box<dyn Exchange>,
        config: ConfigSource,
        initial: &AppConfig,
        sinks: LiveSinks,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            account: account.to_string(),
            exchange,
            config,
            registry: StrategyRegistry::builtin(),
            tracker: PositionTracker::new(),
            adopted: false,
            unprotected: false,
            commands: CommandSlot::for_account(&initial.system.command_dir(), account),
            status: StatusBoard::new(initial.system.status_dir()),
            snapshot: StatusSnapshot::new(account, &initial.pair.symbol),
            sinks,
            shutdown,
        }
    }

    #[cfg(test)]
    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[cfg(test)]
    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    /// Run until shutdown is signalled.
    pub async fn run(mut self) {
        info!(account = %self.account, "Starting live loop");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let delay = match self.config.reload().await {
                None => {
                    error!(account = %self.account, "No usable configuration, skipping cycle");
                    Duration::from_secs(10)
                }
                Some(config) => match self.tick(&config).await {
                    Ok(delay) => delay,
                    Err(e) => {
                        let message = format!("{:#}", e);
                        error!(account = %self.account, error = %message, "Cycle failed");
                        self.snapshot.error = Some(message);
                        self.publish().await;
                        Duration::from_secs(config.system.retry_delay_secs)
                    }
                },
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(account = %self.account, "Live loop stopped");
    }

    /// One cycle. Returns how long to wait before the next one.
    pub async fn tick(&mut self, config: &AppConfig) -> Result<Duration> {
        let idle_wait = Duration::from_secs(config.system.poll_interval_secs);
        let open_wait = Duration::from_secs(config.system.position_poll_secs);
        let symbol = config.pair.symbol.as_str();

        let running = config.is_running(&self.account);
        self.snapshot.symbol = symbol.to_string();
        self.snapshot.running = running;

        // 1. Operator command
        match self.commands.take().await {
            Ok(Some(command)) => {
                info!(account = %self.account, command = ?command, "Command received");
                self.handle_command(command, config).await?;
                self.publish().await;
                return Ok(idle_wait);
            }
            Ok(None) => {}
            Err(e) => warn!(account = %self.account, error = %e, "Discarded command"),
        }

        // 2. Run flag
        if !running {
            debug!(account = %self.account, "Paused");
            self.snapshot.error = None;
            self.publish().await;
            return Ok(idle_wait);
        }

        // 3. Reconcile
        self.sync(config).await?;
        if let Ok(balance) = self.exchange.free_balance(&config.pair.quote_asset).await {
            self.snapshot.balance = Some(balance);
        }

        // 4. Holding: exits are left to the exchange's protective orders,
        // so a position that has none is closed here
        if self.tracker.is_open() && self.unprotected {
            self.flatten(config).await?;
            self.snapshot.error = None;
            self.publish().await;
            return Ok(idle_wait);
        }
        if self.tracker.is_open() {
            self.snapshot.error = None;
            self.publish().await;
            return Ok(open_wait);
        }

        // 5. Signal
        let Some(mut bars) = self
            .exchange
            .fetch_bars(symbol, &config.system.interval, config.system.bar_limit)
            .await?
        else {
            info!(account = %self.account, symbol = %symbol, "No market data, skipping cycle");
            return Ok(idle_wait);
        };

        let strategy = self.registry.build(&config.strategy)?;
        strategy.add_indicators(&mut bars);
        let signal = strategy.on_bar(&bars);

        self.snapshot.price = bars.last().map(|b| b.close);
        self.snapshot.signal = Some(signal.direction);
        self.snapshot.rationale = Some(signal.rationale.clone());
        self.snapshot.indicator = bars
            .len()
            .checked_sub(2)
            .and_then(|i| bars[i].indicators)
            .map(|ind| ind.directional_strength);
        self.snapshot.error = None;

        if signal.is_actionable() && signal.is_well_formed() {
            if config.strategy.use_advisor {
                let verdict = self.sinks.advisor.review(&bars, &signal).await;
                info!(
                    account = %self.account,
                    approved = verdict.approved,
                    score = verdict.score,
                    reason = %verdict.reason,
                    "Advisor verdict"
                );
                if !verdict.approved {
                    self.snapshot.rationale =
                        Some(format!("{} | vetoed: {}", signal.rationale, verdict.reason));
                    self.publish().await;
                    return Ok(idle_wait);
                }
            }
            self.execute_entry(config, &signal).await?;
        }

        self.publish().await;
        Ok(if self.tracker.is_open() { open_wait } else { idle_wait })
    }

    /// Re-derive position state from the exchange.
    pub async fn sync(&mut self, config: &AppConfig) -> Result<()> {
        let symbol = config.pair.symbol.as_str();
        let positions = self
            .exchange
            .open_positions(symbol)
            .await
            .context("Failed to fetch positions")?;
        let remote = positions.into_iter().next();

        match (remote, self.tracker.position().cloned()) {
            (None, None) => {}
            (None, Some(local)) => {
                let (fill, exit_time) = self.attribute_flat_exit(config, &local).await;
                warn!(
                    account = %self.account,
                    reason = fill.reason.as_str(),
                    price = %fill.price,
                    "Exchange reports flat, closing local position"
                );
                let balance = self.snapshot.balance.unwrap_or(Decimal::ZERO);
                if let Some(trade) = self.tracker.close(fill, exit_time, Decimal::ZERO, balance) {
                    self.record(symbol, trade).await;
                }
                self.adopted = false;
                self.unprotected = false;
            }
            (Some(remote), None) => {
                warn!(
                    account = %self.account,
                    side = remote.side.as_str(),
                    qty = %remote.contracts,
                    "Adopting position found on exchange"
                );
                self.tracker.adopt(adopted_position(&remote));
                self.adopted = true;
            }
            (Some(remote), Some(local)) => {
                if remote.side != local.side || remote.contracts != local.quantity {
                    warn!(
                        account = %self.account,
                        local_side = local.side.as_str(),
                        local_qty = %local.quantity,
                        remote_side = remote.side.as_str(),
                        remote_qty = %remote.contracts,
                        "Position mismatch, exchange state wins"
                    );
                    if remote.side == local.side {
                        self.tracker.adopt(OpenPosition {
                            quantity: remote.contracts,
                            ..local
                        });
                    } else {
                        self.tracker.adopt(adopted_position(&remote));
                        self.adopted = true;
                    }
                }
            }
        }
        Ok(())
    }

    /// Exit price and reason for a position the exchange already closed.
    async fn attribute_flat_exit(
        &self,
        config: &AppConfig,
        position: &OpenPosition,
    ) -> (ExitFill, DateTime<Utc>) {
        let bars: Vec<Bar> = match self
            .exchange
            .fetch_bars(&config.pair.symbol, &config.system.interval, config.system.bar_limit)
            .await
        {
            Ok(Some(bars)) => bars,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(account = %self.account, error = %e, "No bars for exit attribution");
                Vec::new()
            }
        };

        if !self.adopted {
            if let Some(found) = attribute_exit(position, &bars) {
                return found;
            }
        }

        let price = bars.last().map(|b| b.close).unwrap_or(position.entry_price);
        (
            ExitFill {
                price,
                reason: ExitReason::Reconciled,
            },
            Utc::now(),
        )
    }

    /// Size and submit an entry, then place the protective orders.
    async fn execute_entry(&mut self, config: &AppConfig, signal: &Signal) -> Result<()> {
        let symbol = config.pair.symbol.as_str();
        let Some(side) = signal.direction.side() else {
            return Ok(());
        };
        let risk = &config.pair.risk;

        if let Err(e) = self.exchange.set_leverage(symbol, risk.leverage).await {
            debug!(account = %self.account, error = %e, "Leverage not changed");
        }

        let balance = self
            .exchange
            .free_balance(&config.pair.quote_asset)
            .await
            .context("Failed to fetch balance")?;
        self.snapshot.balance = Some(balance);

        let sizer = PositionSizer::new(risk.clone());
        let quantity = match sizer.size_for_order(balance, signal.entry_price, signal.stop_loss_price) {
            Ok(q) => q,
            Err(rejection) => {
                info!(account = %self.account, reason = %rejection, "Entry rejected by sizing");
                self.snapshot.rationale = Some(format!("{} | skipped: {}", signal.rationale, rejection));
                return Ok(());
            }
        };

        let ack = self
            .exchange
            .market_order(symbol, OrderSide::opening(side), quantity, false)
            .await
            .context("Entry order failed")?;

        let entry_price = ack.avg_price.unwrap_or(signal.entry_price);
        let filled = Signal {
            entry_price,
            ..signal.clone()
        };
        self.tracker.open(&filled, quantity, Utc::now());
        self.adopted = false;
        self.unprotected = false;

        info!(
            account = %self.account,
            side = side.as_str(),
            qty = %quantity,
            price = %entry_price,
            sl = %signal.stop_loss_price,
            tp = %signal.take_profit_price,
            order_id = %ack.order_id,
            "Entered position"
        );

        let exit_side = OrderSide::closing(side);
        for (kind, trigger) in [
            (ProtectiveKind::StopLoss, signal.stop_loss_price),
            (ProtectiveKind::TakeProfit, signal.take_profit_price),
        ] {
            if let Err(e) = self.exchange.protective_order(symbol, exit_side, kind, trigger).await {
                error!(account = %self.account, kind = ?kind, error = %e, "Protective order failed");
                self.sinks
                    .notifier
                    .send("Protective order failed", &format!("{} {:?}: {}", symbol, kind, e))
                    .await;
                self.unprotected = true;
                break;
            }
        }

        self.sinks
            .notifier
            .send(
                &format!("Entry {} {}", side.as_str(), symbol),
                &format!(
                    "- qty: {}\n- price: {}\n- stop: {}\n- target: {}\n- {}",
                    quantity, entry_price, signal.stop_loss_price, signal.take_profit_price, signal.rationale
                ),
            )
            .await;

        // A position without its stop is never held
        if self.unprotected {
            self.flatten(config)
                .await
                .context("Failed to flatten unprotected position")?;
        }

        Ok(())
    }

    async fn handle_command(&mut self, command: Command, config: &AppConfig) -> Result<()> {
        match command {
            Command::Pause => {
                self.config.set_paused(&self.account, true).await?;
                self.snapshot.running = false;
            }
            Command::Resume => {
                self.config.set_paused(&self.account, false).await?;
                self.snapshot.running = config.system.running;
            }
            Command::CloseAll => self.close_all(config).await?,
        }
        Ok(())
    }

    /// Cancel resting orders, flatten on the exchange and record a manual exit.
    pub async fn close_all(&mut self, config: &AppConfig) -> Result<()> {
        let closed = self.flatten(config).await?;

        info!(account = %self.account, closed, "Close-all complete");
        self.sinks
            .notifier
            .send("Close all", &format!("{}: {} position(s) closed", config.pair.symbol, closed))
            .await;
        Ok(())
    }

    /// Cancel resting orders and close every exchange position with reduce-only
    /// market orders, recording the tracked position as a manual exit.
    /// Returns how many exchange positions were closed.
    async fn flatten(&mut self, config: &AppConfig) -> Result<usize> {
        let symbol = config.pair.symbol.as_str();

        if let Err(e) = self.exchange.cancel_all(symbol).await {
            warn!(account = %self.account, error = %e, "Cancel-all failed");
        }

        let positions = self
            .exchange
            .open_positions(symbol)
            .await
            .context("Failed to fetch positions")?;

        let mut exit_price = None;
        for position in &positions {
            let ack = self
                .exchange
                .market_order(symbol, OrderSide::closing(position.side), position.contracts, true)
                .await
                .context("Close order failed")?;
            exit_price = exit_price.or(ack.avg_price);
        }

        if let Some(local) = self.tracker.position().cloned() {
            let price = exit_price
                .or(self.snapshot.price)
                .unwrap_or(local.entry_price);
            let fill = ExitFill {
                price,
                reason: ExitReason::Manual,
            };
            let balance = self.snapshot.balance.unwrap_or(Decimal::ZERO);
            if let Some(trade) = self.tracker.close(fill, Utc::now(), Decimal::ZERO, balance) {
                self.record(symbol, trade).await;
            }
        }
        self.tracker.force_idle();
        self.adopted = false;
        self.unprotected = false;

        Ok(positions.len())
    }

    /// Append a closed trade to the log and announce it.
    async fn record(&self, symbol: &str, trade: Trade) {
        info!(
            account = %self.account,
            reason = trade.exit_reason().as_str(),
            price = %trade.exit_price(),
            pnl = %trade.realized_pnl(),
            "Trade closed"
        );

        if let Some(db) = &self.sinks.db {
            if let Err(e) = db.log_trade(&self.account, symbol, &trade).await {
                error!(account = %self.account, error = %e, "Failed to log trade");
            }
        }

        self.sinks
            .notifier
            .send(
                &format!("Exit {} {}", trade.side().as_str(), symbol),
                &format!(
                    "- reason: {}\n- entry: {}\n- exit: {}\n- pnl: {}",
                    trade.exit_reason().as_str(),
                    trade.entry_price(),
                    trade.exit_price(),
                    trade.realized_pnl()
                ),
            )
            .await;
    }

    async fn publish(&mut self) {
        self.snapshot.updated_at = Utc::now();
        self.snapshot.position = self.tracker.status();
        if let Err(e) = self.status.publish(&self.snapshot).await {
            warn!(account = %self.account, error = %e, "Failed to publish status");
        }
    }
}

/// Local view of a position whose protective levels are unknown.
fn adopted_position(remote: &ExchangePosition) -> OpenPosition {
    OpenPosition {
        side: remote.side,
        entry_price: remote.entry_price,
        entry_time: Utc::now(),
        stop_loss_price: remote.entry_price,
        take_profit_price: remote.entry_price,
        quantity: remote.contracts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::{AutoApprove, Verdict};
    use crate::api::OrderAck;
    use crate::models::{Direction, PositionStatus, Side};
    use crate::strategy::{SignalGenerator, StrategySettings};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockState {
        bars: Option<Vec<Bar>>,
        balance: Decimal,
        positions: Vec<ExchangePosition>,
        fail_leverage: bool,
        fail_orders: bool,
        fail_close: bool,
        fail_protective: bool,
        order_attempts: usize,
        market_orders: Vec<(OrderSide, Decimal, bool)>,
        protective: Vec<(OrderSide, ProtectiveKind, Decimal)>,
        cancels: usize,
    }

    #[derive(Default)]
    struct MockExchange {
        state: Mutex<MockState>,
    }

    impl MockExchange {
        fn with(f: impl FnOnce(&mut MockState)) -> Self {
            let mock = Self::default();
            f(&mut mock.state.lock().unwrap());
            mock
        }
    }

    #[async_trait]
    impl Exchange for Arc<MockExchange> {
        async fn fetch_bars(&self, _: &str, _: &str, _: u32) -> Result<Option<Vec<Bar>>> {
            Ok(self.state.lock().unwrap().bars.clone())
        }

        async fn free_balance(&self, _: &str) -> Result<Decimal> {
            Ok(self.state.lock().unwrap().balance)
        }

        async fn open_positions(&self, _: &str) -> Result<Vec<ExchangePosition>> {
            Ok(self.state.lock().unwrap().positions.clone())
        }

        async fn set_leverage(&self, _: &str, _: u32) -> Result<()> {
            if self.state.lock().unwrap().fail_leverage {
                return Err(anyhow!("No need to change margin type"));
            }
            Ok(())
        }

        async fn market_order(
            &self,
            symbol: &str,
            side: OrderSide,
            quantity: Decimal,
            reduce_only: bool,
        ) -> Result<OrderAck> {
            let mut state = self.state.lock().unwrap();
            state.order_attempts += 1;
            if state.fail_orders || (reduce_only && state.fail_close) {
                return Err(anyhow!("Margin is insufficient"));
            }
            state.market_orders.push((side, quantity, reduce_only));
            if reduce_only {
                state.positions.clear();
            } else {
                let side = if side == OrderSide::Buy { Side::Long } else { Side::Short };
                state.positions = vec![ExchangePosition {
                    symbol: symbol.to_string(),
                    side,
                    contracts: quantity,
                    entry_price: dec!(100),
                }];
            }
            Ok(OrderAck {
                order_id: state.market_orders.len().to_string(),
                status: "FILLED".to_string(),
                avg_price: None,
            })
        }

        async fn protective_order(
            &self,
            _: &str,
            side: OrderSide,
            kind: ProtectiveKind,
            trigger_price: Decimal,
        ) -> Result<OrderAck> {
            let mut state = self.state.lock().unwrap();
            if state.fail_protective {
                return Err(anyhow!("Order would immediately trigger"));
            }
            state.protective.push((side, kind, trigger_price));
            Ok(OrderAck {
                order_id: format!("p{}", state.protective.len()),
                status: "NEW".to_string(),
                avg_price: None,
            })
        }

        async fn cancel_all(&self, _: &str) -> Result<()> {
            self.state.lock().unwrap().cancels += 1;
            Ok(())
        }
    }

    /// LONG at the last close with a 5-point stop and 15-point target.
    struct AlwaysLong;

    impl SignalGenerator for AlwaysLong {
        fn id(&self) -> &'static str {
            "always_long"
        }

        fn min_bars(&self) -> usize {
            1
        }

        fn add_indicators(&self, _: &mut [Bar]) {}

        fn on_bar(&self, window: &[Bar]) -> Signal {
            let close = window[window.len() - 1].close;
            Signal {
                direction: Direction::Long,
                entry_price: close,
                stop_loss_price: close - dec!(5),
                take_profit_price: close + dec!(15),
                rationale: "scripted".to_string(),
            }
        }
    }

    struct Veto;

    #[async_trait]
    impl AdvisoryFilter for Veto {
        async fn review(&self, _: &[Bar], _: &Signal) -> Verdict {
            Verdict {
                approved: false,
                score: 10.0,
                reason: "no".to_string(),
            }
        }
    }

    fn t(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + ChronoDuration::hours(i)
    }

    fn flat_bars(n: i64) -> Vec<Bar> {
        (0..n)
            .map(|i| Bar::new(t(i), dec!(100), dec!(101), dec!(99), dec!(100), dec!(1)))
            .collect()
    }

    fn app_config(dir: &std::path::Path, strategy: &str) -> AppConfig {
        let mut config = AppConfig::default();
        config.system.data_dir = dir.to_path_buf();
        config.strategy = StrategySettings {
            id: strategy.to_string(),
            ..Default::default()
        };
        config
    }

    fn trader(
        mock: &Arc<MockExchange>,
        dir: &std::path::Path,
        config: &AppConfig,
        advisor: Box<dyn AdvisoryFilter>,
        db: Option<Arc<Database>>,
    ) -> LiveTrader {
        let (_tx, rx) = watch::channel(false);
        trader_with_shutdown(mock, dir, config, advisor, db, rx)
    }

    fn trader_with_shutdown(
        mock: &Arc<MockExchange>,
        dir: &std::path::Path,
        config: &AppConfig,
        advisor: Box<dyn AdvisoryFilter>,
        db: Option<Arc<Database>>,
        rx: watch::Receiver<bool>,
    ) -> LiveTrader {
        let mut registry = StrategyRegistry::builtin();
        registry.register("always_long", |_| Box::new(AlwaysLong));

        LiveTrader::new(
            "main",
            Box::new(mock.clone()),
            ConfigSource::new(dir.join("titan.json")),
            config,
            LiveSinks {
                db,
                notifier: Notifier::disabled(),
                advisor,
            },
            rx,
        )
        .with_registry(registry)
    }

    #[tokio::test]
    async fn test_entry_places_market_and_protective_orders() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(flat_bars(10));
            s.balance = dec!(10000);
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), None);

        live.tick(&config).await.unwrap();

        let state = mock.state.lock().unwrap();
        // 10000 * 0.02 / 5 = 40
        assert_eq!(state.market_orders, vec![(OrderSide::Buy, dec!(40), false)]);
        assert_eq!(
            state.protective,
            vec![
                (OrderSide::Sell, ProtectiveKind::StopLoss, dec!(95)),
                (OrderSide::Sell, ProtectiveKind::TakeProfit, dec!(115)),
            ]
        );
        assert_eq!(live.tracker().status(), PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_leverage_failure_does_not_block_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(flat_bars(10));
            s.balance = dec!(10000);
            s.fail_leverage = true;
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), None);

        live.tick(&config).await.unwrap();
        assert_eq!(mock.state.lock().unwrap().market_orders.len(), 1);
        assert!(live.tracker().is_open());
    }

    #[tokio::test]
    async fn test_order_failure_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(flat_bars(10));
            s.balance = dec!(10000);
            s.fail_orders = true;
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), None);

        assert!(live.tick(&config).await.is_err());
        assert_eq!(live.tracker().status(), PositionStatus::Idle);
        assert!(mock.state.lock().unwrap().protective.is_empty());
    }

    #[tokio::test]
    async fn test_missing_data_skips_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let mock = Arc::new(MockExchange::with(|s| s.balance = dec!(10000)));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), None);

        live.tick(&config).await.unwrap();
        assert!(mock.state.lock().unwrap().market_orders.is_empty());
        assert!(!live.tracker().is_open());
    }

    #[tokio::test]
    async fn test_sizing_rejection_skips_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(flat_bars(10));
            s.balance = dec!(3);
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), None);

        live.tick(&config).await.unwrap();
        assert!(mock.state.lock().unwrap().market_orders.is_empty());
        assert!(!live.tracker().is_open());
    }

    #[tokio::test]
    async fn test_advisor_veto_blocks_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = app_config(dir.path(), "always_long");
        config.strategy.use_advisor = true;
        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(flat_bars(10));
            s.balance = dec!(10000);
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(Veto), None);

        live.tick(&config).await.unwrap();
        assert!(mock.state.lock().unwrap().market_orders.is_empty());

        let status = StatusBoard::new(config.system.status_dir()).read("main").await.unwrap().unwrap();
        assert!(status.rationale.unwrap().contains("vetoed"));
    }

    #[tokio::test]
    async fn test_sync_forces_idle_and_attributes_stop() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let db = Arc::new(Database::in_memory().await.unwrap());
        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(flat_bars(10));
            s.balance = dec!(10000);
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), Some(db.clone()));

        live.tick(&config).await.unwrap();
        assert!(live.tracker().is_open());

        // Stop order fired on the exchange; a later bar traded through 95
        {
            let mut state = mock.state.lock().unwrap();
            state.positions.clear();
            let mut bars = flat_bars(10);
            bars.push(Bar::new(Utc::now() + ChronoDuration::hours(1), dec!(100), dec!(100), dec!(94), dec!(96), dec!(1)));
            state.bars = Some(bars);
        }

        live.sync(&config).await.unwrap();
        assert_eq!(live.tracker().status(), PositionStatus::Idle);

        let trades = db.recent_trades(Some("main"), None, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, "STOP_LOSS");
        assert_eq!(trades[0].pnl(), dec!(-200));
    }

    #[tokio::test]
    async fn test_sync_without_touch_records_reconciled() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let db = Arc::new(Database::in_memory().await.unwrap());
        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(flat_bars(10));
            s.balance = dec!(10000);
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), Some(db.clone()));

        live.tick(&config).await.unwrap();
        mock.state.lock().unwrap().positions.clear();

        live.sync(&config).await.unwrap();
        assert!(!live.tracker().is_open());
        let trades = db.recent_trades(None, None, 10).await.unwrap();
        assert_eq!(trades[0].exit_reason, "RECONCILED");
    }

    #[tokio::test]
    async fn test_sync_adopts_exchange_position() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let mock = Arc::new(MockExchange::with(|s| {
            s.positions = vec![ExchangePosition {
                symbol: "BTCUSDT".to_string(),
                side: Side::Short,
                contracts: dec!(0.5),
                entry_price: dec!(200),
            }];
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), None);

        live.sync(&config).await.unwrap();
        let pos = live.tracker().position().unwrap();
        assert_eq!(pos.side, Side::Short);
        assert_eq!(pos.quantity, dec!(0.5));
    }

    #[tokio::test]
    async fn test_open_position_skips_signal_scan() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(flat_bars(10));
            s.balance = dec!(10000);
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), None);

        live.tick(&config).await.unwrap();
        let wait = live.tick(&config).await.unwrap();

        assert_eq!(wait, Duration::from_secs(config.system.position_poll_secs));
        assert_eq!(mock.state.lock().unwrap().market_orders.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_command() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let db = Arc::new(Database::in_memory().await.unwrap());
        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(flat_bars(10));
            s.balance = dec!(10000);
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), Some(db.clone()));

        live.tick(&config).await.unwrap();
        let slot = CommandSlot::for_account(&config.system.command_dir(), "main");
        assert!(slot.post(Command::CloseAll).await.unwrap());

        live.tick(&config).await.unwrap();

        let state = mock.state.lock().unwrap();
        assert_eq!(state.cancels, 1);
        assert_eq!(state.market_orders.last(), Some(&(OrderSide::Sell, dec!(40), true)));
        assert!(state.positions.is_empty());
        drop(state);

        assert!(!live.tracker().is_open());
        assert_eq!(slot.take().await.unwrap(), None);
        let trades = db.recent_trades(None, None, 10).await.unwrap();
        assert_eq!(trades[0].exit_reason, "MANUAL");
    }

    #[tokio::test]
    async fn test_pause_command_pauses_only_this_account() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let source = ConfigSource::new(dir.path().join("titan.json"));
        tokio::fs::write(source.path(), serde_json::to_vec(&config).unwrap()).await.unwrap();

        let mock = Arc::new(MockExchange::default());
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), None);
        let slot = CommandSlot::for_account(&config.system.command_dir(), "main");
        slot.post(Command::Pause).await.unwrap();

        live.tick(&config).await.unwrap();
        let reloaded = source.load().await.unwrap();
        assert!(!reloaded.is_running("main"));
        assert!(reloaded.system.running);

        // Paused account places no orders
        mock.state.lock().unwrap().bars = Some(flat_bars(10));
        live.tick(&reloaded).await.unwrap();
        assert_eq!(mock.state.lock().unwrap().order_attempts, 0);
    }

    #[tokio::test]
    async fn test_protective_failure_flattens_position() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let db = Arc::new(Database::in_memory().await.unwrap());
        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(flat_bars(10));
            s.balance = dec!(10000);
            s.fail_protective = true;
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), Some(db.clone()));

        live.tick(&config).await.unwrap();

        let state = mock.state.lock().unwrap();
        assert_eq!(
            state.market_orders,
            vec![(OrderSide::Buy, dec!(40), false), (OrderSide::Sell, dec!(40), true)]
        );
        assert!(state.positions.is_empty());
        assert_eq!(state.cancels, 1);
        drop(state);

        assert_eq!(live.tracker().status(), PositionStatus::Idle);
        let trades = db.recent_trades(None, None, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, "MANUAL");
    }

    #[tokio::test]
    async fn test_unprotected_position_flattened_next_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(flat_bars(10));
            s.balance = dec!(10000);
            s.fail_protective = true;
            s.fail_close = true;
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), None);

        // Entry fills, the stop is rejected and so is the first close attempt
        assert!(live.tick(&config).await.is_err());
        assert!(live.tracker().is_open());

        // Price collapses through the intended stop; the next cycle closes
        {
            let mut state = mock.state.lock().unwrap();
            state.fail_close = false;
            let mut bars = flat_bars(10);
            bars.push(Bar::new(Utc::now(), dec!(100), dec!(100), dec!(50), dec!(55), dec!(1)));
            state.bars = Some(bars);
        }
        let wait = live.tick(&config).await.unwrap();

        assert_eq!(wait, Duration::from_secs(config.system.poll_interval_secs));
        assert!(!live.tracker().is_open());
        let state = mock.state.lock().unwrap();
        assert_eq!(state.market_orders.last(), Some(&(OrderSide::Sell, dec!(40), true)));
        assert!(state.positions.is_empty());
    }

    #[tokio::test]
    async fn test_sync_quantity_mismatch_takes_exchange_quantity() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(flat_bars(10));
            s.balance = dec!(10000);
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), None);

        live.tick(&config).await.unwrap();
        mock.state.lock().unwrap().positions[0].contracts = dec!(25);

        live.sync(&config).await.unwrap();
        let pos = live.tracker().position().unwrap();
        assert_eq!(pos.side, Side::Long);
        assert_eq!(pos.quantity, dec!(25));
        assert_eq!(pos.stop_loss_price, dec!(95));
        assert_eq!(pos.take_profit_price, dec!(115));
        assert!(!live.adopted);
    }

    #[tokio::test]
    async fn test_sync_side_flip_adopts_exchange_position() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "always_long");
        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(flat_bars(10));
            s.balance = dec!(10000);
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), None);

        live.tick(&config).await.unwrap();
        mock.state.lock().unwrap().positions = vec![ExchangePosition {
            symbol: "BTCUSDT".to_string(),
            side: Side::Short,
            contracts: dec!(10),
            entry_price: dec!(120),
        }];

        live.sync(&config).await.unwrap();
        let pos = live.tracker().position().unwrap();
        assert_eq!(pos.side, Side::Short);
        assert_eq!(pos.quantity, dec!(10));
        assert_eq!(pos.entry_price, dec!(120));
        assert!(live.adopted);
    }

    #[tokio::test]
    async fn test_run_survives_failing_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = app_config(dir.path(), "always_long");
        config.system.retry_delay_secs = 0;
        tokio::fs::write(dir.path().join("titan.json"), serde_json::to_vec(&config).unwrap())
            .await
            .unwrap();

        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(flat_bars(10));
            s.balance = dec!(10000);
            s.fail_orders = true;
        }));
        let (tx, rx) = watch::channel(false);
        let live = trader_with_shutdown(&mock, dir.path(), &config, Box::new(AutoApprove), None, rx);
        let handle = tokio::spawn(live.run());

        tokio::time::timeout(Duration::from_secs(5), async {
            while mock.state.lock().unwrap().order_attempts < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let status = StatusBoard::new(config.system.status_dir()).read("main").await.unwrap().unwrap();
        assert!(status.error.unwrap().contains("Entry order failed"));
        assert!(mock.state.lock().unwrap().market_orders.is_empty());
    }

    #[tokio::test]
    async fn test_trend_strategy_enters_on_accelerating_trend() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path(), "trend_follow");
        let bars: Vec<Bar> = (0..80)
            .map(|i| {
                let close = dec!(100) + Decimal::from(i * i) * dec!(0.05);
                Bar::new(t(i), close, close + dec!(1), close - dec!(1), close, dec!(1))
            })
            .collect();
        let last_close = bars[79].close;
        let mock = Arc::new(MockExchange::with(|s| {
            s.bars = Some(bars);
            s.balance = dec!(10000);
        }));
        let mut live = trader(&mock, dir.path(), &config, Box::new(AutoApprove), None);

        live.tick(&config).await.unwrap();

        let state = mock.state.lock().unwrap();
        assert_eq!(state.market_orders.len(), 1);
        assert_eq!(state.market_orders[0].0, OrderSide::Buy);
        let (_, stop_kind, stop) = state.protective[0];
        let (_, _, target) = state.protective[1];
        assert_eq!(stop_kind, ProtectiveKind::StopLoss);
        assert!(stop < last_close && last_close < target);
    }
}
