//! Trading engine
//!
//! Wires the components together, runs startup recovery, spawns the
//! background tasks and drives the periodic decision loop.

mod cycle;

use crate::broker::Broker;
use crate::config::{Config, TargetConfig};
use crate::exit::{ExitMonitor, ExitThresholds};
use crate::feed::TickFeed;
use crate::notify::{Notifier, TradeEvent};
use crate::order::OrderManager;
use crate::position::{PositionKey, PositionManager};
use crate::recovery::{RecoveryManager, SessionCheckpointer, SessionStatus, SessionStore};
use crate::safety::{
    ApiCheck, DailyLiquidationManager, EmergencyStop, HealthCheck, HealthChecker, LoopHeartbeat,
    SchedulerCheck, StopFileWatcher, StorageCheck,
};
use crate::strategy::{Strategy, StrategyRegistry};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A configured (symbol, strategy) pair with its strategy instance
pub struct Target {
    pub config: TargetConfig,
    pub strategy: Arc<dyn Strategy>,
}

impl Target {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(&self.config.symbol, &self.config.strategy)
    }
}

pub struct TradingEngine {
    config: Config,
    broker: Arc<dyn Broker>,
    feed: Arc<dyn TickFeed>,
    notifier: Arc<dyn Notifier>,
    orders: Arc<OrderManager>,
    emergency: Arc<EmergencyStop>,
    store: SessionStore,
    changed: Arc<Notify>,
    heartbeat: Arc<LoopHeartbeat>,
    targets: Vec<Target>,
    /// Keys holding a position as of the last cycle
    held: Mutex<HashSet<PositionKey>>,
}

impl TradingEngine {
    pub fn new(
        config: Config,
        broker: Arc<dyn Broker>,
        feed: Arc<dyn TickFeed>,
        notifier: Arc<dyn Notifier>,
        registry: &StrategyRegistry,
    ) -> anyhow::Result<Self> {
        let targets = config
            .engine
            .targets
            .iter()
            .map(|t| {
                Ok(Target {
                    config: t.clone(),
                    strategy: registry.create(&t.strategy, &t.params)?,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let changed = Arc::new(Notify::new());
        let positions = Arc::new(PositionManager::new(
            ExitThresholds::from(&config.exit),
            changed.clone(),
        ));
        let emergency = Arc::new(EmergencyStop::new());
        let orders = Arc::new(OrderManager::new(
            broker.clone(),
            positions,
            emergency.clone(),
            notifier.clone(),
            config.orders.clone(),
            changed.clone(),
        ));

        Ok(Self {
            store: SessionStore::new(&config.recovery.state_dir),
            config,
            broker,
            feed,
            notifier,
            orders,
            emergency,
            changed,
            heartbeat: Arc::new(LoopHeartbeat::new()),
            targets,
            held: Mutex::new(HashSet::new()),
        })
    }

    pub fn orders(&self) -> &Arc<OrderManager> {
        &self.orders
    }

    pub fn emergency(&self) -> &Arc<EmergencyStop> {
        &self.emergency
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Recover, then trade until `shutdown` fires
    ///
    /// Recovery failure is fatal: no order is placed without a consistent
    /// starting point.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let recovery = RecoveryManager::new(
            self.store.clone(),
            self.orders.clone(),
            self.emergency.clone(),
            self.notifier.clone(),
        )
        .recover()
        .await?;
        if let Some(sync) = &recovery.sync {
            tracing::info!(
                open_positions = sync.open_positions,
                mismatches = sync.mismatches.len(),
                "Position sync complete"
            );
        }
        self.remember_held().await;

        let checkpointer = Arc::new(SessionCheckpointer::new(
            self.store.clone(),
            self.orders.clone(),
            self.emergency.clone(),
            self.changed.clone(),
            Duration::from_secs(self.config.recovery.heartbeat_interval_secs),
            recovery.gaps,
        ));
        checkpointer.save(SessionStatus::Running).await;
        tracing::info!(session_id = %checkpointer.session_id(), targets = self.targets.len(), "Session started");

        let tasks = shutdown.child_token();
        let handles = match self.spawn_background(&checkpointer, &tasks).await {
            Ok(handles) => handles,
            Err(e) => {
                tasks.cancel();
                checkpointer.finish().await;
                return Err(e);
            }
        };

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.engine.cycle_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let sync_every = self.config.engine.position_sync_interval_secs;
        let mut sync_ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + Duration::from_secs(sync_every),
            Duration::from_secs(sync_every.max(1)),
        );
        sync_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.run_cycle().await,
                _ = sync_ticker.tick(), if sync_every > 0 => self.sync_positions().await,
            }
        }

        tracing::info!("Shutting down");
        tasks.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        let cancel = self.orders.cancel_all_pending().await;
        if !cancel.failed.is_empty() {
            tracing::error!(failed = cancel.failed.len(), "Some orders could not be cancelled at shutdown");
        }
        checkpointer.finish().await;
        tracing::info!("Shutdown complete");
        Ok(())
    }

    async fn spawn_background(
        &self,
        checkpointer: &Arc<SessionCheckpointer>,
        tasks: &CancellationToken,
    ) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let mut handles = vec![self.spawn_halt_alerts(tasks.clone())];

        let checks: Vec<Box<dyn HealthCheck>> = vec![
            Box::new(ApiCheck::new(
                self.broker.stats(),
                self.config.health.api_degraded_after,
                self.config.health.api_unhealthy_after,
            )),
            Box::new(StorageCheck::new(self.store.clone())),
            Box::new(SchedulerCheck::new(
                self.heartbeat.clone(),
                Duration::from_secs(self.config.health.scheduler_stale_secs),
            )),
        ];
        let health = Arc::new(HealthChecker::new(&self.config.health, checks, self.emergency.clone()));
        handles.push(health.start(tasks.clone()));

        let symbols: Vec<String> = self
            .targets
            .iter()
            .map(|t| t.config.symbol.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let events = self.feed.subscribe(&symbols, tasks.clone()).await?;
        let monitor = Arc::new(ExitMonitor::new(
            self.orders.clone(),
            self.notifier.clone(),
            self.config.exit.dedup_window(),
        ));
        handles.push(monitor.start(events, tasks.clone()));

        handles.push(checkpointer.clone().start(tasks.clone()));

        handles.push(
            StopFileWatcher::new(
                self.emergency.clone(),
                &self.config.emergency.stop_file,
                Duration::from_secs(self.config.emergency.poll_interval_secs),
            )
            .start(tasks.clone()),
        );

        if self.config.liquidation.enabled {
            let liquidation = Arc::new(DailyLiquidationManager::new(
                self.orders.clone(),
                self.notifier.clone(),
                &self.config.liquidation,
            )?);
            handles.push(liquidation.start(tasks.clone()));
        } else {
            tracing::warn!("Daily liquidation disabled");
        }

        Ok(handles)
    }

    /// Forward every new halt to the notifier
    fn spawn_halt_alerts(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut halts = self.emergency.subscribe();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = halts.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let record = halts.borrow_and_update().clone();
                        if let Some(record) = record {
                            notifier
                                .notify(TradeEvent::EmergencyStop {
                                    source: record.source,
                                    reason: record.reason,
                                })
                                .await;
                        }
                    }
                }
            }
        })
    }

    async fn remember_held(&self) {
        let keys: HashSet<PositionKey> = self
            .orders
            .positions()
            .snapshot()
            .await
            .into_iter()
            .map(|p| p.key)
            .collect();
        if let Ok(mut held) = self.held.lock() {
            *held = keys;
        }
    }
}
