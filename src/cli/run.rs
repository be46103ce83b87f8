//! Run command implementation

use crate::broker::{Broker, KisClient, SimulatedBroker};
use crate::config::Config;
use crate::engine::TradingEngine;
use crate::feed::{KisFeed, PollingFeed, TickFeed};
use crate::notify::{FanoutNotifier, LogNotifier, Notifier, SlackNotifier};
use crate::strategy::StrategyRegistry;
use clap::Args;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Trade against the in-process simulator instead of the broker
    #[arg(long)]
    pub simulate: bool,

    /// Starting price for every target symbol when simulating
    #[arg(long, default_value = "10000", requires = "simulate")]
    pub sim_price: Decimal,
}

impl RunArgs {
    pub async fn execute(&self, config: Config) -> anyhow::Result<()> {
        if config.engine.targets.is_empty() {
            anyhow::bail!("no [[engine.targets]] configured");
        }
        let notifier = build_notifier(&config)?;
        let registry = StrategyRegistry::builtin();

        let (broker, feed): (Arc<dyn Broker>, Arc<dyn TickFeed>) = if self.simulate {
            tracing::warn!("Simulated broker: no real orders will be sent");
            let sim = Arc::new(SimulatedBroker::default());
            for target in &config.engine.targets {
                sim.set_price(&target.symbol, self.sim_price);
            }
            let feed = Arc::new(PollingFeed::new(
                sim.clone(),
                Duration::from_millis(config.exit.price_poll_ms),
            ));
            (sim, feed)
        } else {
            let client = Arc::new(KisClient::new(&config.broker, &config.rate_limit, &config.retry)?);
            tracing::info!(mode = config.broker.mode.as_str(), "Broker client ready");
            let feed: Arc<dyn TickFeed> = if config.engine.realtime {
                Arc::new(KisFeed::connect(&client, &config.broker).await?)
            } else {
                Arc::new(PollingFeed::new(
                    client.clone(),
                    Duration::from_millis(config.exit.price_poll_ms),
                ))
            };
            (client, feed)
        };

        let engine = TradingEngine::new(config, broker, feed, notifier, &registry)?;

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received");
                trigger.cancel();
            }
        });

        engine.run(shutdown).await
    }
}

fn build_notifier(config: &Config) -> anyhow::Result<Arc<dyn Notifier>> {
    let mut sinks: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = &config.notification.slack_webhook_url {
        sinks.push(Arc::new(SlackNotifier::new(url.clone())?));
    }
    Ok(Arc::new(FanoutNotifier::new(sinks)))
}
