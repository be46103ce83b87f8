//! REST polling feed for when streaming is off or unavailable

use super::{PriceTick, StreamEvent, TickFeed};
use crate::broker::Broker;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Polls the broker's current price for each symbol on a fixed interval
pub struct PollingFeed {
    broker: Arc<dyn Broker>,
    interval: Duration,
}

impl PollingFeed {
    pub fn new(broker: Arc<dyn Broker>, interval: Duration) -> Self {
        Self { broker, interval }
    }
}

#[async_trait]
impl TickFeed for PollingFeed {
    async fn subscribe(
        &self,
        symbols: &[String],
        shutdown: CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<StreamEvent>> {
        let (tx, rx) = mpsc::channel(256);
        let broker = self.broker.clone();
        let symbols = symbols.to_vec();
        let interval = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            if tx.send(StreamEvent::Connected).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for symbol in &symbols {
                    match broker.get_price(symbol).await {
                        Ok(price) => {
                            let now = Utc::now();
                            let tick = PriceTick {
                                symbol: symbol.clone(),
                                price,
                                volume: 0,
                                timestamp: now,
                                exchange_ts: now,
                            };
                            if tx.send(StreamEvent::Tick(tick)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => tracing::warn!(symbol = %symbol, error = %e, "Price poll failed"),
                    }
                }
            }
            let _ = tx.send(StreamEvent::Disconnected).await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimulatedBroker;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_polls_each_symbol() {
        let broker = Arc::new(SimulatedBroker::default());
        broker.set_price("122630", dec!(10000));
        broker.set_price("252670", dec!(2500));
        let feed = PollingFeed::new(broker, Duration::from_millis(10));
        let shutdown = CancellationToken::new();

        let mut rx = feed
            .subscribe(&["122630".to_string(), "252670".to_string()], shutdown.clone())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), StreamEvent::Connected);
        let mut seen = vec![];
        for _ in 0..2 {
            if let StreamEvent::Tick(tick) = rx.recv().await.unwrap() {
                seen.push((tick.symbol, tick.price));
            }
        }
        assert_eq!(
            seen,
            vec![
                ("122630".to_string(), dec!(10000)),
                ("252670".to_string(), dec!(2500))
            ]
        );

        shutdown.cancel();
        while let Some(event) = rx.recv().await {
            if event == StreamEvent::Disconnected {
                return;
            }
        }
    }
}
