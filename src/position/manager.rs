//! Position manager
//!
//! Authoritative local cache of open positions. `apply_fill` is the only
//! mutation path during normal operation; `sync_with_broker` overwrites the
//! cache with broker holdings and records every divergence.

use super::{AuditEvent, MismatchKind, Position, PositionKey, SyncReport};
use crate::broker::{Broker, BrokerError, OrderSide};
use crate::exit::ExitThresholds;
use crate::order::{FillEvent, OrderId};
use crate::telemetry::{incr, set_gauge, CounterMetric, GaugeMetric};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, RwLock};

/// Strategy name for broker holdings no strategy opened
pub const UNMANAGED_STRATEGY: &str = "unmanaged";

/// Audit entries kept in memory
const AUDIT_CAPACITY: usize = 1_000;

#[derive(Debug, Default)]
struct Book {
    positions: HashMap<PositionKey, Position>,
    applied: HashSet<(OrderId, u64)>,
    /// Bumped on every applied fill
    generation: u64,
    /// Generation of the last fill per symbol
    touched: HashMap<String, u64>,
}

/// Tracks open positions per (symbol, strategy)
pub struct PositionManager {
    book: RwLock<Book>,
    audit: Mutex<Vec<AuditEvent>>,
    defaults: ExitThresholds,
    changed: Arc<Notify>,
}

impl PositionManager {
    pub fn new(defaults: ExitThresholds, changed: Arc<Notify>) -> Self {
        Self {
            book: RwLock::new(Book::default()),
            audit: Mutex::new(Vec::new()),
            defaults,
            changed,
        }
    }

    /// Apply a fill; returns false when the fill was already applied
    pub async fn apply_fill(&self, fill: &FillEvent) -> bool {
        let mut book = self.book.write().await;
        if !book.applied.insert(fill.fill_id()) {
            tracing::debug!(order_id = %fill.order_id, cumulative = fill.cumulative_quantity, "Fill already applied");
            return false;
        }
        book.generation += 1;
        let generation = book.generation;
        book.touched.insert(fill.key.symbol.clone(), generation);
        if fill.quantity == 0 {
            return true;
        }

        match fill.side {
            OrderSide::Buy => {
                let defaults = self.defaults;
                let position = book
                    .positions
                    .entry(fill.key.clone())
                    .or_insert_with(|| Position {
                        key: fill.key.clone(),
                        quantity: 0,
                        avg_price: Decimal::ZERO,
                        opened_at: fill.timestamp,
                        thresholds: defaults,
                    });
                let held = Decimal::from(position.quantity);
                let added = Decimal::from(fill.quantity);
                position.avg_price =
                    (position.avg_price * held + fill.price * added) / (held + added);
                position.quantity += fill.quantity;

                tracing::info!(
                    key = %fill.key,
                    quantity = position.quantity,
                    avg_price = %position.avg_price,
                    "Position increased"
                );
            }
            OrderSide::Sell => {
                let held = book.positions.get(&fill.key).map(|p| p.quantity).unwrap_or(0);
                if fill.quantity > held {
                    self.record(AuditEvent {
                        at: Utc::now(),
                        symbol: fill.key.symbol.clone(),
                        kind: MismatchKind::Oversell,
                        local_quantity: held,
                        broker_quantity: 0,
                        detail: format!(
                            "sell fill of {} for {} exceeds held {}",
                            fill.quantity, fill.key, held
                        ),
                    });
                }
                let remaining = held.saturating_sub(fill.quantity);
                if remaining == 0 {
                    book.positions.remove(&fill.key);
                    tracing::info!(key = %fill.key, price = %fill.price, "Position closed");
                } else if let Some(position) = book.positions.get_mut(&fill.key) {
                    position.quantity = remaining;
                    tracing::info!(key = %fill.key, quantity = remaining, "Position reduced");
                }
            }
        }

        set_gauge(GaugeMetric::OpenPositions, book.positions.len() as f64);
        drop(book);
        self.changed.notify_one();
        true
    }

    /// Reconcile the cache against broker holdings; the broker wins
    pub async fn sync_with_broker(&self, broker: &dyn Broker) -> Result<SyncReport, BrokerError> {
        self.sync_with_broker_except(broker, &HashSet::new()).await
    }

    /// Reconcile every symbol except `busy` ones
    ///
    /// A symbol that received a fill while the balance request was in flight
    /// is skipped too: the broker snapshot may predate that fill.
    pub async fn sync_with_broker_except(
        &self,
        broker: &dyn Broker,
        busy: &HashSet<String>,
    ) -> Result<SyncReport, BrokerError> {
        let since = self.book.read().await.generation;
        let balance = broker.get_balance().await?;
        let mut report = SyncReport::default();
        let mut book = self.book.write().await;

        let symbols: BTreeSet<String> = book
            .positions
            .keys()
            .map(|k| k.symbol.clone())
            .chain(balance.holdings.iter().map(|h| h.symbol.clone()))
            .collect();

        for symbol in symbols {
            let raced = book.touched.get(&symbol).is_some_and(|g| *g > since);
            if raced || busy.contains(&symbol) {
                report.skipped.push(symbol);
                continue;
            }
            let holding = balance.holdings.iter().find(|h| h.symbol == symbol);
            let broker_qty = holding.map(|h| h.quantity).unwrap_or(0);
            let broker_avg = holding.map(|h| h.avg_price).unwrap_or_default();

            // Oldest first
            let mut keys: Vec<PositionKey> = book
                .positions
                .values()
                .filter(|p| p.key.symbol == symbol)
                .map(|p| p.key.clone())
                .collect();
            keys.sort_by_key(|k| book.positions[k].opened_at);
            let local_qty: u64 = keys.iter().map(|k| book.positions[k].quantity).sum();

            if broker_qty == local_qty {
                if let [key] = keys.as_slice() {
                    let position = book.positions.get_mut(key);
                    if let Some(position) = position {
                        if broker_avg > Decimal::ZERO && position.avg_price != broker_avg {
                            report.mismatches.push(AuditEvent {
                                at: Utc::now(),
                                symbol: symbol.clone(),
                                kind: MismatchKind::AvgPriceDiffers,
                                local_quantity: local_qty,
                                broker_quantity: broker_qty,
                                detail: format!(
                                    "avg price {} replaced by broker {}",
                                    position.avg_price, broker_avg
                                ),
                            });
                            position.avg_price = broker_avg;
                        }
                    }
                }
                continue;
            }

            let now = Utc::now();
            if broker_qty == 0 {
                for key in &keys {
                    book.positions.remove(key);
                }
                report.mismatches.push(AuditEvent {
                    at: now,
                    symbol: symbol.clone(),
                    kind: MismatchKind::MissingAtBroker,
                    local_quantity: local_qty,
                    broker_quantity: 0,
                    detail: format!("dropped {} local position(s)", keys.len()),
                });
            } else if keys.is_empty() {
                let key = PositionKey::new(&symbol, UNMANAGED_STRATEGY);
                book.positions.insert(
                    key.clone(),
                    Position {
                        key,
                        quantity: broker_qty,
                        avg_price: broker_avg,
                        opened_at: now,
                        thresholds: self.defaults,
                    },
                );
                report.mismatches.push(AuditEvent {
                    at: now,
                    symbol: symbol.clone(),
                    kind: MismatchKind::MissingLocally,
                    local_quantity: 0,
                    broker_quantity: broker_qty,
                    detail: format!("adopted as {}", UNMANAGED_STRATEGY),
                });
            } else if broker_qty < local_qty {
                let mut excess = local_qty - broker_qty;
                for key in keys.iter().rev() {
                    if excess == 0 {
                        break;
                    }
                    let Some(position) = book.positions.get_mut(key) else {
                        continue;
                    };
                    let cut = excess.min(position.quantity);
                    position.quantity -= cut;
                    excess -= cut;
                    if position.quantity == 0 {
                        book.positions.remove(key);
                    }
                }
                report.mismatches.push(AuditEvent {
                    at: now,
                    symbol: symbol.clone(),
                    kind: MismatchKind::QuantityDiffers,
                    local_quantity: local_qty,
                    broker_quantity: broker_qty,
                    detail: "trimmed newest positions first".to_string(),
                });
            } else {
                let excess = broker_qty - local_qty;
                let detail = if let [key] = keys.as_slice() {
                    if let Some(position) = book.positions.get_mut(key) {
                        position.quantity = broker_qty;
                        if broker_avg > Decimal::ZERO {
                            position.avg_price = broker_avg;
                        }
                    }
                    format!("extended {} by {}", key, excess)
                } else {
                    let key = PositionKey::new(&symbol, UNMANAGED_STRATEGY);
                    let defaults = self.defaults;
                    let position = book.positions.entry(key.clone()).or_insert_with(|| Position {
                        key: key.clone(),
                        quantity: 0,
                        avg_price: broker_avg,
                        opened_at: now,
                        thresholds: defaults,
                    });
                    position.quantity += excess;
                    format!("excess {} assigned to {}", excess, key)
                };
                report.mismatches.push(AuditEvent {
                    at: now,
                    symbol: symbol.clone(),
                    kind: MismatchKind::QuantityDiffers,
                    local_quantity: local_qty,
                    broker_quantity: broker_qty,
                    detail,
                });
            }
        }

        report.open_positions = book.positions.len();
        set_gauge(GaugeMetric::OpenPositions, book.positions.len() as f64);
        drop(book);

        for mismatch in &report.mismatches {
            tracing::warn!(
                symbol = %mismatch.symbol,
                kind = ?mismatch.kind,
                local = mismatch.local_quantity,
                broker = mismatch.broker_quantity,
                detail = %mismatch.detail,
                "Reconciliation mismatch, broker state applied"
            );
            incr(CounterMetric::ReconciliationMismatches);
            self.record(mismatch.clone());
        }
        if !report.is_clean() {
            self.changed.notify_one();
        }

        tracing::info!(
            open_positions = report.open_positions,
            mismatches = report.mismatches.len(),
            skipped = report.skipped.len(),
            "Positions synced with broker"
        );
        Ok(report)
    }

    /// Drop idempotency keys of orders no longer tracked
    pub async fn forget_fills(&self, orders: &HashSet<OrderId>) -> usize {
        let mut book = self.book.write().await;
        let before = book.applied.len();
        book.applied.retain(|(id, _)| !orders.contains(id));
        before - book.applied.len()
    }

    /// Seed the cache from persisted state before the first broker sync
    pub async fn restore(&self, positions: Vec<Position>) {
        let mut book = self.book.write().await;
        for position in positions {
            book.positions.insert(position.key.clone(), position);
        }
        set_gauge(GaugeMetric::OpenPositions, book.positions.len() as f64);
    }

    /// Consistent copy of all open positions
    pub async fn snapshot(&self) -> Vec<Position> {
        let book = self.book.read().await;
        let mut positions: Vec<Position> = book.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.key.cmp(&b.key));
        positions
    }

    pub async fn get(&self, key: &PositionKey) -> Option<Position> {
        self.book.read().await.positions.get(key).cloned()
    }

    pub async fn for_symbol(&self, symbol: &str) -> Vec<Position> {
        self.book
            .read()
            .await
            .positions
            .values()
            .filter(|p| p.key.symbol == symbol)
            .cloned()
            .collect()
    }

    pub async fn open_count(&self) -> usize {
        self.book.read().await.positions.len()
    }

    /// Replace the exit thresholds of one position
    pub async fn set_thresholds(&self, key: &PositionKey, thresholds: ExitThresholds) -> bool {
        match self.book.write().await.positions.get_mut(key) {
            Some(position) => {
                position.thresholds = thresholds;
                true
            }
            None => false,
        }
    }

    /// Recorded reconciliation mismatches, oldest first
    pub fn audit_log(&self) -> Vec<AuditEvent> {
        self.audit.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn record(&self, event: AuditEvent) {
        if let Ok(mut log) = self.audit.lock() {
            if log.len() >= AUDIT_CAPACITY {
                log.remove(0);
            }
            log.push(event);
        }
    }
}
