//! In-process simulated broker
//!
//! Keeps a market price per symbol and fills marketable orders against it.
//! Tests script failures, rejections and racing fills through the control
//! methods; `run --simulate` uses it as a dry-run venue.

use super::{
    ApiStats, Balance, Broker, BrokerError, BrokerOrderState, BrokerOrderStatus, Candle, Holding,
    OrderAck, OrderKind, OrderSide,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// An order as it was submitted to the simulator
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub broker_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: u64,
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone)]
struct SimOrder {
    status: BrokerOrderStatus,
    kind: OrderKind,
    limit: Option<Decimal>,
}

#[derive(Debug)]
struct SimState {
    prices: HashMap<String, Decimal>,
    holdings: HashMap<String, (u64, Decimal)>,
    cash: Decimal,
    orders: HashMap<String, SimOrder>,
    order_seq: u64,
    candles: HashMap<String, Vec<Candle>>,
    fill_marketable_limits: bool,
    fill_market_orders: bool,
    reject_next: Option<(String, String)>,
    fail_next: VecDeque<BrokerError>,
    cancel_fails: bool,
    fill_on_cancel: Option<u64>,
    calls: u64,
    placed: Vec<PlacedOrder>,
    max_live: HashMap<String, usize>,
}

/// Scriptable broker backed by in-memory state
pub struct SimulatedBroker {
    state: Mutex<SimState>,
    stats: Arc<ApiStats>,
}

impl Default for SimulatedBroker {
    fn default() -> Self {
        Self::new(Decimal::new(10_000_000, 0))
    }
}

impl SimulatedBroker {
    /// Create a simulator with the given cash balance
    pub fn new(cash: Decimal) -> Self {
        Self {
            state: Mutex::new(SimState {
                prices: HashMap::new(),
                holdings: HashMap::new(),
                cash,
                orders: HashMap::new(),
                order_seq: 0,
                candles: HashMap::new(),
                fill_marketable_limits: true,
                fill_market_orders: true,
                reject_next: None,
                fail_next: VecDeque::new(),
                cancel_fails: false,
                fill_on_cancel: None,
                calls: 0,
                placed: vec![],
                max_live: HashMap::new(),
            }),
            stats: Arc::new(ApiStats::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicked holder leaves plain data behind; keep using it
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move the market price and fill any resting limit orders it crosses
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.lock();
        state.prices.insert(symbol.to_string(), price);
        if state.fill_marketable_limits {
            let crossed: Vec<String> = state
                .orders
                .iter()
                .filter(|(_, o)| o.status.symbol == symbol && o.status.state == BrokerOrderState::Open)
                .filter(|(_, o)| is_marketable(o, price))
                .map(|(id, _)| id.clone())
                .collect();
            for id in crossed {
                let remaining = state.orders[&id].status.quantity
                    - state.orders[&id].status.filled_quantity;
                fill(&mut state, &id, remaining, price);
            }
        }
    }

    pub fn set_holding(&self, symbol: &str, quantity: u64, avg_price: Decimal) {
        let mut state = self.lock();
        if quantity == 0 {
            state.holdings.remove(symbol);
        } else {
            state
                .holdings
                .insert(symbol.to_string(), (quantity, avg_price));
        }
    }

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.lock().candles.insert(symbol.to_string(), candles);
    }

    /// Whether limit orders at or through the market fill on their own
    pub fn set_fill_marketable_limits(&self, enabled: bool) {
        self.lock().fill_marketable_limits = enabled;
    }

    /// Whether market orders fill on submission
    pub fn set_fill_market_orders(&self, enabled: bool) {
        self.lock().fill_market_orders = enabled;
    }

    /// Reject the next order submission
    pub fn reject_next(&self, code: &str, message: &str) {
        self.lock().reject_next = Some((code.to_string(), message.to_string()));
    }

    /// Fail the next call of any kind with the given error
    pub fn fail_next(&self, err: BrokerError) {
        self.lock().fail_next.push_back(err);
    }

    /// Make cancel requests fail while leaving orders live
    pub fn set_cancel_fails(&self, fails: bool) {
        self.lock().cancel_fails = fails;
    }

    /// Fill this quantity just before the next cancel lands
    pub fn fill_on_next_cancel(&self, quantity: u64) {
        self.lock().fill_on_cancel = Some(quantity);
    }

    /// Fill part or all of an open order at the given price
    pub fn fill_order(&self, broker_order_id: &str, quantity: u64, price: Decimal) {
        let mut state = self.lock();
        fill(&mut state, broker_order_id, quantity, price);
    }

    /// Drop an order so status queries report it unknown
    pub fn forget_order(&self, broker_order_id: &str) {
        self.lock().orders.remove(broker_order_id);
    }

    pub fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.lock().placed.clone()
    }

    /// Orders currently resting for a symbol
    pub fn live_orders(&self, symbol: &str) -> usize {
        live_count(&self.lock(), symbol)
    }

    /// Highest number of simultaneously live orders seen for a symbol
    pub fn max_live_orders(&self, symbol: &str) -> usize {
        self.lock().max_live.get(symbol).copied().unwrap_or(0)
    }

    pub fn holding(&self, symbol: &str) -> u64 {
        self.lock().holdings.get(symbol).map(|h| h.0).unwrap_or(0)
    }

    pub fn call_count(&self) -> u64 {
        self.lock().calls
    }

    /// Count the call and apply any scripted failure
    fn enter(&self) -> Result<MutexGuard<'_, SimState>, BrokerError> {
        let mut state = self.lock();
        state.calls += 1;
        if let Some(err) = state.fail_next.pop_front() {
            self.stats.record_failure(err.is_timeout());
            return Err(err);
        }
        self.stats.record_success();
        Ok(state)
    }

    fn submit(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
        kind: OrderKind,
        limit: Option<Decimal>,
    ) -> Result<OrderAck, BrokerError> {
        let mut state = self.enter()?;

        if let Some((code, message)) = state.reject_next.take() {
            return Err(BrokerError::rejected(code, message));
        }
        if quantity == 0 {
            return Err(BrokerError::rejected("SIM0001", "quantity must be positive"));
        }
        let market = state.prices.get(symbol).copied();
        if kind == OrderKind::Market && market.is_none() {
            return Err(BrokerError::rejected("SIM0002", "no market price"));
        }
        if side == OrderSide::Sell {
            let held = state.holdings.get(symbol).map(|h| h.0).unwrap_or(0);
            let reserved: u64 = state
                .orders
                .values()
                .filter(|o| o.status.symbol == symbol && o.status.side == OrderSide::Sell)
                .filter(|o| o.status.state == BrokerOrderState::Open)
                .map(|o| o.status.quantity - o.status.filled_quantity)
                .sum();
            if quantity + reserved > held {
                return Err(BrokerError::rejected("SIM0003", "insufficient holdings"));
            }
        }

        state.order_seq += 1;
        let broker_order_id = format!("{:010}", state.order_seq);
        state.orders.insert(
            broker_order_id.clone(),
            SimOrder {
                status: BrokerOrderStatus {
                    broker_order_id: broker_order_id.clone(),
                    symbol: symbol.to_string(),
                    side,
                    quantity,
                    filled_quantity: 0,
                    avg_fill_price: None,
                    state: BrokerOrderState::Open,
                },
                kind,
                limit,
            },
        );
        state.placed.push(PlacedOrder {
            broker_order_id: broker_order_id.clone(),
            symbol: symbol.to_string(),
            side,
            kind,
            quantity,
            price: limit,
        });

        let live = live_count(&state, symbol);
        let max = state.max_live.entry(symbol.to_string()).or_insert(0);
        *max = (*max).max(live);

        if let Some(price) = market {
            let order = &state.orders[&broker_order_id];
            let fills_now = match kind {
                OrderKind::Market => state.fill_market_orders,
                OrderKind::Limit => state.fill_marketable_limits && is_marketable(order, price),
            };
            if fills_now {
                fill(&mut state, &broker_order_id, quantity, price);
            }
        }

        Ok(OrderAck {
            broker_order_id,
            accepted_at: Utc::now(),
        })
    }
}

fn is_marketable(order: &SimOrder, market: Decimal) -> bool {
    match (order.kind, order.limit) {
        (OrderKind::Market, _) => true,
        (OrderKind::Limit, Some(limit)) => match order.status.side {
            OrderSide::Buy => limit >= market,
            OrderSide::Sell => limit <= market,
        },
        (OrderKind::Limit, None) => false,
    }
}

fn live_count(state: &SimState, symbol: &str) -> usize {
    state
        .orders
        .values()
        .filter(|o| o.status.symbol == symbol && o.status.state == BrokerOrderState::Open)
        .count()
}

/// Apply a fill to an order and the account
fn fill(state: &mut SimState, broker_order_id: &str, quantity: u64, price: Decimal) {
    let Some(order) = state.orders.get_mut(broker_order_id) else {
        return;
    };
    if order.status.state != BrokerOrderState::Open {
        return;
    }
    let quantity = quantity.min(order.status.quantity - order.status.filled_quantity);
    if quantity == 0 {
        return;
    }

    let prev_qty = Decimal::from(order.status.filled_quantity);
    let prev_avg = order.status.avg_fill_price.unwrap_or_default();
    let new_qty = order.status.filled_quantity + quantity;
    order.status.avg_fill_price =
        Some((prev_avg * prev_qty + price * Decimal::from(quantity)) / Decimal::from(new_qty));
    order.status.filled_quantity = new_qty;
    if new_qty == order.status.quantity {
        order.status.state = BrokerOrderState::Filled;
    }

    let symbol = order.status.symbol.clone();
    let side = order.status.side;
    let notional = price * Decimal::from(quantity);
    match side {
        OrderSide::Buy => {
            state.cash -= notional;
            let entry = state.holdings.entry(symbol).or_insert((0, Decimal::ZERO));
            let total = entry.0 + quantity;
            entry.1 = (entry.1 * Decimal::from(entry.0) + notional) / Decimal::from(total);
            entry.0 = total;
        }
        OrderSide::Sell => {
            state.cash += notional;
            if let Some(entry) = state.holdings.get_mut(&symbol) {
                entry.0 = entry.0.saturating_sub(quantity);
                if entry.0 == 0 {
                    state.holdings.remove(&symbol);
                }
            }
        }
    }
}

#[async_trait]
impl Broker for SimulatedBroker {
    async fn get_price(&self, symbol: &str) -> Result<Decimal, BrokerError> {
        let state = self.enter()?;
        state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::NotFound(format!("no price for {}", symbol)))
    }

    async fn get_balance(&self) -> Result<Balance, BrokerError> {
        let state = self.enter()?;
        let holdings: Vec<Holding> = state
            .holdings
            .iter()
            .map(|(symbol, (quantity, avg_price))| Holding {
                symbol: symbol.clone(),
                name: symbol.clone(),
                quantity: *quantity,
                avg_price: *avg_price,
                current_price: state.prices.get(symbol).copied().unwrap_or(*avg_price),
            })
            .collect();
        let market_value: Decimal = holdings
            .iter()
            .map(|h| h.current_price * Decimal::from(h.quantity))
            .sum();
        Ok(Balance {
            total_eval: state.cash + market_value,
            cash: state.cash,
            holdings,
        })
    }

    async fn get_buyable_quantity(&self, _symbol: &str, price: Decimal) -> Result<u64, BrokerError> {
        let state = self.enter()?;
        if price <= Decimal::ZERO || state.cash <= Decimal::ZERO {
            return Ok(0);
        }
        Ok((state.cash / price).trunc().to_string().parse().unwrap_or(0))
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
    ) -> Result<OrderAck, BrokerError> {
        self.submit(symbol, side, quantity, OrderKind::Market, None)
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
        price: Decimal,
    ) -> Result<OrderAck, BrokerError> {
        self.submit(symbol, side, quantity, OrderKind::Limit, Some(price))
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let mut state = self.enter()?;

        if let Some(quantity) = state.fill_on_cancel.take() {
            let price = state
                .orders
                .get(broker_order_id)
                .and_then(|o| o.limit.or_else(|| state.prices.get(&o.status.symbol).copied()))
                .unwrap_or_default();
            fill(&mut state, broker_order_id, quantity, price);
        }
        if state.cancel_fails {
            return Err(BrokerError::Transient("simulated cancel failure".into()));
        }

        let order = state
            .orders
            .get_mut(broker_order_id)
            .ok_or_else(|| BrokerError::NotFound(format!("order {}", broker_order_id)))?;
        match order.status.state {
            BrokerOrderState::Open => {
                order.status.state = BrokerOrderState::Cancelled;
                Ok(())
            }
            _ => Err(BrokerError::rejected(
                "SIM0004",
                "order is not open; nothing to cancel",
            )),
        }
    }

    async fn get_order_status(
        &self,
        broker_order_id: &str,
    ) -> Result<BrokerOrderStatus, BrokerError> {
        let state = self.enter()?;
        state
            .orders
            .get(broker_order_id)
            .map(|o| o.status.clone())
            .ok_or_else(|| BrokerError::NotFound(format!("order {}", broker_order_id)))
    }

    async fn get_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, BrokerError> {
        let state = self.enter()?;
        let candles = state.candles.get(symbol).cloned().unwrap_or_default();
        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }

    fn stats(&self) -> Arc<ApiStats> {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_resting_limit_fills_when_price_crosses() {
        let broker = SimulatedBroker::default();
        broker.set_price("122630", dec!(10010));

        let ack = broker
            .place_limit_order("122630", OrderSide::Buy, 10, dec!(10000))
            .await
            .unwrap();
        let status = broker.get_order_status(&ack.broker_order_id).await.unwrap();
        assert_eq!(status.state, BrokerOrderState::Open);
        assert_eq!(broker.live_orders("122630"), 1);

        broker.set_price("122630", dec!(9995));
        let status = broker.get_order_status(&ack.broker_order_id).await.unwrap();
        assert_eq!(status.state, BrokerOrderState::Filled);
        assert_eq!(status.avg_fill_price, Some(dec!(9995)));
        assert_eq!(broker.holding("122630"), 10);
    }

    #[tokio::test]
    async fn test_market_order_fills_immediately() {
        let broker = SimulatedBroker::default();
        broker.set_price("252670", dec!(2500));
        broker.set_holding("252670", 20, dec!(2400));

        let ack = broker
            .place_market_order("252670", OrderSide::Sell, 20)
            .await
            .unwrap();
        let status = broker.get_order_status(&ack.broker_order_id).await.unwrap();
        assert_eq!(status.state, BrokerOrderState::Filled);
        assert_eq!(broker.holding("252670"), 0);
    }

    #[tokio::test]
    async fn test_partial_fill_then_cancel() {
        let broker = SimulatedBroker::default();
        broker.set_price("122630", dec!(10100));
        let ack = broker
            .place_limit_order("122630", OrderSide::Buy, 10, dec!(10000))
            .await
            .unwrap();

        broker.fill_order(&ack.broker_order_id, 4, dec!(10000));
        broker.cancel_order(&ack.broker_order_id).await.unwrap();

        let status = broker.get_order_status(&ack.broker_order_id).await.unwrap();
        assert_eq!(status.state, BrokerOrderState::Cancelled);
        assert_eq!(status.filled_quantity, 4);
        assert_eq!(broker.holding("122630"), 4);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let broker = SimulatedBroker::default();
        broker.set_price("122630", dec!(10000));
        broker.fail_next(BrokerError::Timeout);
        broker.reject_next("APBK0919", "insufficient buying power");

        assert!(matches!(
            broker.get_price("122630").await,
            Err(BrokerError::Timeout)
        ));
        assert!(matches!(
            broker
                .place_limit_order("122630", OrderSide::Buy, 1, dec!(10000))
                .await,
            Err(BrokerError::Rejected { .. })
        ));
        assert_eq!(broker.call_count(), 2);
        assert_eq!(broker.stats().snapshot().consecutive_timeouts, 0);
    }

    #[tokio::test]
    async fn test_sell_beyond_holdings_rejected() {
        let broker = SimulatedBroker::default();
        broker.set_price("122630", dec!(10000));
        broker.set_holding("122630", 5, dec!(9900));
        let result = broker
            .place_market_order("122630", OrderSide::Sell, 6)
            .await;
        assert!(matches!(result, Err(BrokerError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_forgotten_order_not_found() {
        let broker = SimulatedBroker::default();
        broker.set_price("122630", dec!(10100));
        let ack = broker
            .place_limit_order("122630", OrderSide::Buy, 1, dec!(10000))
            .await
            .unwrap();
        broker.forget_order(&ack.broker_order_id);
        assert!(matches!(
            broker.get_order_status(&ack.broker_order_id).await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_buyable_quantity() {
        let broker = SimulatedBroker::new(dec!(100000));
        assert_eq!(
            broker.get_buyable_quantity("122630", dec!(10010)).await.unwrap(),
            9
        );
    }
}
