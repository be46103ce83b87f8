//! KIS real-time WebSocket feed
//!
//! Data frames are pipe-delimited: `encrypted|tr_id|count|f0^f1^...`, with
//! `count` records of fixed width concatenated in the payload. Control
//! frames are JSON; the server's PINGPONG must be echoed back verbatim.

use super::{PriceTick, StreamEvent, TickFeed};
use crate::broker::{kst, BrokerError, KisClient};
use crate::config::{BrokerConfig, ExecutionMode};
use crate::ws::{WsClient, WsConfig, WsMessage};
use async_trait::async_trait;
use chrono::{NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TR_TICK: &str = "H0STCNT0";
const TR_NOTICE_LIVE: &str = "H0STCNI0";
const TR_NOTICE_PAPER: &str = "H0STCNI9";
const TR_PINGPONG: &str = "PINGPONG";

/// Fields per H0STCNT0 record
const TICK_FIELDS: usize = 46;
const TICK_SYMBOL: usize = 0;
const TICK_TIME: usize = 1;
const TICK_PRICE: usize = 2;
const TICK_VOLUME: usize = 12;

const NOTICE_ORDER_NO: usize = 2;
const NOTICE_FILLED_FLAG: usize = 13;

pub struct KisFeed {
    ws_url: String,
    approval_key: String,
    mode: ExecutionMode,
    hts_id: Option<String>,
}

impl KisFeed {
    pub fn new(
        ws_url: impl Into<String>,
        approval_key: impl Into<String>,
        mode: ExecutionMode,
        hts_id: Option<String>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            approval_key: approval_key.into(),
            mode,
            hts_id,
        }
    }

    /// Issue an approval key and build a feed for the configured environment
    pub async fn connect(client: &KisClient, config: &BrokerConfig) -> Result<Self, BrokerError> {
        let approval_key = client.approval_key().await?;
        if config.hts_id.is_none() {
            tracing::warn!("No HTS id configured; order notices disabled, fills found by polling only");
        }
        Ok(Self::new(
            config.realtime_url(),
            approval_key,
            config.mode,
            config.hts_id.clone(),
        ))
    }

    fn notice_tr_id(&self) -> &'static str {
        match self.mode {
            ExecutionMode::Live => TR_NOTICE_LIVE,
            ExecutionMode::Paper => TR_NOTICE_PAPER,
        }
    }

    fn subscription(&self, tr_id: &str, tr_key: &str) -> String {
        json!({
            "header": {
                "approval_key": self.approval_key,
                "custtype": "P",
                "tr_type": "1",
                "content-type": "utf-8",
            },
            "body": {
                "input": { "tr_id": tr_id, "tr_key": tr_key }
            }
        })
        .to_string()
    }

    fn subscriptions(&self, symbols: &[String]) -> Vec<String> {
        let mut messages: Vec<String> = symbols
            .iter()
            .map(|symbol| self.subscription(TR_TICK, symbol))
            .collect();
        if let Some(hts_id) = &self.hts_id {
            messages.push(self.subscription(self.notice_tr_id(), hts_id));
        }
        messages
    }

    /// Parse one data frame into events
    fn parse_frame(text: &str) -> Vec<StreamEvent> {
        let mut parts = text.splitn(4, '|');
        let (Some(encrypted), Some(tr_id), Some(count), Some(payload)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return vec![];
        };

        match tr_id {
            TR_TICK => {
                let count: usize = count.parse().unwrap_or(1);
                let fields: Vec<&str> = payload.split('^').collect();
                fields
                    .chunks(TICK_FIELDS)
                    .take(count)
                    .filter_map(parse_tick)
                    .map(StreamEvent::Tick)
                    .collect()
            }
            TR_NOTICE_LIVE | TR_NOTICE_PAPER => {
                if encrypted == "1" {
                    return vec![StreamEvent::OrderNotice {
                        broker_order_id: None,
                    }];
                }
                let fields: Vec<&str> = payload.split('^').collect();
                if fields.get(NOTICE_FILLED_FLAG).map(|f| f.trim()) != Some("2") {
                    // Acceptance, cancel and reject notices carry no fill
                    return vec![];
                }
                let broker_order_id = fields
                    .get(NOTICE_ORDER_NO)
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty());
                vec![StreamEvent::OrderNotice { broker_order_id }]
            }
            _ => vec![],
        }
    }

    async fn run_message_loop(
        mut ws_rx: mpsc::Receiver<WsMessage>,
        ws_tx: mpsc::Sender<String>,
        event_tx: mpsc::Sender<StreamEvent>,
        subscriptions: Vec<String>,
    ) {
        while let Some(msg) = ws_rx.recv().await {
            match msg {
                WsMessage::Text(text) => {
                    if text.starts_with('0') || text.starts_with('1') {
                        for event in Self::parse_frame(&text) {
                            if event_tx.send(event).await.is_err() {
                                tracing::debug!("Event receiver dropped, stopping feed");
                                return;
                            }
                        }
                    } else if handle_control(&text) && ws_tx.send(text).await.is_err() {
                        return;
                    }
                }
                WsMessage::Connected => {
                    tracing::info!(subscriptions = subscriptions.len(), "KIS feed connected");
                    for sub in &subscriptions {
                        if ws_tx.send(sub.clone()).await.is_err() {
                            return;
                        }
                    }
                    if event_tx.send(StreamEvent::Connected).await.is_err() {
                        return;
                    }
                }
                WsMessage::Disconnected => {
                    tracing::warn!("KIS feed disconnected");
                    let _ = event_tx.send(StreamEvent::Disconnected).await;
                    break;
                }
                WsMessage::Reconnecting { attempt } => {
                    tracing::warn!(attempt, "KIS feed reconnecting...");
                }
            }
        }
    }
}

/// Handle a JSON control frame; returns true if it must be echoed
fn handle_control(text: &str) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        tracing::debug!(frame = %text, "Unrecognized frame");
        return false;
    };
    let tr_id = value
        .pointer("/header/tr_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if tr_id == TR_PINGPONG {
        return true;
    }

    let rt_cd = value.pointer("/body/rt_cd").and_then(Value::as_str);
    let msg = value
        .pointer("/body/msg1")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match rt_cd {
        Some("0") => tracing::info!(tr_id, msg, "Subscription acknowledged"),
        Some(code) => tracing::warn!(tr_id, code, msg, "Subscription rejected"),
        None => tracing::debug!(tr_id, "Control frame"),
    }
    false
}

fn parse_tick(fields: &[&str]) -> Option<PriceTick> {
    if fields.len() <= TICK_VOLUME {
        return None;
    }
    let price = Decimal::from_str(fields[TICK_PRICE].trim()).ok()?;
    let volume = fields[TICK_VOLUME].trim().parse().ok()?;
    let now = Utc::now();
    let exchange_ts = NaiveTime::parse_from_str(fields[TICK_TIME].trim(), "%H%M%S")
        .ok()
        .and_then(|time| {
            now.with_timezone(&kst())
                .date_naive()
                .and_time(time)
                .and_local_timezone(kst())
                .single()
        })
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(now);

    Some(PriceTick {
        symbol: fields[TICK_SYMBOL].trim().to_string(),
        price,
        volume,
        timestamp: now,
        exchange_ts,
    })
}

#[async_trait]
impl TickFeed for KisFeed {
    async fn subscribe(
        &self,
        symbols: &[String],
        shutdown: CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<StreamEvent>> {
        let (event_tx, event_rx) = mpsc::channel(1024);
        tracing::info!(symbols = ?symbols, url = %self.ws_url, "Subscribing to KIS feed");

        let config = WsConfig::new(self.ws_url.clone())
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(60))
            .ping_interval(Duration::from_secs(30));
        let client = WsClient::new(config);
        let (ws_rx, ws_tx) = client.connect(shutdown);

        let subscriptions = self.subscriptions(symbols);
        tokio::spawn(async move {
            Self::run_message_loop(ws_rx, ws_tx, event_tx, subscriptions).await;
        });

        Ok(event_rx)
    }
}
