//! Korea Investment & Securities Open API client
//!
//! Token-authenticated REST client. All calls go through [`KisClient::call`],
//! which applies the rate limiter, the retry policy and one transparent
//! re-authentication when the access token expires.

use super::retry::{is_retryable_status, Backoff, RetryPolicy};
use super::{
    ApiStats, Balance, Broker, BrokerError, BrokerOrderState, BrokerOrderStatus, Candle, Holding,
    OrderAck, OrderSide, RateLimiter,
};
use crate::config::{BrokerConfig, ExecutionMode, RateLimitConfig, RetryConfig};
use crate::telemetry::{incr, record_latency, CounterMetric, LatencyMetric};
use async_trait::async_trait;
use chrono::{
    DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc,
};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};

/// Access token expired or invalid
const AUTH_EXPIRED_CODES: &[&str] = &["EGW00123", "EGW00121"];
/// Requests per second exceeded
const RATE_LIMIT_CODE: &str = "EGW00201";

/// Market division code for KRX stocks and ETFs
const MARKET_DIV: &str = "J";
const ORDER_DVSN_LIMIT: &str = "00";
const ORDER_DVSN_MARKET: &str = "01";

const PATH_TOKEN: &str = "/oauth2/tokenP";
const PATH_APPROVAL: &str = "/oauth2/Approval";
const PATH_PRICE: &str = "/uapi/domestic-stock/v1/quotations/inquire-price";
const PATH_CANDLES: &str = "/uapi/domestic-stock/v1/quotations/inquire-time-itemchartprice";
const PATH_BALANCE: &str = "/uapi/domestic-stock/v1/trading/inquire-balance";
const PATH_BUYABLE: &str = "/uapi/domestic-stock/v1/trading/inquire-psbl-order";
const PATH_ORDER: &str = "/uapi/domestic-stock/v1/trading/order-cash";
const PATH_CANCEL: &str = "/uapi/domestic-stock/v1/trading/order-rvsecncl";
const PATH_DAILY_FILLS: &str = "/uapi/domestic-stock/v1/trading/inquire-daily-ccld";

const TR_PRICE: &str = "FHKST01010100";
const TR_CANDLES: &str = "FHKST03010200";
const TR_BALANCE: &str = "TTTC8434R";
const TR_BUYABLE: &str = "TTTC8908R";
const TR_BUY: &str = "TTTC0802U";
const TR_SELL: &str = "TTTC0801U";
const TR_CANCEL: &str = "TTTC0803U";
const TR_DAILY_FILLS: &str = "TTTC8001R";

/// Tokens are refreshed this long before the advertised expiry
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Common response envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    rt_cd: Option<String>,
    msg_cd: Option<String>,
    msg1: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct ApprovalResponse {
    approval_key: String,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Row of the daily fills inquiry
#[derive(Debug, Deserialize)]
struct DailyFillRow {
    odno: String,
    #[serde(default)]
    pdno: String,
    #[serde(default)]
    sll_buy_dvsn_cd: String,
    #[serde(default)]
    ord_qty: String,
    #[serde(default)]
    tot_ccld_qty: String,
    #[serde(default)]
    avg_prvs: String,
    #[serde(default)]
    rmn_qty: String,
    #[serde(default)]
    rjct_qty: String,
    #[serde(default)]
    cncl_yn: String,
    #[serde(default)]
    ord_gno_brno: String,
}

#[derive(Debug, Deserialize)]
struct BalanceRow {
    pdno: String,
    #[serde(default)]
    prdt_name: String,
    hldg_qty: String,
    pchs_avg_pric: String,
    prpr: String,
}

#[derive(Debug, Deserialize)]
struct CandleRow {
    stck_bsop_date: String,
    stck_cntg_hour: String,
    stck_oprc: String,
    stck_hgpr: String,
    stck_lwpr: String,
    stck_prpr: String,
    cntg_vol: String,
}

/// A prepared API request
enum Request {
    Get {
        path: &'static str,
        tr_id: &'static str,
        query: Vec<(&'static str, String)>,
    },
    Post {
        path: &'static str,
        tr_id: &'static str,
        body: Value,
    },
}

impl Request {
    fn path(&self) -> &'static str {
        match self {
            Request::Get { path, .. } | Request::Post { path, .. } => path,
        }
    }

    /// GETs are always safe to resend; POSTs here create or cancel orders
    fn idempotent(&self) -> bool {
        matches!(self, Request::Get { .. })
    }
}

/// REST client for the KIS Open API
pub struct KisClient {
    http: Client,
    config: BrokerConfig,
    limiter: RateLimiter,
    retry: RetryPolicy,
    stats: Arc<ApiStats>,
    token: RwLock<Option<AccessToken>>,
    /// Order number to originating branch, needed for cancels
    branches: Mutex<HashMap<String, String>>,
}

impl KisClient {
    /// Create a client for the configured environment
    pub fn new(
        config: &BrokerConfig,
        rate_limit: &RateLimitConfig,
        retry: &RetryConfig,
    ) -> Result<Self, BrokerError> {
        if config.app_key.is_empty() || config.app_secret.is_empty() {
            return Err(BrokerError::AuthFailed("app key and secret are required".into()));
        }
        if config.account_no.len() != 8 {
            return Err(BrokerError::AuthFailed(format!(
                "account number must be 8 digits, got {:?}",
                config.account_no
            )));
        }

        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| BrokerError::Transient(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            config: config.clone(),
            limiter: RateLimiter::new(rate_limit.min_interval(config.mode)),
            retry: RetryPolicy::from(retry),
            stats: Arc::new(ApiStats::new()),
            token: RwLock::new(None),
            branches: Mutex::new(HashMap::new()),
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.config.mode
    }

    /// Issue a real-time approval key for the WebSocket endpoint
    pub async fn approval_key(&self) -> Result<String, BrokerError> {
        let url = format!("{}{}", self.config.rest_url(), PATH_APPROVAL);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "grant_type": "client_credentials",
                "appkey": self.config.app_key,
                "secretkey": self.config.app_secret,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::AuthFailed(format!("approval key: {} - {}", status, body)));
        }

        let approval: ApprovalResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Decode(e.to_string()))?;
        Ok(approval.approval_key)
    }

    /// Current access token, issuing one when absent or near expiry
    async fn access_token(&self) -> Result<String, BrokerError> {
        {
            let token = self.token.read().await;
            if let Some(token) = token.as_ref() {
                if token.expires_at > Utc::now() {
                    return Ok(token.value.clone());
                }
            }
        }
        self.refresh_token().await
    }

    /// Issue a new access token unconditionally
    async fn refresh_token(&self) -> Result<String, BrokerError> {
        let mut slot = self.token.write().await;

        let url = format!("{}{}", self.config.rest_url(), PATH_TOKEN);
        tracing::info!(mode = self.config.mode.as_str(), "Issuing KIS access token");

        let response = self
            .http
            .post(&url)
            .json(&json!({
                "grant_type": "client_credentials",
                "appkey": self.config.app_key,
                "appsecret": self.config.app_secret,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::AuthFailed(format!("token: {} - {}", status, body)));
        }

        let issued: TokenResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Decode(e.to_string()))?;

        let lifetime = (issued.expires_in - TOKEN_REFRESH_MARGIN_SECS).max(0);
        *slot = Some(AccessToken {
            value: issued.access_token.clone(),
            expires_at: Utc::now() + ChronoDuration::seconds(lifetime),
        });

        Ok(issued.access_token)
    }

    /// TR id for the configured environment
    fn tr_id(&self, live_tr_id: &str) -> String {
        paper_tr_id(self.config.mode, live_tr_id)
    }

    /// Send a request with rate limiting, retry and one re-authentication
    async fn call(&self, request: &Request) -> Result<Value, BrokerError> {
        let mut backoff = Backoff::new(&self.retry);
        let mut reauthenticated = false;

        loop {
            self.limiter.acquire().await;
            let started = Instant::now();
            let result = self.send_once(request).await;
            record_latency(LatencyMetric::BrokerCall, started.elapsed());

            let err = match result {
                Ok(value) => {
                    self.stats.record_success();
                    return Ok(value);
                }
                Err(e) => e,
            };

            match &err {
                // The API answered; the request itself was refused
                BrokerError::Rejected { .. } | BrokerError::NotFound(_) => {
                    self.stats.record_success();
                    return Err(err);
                }
                BrokerError::AuthExpired(code) if !reauthenticated => {
                    tracing::warn!(code = %code, path = request.path(), "Access token expired, re-authenticating");
                    reauthenticated = true;
                    self.refresh_token().await?;
                    continue;
                }
                _ => {}
            }

            self.stats.record_failure(err.is_timeout());

            let may_retry = if request.idempotent() {
                err.is_retryable()
            } else {
                err.is_safe_to_resend()
            };
            if !may_retry {
                return Err(err);
            }

            match backoff.next_backoff() {
                Some(mut delay) => {
                    if matches!(err, BrokerError::RateLimited(_)) {
                        delay = delay.max(self.retry.rate_limit_backoff);
                        self.limiter.penalize(delay).await;
                    }
                    incr(CounterMetric::BrokerRetries);
                    tracing::warn!(
                        error = %err,
                        path = request.path(),
                        retry = backoff.retries(),
                        delay_ms = delay.as_millis() as u64,
                        "Broker call failed, retrying"
                    );
                    sleep(delay).await;
                }
                None => {
                    return Err(BrokerError::RetriesExhausted {
                        attempts: backoff.retries() + 1,
                        last: Box::new(err),
                    });
                }
            }
        }
    }

    async fn send_once(&self, request: &Request) -> Result<Value, BrokerError> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.config.rest_url(), request.path());

        let builder = match request {
            Request::Get { tr_id, query, .. } => self
                .http
                .get(&url)
                .query(query)
                .header("tr_id", self.tr_id(tr_id)),
            Request::Post { tr_id, body, .. } => self
                .http
                .post(&url)
                .json(body)
                .header("tr_id", self.tr_id(tr_id)),
        };

        let response = builder
            .header("content-type", "application/json; charset=utf-8")
            .header("authorization", format!("Bearer {}", token))
            .header("appkey", &self.config.app_key)
            .header("appsecret", &self.config.app_secret)
            .header("custtype", "P")
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        classify_response(status, &body)
    }

    fn account_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("CANO", self.config.account_no.clone()),
            ("ACNT_PRDT_CD", self.config.account_product.clone()),
        ]
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
        order_dvsn: &str,
        price: Decimal,
    ) -> Result<OrderAck, BrokerError> {
        let tr_id = match side {
            OrderSide::Buy => TR_BUY,
            OrderSide::Sell => TR_SELL,
        };
        let request = Request::Post {
            path: PATH_ORDER,
            tr_id,
            body: json!({
                "CANO": self.config.account_no,
                "ACNT_PRDT_CD": self.config.account_product,
                "PDNO": symbol,
                "ORD_DVSN": order_dvsn,
                "ORD_QTY": quantity.to_string(),
                "ORD_UNPR": price.trunc().to_string(),
            }),
        };

        let value = self.call(&request).await?;
        let output = value
            .get("output")
            .ok_or_else(|| BrokerError::Decode("order response without output".into()))?;
        let broker_order_id = str_field(output, "ODNO")?;
        let branch = str_field(output, "KRX_FWDG_ORD_ORGNO").unwrap_or_default();

        if let Ok(mut branches) = self.branches.lock() {
            branches.insert(broker_order_id.clone(), branch);
        }

        tracing::info!(
            symbol,
            ?side,
            quantity,
            %price,
            order_dvsn,
            broker_order_id = %broker_order_id,
            "KIS order accepted"
        );

        Ok(OrderAck {
            broker_order_id,
            accepted_at: Utc::now(),
        })
    }

    async fn query_order(&self, broker_order_id: &str) -> Result<DailyFillRow, BrokerError> {
        let today = kst_now().format("%Y%m%d").to_string();
        let mut query = self.account_params();
        query.extend([
            ("INQR_STRT_DT", today.clone()),
            ("INQR_END_DT", today),
            ("SLL_BUY_DVSN_CD", "00".to_string()),
            ("INQR_DVSN", "00".to_string()),
            ("PDNO", String::new()),
            ("CCLD_DVSN", "00".to_string()),
            ("ORD_GNO_BRNO", String::new()),
            ("ODNO", broker_order_id.to_string()),
            ("INQR_DVSN_3", "00".to_string()),
            ("INQR_DVSN_1", String::new()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
        ]);

        let value = self
            .call(&Request::Get {
                path: PATH_DAILY_FILLS,
                tr_id: TR_DAILY_FILLS,
                query,
            })
            .await?;

        let rows: Vec<DailyFillRow> = rows_field(&value, "output1")?;
        rows.into_iter()
            .find(|row| same_order_number(&row.odno, broker_order_id))
            .ok_or_else(|| BrokerError::NotFound(format!("order {}", broker_order_id)))
    }
}

#[async_trait]
impl Broker for KisClient {
    async fn get_price(&self, symbol: &str) -> Result<Decimal, BrokerError> {
        let value = self
            .call(&Request::Get {
                path: PATH_PRICE,
                tr_id: TR_PRICE,
                query: vec![
                    ("FID_COND_MRKT_DIV_CODE", MARKET_DIV.to_string()),
                    ("FID_INPUT_ISCD", symbol.to_string()),
                ],
            })
            .await?;

        let output = value
            .get("output")
            .ok_or_else(|| BrokerError::Decode("price response without output".into()))?;
        parse_decimal(&str_field(output, "stck_prpr")?)
    }

    async fn get_balance(&self) -> Result<Balance, BrokerError> {
        let mut query = self.account_params();
        query.extend([
            ("AFHR_FLPR_YN", "N".to_string()),
            ("OFL_YN", String::new()),
            ("INQR_DVSN", "02".to_string()),
            ("UNPR_DVSN", "01".to_string()),
            ("FUND_STTL_ICLD_YN", "N".to_string()),
            ("FNCG_AMT_AUTO_RDPT_YN", "N".to_string()),
            ("PRCS_DVSN", "00".to_string()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
        ]);

        let value = self
            .call(&Request::Get {
                path: PATH_BALANCE,
                tr_id: TR_BALANCE,
                query,
            })
            .await?;

        let rows: Vec<BalanceRow> = rows_field(&value, "output1")?;
        let mut holdings = Vec::with_capacity(rows.len());
        for row in rows {
            let quantity = parse_u64(&row.hldg_qty)?;
            if quantity == 0 {
                continue;
            }
            holdings.push(Holding {
                symbol: row.pdno,
                name: row.prdt_name,
                quantity,
                avg_price: parse_decimal(&row.pchs_avg_pric)?,
                current_price: parse_decimal(&row.prpr)?,
            });
        }

        let summary = value
            .get("output2")
            .and_then(|v| v.as_array())
            .and_then(|rows| rows.first());
        let (cash, total_eval) = match summary {
            Some(summary) => (
                parse_decimal(&str_field(summary, "dnca_tot_amt")?)?,
                parse_decimal(&str_field(summary, "tot_evlu_amt").unwrap_or_default())
                    .unwrap_or_default(),
            ),
            None => (Decimal::ZERO, Decimal::ZERO),
        };

        Ok(Balance {
            holdings,
            cash,
            total_eval,
        })
    }

    async fn get_buyable_quantity(&self, symbol: &str, price: Decimal) -> Result<u64, BrokerError> {
        let mut query = self.account_params();
        query.extend([
            ("PDNO", symbol.to_string()),
            ("ORD_UNPR", price.trunc().to_string()),
            ("ORD_DVSN", ORDER_DVSN_LIMIT.to_string()),
            ("CMA_EVLU_AMT_ICLD_YN", "N".to_string()),
            ("OVRS_ICLD_YN", "N".to_string()),
        ]);

        let value = self
            .call(&Request::Get {
                path: PATH_BUYABLE,
                tr_id: TR_BUYABLE,
                query,
            })
            .await?;

        let output = value
            .get("output")
            .ok_or_else(|| BrokerError::Decode("buyable response without output".into()))?;
        parse_u64(&str_field(output, "nrcvb_buy_qty")?)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
    ) -> Result<OrderAck, BrokerError> {
        self.place_order(symbol, side, quantity, ORDER_DVSN_MARKET, Decimal::ZERO)
            .await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
        price: Decimal,
    ) -> Result<OrderAck, BrokerError> {
        self.place_order(symbol, side, quantity, ORDER_DVSN_LIMIT, price)
            .await
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let known = self
            .branches
            .lock()
            .ok()
            .and_then(|branches| branches.get(broker_order_id).cloned())
            .filter(|branch| !branch.is_empty());

        let branch = match known {
            Some(branch) => branch,
            None => self.query_order(broker_order_id).await?.ord_gno_brno,
        };

        let request = Request::Post {
            path: PATH_CANCEL,
            tr_id: TR_CANCEL,
            body: json!({
                "CANO": self.config.account_no,
                "ACNT_PRDT_CD": self.config.account_product,
                "KRX_FWDG_ORD_ORGNO": branch,
                "ORGN_ODNO": broker_order_id,
                "ORD_DVSN": ORDER_DVSN_LIMIT,
                "RVSE_CNCL_DVSN_CD": "02",
                "ORD_QTY": "0",
                "ORD_UNPR": "0",
                "QTY_ALL_ORD_YN": "Y",
            }),
        };

        self.call(&request).await?;
        tracing::info!(broker_order_id, "KIS cancel accepted");
        Ok(())
    }

    async fn get_order_status(
        &self,
        broker_order_id: &str,
    ) -> Result<BrokerOrderStatus, BrokerError> {
        let row = self.query_order(broker_order_id).await?;
        status_from_row(row)
    }

    async fn get_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, BrokerError> {
        let hour = kst_now().format("%H%M%S").to_string();
        let value = self
            .call(&Request::Get {
                path: PATH_CANDLES,
                tr_id: TR_CANDLES,
                query: vec![
                    ("FID_ETC_CLS_CODE", String::new()),
                    ("FID_COND_MRKT_DIV_CODE", MARKET_DIV.to_string()),
                    ("FID_INPUT_ISCD", symbol.to_string()),
                    ("FID_INPUT_HOUR_1", hour),
                    ("FID_PW_DATA_INCU_YN", "N".to_string()),
                ],
            })
            .await?;

        let rows: Vec<CandleRow> = rows_field(&value, "output2")?;
        // Newest first on the wire
        let mut candles = rows
            .into_iter()
            .take(limit)
            .map(candle_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        candles.reverse();
        Ok(candles)
    }

    fn stats(&self) -> Arc<ApiStats> {
        self.stats.clone()
    }
}

/// Map an HTTP status and body to a value or a typed error
fn classify_response(status: u16, body: &str) -> Result<Value, BrokerError> {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let envelope: Option<Envelope> = parsed
        .as_ref()
        .and_then(|v| serde_json::from_value(v.clone()).ok());

    if let Some(envelope) = &envelope {
        let code = envelope.msg_cd.as_deref().unwrap_or_default();
        let message = envelope.msg1.clone().unwrap_or_default();
        if AUTH_EXPIRED_CODES.contains(&code) {
            return Err(BrokerError::AuthExpired(code.to_string()));
        }
        if code == RATE_LIMIT_CODE {
            return Err(BrokerError::RateLimited(message));
        }
    }

    if !(200..300).contains(&status) {
        return Err(match status {
            401 => BrokerError::AuthExpired(format!("HTTP 401: {}", body)),
            429 => BrokerError::RateLimited(format!("HTTP 429: {}", body)),
            404 => BrokerError::NotFound(format!("HTTP 404: {}", body)),
            s if is_retryable_status(s) => BrokerError::Transient(format!("HTTP {}: {}", s, body)),
            s => BrokerError::rejected(format!("HTTP {}", s), body),
        });
    }

    let value = parsed.ok_or_else(|| BrokerError::Decode(format!("non-JSON body: {}", body)))?;

    match envelope.and_then(|e| e.rt_cd.map(|rt| (rt, e.msg_cd, e.msg1))) {
        Some((rt_cd, msg_cd, msg1)) if rt_cd != "0" => Err(BrokerError::rejected(
            msg_cd.unwrap_or(rt_cd),
            msg1.unwrap_or_default(),
        )),
        _ => Ok(value),
    }
}

/// Paper trading uses `V`-prefixed TR ids for the T/J/C families
fn paper_tr_id(mode: ExecutionMode, live_tr_id: &str) -> String {
    match mode {
        ExecutionMode::Live => live_tr_id.to_string(),
        ExecutionMode::Paper => match live_tr_id.chars().next() {
            Some('T') | Some('J') | Some('C') => format!("V{}", &live_tr_id[1..]),
            _ => live_tr_id.to_string(),
        },
    }
}

fn status_from_row(row: DailyFillRow) -> Result<BrokerOrderStatus, BrokerError> {
    let quantity = parse_u64(&row.ord_qty)?;
    let filled_quantity = parse_u64(&row.tot_ccld_qty)?;
    let remaining = if row.rmn_qty.trim().is_empty() {
        quantity.saturating_sub(filled_quantity)
    } else {
        parse_u64(&row.rmn_qty)?
    };
    let rejected = parse_u64(&row.rjct_qty).unwrap_or(0);

    let avg_fill_price = match parse_decimal(&row.avg_prvs) {
        Ok(avg) if avg > Decimal::ZERO && filled_quantity > 0 => Some(avg),
        _ => None,
    };

    let state = if quantity > 0 && filled_quantity >= quantity {
        BrokerOrderState::Filled
    } else if row.cncl_yn == "Y" {
        BrokerOrderState::Cancelled
    } else if rejected > 0 && filled_quantity == 0 && remaining == 0 {
        BrokerOrderState::Rejected
    } else if remaining == 0 {
        BrokerOrderState::Cancelled
    } else {
        BrokerOrderState::Open
    };

    let side = match row.sll_buy_dvsn_cd.as_str() {
        "01" => OrderSide::Sell,
        _ => OrderSide::Buy,
    };

    Ok(BrokerOrderStatus {
        broker_order_id: row.odno,
        symbol: row.pdno,
        side,
        quantity,
        filled_quantity,
        avg_fill_price,
        state,
    })
}

fn candle_from_row(row: CandleRow) -> Result<Candle, BrokerError> {
    let date = NaiveDate::parse_from_str(&row.stck_bsop_date, "%Y%m%d")
        .map_err(|e| BrokerError::Decode(format!("candle date: {}", e)))?;
    let time = NaiveTime::parse_from_str(&row.stck_cntg_hour, "%H%M%S")
        .map_err(|e| BrokerError::Decode(format!("candle time: {}", e)))?;
    let local = kst()
        .from_local_datetime(&date.and_time(time))
        .single()
        .ok_or_else(|| BrokerError::Decode("ambiguous candle time".into()))?;

    Ok(Candle {
        time: local.with_timezone(&Utc),
        open: parse_decimal(&row.stck_oprc)?,
        high: parse_decimal(&row.stck_hgpr)?,
        low: parse_decimal(&row.stck_lwpr)?,
        close: parse_decimal(&row.stck_prpr)?,
        volume: parse_u64(&row.cntg_vol)?,
    })
}

/// Order numbers come back zero-padded
fn same_order_number(a: &str, b: &str) -> bool {
    a.trim_start_matches('0') == b.trim_start_matches('0')
}

pub(crate) fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap_or_else(|| Utc.fix())
}

fn kst_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&kst())
}

fn str_field(value: &Value, key: &str) -> Result<String, BrokerError> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| BrokerError::Decode(format!("missing field {}", key)))
}

fn rows_field<T: DeserializeOwned>(value: &Value, key: &str) -> Result<Vec<T>, BrokerError> {
    match value.get(key) {
        Some(rows) => serde_json::from_value(rows.clone())
            .map_err(|e| BrokerError::Decode(format!("{}: {}", key, e))),
        None => Ok(vec![]),
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, BrokerError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(raw).map_err(|e| BrokerError::Decode(format!("decimal {:?}: {}", raw, e)))
}

fn parse_u64(raw: &str) -> Result<u64, BrokerError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    // Quantities occasionally arrive as "10.0"
    let value = parse_decimal(raw)?;
    value
        .trunc()
        .to_string()
        .parse()
        .map_err(|e| BrokerError::Decode(format!("quantity {:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn row(ord_qty: &str, filled: &str, remaining: &str, cancelled: &str) -> DailyFillRow {
        DailyFillRow {
            odno: "0000012345".to_string(),
            pdno: "122630".to_string(),
            sll_buy_dvsn_cd: "02".to_string(),
            ord_qty: ord_qty.to_string(),
            tot_ccld_qty: filled.to_string(),
            avg_prvs: "10010".to_string(),
            rmn_qty: remaining.to_string(),
            rjct_qty: "0".to_string(),
            cncl_yn: cancelled.to_string(),
            ord_gno_brno: "06010".to_string(),
        }
    }

    #[test]
    fn test_paper_tr_id_translation() {
        assert_eq!(paper_tr_id(ExecutionMode::Paper, "TTTC0802U"), "VTTC0802U");
        assert_eq!(paper_tr_id(ExecutionMode::Paper, "JTTT1002U"), "VTTT1002U");
        assert_eq!(paper_tr_id(ExecutionMode::Paper, "FHKST01010100"), "FHKST01010100");
        assert_eq!(paper_tr_id(ExecutionMode::Live, "TTTC0802U"), "TTTC0802U");
    }

    #[test]
    fn test_classify_success() {
        let body = r#"{"rt_cd":"0","msg_cd":"MCA00000","msg1":"ok","output":{"stck_prpr":"10010"}}"#;
        let value = classify_response(200, body).unwrap();
        assert_eq!(value["output"]["stck_prpr"], "10010");
    }

    #[test]
    fn test_classify_auth_expired() {
        let body = r#"{"rt_cd":"1","msg_cd":"EGW00123","msg1":"token expired"}"#;
        assert!(matches!(
            classify_response(500, body),
            Err(BrokerError::AuthExpired(code)) if code == "EGW00123"
        ));
    }

    #[test]
    fn test_classify_rate_limit() {
        let body = r#"{"rt_cd":"1","msg_cd":"EGW00201","msg1":"too many requests"}"#;
        assert!(matches!(
            classify_response(500, body),
            Err(BrokerError::RateLimited(_))
        ));
    }

    #[test]
    fn test_classify_business_rejection() {
        let body = r#"{"rt_cd":"7","msg_cd":"APBK0919","msg1":"insufficient buying power"}"#;
        match classify_response(200, body) {
            Err(BrokerError::Rejected { code, message }) => {
                assert_eq!(code, "APBK0919");
                assert_eq!(message, "insufficient buying power");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_server_errors() {
        assert!(matches!(
            classify_response(503, "unavailable"),
            Err(BrokerError::Transient(_))
        ));
        assert!(matches!(
            classify_response(400, "bad"),
            Err(BrokerError::Rejected { .. })
        ));
        assert!(matches!(
            classify_response(200, "<html>"),
            Err(BrokerError::Decode(_))
        ));
    }

    #[test]
    fn test_status_from_row_states() {
        let open = status_from_row(row("10", "4", "6", "N")).unwrap();
        assert_eq!(open.state, BrokerOrderState::Open);
        assert_eq!(open.filled_quantity, 4);
        assert_eq!(open.avg_fill_price, Some(dec!(10010)));

        let filled = status_from_row(row("10", "10", "0", "N")).unwrap();
        assert_eq!(filled.state, BrokerOrderState::Filled);

        let cancelled = status_from_row(row("10", "3", "0", "N")).unwrap();
        assert_eq!(cancelled.state, BrokerOrderState::Cancelled);
        assert_eq!(cancelled.filled_quantity, 3);

        let flagged = status_from_row(row("10", "0", "10", "Y")).unwrap();
        assert_eq!(flagged.state, BrokerOrderState::Cancelled);
        assert!(flagged.avg_fill_price.is_none());
    }

    #[test]
    fn test_same_order_number_ignores_padding() {
        assert!(same_order_number("0000012345", "12345"));
        assert!(!same_order_number("0000012345", "12346"));
    }

    #[test]
    fn test_parse_quantity_forms() {
        assert_eq!(parse_u64("10").unwrap(), 10);
        assert_eq!(parse_u64("10.0").unwrap(), 10);
        assert_eq!(parse_u64("").unwrap(), 0);
        assert!(parse_u64("abc").is_err());
    }

    #[test]
    fn test_candle_from_row() {
        let candle = candle_from_row(CandleRow {
            stck_bsop_date: "20240102".to_string(),
            stck_cntg_hour: "093000".to_string(),
            stck_oprc: "10000".to_string(),
            stck_hgpr: "10050".to_string(),
            stck_lwpr: "9990".to_string(),
            stck_prpr: "10020".to_string(),
            cntg_vol: "1500".to_string(),
        })
        .unwrap();
        assert_eq!(candle.close, dec!(10020));
        assert_eq!(candle.volume, 1500);
        assert_eq!(candle.time.to_rfc3339(), "2024-01-02T00:30:00+00:00");
    }

    #[test]
    fn test_new_requires_credentials() {
        let config = BrokerConfig::default();
        let result = KisClient::new(&config, &RateLimitConfig::default(), &RetryConfig::default());
        assert!(matches!(result, Err(BrokerError::AuthFailed(_))));
    }
}
