//! Configuration types for leverage-worker

use crate::telemetry::LogFormat;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Live REST endpoint
pub const KIS_LIVE_URL: &str = "https://openapi.koreainvestment.com:9443";
/// Paper (mock investment) REST endpoint
pub const KIS_PAPER_URL: &str = "https://openapivts.koreainvestment.com:29443";
/// Live real-time endpoint
pub const KIS_LIVE_WS_URL: &str = "ws://ops.koreainvestment.com:21000";
/// Paper real-time endpoint
pub const KIS_PAPER_WS_URL: &str = "ws://ops.koreainvestment.com:31000";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub orders: OrderConfig,
    #[serde(default)]
    pub exit: ExitConfig,
    #[serde(default)]
    pub liquidation: LiquidationConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub emergency: EmergencyConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Execution mode: paper trading or live
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Paper,
    Live,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Paper => "paper",
            ExecutionMode::Live => "live",
        }
    }
}

/// Brokerage connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    /// App key; falls back to `KIS_APP_KEY` when empty
    #[serde(default)]
    pub app_key: String,
    /// App secret; falls back to `KIS_APP_SECRET` when empty
    #[serde(default, skip_serializing)]
    pub app_secret: String,
    /// 8-digit account number; falls back to `KIS_ACCOUNT_NO` when empty
    #[serde(default)]
    pub account_no: String,
    /// 2-digit account product code
    #[serde(default = "default_account_product")]
    pub account_product: String,
    /// HTS user id, required for real-time order notices
    #[serde(default)]
    pub hts_id: Option<String>,
    /// Override for the REST base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// Override for the real-time URL
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_account_product() -> String {
    "01".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Paper,
            app_key: String::new(),
            app_secret: String::new(),
            account_no: String::new(),
            account_product: default_account_product(),
            hts_id: None,
            base_url: None,
            ws_url: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl BrokerConfig {
    /// REST base URL for the configured mode
    pub fn rest_url(&self) -> &str {
        match (&self.base_url, self.mode) {
            (Some(url), _) => url,
            (None, ExecutionMode::Paper) => KIS_PAPER_URL,
            (None, ExecutionMode::Live) => KIS_LIVE_URL,
        }
    }

    /// Real-time URL for the configured mode
    pub fn realtime_url(&self) -> &str {
        match (&self.ws_url, self.mode) {
            (Some(url), _) => url,
            (None, ExecutionMode::Paper) => KIS_PAPER_WS_URL,
            (None, ExecutionMode::Live) => KIS_LIVE_WS_URL,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Fill empty credential fields from the environment
    pub fn resolve_credentials(&mut self) {
        fill_from_env(&mut self.app_key, "KIS_APP_KEY");
        fill_from_env(&mut self.app_secret, "KIS_APP_SECRET");
        fill_from_env(&mut self.account_no, "KIS_ACCOUNT_NO");
    }
}

fn fill_from_env(field: &mut String, var: &str) {
    if field.is_empty() {
        if let Ok(value) = std::env::var(var) {
            *field = value;
        }
    }
}

/// Request budget per environment
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_paper_rps")]
    pub paper_rps: f64,
    #[serde(default = "default_live_rps")]
    pub live_rps: f64,
}

fn default_paper_rps() -> f64 {
    2.0
}
fn default_live_rps() -> f64 {
    20.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            paper_rps: default_paper_rps(),
            live_rps: default_live_rps(),
        }
    }
}

impl RateLimitConfig {
    /// Minimum spacing between two broker calls
    pub fn min_interval(&self, mode: ExecutionMode) -> Duration {
        let rps = match mode {
            ExecutionMode::Paper => self.paper_rps,
            ExecutionMode::Live => self.live_rps,
        };
        Duration::from_secs_f64(1.0 / rps)
    }
}

/// Transport retry settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Floor applied to the backoff after a rate-limit response
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    5_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_factor() -> f64 {
    0.2
}
fn default_rate_limit_backoff_ms() -> u64 {
    1_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
        }
    }
}

/// How a chase re-prices the next submission
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChaseStep {
    /// Move the price by a number of exchange ticks
    Ticks { count: u32 },
    /// Move the price by a percentage of the previous price
    Percent { pct: Decimal },
}

impl Default for ChaseStep {
    fn default() -> Self {
        ChaseStep::Ticks { count: 1 }
    }
}

/// What a buy chase does after its last re-price
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedPolicy {
    /// Give up; the last order ends FAILED
    Abandon,
    /// Convert the remainder to a market order
    #[default]
    Market,
}

/// Order execution settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrderConfig {
    /// Status polling interval while waiting for a fill
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Time a chase order may rest before it is re-priced
    #[serde(default = "default_chase_interval_ms")]
    pub chase_interval_ms: u64,
    /// Maximum number of re-priced resubmissions
    #[serde(default = "default_max_chase_attempts")]
    pub max_chase_attempts: u32,
    #[serde(default)]
    pub chase_step: ChaseStep,
    #[serde(default)]
    pub on_exhausted: ExhaustedPolicy,
    /// Time a limit sell may rest before converting to market
    #[serde(default = "default_sell_fallback_timeout_ms")]
    pub sell_fallback_timeout_ms: u64,
    /// Time allowed for a market order to report filled
    #[serde(default = "default_market_fill_timeout_ms")]
    pub market_fill_timeout_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}
fn default_chase_interval_ms() -> u64 {
    3_000
}
fn default_max_chase_attempts() -> u32 {
    3
}
fn default_sell_fallback_timeout_ms() -> u64 {
    5_000
}
fn default_market_fill_timeout_ms() -> u64 {
    10_000
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            chase_interval_ms: default_chase_interval_ms(),
            max_chase_attempts: default_max_chase_attempts(),
            chase_step: ChaseStep::default(),
            on_exhausted: ExhaustedPolicy::default(),
            sell_fallback_timeout_ms: default_sell_fallback_timeout_ms(),
            market_fill_timeout_ms: default_market_fill_timeout_ms(),
        }
    }
}

impl OrderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn chase_interval(&self) -> Duration {
        Duration::from_millis(self.chase_interval_ms)
    }

    pub fn sell_fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.sell_fallback_timeout_ms)
    }

    pub fn market_fill_timeout(&self) -> Duration {
        Duration::from_millis(self.market_fill_timeout_ms)
    }
}

/// Default exit thresholds attached to new positions
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExitConfig {
    /// Take-profit in percent of entry price
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: Decimal,
    /// Stop-loss in percent of entry price
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// Maximum holding time (0 = no timeout)
    #[serde(default = "default_max_holding_minutes")]
    pub max_holding_minutes: i64,
    /// Window in which repeated triggers for one position are suppressed
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    /// Price polling interval when no real-time stream is used
    #[serde(default = "default_price_poll_ms")]
    pub price_poll_ms: u64,
}

fn default_take_profit_pct() -> Decimal {
    Decimal::new(30, 1) // 3.0%
}
fn default_stop_loss_pct() -> Decimal {
    Decimal::new(20, 1) // 2.0%
}
fn default_max_holding_minutes() -> i64 {
    60
}
fn default_dedup_window_ms() -> u64 {
    5_000
}
fn default_price_poll_ms() -> u64 {
    2_000
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            take_profit_pct: default_take_profit_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            max_holding_minutes: default_max_holding_minutes(),
            dedup_window_ms: default_dedup_window_ms(),
            price_poll_ms: default_price_poll_ms(),
        }
    }
}

impl ExitConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}

/// End-of-day forced close-out
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LiquidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Local exchange time, "HH:MM"
    #[serde(default = "default_liquidation_time")]
    pub time: String,
    /// Exchange UTC offset in hours
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
    /// Placement retries per position
    #[serde(default = "default_liquidation_retries")]
    pub retries: u32,
    #[serde(default = "default_liquidation_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// How long to wait for market sells to report filled
    #[serde(default = "default_settle_timeout_secs")]
    pub settle_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_liquidation_time() -> String {
    "15:19".to_string()
}
fn default_utc_offset_hours() -> i32 {
    9
}
fn default_liquidation_retries() -> u32 {
    2
}
fn default_liquidation_retry_delay_ms() -> u64 {
    500
}
fn default_settle_timeout_secs() -> u64 {
    20
}

impl Default for LiquidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time: default_liquidation_time(),
            utc_offset_hours: default_utc_offset_hours(),
            retries: default_liquidation_retries(),
            retry_delay_ms: default_liquidation_retry_delay_ms(),
            settle_timeout_secs: default_settle_timeout_secs(),
        }
    }
}

/// Background health probing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// Consecutive unhealthy results before a halting check trips
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Checks allowed to trigger the emergency stop
    #[serde(default = "default_halt_on")]
    pub halt_on: Vec<String>,
    /// Consecutive broker failures before the API check reports degraded
    #[serde(default = "default_api_degraded_after")]
    pub api_degraded_after: u32,
    /// Consecutive broker failures before the API check reports unhealthy
    #[serde(default = "default_api_unhealthy_after")]
    pub api_unhealthy_after: u32,
    /// Main loop heartbeat age that counts as stalled
    #[serde(default = "default_scheduler_stale_secs")]
    pub scheduler_stale_secs: u64,
}

fn default_health_interval_secs() -> u64 {
    60
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_halt_on() -> Vec<String> {
    vec!["api".to_string()]
}
fn default_api_degraded_after() -> u32 {
    2
}
fn default_api_unhealthy_after() -> u32 {
    5
}
fn default_scheduler_stale_secs() -> u64 {
    300
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            failure_threshold: default_failure_threshold(),
            halt_on: default_halt_on(),
            api_degraded_after: default_api_degraded_after(),
            api_unhealthy_after: default_api_unhealthy_after(),
            scheduler_stale_secs: default_scheduler_stale_secs(),
        }
    }
}

/// Session persistence
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

/// Operator stop file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmergencyConfig {
    /// File whose appearance halts new entries; its content is the reason
    #[serde(default = "default_stop_file")]
    pub stop_file: PathBuf,
    #[serde(default = "default_stop_file_poll_secs")]
    pub poll_interval_secs: u64,
}

fn default_stop_file() -> PathBuf {
    PathBuf::from("./EMERGENCY_STOP")
}
fn default_stop_file_poll_secs() -> u64 {
    5
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            stop_file: default_stop_file(),
            poll_interval_secs: default_stop_file_poll_secs(),
        }
    }
}

/// One traded (symbol, strategy) pair
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub symbol: String,
    pub strategy: String,
    /// Upper bound on shares per entry; capped by buyable quantity
    pub max_quantity: u64,
    #[serde(default)]
    pub params: HashMap<String, f64>,
}

/// Main loop settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    /// Candles fetched per signal evaluation
    #[serde(default = "default_candle_count")]
    pub candle_count: usize,
    /// Signals below this confidence are ignored
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Use the broker's real-time stream for ticks
    #[serde(default)]
    pub realtime: bool,
    /// Seconds between position syncs with broker holdings; 0 disables
    #[serde(default = "default_position_sync_interval_secs")]
    pub position_sync_interval_secs: u64,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

fn default_cycle_interval_secs() -> u64 {
    60
}
fn default_candle_count() -> usize {
    30
}
fn default_min_confidence() -> f64 {
    0.5
}
fn default_position_sync_interval_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval_secs(),
            candle_count: default_candle_count(),
            min_confidence: default_min_confidence(),
            realtime: false,
            position_sync_interval_secs: default_position_sync_interval_secs(),
            targets: vec![],
        }
    }
}

/// Outbound notifications
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotificationConfig {
    #[serde(default, skip_serializing)]
    pub slack_webhook_url: Option<String>,
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// Prometheus listener port; disabled when absent
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            metrics_port: None,
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.broker.resolve_credentials();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rate_limit.paper_rps <= 0.0 || self.rate_limit.live_rps <= 0.0 {
            anyhow::bail!("rate_limit: requests per second must be positive");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.orders.poll_interval_ms == 0 {
            anyhow::bail!("orders.poll_interval_ms must be positive");
        }
        match self.orders.chase_step {
            ChaseStep::Ticks { count } if count == 0 => {
                anyhow::bail!("orders.chase_step.count must be at least 1")
            }
            ChaseStep::Percent { pct } if pct <= Decimal::ZERO => {
                anyhow::bail!("orders.chase_step.pct must be positive")
            }
            _ => {}
        }
        if self.exit.take_profit_pct <= Decimal::ZERO || self.exit.stop_loss_pct <= Decimal::ZERO {
            anyhow::bail!("exit: take_profit_pct and stop_loss_pct must be positive");
        }
        if chrono::NaiveTime::parse_from_str(&self.liquidation.time, "%H:%M").is_err() {
            anyhow::bail!("liquidation.time must be HH:MM, got {}", self.liquidation.time);
        }
        if self.health.failure_threshold == 0 {
            anyhow::bail!("health.failure_threshold must be at least 1");
        }
        for target in &self.engine.targets {
            if target.max_quantity == 0 {
                anyhow::bail!("engine.targets: {} has max_quantity 0", target.symbol);
            }
        }
        Ok(())
    }
}
