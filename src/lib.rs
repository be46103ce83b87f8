//! leverage-worker: order execution and recovery engine for leveraged ETF
//! trading on the KIS Open API
//!
//! This library provides the core components for:
//! - Broker access with rate limiting and bounded retry
//! - Limit-order chasing and limit-to-market sell fallback
//! - A single fill-application path shared by polling and streaming
//! - Real-time exit monitoring against take-profit, stop-loss and timeout
//! - Crash recovery from atomically persisted session state
//! - Emergency stop, health checking and daily liquidation
//! - Structured logging and Prometheus metrics

pub mod broker;
pub mod cli;
pub mod config;
pub mod engine;
pub mod exit;
pub mod feed;
pub mod notify;
pub mod order;
pub mod position;
pub mod recovery;
pub mod safety;
pub mod strategy;
pub mod telemetry;
pub mod ws;
