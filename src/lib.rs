//! Real-time multi-exchange trade aggregation.
//!
//! The engine fans trade events from Binance, Bybit, and OKX into one
//! normalized stream per subscription, bins them into per-symbol OHLCV
//! candles on a fixed interval, and serves them over server-streaming gRPC.

pub mod aggregator;
pub mod candles;
pub mod config;
pub mod exchange;
pub mod proto;
pub mod service;
pub mod streamer;
pub mod types;
