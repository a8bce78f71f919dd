//! Predictor Activity Monitor
//!
//! Polls a ranked predictor feed and each tracked predictor's activity feed,
//! detects newly appeared predictions and material odds movements, and hands
//! them to a notifier. The engine is built around an adaptive polling loop, a
//! per-predictor circuit breaker, an idempotent seen-key store, time-window
//! admission and a latched odds movement detector.

pub mod circuit_breaker;
pub mod config;
pub mod detector;
pub mod discord;
pub mod discovery;
pub mod fetcher;
pub mod line_movement;
pub mod notifier;
pub mod scheduler;
pub mod sofascore;
pub mod storage;
pub mod types;
