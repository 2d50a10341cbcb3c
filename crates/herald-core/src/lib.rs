//! herald-core
//!
//! Core building blocks for the Herald scheduled-delivery pipeline.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, message, status, job, errors）
//! - **ports**: 抽象化レイヤー（MessageStore, CounterStore, MailTransport, Clock, IdGenerator）
//! - **queue**: DispatchQueue（lease / retry / backoff / throughput limit）
//! - **rate_limit**: 固定窓の RateLimiter
//! - **app**: アプリケーションロジック（builder, scheduler_loop, worker_loop, reaper_loop, submission, status）
//! - **impls**: ports の実装（in-memory, SQLite, LogTransport）
//! - **config** / **logging**: 設定と tracing の初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod logging;
pub mod ports;
pub mod queue;
pub mod rate_limit;
