//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（DB、共有カウンタ、メール送信）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - MessageStore が source of truth（正本）
//! - DispatchQueue（`crate::queue`）は配送ジョブの一時的な置き場
//! - CounterStore は RateLimiter 専用の共有カウンタ

pub mod clock;
pub mod counter_store;
pub mod id_generator;
pub mod message_store;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::counter_store::{CounterError, CounterStore};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::message_store::{MessageStore, StoreError};
pub use self::transport::{DeliveryInfo, MailTransport, TransportError};
