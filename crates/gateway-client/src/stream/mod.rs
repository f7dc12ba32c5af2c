//! Resilient push-stream subscriptions.
//!
//! A subscription moves through `closed → connecting → open`, and on a
//! transport failure through `error`, from which it reconnects after a fixed
//! delay until the attempt cap is reached.
//!
//! ```text
//! StreamConsumer::spawn(config, transport, observer)
//!   └─ tokio::spawn(driver) ── owns SubscriptionMachine + PushEvents
//!        │
//!        ├── commands ◄── mpsc ◄── StreamConsumer::{connect, reconnect, close}
//!        ├── snapshot ──► watch ──► StreamConsumer::{status, subscribe}
//!        └── messages ──► Arc<RwLock<Vec<Message>>> + StreamObserver
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use gateway_client::stream::{NoopObserver, SseTransport, StreamConfig, StreamConsumer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StreamConfig::for_task("http://localhost:8000/api", "task-1");
//! let consumer =
//!     StreamConsumer::open(config, Arc::new(SseTransport::new()), Arc::new(NoopObserver))
//!         .await?;
//!
//! let mut updates = consumer.subscribe();
//! while updates.changed().await.is_ok() {
//!     println!("status={} messages={}", consumer.status(), consumer.messages().len());
//! }
//! # Ok(())
//! # }
//! ```

mod config;
pub mod consumer;
pub mod machine;
mod message;
pub mod sse;
mod transport;

pub use config::StreamConfig;
pub use consumer::{NoopObserver, StreamConsumer, StreamObserver, SubscriptionSnapshot};
pub use machine::{Effect, Input, StreamStatus, SubscriptionMachine};
pub use message::{AgentStatus, Message};
pub use sse::SseTransport;
pub use transport::{PushEvent, PushEvents, PushTransport};
