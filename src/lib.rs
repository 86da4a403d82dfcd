//! # Sandbox Bridge
//!
//! Drives script sandboxes from another process over line-delimited JSON.
//!
//! ## Features
//!
//! - **Sessions:** plain evaluators and module hosts, addressed by integer handles
//! - **Cross-boundary functions:** functions passed either way stay callable,
//!   with replies matched by correlation id in any order
//! - **Tagged values:** strings and function references survive the round trip
//! - **Pluggable engines:** a QuickJS adapter ships behind the `quickjs` feature
//!
//! ## Example
//!
//! ```no_run
//! # #[cfg(feature = "quickjs")]
//! # async fn serve() -> sandbox_bridge::Result<()> {
//! use sandbox_bridge::{config::Config, engine::QuickJsFactory, server};
//!
//! let config = Config::default();
//! let factory = QuickJsFactory::new(config.bridge.max_depth);
//! server::run(factory, &config, tokio::io::stdin(), tokio::io::stdout()).await
//! # }
//! ```

pub mod bridge;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod intern;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod value;

pub use bridge::Bridge;
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
