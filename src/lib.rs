//! Coachline - paid coaching entitlements on top of Axum and Tokio
//!
//! Turns successful package payments into quota-bearing coaching
//! entitlements, routes the coach's share of each payment, reconciles
//! transfer history against the payment processor, and enforces clip and
//! daily message limits on player/coach conversations.
//!
//! # Features
//!
//! - **Catalog**: sport + tier packages with price, clip allowance and validity
//! - **Issuance**: exactly one entitlement per payment, however often it is delivered
//! - **Routing**: destination charges or separate transfers, minus the platform fee
//! - **Reconciliation**: merged ledger and processor transfer history per coach
//! - **Guard**: atomic clip consumption and per-day message caps
//! - **Webhooks**: signed processor events with replay protection
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use coachline::{App, CoachingService, ConfigBuilder};
//!
//! #[tokio::main]
//! async fn main() -> coachline::Result<()> {
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     coachline::init_tracing_with_config(&config);
//!
//!     let service = CoachingService::builder(store, processor)
//!         .config(config.coaching.clone())
//!         .build();
//!
//!     App::new(config, Arc::new(service)).serve().await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod coaching;
mod config;
mod core;
mod error;
pub mod http;
pub mod utils;

// Re-exports for public API
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use coaching::{CoachingError, CoachingResult, CoachingService, CoachingServiceBuilder};
pub use config::{CoachingConfig, Config, ConfigBuilder, LoggingConfig, ServerConfig};
pub use core::App;
pub use error::{CoachlineError, ErrorResponse, Result};
pub use http::{ApiResponse, CreatedResponse, IssueResponse, JsonResponse, NoContentResponse};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "coachline::guard=debug")
/// - `COACHLINE_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing with a custom configuration
///
/// `RUST_LOG`, when set, overrides the configured level.
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
