//! Coaching entitlement payment pipeline.
//!
//! Players buy a coaching package (sport + tier) from a provider. Once the
//! processor reports the payment, the pipeline issues a quota-bearing
//! entitlement, opens or refreshes the player/provider conversation, routes
//! the provider's share of the money, and enforces the quota as messages
//! are sent.
//!
//! # Example
//!
//! ```rust,ignore
//! use coachline::coaching::{
//!     CheckoutRequest, CoachingService, InMemoryLedgerStore, RoutingMode, Tier,
//! };
//!
//! let service = CoachingService::builder(store, processor)
//!     .config(config.coaching.clone())
//!     .build();
//!
//! // Create the charge the client pays
//! let session = service.create_checkout(CheckoutRequest {
//!     player_id: "player_1".into(),
//!     player_name: Some("Sam".into()),
//!     provider_id: "coach_1".into(),
//!     sport: "golf".into(),
//!     tier: Tier::Two,
//!     routing_mode: RoutingMode::Destination,
//!     customer_ref: None,
//!     idempotency_key: None,
//! }).await?;
//!
//! // Later, from the processor webhook
//! let outcome = service.handle_webhook(&body, &signature).await?;
//! ```

pub mod accounts;
pub mod audit;
pub mod catalog;
pub mod checkout;
pub mod conversation;
pub mod error;
pub mod fees;
pub mod guard;
pub mod issuer;
pub mod processor;
pub mod reconcile;
pub mod router;
pub mod service;
pub mod storage;
pub mod webhook;

// Catalog and fees
pub use catalog::{Package, PackageCatalog, PackageCatalogBuilder, Tier};
pub use fees::{compute_fee, FeePercent, FeeSplit};

// Storage exports
pub use storage::{
    CoachAccount, Conversation, ConversationStatus, Entitlement, EntitlementStatus,
    InMemoryLedgerStore, InsertOutcome, LedgerStore, Message, MessageType, SenderRole,
    TransferRecord, TransferSource, TransferStatus, UnreadCounts,
};

// Processor exports
pub use processor::{
    AccountStatus, ChargeRecord, ChargeStatus, CreateChargeRequest, CreateTransferRequest,
    MockPaymentProcessor, PaymentProcessor, TransferResult,
};

// Pipeline components
pub use accounts::CoachAccountResolver;
pub use checkout::{CheckoutManager, CheckoutRequest, CheckoutSession};
pub use conversation::ConversationManager;
pub use guard::{ConversationGuard, QuotaSnapshot, SendMessageRequest};
pub use issuer::{EntitlementIssuer, IssueOutcome, IssueReport, PaymentEvent, RoutingStatus};
pub use reconcile::{ProviderTransferReport, Reconciler, TransferSummary};
pub use router::{FundRouter, RoutingMode};
pub use service::{CoachingService, CoachingServiceBuilder};
pub use webhook::{WebhookEvent, WebhookHandler, WebhookOutcome, WebhookVerifier};

// Audit exports
pub use audit::{
    CoachingAuditEvent, CoachingAuditLogger, MemoryAuditLogger, NoOpAuditLogger,
    SharedAuditLogger, TracingAuditLogger,
};

// Error exports
pub use error::{CoachingError, CoachingResult};
