//! attribution-core: registration coordinator for attribution reporting
//!
//! Sources and triggers arrive over many concurrent flows: same-document
//! registrations, navigations, background keep-alive requests and fenced
//! frame beacons. The coordinator ties the flows of one navigation together
//! and holds back triggers until every source that navigation could still
//! register has been seen.
//!
//! # Architecture
//!
//! ```text
//! callers → CoordinatorHandle → event loop (Coordinator)
//!                                 ├─ ChannelRegistry   (per-flow eligibility)
//!                                 ├─ ContextTable      (pending accounting)
//!                                 ├─ DeferredTriggerQueue
//!                                 ├─ TimeoutScheduler  → timer events
//!                                 └─ parse tasks       → parse events
//!                                        ↓
//!                          AttributionSink + OutcomeSink
//! ```
//!
//! # Modules
//!
//! - `coordinator`: the state machine
//! - `service`: async event loop and handle
//! - `channel`: registration channels and their indices
//! - `context`: navigation contexts and eviction memory
//! - `deferred`: bounded trigger queue
//! - `timeout`: cancellable context timers
//! - `parser`: header selection and JSON parsing
//! - `keep_alive`: background keep-alive request helper
//! - `telemetry`: outcome tags and diagnostics
//! - `config`, `logging`, `error`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod channel;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod deferred;
pub mod error;
pub mod ids;
pub mod keep_alive;
pub mod logging;
pub mod origin;
pub mod parser;
pub mod registration;
pub mod service;
pub mod sink;
pub mod telemetry;
pub mod timeout;

pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, CoordinatorSnapshot};
pub use error::{Error, RegistrationError, Result};
pub use service::{CoordinatorHandle, CoordinatorService, CoordinatorTask};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
