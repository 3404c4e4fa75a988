//! # tollgate-engine
//!
//! The I/O surface of tollgate: store contracts for the two collections
//! (with in-memory and SQLite implementations), the restriction matcher,
//! the check/acquire/release decision engine with its optimistic retry
//! loop, and restriction definition management.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tollgate_core::acquisition::RequestItem;
//! use tollgate_core::policy::MethodRegistry;
//! use tollgate_core::tokenizer::HmacKeyRing;
//! use tollgate_engine::engine::{AcquireParams, AdmissionEngine};
//! use tollgate_engine::store::MemoryStore;
//!
//! # async fn run() -> Result<(), tollgate_engine::error::EngineError> {
//! let store = Arc::new(MemoryStore::new());
//! let engine = AdmissionEngine::new(
//!     store.clone(),
//!     store,
//!     Arc::new(MethodRegistry::with_builtins()),
//!     Arc::new(HmacKeyRing::new()),
//! );
//! let decision = engine
//!     .acquire(&AcquireParams {
//!         acquirer_id: "alice".to_string(),
//!         request: vec![RequestItem::new("widget", 1, 1_700_000_000_000)],
//!         acquisition_ttl: 0,
//!         zones: vec!["zone-a".to_string()],
//!         force_acquisition: false,
//!         deadline: None,
//!     })
//!     .await?;
//! assert!(decision.authorized);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod restrictions;
pub mod store;

pub use clock::{Clock, SystemClock};
pub use engine::{AcquireParams, AdmissionEngine, CheckParams, ReleaseParams};
pub use error::EngineError;
pub use restrictions::RestrictionManager;
pub use store::{MemoryStore, SqliteStore};
