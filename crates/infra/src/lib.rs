//! `regsync-infra`: persistence, the Registry client and the sync engine.
//!
//! The engine is four cooperating loops over a shared [`engine::EngineContext`]:
//! the [`dispatcher`], the receipt poller in [`receipts`], the [`drift`]
//! detector, and the webhook path that feeds [`receipts::ReceiptProcessor`]
//! directly. Domain code only ever touches [`writer::OutboxWriter`].

pub mod alerts;
pub mod config;
pub mod dispatcher;
pub mod drift;
pub mod engine;
pub mod error;
pub mod receipts;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod vault;
pub mod workers;
pub mod writer;

pub use engine::EngineContext;
pub use error::{EngineError, StoreError, StoreResult};
