//! Background loops: dispatcher, receipt poller and drift detector ticks.

pub mod periodic;

pub use periodic::{PeriodicWorker, WorkerHandle};
