//! HTTP API: receipt webhook, operator read paths and administrative actions.

pub mod app;
