//! `hostpilot-api` — the HTTP producer boundary.
//!
//! Exposes enqueue/status/list/stats over axum; the dispatcher and watchdog
//! loops are spawned by the binary in `main.rs`.

pub mod app;
