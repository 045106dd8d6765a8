//! Medic Agent — autonomous resurrection arbiter.
//!
//! Consumes kill notifications from the Smith security agent, decides
//! whether each kill was justified, and — in live mode — restarts the
//! terminated container and records the outcome. Outcomes feed back into
//! the decision engine, which re-calibrates its auto-approval confidence
//! bar from historical accuracy.
//!
//! # Pipeline
//!
//! ```text
//! stream ──► validate ──► enrich (SIEM) ──► decide ──► act ──► record ──► ack
//!                                             │                  │
//!                                             └── calibration ◄──┘
//! ```

pub mod api;
pub mod config;
pub mod decision;
pub mod error;
pub mod listener;
pub mod models;
pub mod orchestrator;
pub mod pending;
pub mod resurrector;
pub mod siem;
pub mod store;
pub mod validation;
