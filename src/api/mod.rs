//! REST route definitions (spec §6).
//!
//! The whole API surface is plain REST JSON — no GraphQL. Routes are
//! grouped by resource and nested under `/api` in `main.rs`.

pub mod health;
pub mod jobs;
pub mod queue;
pub mod shows;
pub mod ws;
