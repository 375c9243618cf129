//! Run orchestration and knowledge layer for autonomous web agents.
//!
//! A run drives a policy (planner, actor, critic, judge) against an
//! environment step by step while the layer around it governs and records
//! what happens. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (types, events, guards, progress,
//!   JSON repair). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting storage (run records, host knowledge, config).
//!
//! Orchestration modules ([`control`], [`cache`], [`bus`], [`looping`],
//! [`launcher`]) combine the two into live, steerable, durably recorded runs.

pub mod bus;
pub mod cache;
pub mod control;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod launcher;
pub mod logging;
pub mod looping;
pub mod policy;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
