//! testsmith turns natural-language test specifications into verified
//! Playwright tests.
//!
//! A run plans the specification into steps, has an automation agent carry
//! them out in a real browser, exports the observed interactions as test
//! code, then runs that code and asks the agent to fix it until it passes or
//! the attempt budget is spent. Every stage's output is persisted in the
//! run's artifact namespace as soon as it is produced.

pub mod agent;
pub mod artifacts;
pub mod config;
pub mod error;
pub mod extract;
pub mod gate;
pub mod model;
pub mod pipeline;
pub mod runner;
pub mod secrets;
pub mod stages;
pub mod timeout;
