//! Setup for the running application.
//!
//! Bootstrapping collects everything that happens once at process
//! start: logging initialization and the job starters that turn a
//! [`Configuration`](crate::config::Configuration) into running
//! services.
pub mod jobs;
pub mod logging;
