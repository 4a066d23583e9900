//! Job starters: one module per long-running service the application
//! can launch.
pub mod utp_listener;
