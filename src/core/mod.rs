pub mod app_context;
pub mod clients;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod pace;
pub mod retry;
