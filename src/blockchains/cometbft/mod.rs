pub mod block;
pub mod metrics;
pub mod rpc;
pub mod types;
