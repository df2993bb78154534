pub mod blockchains;
pub mod core;
