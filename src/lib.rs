pub mod config;
pub mod jobs;
pub mod metrics;
pub mod rpc;
pub mod stratum;
