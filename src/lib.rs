pub mod analyzers;
pub mod archive;
pub mod classifier;
pub mod config;
pub mod error;
pub mod health;
pub mod ingest;
pub mod model;
pub mod period;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod transitions;
pub mod trends;
