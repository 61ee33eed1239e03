pub mod config;
pub mod embedding;
pub mod errors;
pub mod extraction;
pub mod graph;
pub mod ingest;
pub mod logging;
pub mod search;
pub mod server;
pub mod store;
pub mod sync;
