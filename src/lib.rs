pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod indexer;
pub mod matcher;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod rpc;
pub mod store;
pub mod util;
