//! Distributed MapReduce over gRPC.
//!
//! A coordinator brings up map and reduce worker processes, spreads the input files
//! over the mappers in bounded rounds, has the mappers shuffle their buckets to the
//! reducers and collects one output file per reducer.

pub mod bucket;
pub mod client;
pub mod cluster;
pub mod common;
pub mod config;
pub mod error;
pub mod logging;
pub mod map_reduce_apps;
pub mod map_reduce_seq;
pub mod rpc;

pub use common::{MapReduceApp, Operation};
pub use config::ClusterConfig;
pub use error::{MrError, Result};
