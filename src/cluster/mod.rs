pub mod coordinator;
pub mod map_worker;
pub mod reduce_worker;
pub mod server;
pub mod worker_pool;

use std::fmt;

pub use coordinator::CoordinatorService;
pub use map_worker::MapWorkerService;
pub use reduce_worker::ReduceWorkerService;
pub use worker_pool::{InProcessLauncher, ProcessLauncher, WorkerLauncher, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum WorkerRole {
    Mapper,
    Reducer,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Mapper => "mapper",
            WorkerRole::Reducer => "reducer",
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
