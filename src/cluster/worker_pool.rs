//! Supervision of the worker processes a coordinator brings up.
//!
//! The pool owns a handle per worker, so a failed bring-up can roll back the workers
//! already started and `shutdown` (or dropping the pool) stops all of them.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::server;
use crate::cluster::WorkerRole;
use crate::config::ClusterConfig;
use crate::error::{MrError, Result};
use crate::rpc;

const READY_POLL: Duration = Duration::from_millis(50);
const READY_GRACE: Duration = Duration::from_millis(200);

pub enum WorkerHandle {
    Process(Child),
    InProcess {
        shutdown: Option<oneshot::Sender<()>>,
        task: JoinHandle<Result<()>>,
    },
}

impl WorkerHandle {
    pub fn is_alive(&mut self) -> bool {
        match self {
            WorkerHandle::Process(child) => matches!(child.try_wait(), Ok(None)),
            WorkerHandle::InProcess { task, .. } => !task.is_finished(),
        }
    }

    pub async fn stop(&mut self) {
        match self {
            WorkerHandle::Process(child) => {
                if let Err(err) = child.kill().await {
                    warn!("cannot kill worker process: {}", err);
                }
            }
            WorkerHandle::InProcess { shutdown, task } => {
                if let Some(tx) = shutdown.take() {
                    let _ = tx.send(());
                }
                if tokio::time::timeout(Duration::from_secs(5), &mut *task)
                    .await
                    .is_err()
                {
                    task.abort();
                }
            }
        }
    }
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, role: WorkerRole, port: u16) -> Result<WorkerHandle>;
}

/// Starts `<exe> worker <role> <port> --config <path>` per worker.
pub struct ProcessLauncher {
    exe: PathBuf,
    config_path: PathBuf,
    verbose: u8,
}

impl ProcessLauncher {
    pub fn new(exe: PathBuf, config_path: PathBuf, verbose: u8) -> Self {
        Self {
            exe,
            config_path,
            verbose,
        }
    }

    pub fn current_exe(config_path: PathBuf, verbose: u8) -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| MrError::ProcessSpawn {
            role: "worker".to_string(),
            port: 0,
            reason: format!("cannot locate own executable: {}", e),
        })?;
        Ok(Self::new(exe, config_path, verbose))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, role: WorkerRole, port: u16) -> Result<WorkerHandle> {
        let mut command = Command::new(&self.exe);
        command
            .arg("--config")
            .arg(&self.config_path)
            .arg("worker")
            .arg(role.as_str())
            .arg(port.to_string())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if self.verbose > 0 {
            command.arg(format!("-{}", "v".repeat(self.verbose as usize)));
        }

        let child = command.spawn().map_err(|e| MrError::ProcessSpawn {
            role: role.to_string(),
            port,
            reason: e.to_string(),
        })?;
        debug!(%role, port, pid = child.id(), "worker process spawned");
        Ok(WorkerHandle::Process(child))
    }
}

/// Serves each worker on a task of the current runtime.
pub struct InProcessLauncher {
    config: Arc<ClusterConfig>,
}

impl InProcessLauncher {
    pub fn new(config: Arc<ClusterConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, role: WorkerRole, port: u16) -> Result<WorkerHandle> {
        let listener = server::bind(&self.config.host, port, role.as_str()).await?;
        let (tx, rx) = oneshot::channel::<()>();
        let config = self.config.clone();
        let task = tokio::spawn(async move {
            server::serve_worker(config, role, listener, async {
                let _ = rx.await;
            })
            .await
        });
        Ok(WorkerHandle::InProcess {
            shutdown: Some(tx),
            task,
        })
    }
}

pub struct ManagedWorker {
    pub role: WorkerRole,
    pub port: u16,
    pub endpoint: String,
    handle: WorkerHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHealth {
    pub role: WorkerRole,
    pub port: u16,
    pub alive: bool,
}

pub struct WorkerPool {
    workers: Vec<ManagedWorker>,
}

impl WorkerPool {
    /// Launches the first `n_mappers` mappers and `n_reducers` reducers of the config,
    /// waiting for each to accept connections. On any failure the workers already
    /// started are stopped before the error is returned.
    pub async fn start(
        launcher: &dyn WorkerLauncher,
        config: &ClusterConfig,
        n_mappers: usize,
        n_reducers: usize,
    ) -> Result<Self> {
        config.check_counts(n_mappers, n_reducers)?;

        let mappers = config
            .mappers
            .ports
            .iter()
            .zip(config.mapper_endpoints(n_mappers))
            .map(|(port, endpoint)| (WorkerRole::Mapper, *port, endpoint));
        let reducers = config
            .reducers
            .ports
            .iter()
            .zip(config.reducer_endpoints(n_reducers))
            .map(|(port, endpoint)| (WorkerRole::Reducer, *port, endpoint));
        let plan = mappers.chain(reducers);

        let mut pool = WorkerPool {
            workers: Vec::with_capacity(n_mappers + n_reducers),
        };
        for (role, port, endpoint) in plan {
            match launch_ready(launcher, config, role, port, endpoint).await {
                Ok(worker) => pool.workers.push(worker),
                Err(err) => {
                    warn!(%role, port, "rolling back cluster start: {}", err);
                    pool.shutdown().await;
                    return Err(err);
                }
            }
        }
        info!(workers = pool.workers.len(), "cluster started");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn endpoints(&self, role: WorkerRole) -> Vec<String> {
        self.workers
            .iter()
            .filter(|w| w.role == role)
            .map(|w| w.endpoint.clone())
            .collect()
    }

    pub fn health(&mut self) -> Vec<WorkerHealth> {
        self.workers
            .iter_mut()
            .map(|w| WorkerHealth {
                role: w.role,
                port: w.port,
                alive: w.handle.is_alive(),
            })
            .collect()
    }

    pub async fn shutdown(&mut self) {
        for mut worker in self.workers.drain(..) {
            debug!(role = %worker.role, port = worker.port, "stopping worker");
            worker.handle.stop().await;
        }
    }
}

async fn launch_ready(
    launcher: &dyn WorkerLauncher,
    config: &ClusterConfig,
    role: WorkerRole,
    port: u16,
    endpoint: String,
) -> Result<ManagedWorker> {
    let mut handle = launcher.launch(role, port).await?;

    let deadline = Instant::now() + config.timeouts.startup();
    loop {
        if !handle.is_alive() {
            return Err(MrError::ProcessSpawn {
                role: role.to_string(),
                port,
                reason: "worker exited during startup".to_string(),
            });
        }
        if rpc::connect(&endpoint, config.timeouts.connect()).await.is_ok() {
            // An older process may still hold the port while this one fails to bind.
            tokio::time::sleep(READY_GRACE).await;
            if handle.is_alive() {
                debug!(%role, port, "worker ready");
                return Ok(ManagedWorker {
                    role,
                    port,
                    endpoint,
                    handle,
                });
            }
            continue;
        }
        if Instant::now() >= deadline {
            handle.stop().await;
            return Err(MrError::ProcessSpawn {
                role: role.to_string(),
                port,
                reason: format!(
                    "not reachable within {}ms",
                    config.timeouts.startup().as_millis()
                ),
            });
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(root: &std::path::Path, mappers: Vec<u16>, reducers: Vec<u16>) -> Arc<ClusterConfig> {
        let mut config = ClusterConfig::local(root, free_port(), mappers, reducers);
        config.timeouts.startup_ms = 2_000;
        config.timeouts.connect_ms = 200;
        Arc::new(config)
    }

    #[tokio::test]
    async fn starts_and_stops_in_process_workers() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path(), vec![free_port()], vec![free_port(), free_port()]);
        let launcher = InProcessLauncher::new(config.clone());

        let mut pool = WorkerPool::start(&launcher, &config, 1, 2).await.unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.endpoints(WorkerRole::Reducer).len(), 2);
        assert!(pool.health().iter().all(|h| h.alive));

        let endpoint = pool.endpoints(WorkerRole::Mapper)[0].clone();
        pool.shutdown().await;
        assert!(pool.is_empty());
        assert!(rpc::connect(&endpoint, Duration::from_millis(200)).await.is_err());
    }

    #[tokio::test]
    async fn rolls_back_when_a_port_is_taken() {
        let root = tempfile::tempdir().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_port = taken.local_addr().unwrap().port();
        let mapper_port = free_port();
        let config = config(root.path(), vec![mapper_port], vec![taken_port]);
        let launcher = InProcessLauncher::new(config.clone());

        let result = WorkerPool::start(&launcher, &config, 1, 1).await;
        assert!(matches!(result, Err(MrError::ProcessSpawn { .. })));

        // The mapper started before the failure is gone again.
        let mapper = config.endpoint(mapper_port);
        assert!(rpc::connect(&mapper, Duration::from_millis(200)).await.is_err());
        drop(taken);
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let launcher = ProcessLauncher::new(
            PathBuf::from("/definitely/not/a/binary"),
            PathBuf::from("config.json"),
            0,
        );
        let result = launcher.launch(WorkerRole::Mapper, free_port()).await;
        assert!(matches!(result, Err(MrError::ProcessSpawn { .. })));
    }

    /// Stands in for a worker that fails to bind because the port is still taken.
    struct DiesAfterLaunch;

    #[async_trait]
    impl WorkerLauncher for DiesAfterLaunch {
        async fn launch(&self, role: WorkerRole, port: u16) -> Result<WorkerHandle> {
            let task = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(MrError::ProcessSpawn {
                    role: role.to_string(),
                    port,
                    reason: "address in use".to_string(),
                })
            });
            Ok(WorkerHandle::InProcess {
                shutdown: None,
                task,
            })
        }
    }

    #[tokio::test]
    async fn stale_listener_does_not_mark_dying_worker_ready() {
        let root = tempfile::tempdir().unwrap();
        let port = free_port();
        let config = config(root.path(), vec![port], vec![free_port()]);

        let mut stale = InProcessLauncher::new(config.clone())
            .launch(WorkerRole::Mapper, port)
            .await
            .unwrap();
        let endpoint = config.endpoint(port);
        while rpc::connect(&endpoint, Duration::from_millis(200)).await.is_err() {
            tokio::time::sleep(READY_POLL).await;
        }

        let result = WorkerPool::start(&DiesAfterLaunch, &config, 1, 1).await;
        assert!(matches!(
            result,
            Err(MrError::ProcessSpawn { ref reason, .. }) if reason.contains("exited")
        ));
        stale.stop().await;
    }
}
