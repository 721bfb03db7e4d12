use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cluster::worker_pool::{WorkerLauncher, WorkerPool};
use crate::cluster::WorkerRole;
use crate::common::{read_files_from_dir, sanitize_file_name, Operation};
use crate::config::ClusterConfig;
use crate::error::{MrError, Result};
use crate::rpc::proto::coordinator_server::Coordinator;
use crate::rpc::proto::{
    Ack, FileOutput, InitClusterRequest, InitReduceRequest, JobReport, RunMapRdRequest,
    RunMapRequest, RunReduceRequest, ShuffleReport,
};
use crate::rpc::{self, with_retry};

struct Cluster {
    pool: WorkerPool,
    n_mappers: usize,
    n_reducers: usize,
}

/// Who works on a job: mapper endpoints in round-robin order and reducer endpoints
/// in bucket-index order.
#[derive(Debug, Clone)]
pub struct ClusterShape {
    pub mappers: Vec<String>,
    pub reducers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MapTask {
    pub task_id: u32,
    pub file_name: String,
    pub path: PathBuf,
}

pub struct CoordinatorService {
    config: Arc<ClusterConfig>,
    launcher: Arc<dyn WorkerLauncher>,
    cluster: Mutex<Option<Cluster>>,
}

impl CoordinatorService {
    pub fn new(config: Arc<ClusterConfig>, launcher: Arc<dyn WorkerLauncher>) -> Result<Self> {
        let staging = config.staging_dir();
        std::fs::create_dir_all(&staging).map_err(|e| MrError::io(&staging, e))?;
        Ok(Self {
            config,
            launcher,
            cluster: Mutex::new(None),
        })
    }

    pub async fn start_cluster(&self, n_mappers: usize, n_reducers: usize) -> Result<()> {
        self.config.check_counts(n_mappers, n_reducers)?;

        let mut cluster = self.cluster.lock().await;
        if let Some(mut previous) = cluster.take() {
            info!(workers = previous.pool.len(), "replacing running cluster");
            previous.pool.shutdown().await;
        }
        let pool =
            WorkerPool::start(self.launcher.as_ref(), &self.config, n_mappers, n_reducers).await?;
        *cluster = Some(Cluster {
            pool,
            n_mappers,
            n_reducers,
        });
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(mut cluster) = self.cluster.lock().await.take() {
            if !cluster.pool.is_empty() {
                info!(workers = cluster.pool.len(), "stopping workers");
            }
            cluster.pool.shutdown().await;
        }
    }

    async fn shape(&self) -> Result<ClusterShape> {
        let mut guard = self.cluster.lock().await;
        let cluster = guard.as_mut().ok_or_else(|| {
            MrError::Config("cluster not initialized, call InitCluster first".to_string())
        })?;

        for health in cluster.pool.health() {
            if !health.alive {
                warn!(role = %health.role, port = health.port, "worker is not running");
            }
        }
        let shape = ClusterShape {
            mappers: cluster.pool.endpoints(WorkerRole::Mapper),
            reducers: cluster.pool.endpoints(WorkerRole::Reducer),
        };
        debug_assert_eq!(shape.mappers.len(), cluster.n_mappers);
        debug_assert_eq!(shape.reducers.len(), cluster.n_reducers);
        Ok(shape)
    }

    /// Drains the client stream into a fresh staging area; returns the operation and file count.
    async fn receive_inputs(&self, stream: &mut Streaming<RunMapRdRequest>) -> Result<(Operation, u32)> {
        let staging = self.config.staging_dir();
        reset_dir(&staging).await?;

        let mut operation: Option<Operation> = None;
        let mut received = 0;
        while let Some(message) = stream
            .message()
            .await
            .map_err(|status| MrError::transport("client", status))?
        {
            if operation.is_none() {
                operation = Some(message.operation.parse()?);
            }
            let Some(file) = message.file else {
                warn!("stream message without a file, skipping");
                continue;
            };
            let name = sanitize_file_name(&file.name)?;
            let path = staging.join(&name);
            if path.exists() {
                warn!(file = %name, "duplicate input file name, keeping the latest");
            }
            tokio::fs::write(&path, &file.data)
                .await
                .map_err(|e| MrError::io(&path, e))?;
            debug!(file = %name, bytes = file.data.len(), "staged input");
            received += 1;
        }

        let operation = operation
            .ok_or_else(|| MrError::TaskExecution("input stream was empty".to_string()))?;
        Ok((operation, received))
    }

    /// Runs map, shuffle and reduce over everything in the staging area.
    pub async fn run_job(
        &self,
        job_id: Uuid,
        operation: Operation,
        shape: &ClusterShape,
    ) -> Result<JobReport> {
        let mut report = JobReport {
            job_id: job_id.to_string(),
            operation: operation.to_string(),
            ..Default::default()
        };

        let tasks: Vec<MapTask> = read_files_from_dir(self.config.staging_dir())?
            .into_iter()
            .enumerate()
            .map(|(i, (file_name, path))| MapTask {
                task_id: i as u32,
                file_name,
                path,
            })
            .collect();
        report.map_tasks_dispatched = tasks.len() as u32;

        info!(tasks = tasks.len(), mappers = shape.mappers.len(), "map phase");
        let n_reducers = shape.reducers.len() as u32;
        let map_results = dispatch_in_rounds(tasks, shape.mappers.len(), |task| {
            let endpoint = &shape.mappers[task.task_id as usize % shape.mappers.len()];
            async move {
                let task_id = task.task_id;
                let result = self.dispatch_map(endpoint, task, operation, n_reducers).await;
                (task_id, result)
            }
        })
        .await;
        for (task_id, result) in map_results {
            if let Err(err) = result {
                error!(task_id, "map task failed: {}", err);
                report.failed_map_tasks.push(task_id);
            }
        }
        info!(failed = report.failed_map_tasks.len(), "map phase done");

        info!("shuffle phase");
        let shuffles = join_all(
            shape
                .mappers
                .iter()
                .map(|endpoint| self.trigger_shuffle(endpoint, &shape.reducers)),
        )
        .await;
        for (endpoint, result) in shape.mappers.iter().zip(shuffles) {
            match result {
                Ok(shuffle) => {
                    report.buckets_forwarded += shuffle.buckets_sent;
                    report.buckets_failed += shuffle.buckets_failed;
                }
                Err(err) => {
                    error!(%endpoint, "init reduce failed: {}", err);
                    report.failed_shuffle_workers.push(endpoint.clone());
                }
            }
        }
        info!(
            forwarded = report.buckets_forwarded,
            failed = report.buckets_failed,
            "shuffle phase done"
        );

        let output_dir = self.config.output_dir();
        reset_dir(&output_dir).await?;

        info!(reducers = shape.reducers.len(), "reduce phase");
        let outputs = join_all(
            shape
                .reducers
                .iter()
                .map(|endpoint| self.trigger_reduce(endpoint, operation)),
        )
        .await;
        for (endpoint, result) in shape.reducers.iter().zip(outputs) {
            let persisted = match result {
                Ok(output) => persist_output(&output_dir, output).await,
                Err(err) => Err(err),
            };
            match persisted {
                Ok(name) => report.output_files.push(name),
                Err(err) => {
                    error!(%endpoint, "reduce failed: {}", err);
                    report.failed_reducers.push(endpoint.clone());
                }
            }
        }

        report.complete = report.failed_map_tasks.is_empty()
            && report.buckets_failed == 0
            && report.failed_shuffle_workers.is_empty()
            && report.failed_reducers.is_empty();
        info!(complete = report.complete, outputs = report.output_files.len(), "job done");
        Ok(report)
    }

    async fn dispatch_map(
        &self,
        endpoint: &str,
        task: MapTask,
        operation: Operation,
        n_reducers: u32,
    ) -> Result<()> {
        let file_data = tokio::fs::read(&task.path)
            .await
            .map_err(|e| MrError::io(&task.path, e))?;
        let request = RunMapRequest {
            task_id: task.task_id,
            n_reducers,
            operation: operation.to_string(),
            file_name: task.file_name,
            file_data,
        };
        debug!(task_id = request.task_id, %endpoint, file = %request.file_name, "dispatching map task");

        let config = &self.config;
        with_retry(&config.retry, "RunMap", || {
            let request = request.clone();
            async move {
                let channel = rpc::connect(endpoint, config.timeouts.connect()).await?;
                let mut client = rpc::map_worker_client(channel, config.max_message_bytes);
                let deadline = config.timeouts.control();
                rpc::call(endpoint, deadline, client.run_map(rpc::request(request, deadline))).await
            }
        })
        .await?;
        Ok(())
    }

    async fn trigger_shuffle(&self, endpoint: &str, reducers: &[String]) -> Result<ShuffleReport> {
        let config = &self.config;
        // Forwarding makes one control call per bucket, so the whole shuffle gets the reduce deadline.
        let deadline = config.timeouts.reduce();
        with_retry(&config.retry, "InitReduce", || async move {
            let channel = rpc::connect(endpoint, config.timeouts.connect()).await?;
            let mut client = rpc::map_worker_client(channel, config.max_message_bytes);
            let request = InitReduceRequest {
                endpoints: reducers.to_vec(),
            };
            rpc::call(endpoint, deadline, client.init_reduce(rpc::request(request, deadline))).await
        })
        .await
    }

    async fn trigger_reduce(&self, endpoint: &str, operation: Operation) -> Result<FileOutput> {
        let config = &self.config;
        let deadline = config.timeouts.reduce();
        with_retry(&config.retry, "RunReduce", || async move {
            let channel = rpc::connect(endpoint, config.timeouts.connect()).await?;
            let mut client = rpc::reduce_worker_client(channel, config.max_message_bytes);
            let request = RunReduceRequest {
                operation: operation.to_string(),
            };
            rpc::call(endpoint, deadline, client.run_reduce(rpc::request(request, deadline))).await
        })
        .await
    }
}

/// Runs `dispatch` over `tasks` in rounds of `round_size`; a round starts only after
/// every call of the previous round has finished. Results keep task order.
pub async fn dispatch_in_rounds<T, R, F, Fut>(tasks: Vec<T>, round_size: usize, mut dispatch: F) -> Vec<R>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = R>,
{
    let round_size = round_size.max(1);
    let mut results = Vec::with_capacity(tasks.len());
    let mut tasks = tasks.into_iter().peekable();
    let mut round = 0;
    while tasks.peek().is_some() {
        let batch: Vec<Fut> = tasks.by_ref().take(round_size).map(&mut dispatch).collect();
        debug!(round, size = batch.len(), "dispatching round");
        results.extend(join_all(batch).await);
        round += 1;
    }
    results
}

async fn reset_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(MrError::io(dir, e)),
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| MrError::io(dir, e))
}

async fn persist_output(output_dir: &Path, output: FileOutput) -> Result<String> {
    let name = sanitize_file_name(&output.name)?;
    let path = output_dir.join(&name);
    tokio::fs::write(&path, &output.data)
        .await
        .map_err(|e| MrError::io(&path, e))?;
    Ok(name)
}

#[tonic::async_trait]
impl Coordinator for CoordinatorService {
    async fn init_cluster(
        &self,
        request: Request<InitClusterRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let request = request.into_inner();
        info!(
            mappers = request.n_mappers,
            reducers = request.n_reducers,
            "initializing cluster"
        );
        self.start_cluster(request.n_mappers as usize, request.n_reducers as usize)
            .await
            .map_err(|err| {
                error!("cluster start failed: {}", err);
                Status::from(err)
            })?;
        Ok(Response::new(Ack {}))
    }

    async fn run_map_rd(
        &self,
        request: Request<Streaming<RunMapRdRequest>>,
    ) -> std::result::Result<Response<JobReport>, Status> {
        let job_id = Uuid::new_v4();
        let span = info_span!("job", %job_id);
        async move {
            let shape = self.shape().await?;
            let mut stream = request.into_inner();
            let (operation, received) = self.receive_inputs(&mut stream).await?;
            info!(%operation, files = received, "input stream closed");

            let mut report = self.run_job(job_id, operation, &shape).await?;
            report.files_received = received;
            Ok::<_, MrError>(Response::new(report))
        }
        .instrument(span)
        .await
        .map_err(|err| {
            error!(%job_id, "job failed: {}", err);
            Status::from(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn rounds_never_exceed_round_size() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = dispatch_in_rounds((0..5).collect(), 2, |task: u32| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                task * 10
            }
        })
        .await;

        assert_eq!(results, vec![0, 10, 20, 30, 40]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn next_round_waits_for_slowest_task() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        dispatch_in_rounds(vec![(0, 30u64), (1, 1), (2, 1)], 2, |(id, delay)| {
            let finished = finished.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                finished.lock().await.push(id);
            }
        })
        .await;
        // Task 2 belongs to the second round, so it cannot overtake task 0.
        assert_eq!(*finished.lock().await, vec![1, 0, 2]);
    }

    #[tokio::test]
    async fn empty_task_list_dispatches_nothing() {
        let results: Vec<()> = dispatch_in_rounds(Vec::<u32>::new(), 3, |_| async {}).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn reset_dir_clears_previous_contents() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("output");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stale.txt"), "old").unwrap();

        reset_dir(&dir).await.unwrap();
        assert!(dir.exists());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }
}
