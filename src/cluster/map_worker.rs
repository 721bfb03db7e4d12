use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument, warn};

use crate::bucket::{self, BucketId};
use crate::common::{sanitize_file_name, KeyValue, Operation};
use crate::config::ClusterConfig;
use crate::error::{MrError, Result};
use crate::map_reduce_apps::bucket_index;
use crate::rpc::proto::map_worker_server::MapWorker;
use crate::rpc::proto::reduce_worker_client::ReduceWorkerClient;
use crate::rpc::proto::{Ack, InitReduceRequest, IntermediateData, RunMapRequest, ShuffleReport};
use crate::rpc::{self, with_retry};

pub struct MapWorkerService {
    config: Arc<ClusterConfig>,
    port: u16,
    dir: PathBuf,
}

impl MapWorkerService {
    pub fn new(config: Arc<ClusterConfig>, port: u16) -> Result<Self> {
        let dir = config.mapper_dir(port);
        std::fs::create_dir_all(&dir).map_err(|e| MrError::io(&dir, e))?;
        remove_stale_buckets(&dir)?;
        Ok(Self { config, port, dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Maps one file and persists its non-empty buckets; returns how many were written.
    pub async fn execute_map(&self, task: RunMapRequest) -> Result<u32> {
        let RunMapRequest {
            task_id,
            n_reducers,
            operation,
            file_name,
            file_data,
        } = task;
        let operation: Operation = operation.parse()?;
        if n_reducers == 0 {
            return Err(MrError::TaskExecution(
                "reducer count must be at least 1".to_string(),
            ));
        }
        let file_name = sanitize_file_name(&file_name)?;

        let buckets = tokio::task::spawn_blocking(move || {
            let contents = String::from_utf8_lossy(&file_data);
            let key_values = operation.app().map(&file_name, &contents);
            partition(key_values, n_reducers)
        })
        .await
        .map_err(|e| MrError::TaskExecution(format!("map task panicked: {}", e)))?;

        let mut written = 0;
        for (index, pairs) in buckets.into_iter().enumerate() {
            if pairs.is_empty() {
                continue;
            }
            let id = BucketId {
                operation,
                task_id,
                bucket_index: index as u32,
            };
            debug!(bucket = %id, pairs = pairs.len(), "writing bucket");
            bucket::write_bucket(&self.dir, &id, pairs).await?;
            written += 1;
        }
        Ok(written)
    }

    /// Forwards every bucket on disk to the reducer owning its index.
    pub async fn forward_buckets(&self, endpoints: &[String]) -> Result<ShuffleReport> {
        let bucket_files = self.bucket_files().await?;
        info!(count = bucket_files.len(), "forwarding buckets");

        let mut clients: HashMap<String, ReduceWorkerClient<Channel>> = HashMap::new();
        let mut report = ShuffleReport::default();

        for path in bucket_files {
            match self.forward(&path, endpoints, &mut clients).await {
                Ok(()) => {
                    report.buckets_sent += 1;
                    if !self.config.retain_buckets {
                        if let Err(err) = tokio::fs::remove_file(&path).await {
                            warn!(path = %path.display(), "cannot remove forwarded bucket: {}", err);
                        }
                    }
                }
                Err(err) => {
                    error!(path = %path.display(), "bucket not forwarded: {}", err);
                    report.buckets_failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn forward(
        &self,
        path: &Path,
        endpoints: &[String],
        clients: &mut HashMap<String, ReduceWorkerClient<Channel>>,
    ) -> Result<()> {
        let (id, pairs) = bucket::read_bucket(path).await?;
        let endpoint = endpoints.get(id.bucket_index as usize).ok_or_else(|| {
            MrError::TaskExecution(format!(
                "bucket {} has no reducer, only {} endpoints given",
                id,
                endpoints.len()
            ))
        })?;

        let connect_timeout = self.config.timeouts.connect();
        let deadline = self.config.timeouts.control();
        let max_message_bytes = self.config.max_message_bytes;
        let data = IntermediateData {
            file_name: id.file_name(),
            pairs,
            task_id: id.task_id,
            bucket_index: id.bucket_index,
        };
        let cached = clients.get(endpoint).cloned();

        let client = with_retry(&self.config.retry, "SendIntermediateData", || {
            let cached = cached.clone();
            let data = data.clone();
            async move {
                let mut client = match cached {
                    Some(client) => client,
                    None => {
                        let channel = rpc::connect(endpoint, connect_timeout).await?;
                        rpc::reduce_worker_client(channel, max_message_bytes)
                    }
                };
                let request = rpc::request(data, deadline);
                rpc::call(endpoint, deadline, client.send_intermediate_data(request)).await?;
                Ok(client)
            }
        })
        .await?;
        clients.insert(endpoint.clone(), client);

        debug!(bucket = %id, endpoint = %endpoint, "bucket forwarded");
        Ok(())
    }

    async fn bucket_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| MrError::io(&self.dir, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MrError::io(&self.dir, e))?
        {
            let path = entry.path();
            if bucket::is_bucket_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Buckets left by an earlier process on this port must not be forwarded again.
fn remove_stale_buckets(dir: &Path) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| MrError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| MrError::io(dir, e))?.path();
        if bucket::is_bucket_file(&path) {
            debug!(path = %path.display(), "removing stale bucket");
            std::fs::remove_file(&path).map_err(|e| MrError::io(&path, e))?;
        }
    }
    Ok(())
}

/// Sorts by key, then splits into `n_reducers` buckets by partition hash.
pub fn partition(mut key_values: Vec<KeyValue>, n_reducers: u32) -> Vec<Vec<KeyValue>> {
    key_values.sort_by(|a, b| a.key.as_bytes().cmp(b.key.as_bytes()));

    let mut buckets = vec![Vec::new(); n_reducers as usize];
    for pair in key_values {
        let index = bucket_index(&pair.key, n_reducers) as usize;
        buckets[index].push(pair);
    }
    buckets
}

#[tonic::async_trait]
impl MapWorker for MapWorkerService {
    #[instrument(skip_all, fields(port = self.port, task_id = request.get_ref().task_id))]
    async fn run_map(&self, request: Request<RunMapRequest>) -> std::result::Result<Response<Ack>, Status> {
        let task = request.into_inner();
        info!(file = %task.file_name, operation = %task.operation, "starting map task");
        match self.execute_map(task).await {
            Ok(buckets) => {
                info!(buckets, "map task done");
                Ok(Response::new(Ack {}))
            }
            Err(err) => {
                error!("map task failed: {}", err);
                Err(err.into())
            }
        }
    }

    #[instrument(skip_all, fields(port = self.port))]
    async fn init_reduce(
        &self,
        request: Request<InitReduceRequest>,
    ) -> std::result::Result<Response<ShuffleReport>, Status> {
        let endpoints = request.into_inner().endpoints;
        let report = self
            .forward_buckets(&endpoints)
            .await
            .map_err(|err| {
                error!("init reduce failed: {}", err);
                Status::from(err)
            })?;
        info!(
            sent = report.buckets_sent,
            failed = report.buckets_failed,
            "init reduce done"
        );
        Ok(Response::new(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::kv;

    fn service(root: &std::path::Path, retain_buckets: bool) -> MapWorkerService {
        let mut config = ClusterConfig::local(root, 7000, vec![7001], vec![7011, 7012]);
        config.retain_buckets = retain_buckets;
        config.retry = crate::config::RetryPolicy::none();
        config.timeouts.connect_ms = 200;
        MapWorkerService::new(Arc::new(config), 7001).unwrap()
    }

    fn task(task_id: u32, n_reducers: u32, operation: &str, contents: &str) -> RunMapRequest {
        RunMapRequest {
            task_id,
            n_reducers,
            operation: operation.to_string(),
            file_name: "a.txt".to_string(),
            file_data: contents.as_bytes().to_vec(),
        }
    }

    #[test]
    fn partition_places_each_pair_once_by_hash() {
        let pairs = vec![kv("the", "1"), kv("cat", "1"), kv("the", "1"), kv("sat", "1")];
        let buckets = partition(pairs, 3);
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets.iter().map(Vec::len).sum::<usize>(), 4);
        for (index, bucket) in buckets.iter().enumerate() {
            for pair in bucket {
                assert_eq!(bucket_index(&pair.key, 3) as usize, index);
            }
            assert!(bucket.windows(2).all(|w| w[0].key <= w[1].key));
        }
    }

    #[tokio::test]
    async fn run_map_writes_only_non_empty_buckets() {
        let root = tempfile::tempdir().unwrap();
        let svc = service(root.path(), false);

        let written = svc.execute_map(task(4, 8, "wc", "the cat sat")).await.unwrap();

        let mut total = 0;
        let mut seen = 0;
        for entry in std::fs::read_dir(svc.dir()).unwrap() {
            let path = entry.unwrap().path();
            let (id, pairs) = bucket::read_bucket(&path).await.unwrap();
            assert_eq!(id.task_id, 4);
            assert_eq!(path.file_name().unwrap().to_str().unwrap(), id.file_name());
            for pair in &pairs {
                assert_eq!(bucket_index(&pair.key, 8), id.bucket_index);
                assert_eq!(pair.value, "1");
            }
            total += pairs.len();
            seen += 1;
        }
        assert_eq!(total, 3);
        assert_eq!(seen, written);
    }

    #[tokio::test]
    async fn run_map_rejects_unknown_operation() {
        let root = tempfile::tempdir().unwrap();
        let svc = service(root.path(), false);
        let err = MapWorker::run_map(&svc, Request::new(task(0, 1, "grep", "x")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn init_reduce_counts_unreachable_reducers_and_keeps_buckets() {
        let root = tempfile::tempdir().unwrap();
        let svc = service(root.path(), false);
        svc.execute_map(task(0, 1, "wc", "one two")).await.unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
        drop(listener);

        let report = svc.forward_buckets(&[dead]).await.unwrap();
        assert_eq!(report.buckets_sent, 0);
        assert_eq!(report.buckets_failed, 1);
        assert_eq!(svc.bucket_files().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn init_reduce_fails_bucket_without_endpoint() {
        let root = tempfile::tempdir().unwrap();
        let svc = service(root.path(), false);
        svc.execute_map(task(0, 4, "wc", "alpha beta gamma delta epsilon")).await.unwrap();

        let report = svc.forward_buckets(&[]).await.unwrap();
        assert_eq!(report.buckets_sent, 0);
        assert_eq!(report.buckets_failed as usize, svc.bucket_files().await.unwrap().len());
    }

    #[tokio::test]
    async fn restart_drops_buckets_of_previous_process() {
        let root = tempfile::tempdir().unwrap();
        let svc = service(root.path(), true);
        svc.execute_map(task(0, 2, "wc", "left over words")).await.unwrap();
        std::fs::write(svc.dir().join("logs.txt"), "kept").unwrap();

        let restarted = service(root.path(), true);
        assert!(restarted.bucket_files().await.unwrap().is_empty());
        assert!(restarted.dir().join("logs.txt").exists());
    }
}
