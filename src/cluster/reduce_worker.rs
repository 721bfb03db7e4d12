use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_channel::Sender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument};

use crate::bucket::{is_bucket_file, read_bucket, write_bucket, BucketId};
use crate::common::{KeyValue, Operation};
use crate::config::ClusterConfig;
use crate::error::{MrError, Result};
use crate::rpc::proto::reduce_worker_server::ReduceWorker;
use crate::rpc::proto::{Ack, FileOutput, IntermediateData, RunReduceRequest};

/// Pairs buffered between the bucket readers and the aggregator.
pub const QUEUE_CAPACITY: usize = 1000;

pub type GroupedData = HashMap<String, Vec<String>>;

pub struct ReduceWorkerService {
    port: u16,
    dir: PathBuf,
    staging: PathBuf,
}

impl ReduceWorkerService {
    pub fn new(config: Arc<ClusterConfig>, port: u16) -> Result<Self> {
        let dir = config.reducer_dir(port);
        let staging = dir.join("staged");
        // Staged data belongs to one worker lifetime.
        match std::fs::remove_dir_all(&staging) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(MrError::io(&staging, e)),
        }
        std::fs::create_dir_all(&staging).map_err(|e| MrError::io(&staging, e))?;
        Ok(Self { port, dir, staging })
    }

    pub fn output_file_name(&self, operation: Operation) -> String {
        format!("{}_out_{}.txt", operation, self.port)
    }

    /// Stages a forwarded bucket under its id. A repeated delivery of the same
    /// (task, bucket index) replaces the earlier copy instead of adding to it.
    pub async fn stage(&self, data: IntermediateData) -> Result<BucketId> {
        let IntermediateData {
            file_name,
            pairs,
            task_id,
            bucket_index,
        } = data;
        let id: BucketId = file_name.parse()?;
        if id.task_id != task_id || id.bucket_index != bucket_index {
            return Err(MrError::TaskExecution(format!(
                "bucket name {} does not match task {} bucket {}",
                file_name, task_id, bucket_index
            )));
        }
        debug!(bucket = %id, pairs = pairs.len(), "staging bucket");
        write_bucket(&self.staging, &id, pairs).await?;
        Ok(id)
    }

    pub async fn execute_reduce(
        &self,
        operation: Operation,
        cancel: CancellationToken,
    ) -> Result<FileOutput> {
        let files = staged_files(&self.staging).await?;
        info!(files = files.len(), "grouping staged buckets");
        let grouped = group_staged(files, cancel.clone()).await?;
        info!(keys = grouped.len(), "group by done");

        let app = operation.app();
        let mut keys: Vec<&String> = grouped.keys().collect();
        keys.sort_unstable();

        let mut lines = String::new();
        for key in keys {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            lines.push_str(&format!("{}: {}\n", key, app.reduce(key, &grouped[key])));
        }

        let name = self.output_file_name(operation);
        let path = self.dir.join(&name);
        tokio::fs::write(&path, lines)
            .await
            .map_err(|e| MrError::io(&path, e))?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| MrError::io(&path, e))?;
        Ok(FileOutput { name, data })
    }
}

fn cancelled() -> MrError {
    MrError::TaskExecution("reduce cancelled by caller".to_string())
}

async fn staged_files(staging: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(staging)
        .await
        .map_err(|e| MrError::io(staging, e))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| MrError::io(staging, e))?
    {
        let path = entry.path();
        if path.is_file() && is_bucket_file(&path) {
            files.push(path);
        }
    }
    Ok(files)
}

/// One reader task per staged file feeds a bounded queue; the caller's task is the
/// only writer of the grouped map.
pub async fn group_staged(files: Vec<PathBuf>, cancel: CancellationToken) -> Result<GroupedData> {
    let (tx, rx) = async_channel::bounded::<KeyValue>(QUEUE_CAPACITY);
    let mut readers = JoinSet::new();
    for path in files {
        readers.spawn(read_staged(path, tx.clone(), cancel.clone()));
    }
    drop(tx);

    let mut grouped = GroupedData::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            pair = rx.recv() => match pair {
                Ok(pair) => grouped.entry(pair.key).or_default().push(pair.value),
                Err(_) => break,
            },
        }
    }

    if cancel.is_cancelled() {
        readers.abort_all();
        return Err(cancelled());
    }

    while let Some(joined) = readers.join_next().await {
        joined.map_err(|e| MrError::TaskExecution(format!("bucket reader panicked: {}", e)))??;
    }
    Ok(grouped)
}

async fn read_staged(
    path: PathBuf,
    tx: Sender<KeyValue>,
    cancel: CancellationToken,
) -> Result<()> {
    debug!(path = %path.display(), "reading staged bucket");
    let (_, pairs) = read_bucket(&path).await.map_err(|e| {
        error!(path = %path.display(), "cannot decode staged bucket: {}", e);
        e
    })?;

    for pair in pairs {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            sent = tx.send(pair) => if sent.is_err() {
                return Ok(());
            },
        }
    }
    Ok(())
}

#[tonic::async_trait]
impl ReduceWorker for ReduceWorkerService {
    #[instrument(skip_all, fields(port = self.port, file = %request.get_ref().file_name))]
    async fn send_intermediate_data(
        &self,
        request: Request<IntermediateData>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let data = request.into_inner();
        match self.stage(data).await {
            Ok(id) => {
                debug!(bucket = %id, "staged intermediate data");
                Ok(Response::new(Ack {}))
            }
            Err(err) => {
                error!("cannot stage intermediate data: {}", err);
                Err(err.into())
            }
        }
    }

    #[instrument(skip_all, fields(port = self.port, operation = %request.get_ref().operation))]
    async fn run_reduce(
        &self,
        request: Request<RunReduceRequest>,
    ) -> std::result::Result<Response<FileOutput>, Status> {
        let operation: Operation = request.into_inner().operation.parse()?;
        // Dropping this handler (caller deadline or disconnect) cancels the readers.
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();

        match self.execute_reduce(operation, cancel).await {
            Ok(output) => {
                info!(file = %output.name, bytes = output.data.len(), "reduce done");
                Ok(Response::new(output))
            }
            Err(err) => {
                error!("reduce failed: {}", err);
                Err(err.into())
            }
        }
    }
}
