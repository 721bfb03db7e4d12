//! Client driver: brings the cluster up, streams the input directory to the
//! coordinator and waits for the job report.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::cluster::server;
use crate::cluster::worker_pool::InProcessLauncher;
use crate::common::{read_files_from_dir, Operation};
use crate::config::ClusterConfig;
use crate::error::{MrError, Result};
use crate::rpc::proto::{FileInput, InitClusterRequest, JobReport, RunMapRdRequest};
use crate::rpc;

const STREAM_BUFFER: usize = 4;

/// Connects to the coordinator, retrying until the startup timeout passes.
async fn connect_coordinator(config: &ClusterConfig) -> Result<Channel> {
    let endpoint = config.master_endpoint();
    let deadline = Instant::now() + config.timeouts.startup();
    loop {
        match rpc::connect(&endpoint, config.timeouts.connect()).await {
            Ok(channel) => return Ok(channel),
            Err(err) if Instant::now() >= deadline => return Err(err),
            Err(err) => {
                debug!("coordinator not reachable yet: {}", err);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

pub async fn submit_job(
    config: &ClusterConfig,
    input_dir: &Path,
    operation: Operation,
) -> Result<JobReport> {
    let files = read_files_from_dir(input_dir)?;
    let endpoint = config.master_endpoint();
    let job_deadline = config.timeouts.job();

    let channel = connect_coordinator(config).await?;
    let mut client = rpc::coordinator_client(channel, config.max_message_bytes);

    let (n_mappers, n_reducers) = (config.client.n_mappers, config.client.n_reducers);
    info!(n_mappers, n_reducers, "initializing cluster");
    let init = InitClusterRequest {
        n_mappers: n_mappers as u32,
        n_reducers: n_reducers as u32,
    };
    rpc::call(
        &endpoint,
        job_deadline,
        client.init_cluster(rpc::request(init, job_deadline)),
    )
    .await?;

    info!(files = files.len(), %operation, input = %input_dir.display(), "running map reduce");
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let mut reader = tokio::spawn(stream_inputs(files, operation, tx));

    let job = rpc::call(
        &endpoint,
        job_deadline,
        client.run_map_rd(rpc::request(ReceiverStream::new(rx), job_deadline)),
    );
    tokio::pin!(job);

    tokio::select! {
        read = &mut reader => {
            // A failed read drops the call, so the coordinator never runs on partial input.
            read.map_err(|e| MrError::TaskExecution(format!("input reader panicked: {}", e)))??;
            job.await
        }
        report = &mut job => {
            reader.abort();
            report
        }
    }
}

async fn stream_inputs(
    files: Vec<(String, PathBuf)>,
    operation: Operation,
    tx: mpsc::Sender<RunMapRdRequest>,
) -> Result<()> {
    for (name, path) in files {
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| MrError::io(&path, e))?;
        debug!(file = %name, bytes = data.len(), "sending input");
        let message = RunMapRdRequest {
            operation: operation.to_string(),
            file: Some(FileInput { name, data }),
        };
        if tx.send(message).await.is_err() {
            warn!("coordinator stream closed early");
            break;
        }
    }
    Ok(())
}

/// Starts a coordinator process next to this one; it is killed when the handle drops.
pub fn launch_master(config_path: &Path, verbose: u8) -> Result<Child> {
    let spawn_error = |reason: String| MrError::ProcessSpawn {
        role: "coordinator".to_string(),
        port: 0,
        reason,
    };
    let exe = std::env::current_exe().map_err(|e| spawn_error(e.to_string()))?;
    let mut command = Command::new(exe);
    command
        .arg("--config")
        .arg(config_path)
        .arg("master")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if verbose > 0 {
        command.arg(format!("-{}", "v".repeat(verbose as usize)));
    }
    command.spawn().map_err(|e| spawn_error(e.to_string()))
}

/// Runs coordinator and workers inside this process and submits one job.
pub async fn run_local(
    config: Arc<ClusterConfig>,
    input_dir: &Path,
    operation: Operation,
) -> Result<JobReport> {
    let listener = server::bind(&config.host, config.master.port, "coordinator").await?;
    let launcher = Arc::new(InProcessLauncher::new(config.clone()));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let coordinator = tokio::spawn(server::serve_coordinator(
        config.clone(),
        launcher,
        listener,
        async {
            let _ = shutdown_rx.await;
        },
    ));

    let report = submit_job(&config, input_dir, operation).await;

    let _ = shutdown_tx.send(());
    match coordinator.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("coordinator stopped with error: {}", err),
        Err(err) => warn!("coordinator task failed: {}", err),
    }
    report
}

pub fn summarize(report: &JobReport) -> String {
    let mut lines = vec![
        format!("job {} ({})", report.job_id, report.operation),
        format!(
            "  files received: {}, map tasks: {} ({} failed)",
            report.files_received,
            report.map_tasks_dispatched,
            report.failed_map_tasks.len()
        ),
        format!(
            "  buckets forwarded: {} ({} failed)",
            report.buckets_forwarded, report.buckets_failed
        ),
        format!("  outputs: {}", report.output_files.join(", ")),
    ];
    if !report.failed_map_tasks.is_empty() {
        lines.push(format!("  failed map tasks: {:?}", report.failed_map_tasks));
    }
    if !report.failed_shuffle_workers.is_empty() {
        lines.push(format!(
            "  failed shuffles: {}",
            report.failed_shuffle_workers.join(", ")
        ));
    }
    if !report.failed_reducers.is_empty() {
        lines.push(format!(
            "  failed reducers: {}",
            report.failed_reducers.join(", ")
        ));
    }
    lines.push(if report.complete {
        "  status: complete".to_string()
    } else {
        "  status: PARTIAL".to_string()
    });
    lines.join("\n")
}
