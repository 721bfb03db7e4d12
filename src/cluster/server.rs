use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::info;

use crate::cluster::coordinator::CoordinatorService;
use crate::cluster::map_worker::MapWorkerService;
use crate::cluster::reduce_worker::ReduceWorkerService;
use crate::cluster::worker_pool::WorkerLauncher;
use crate::cluster::WorkerRole;
use crate::config::ClusterConfig;
use crate::error::{MrError, Result};
use crate::rpc::proto::coordinator_server::CoordinatorServer;
use crate::rpc::proto::map_worker_server::MapWorkerServer;
use crate::rpc::proto::reduce_worker_server::ReduceWorkerServer;

/// Binds first so callers know the port is ours before serving starts.
pub async fn bind(host: &str, port: u16, role: &str) -> Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .map_err(|e| MrError::ProcessSpawn {
            role: role.to_string(),
            port,
            reason: format!("cannot bind {}:{}: {}", host, port, e),
        })
}

pub async fn serve_worker(
    config: Arc<ClusterConfig>,
    role: WorkerRole,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let port = local_port(&listener, role.as_str())?;
    let limit = config.max_message_bytes;
    let incoming = TcpListenerStream::new(listener);

    let served = match role {
        WorkerRole::Mapper => {
            let service = MapWorkerService::new(config, port)?;
            info!(port, "map worker listening");
            Server::builder()
                .add_service(
                    MapWorkerServer::new(service)
                        .max_decoding_message_size(limit)
                        .max_encoding_message_size(limit),
                )
                .serve_with_incoming_shutdown(incoming, shutdown)
                .await
        }
        WorkerRole::Reducer => {
            let service = ReduceWorkerService::new(config, port)?;
            info!(port, "reduce worker listening");
            Server::builder()
                .add_service(
                    ReduceWorkerServer::new(service)
                        .max_decoding_message_size(limit)
                        .max_encoding_message_size(limit),
                )
                .serve_with_incoming_shutdown(incoming, shutdown)
                .await
        }
    };

    served.map_err(|e| MrError::ProcessSpawn {
        role: role.to_string(),
        port,
        reason: e.to_string(),
    })
}

/// Serves the coordinator; shuts the worker pool down once `shutdown` resolves.
pub async fn serve_coordinator(
    config: Arc<ClusterConfig>,
    launcher: Arc<dyn WorkerLauncher>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let port = local_port(&listener, "coordinator")?;
    let limit = config.max_message_bytes;
    let service = Arc::new(CoordinatorService::new(config, launcher)?);
    info!(port, "coordinator listening");

    let served = Server::builder()
        .add_service(
            CoordinatorServer::from_arc(service.clone())
                .max_decoding_message_size(limit)
                .max_encoding_message_size(limit),
        )
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await;

    service.shutdown().await;
    served.map_err(|e| MrError::ProcessSpawn {
        role: "coordinator".to_string(),
        port,
        reason: e.to_string(),
    })
}

fn local_port(listener: &TcpListener, role: &str) -> Result<u16> {
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| MrError::ProcessSpawn {
            role: role.to_string(),
            port: 0,
            reason: e.to_string(),
        })
}
