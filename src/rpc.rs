//! RPC substrate shared by the coordinator, the workers and the client.
//!
//! Every outgoing call goes through [`call`], which applies the call's deadline both as the
//! gRPC timeout header (so the server drops the handler) and locally, and through
//! [`with_retry`] when the caller wants the configured backoff policy.

use std::future::Future;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::{MrError, Result};

pub mod proto {
    tonic::include_proto!("mapreduce");
}

use proto::coordinator_client::CoordinatorClient;
use proto::map_worker_client::MapWorkerClient;
use proto::reduce_worker_client::ReduceWorkerClient;

pub async fn connect(endpoint: &str, connect_timeout: Duration) -> Result<Channel> {
    let channel = Endpoint::from_shared(endpoint.to_string())
        .map_err(|e| MrError::transport(endpoint, Status::invalid_argument(e.to_string())))?
        .connect_timeout(connect_timeout)
        .connect()
        .await
        .map_err(|e| MrError::transport(endpoint, Status::unavailable(e.to_string())))?;
    Ok(channel)
}

pub fn map_worker_client(channel: Channel, max_message_bytes: usize) -> MapWorkerClient<Channel> {
    MapWorkerClient::new(channel)
        .max_decoding_message_size(max_message_bytes)
        .max_encoding_message_size(max_message_bytes)
}

pub fn reduce_worker_client(
    channel: Channel,
    max_message_bytes: usize,
) -> ReduceWorkerClient<Channel> {
    ReduceWorkerClient::new(channel)
        .max_decoding_message_size(max_message_bytes)
        .max_encoding_message_size(max_message_bytes)
}

pub fn coordinator_client(channel: Channel, max_message_bytes: usize) -> CoordinatorClient<Channel> {
    CoordinatorClient::new(channel)
        .max_decoding_message_size(max_message_bytes)
        .max_encoding_message_size(max_message_bytes)
}

/// Wraps `message` in a request carrying `deadline` as its gRPC timeout.
pub fn request<T>(message: T, deadline: Duration) -> Request<T> {
    let mut request = Request::new(message);
    request.set_timeout(deadline);
    request
}

/// Awaits one RPC under `deadline`, mapping every failure to a transport error.
pub async fn call<T, F>(endpoint: &str, deadline: Duration, rpc: F) -> Result<T>
where
    F: Future<Output = std::result::Result<Response<T>, Status>>,
{
    match tokio::time::timeout(deadline, rpc).await {
        Ok(Ok(response)) => Ok(response.into_inner()),
        Ok(Err(status)) if status.code() == tonic::Code::DeadlineExceeded => {
            Err(MrError::DeadlineExceeded {
                endpoint: endpoint.to_string(),
                timeout_ms: deadline.as_millis(),
            })
        }
        Ok(Err(status)) => Err(MrError::transport(endpoint, status)),
        Err(_) => Err(MrError::DeadlineExceeded {
            endpoint: endpoint.to_string(),
            timeout_ms: deadline.as_millis(),
        }),
    }
}

/// Runs `op` until it succeeds or the policy's attempts are used up.
///
/// Errors the remote rejected as invalid are not retried: another attempt
/// would be rejected the same way.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.max_attempts || !is_retryable(&err) => return Err(err),
            Err(err) => {
                let backoff = policy.backoff(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "{} failed, retrying: {}",
                    what,
                    err
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

fn is_retryable(err: &MrError) -> bool {
    match err {
        MrError::RpcTransport { status, .. } => !matches!(
            status.code(),
            tonic::Code::InvalidArgument | tonic::Code::FailedPrecondition
        ),
        MrError::DeadlineExceeded { .. } => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[tokio::test]
    async fn retries_transport_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(&fast_policy(3), "flaky", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MrError::transport("x", Status::unavailable("down")))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = with_retry(&fast_policy(2), "down", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MrError::transport("x", Status::unavailable("down")))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_argument_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = with_retry(&fast_policy(5), "bad", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MrError::transport("x", Status::invalid_argument("nope")))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_deadline_fails_slow_call() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Status>(Response::new(proto::Ack {}))
        };
        let result = call("http://slow", Duration::from_millis(10), slow).await;
        assert!(matches!(result, Err(MrError::DeadlineExceeded { .. })));
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect(&format!("http://127.0.0.1:{}", port), Duration::from_millis(200)).await;
        assert!(matches!(result, Err(MrError::RpcTransport { .. })));
    }
}
