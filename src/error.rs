use std::path::{Path, PathBuf};

use thiserror::Error;
use tonic::{Code, Status};

pub type Result<T> = std::result::Result<T, MrError>;

#[derive(Debug, Error)]
pub enum MrError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to start {role} on port {port}: {reason}")]
    ProcessSpawn {
        role: String,
        port: u16,
        reason: String,
    },

    #[error("rpc to {endpoint} failed: {status}")]
    RpcTransport { endpoint: String, status: Status },

    #[error("rpc to {endpoint} exceeded its {timeout_ms}ms deadline")]
    DeadlineExceeded { endpoint: String, timeout_ms: u128 },

    #[error("task execution failed: {0}")]
    TaskExecution(String),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MrError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        MrError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn transport(endpoint: impl Into<String>, status: Status) -> Self {
        MrError::RpcTransport {
            endpoint: endpoint.into(),
            status,
        }
    }
}

impl From<prost::DecodeError> for MrError {
    fn from(err: prost::DecodeError) -> Self {
        MrError::Serialization(err.to_string())
    }
}

impl From<prost::EncodeError> for MrError {
    fn from(err: prost::EncodeError) -> Self {
        MrError::Serialization(err.to_string())
    }
}

impl From<MrError> for Status {
    fn from(err: MrError) -> Self {
        let code = match &err {
            MrError::Config(_) => Code::FailedPrecondition,
            MrError::TaskExecution(_) => Code::InvalidArgument,
            MrError::ProcessSpawn { .. } => Code::Unavailable,
            MrError::RpcTransport { status, .. } => status.code(),
            MrError::DeadlineExceeded { .. } => Code::DeadlineExceeded,
            MrError::Io { .. } | MrError::Serialization(_) => Code::Internal,
        };
        Status::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_keeps_path_in_message() {
        let err = MrError::io(
            "/tmp/bucket.bin",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/bucket.bin"));
        assert_eq!(Status::from(err).code(), Code::Internal);
    }

    #[test]
    fn transport_error_keeps_remote_code() {
        let err = MrError::transport("http://127.0.0.1:1", Status::unavailable("down"));
        assert_eq!(Status::from(err).code(), Code::Unavailable);
    }

    #[test]
    fn deadline_maps_to_deadline_exceeded() {
        let err = MrError::DeadlineExceeded {
            endpoint: "http://127.0.0.1:1".into(),
            timeout_ms: 5,
        };
        assert_eq!(Status::from(err).code(), Code::DeadlineExceeded);
    }
}
