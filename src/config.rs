use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MrError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub master: MasterSection,
    pub mappers: WorkerSection,
    pub reducers: WorkerSection,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Keep map buckets on disk after the reducer acknowledged them.
    #[serde(default)]
    pub retain_buckets: bool,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSection {
    pub n_mappers: usize,
    pub n_reducers: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            n_mappers: 1,
            n_reducers: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterSection {
    pub port: u16,
}

impl Default for MasterSection {
    fn default() -> Self {
        Self { port: 50050 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSection {
    #[serde(default)]
    pub max_allowed: Option<usize>,
    pub ports: Vec<u16>,
}

impl WorkerSection {
    pub fn max_allowed(&self) -> usize {
        self.max_allowed.unwrap_or(self.ports.len())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    /// Intra-cluster control calls: RunMap, InitReduce, SendIntermediateData.
    #[serde(default = "default_control_ms")]
    pub control_ms: u64,
    #[serde(default = "default_reduce_ms")]
    pub reduce_ms: u64,
    /// Whole job as observed by the client.
    #[serde(default = "default_job_ms")]
    pub job_ms: u64,
    #[serde(default = "default_startup_ms")]
    pub startup_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            control_ms: default_control_ms(),
            reduce_ms: default_reduce_ms(),
            job_ms: default_job_ms(),
            startup_ms: default_startup_ms(),
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn control(&self) -> Duration {
        Duration::from_millis(self.control_ms)
    }

    pub fn reduce(&self) -> Duration {
        Duration::from_millis(self.reduce_ms)
    }

    pub fn job(&self) -> Duration {
        Duration::from_millis(self.job_ms)
    }

    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from the initial backoff.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_message_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_connect_ms() -> u64 {
    2_000
}

fn default_control_ms() -> u64 {
    5_000
}

fn default_reduce_ms() -> u64 {
    60_000
}

fn default_job_ms() -> u64 {
    120_000
}

fn default_startup_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| MrError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: ClusterConfig = serde_json::from_str(contents)
            .map_err(|e| MrError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, section) in [("mappers", &self.mappers), ("reducers", &self.reducers)] {
            if section.ports.is_empty() {
                return Err(MrError::Config(format!("{} has no ports", name)));
            }
            if section.max_allowed() > section.ports.len() {
                return Err(MrError::Config(format!(
                    "{}.maxAllowed is {} but only {} ports are configured",
                    name,
                    section.max_allowed(),
                    section.ports.len()
                )));
            }
        }

        let mut seen = HashSet::new();
        let all_ports = std::iter::once(self.master.port)
            .chain(self.mappers.ports.iter().copied())
            .chain(self.reducers.ports.iter().copied());
        for port in all_ports {
            if !seen.insert(port) {
                return Err(MrError::Config(format!("port {} is configured twice", port)));
            }
        }

        self.check_counts(self.client.n_mappers, self.client.n_reducers)?;

        let t = &self.timeouts;
        if [t.connect_ms, t.control_ms, t.reduce_ms, t.job_ms, t.startup_ms].contains(&0) {
            return Err(MrError::Config("timeouts must be non-zero".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(MrError::Config("retry.maxAttempts must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Checks a requested cluster shape against the configured endpoints.
    pub fn check_counts(&self, n_mappers: usize, n_reducers: usize) -> Result<()> {
        if n_mappers == 0 || n_reducers == 0 {
            return Err(MrError::Config(
                "cluster needs at least one mapper and one reducer".to_string(),
            ));
        }
        if n_mappers > self.mappers.max_allowed() {
            return Err(MrError::Config(format!(
                "{} mappers requested, at most {} allowed",
                n_mappers,
                self.mappers.max_allowed()
            )));
        }
        if n_reducers > self.reducers.max_allowed() {
            return Err(MrError::Config(format!(
                "{} reducers requested, at most {} allowed",
                n_reducers,
                self.reducers.max_allowed()
            )));
        }
        Ok(())
    }

    pub fn endpoint(&self, port: u16) -> String {
        format!("http://{}:{}", self.host, port)
    }

    pub fn master_endpoint(&self) -> String {
        self.endpoint(self.master.port)
    }

    /// Endpoints of the first `n` mappers.
    pub fn mapper_endpoints(&self, n: usize) -> Vec<String> {
        self.mappers
            .ports
            .iter()
            .take(n)
            .map(|p| self.endpoint(*p))
            .collect()
    }

    /// Endpoints of the first `n` reducers.
    pub fn reducer_endpoints(&self, n: usize) -> Vec<String> {
        self.reducers
            .ports
            .iter()
            .take(n)
            .map(|p| self.endpoint(*p))
            .collect()
    }

    pub fn master_dir(&self) -> PathBuf {
        self.root_dir.join("master")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.master_dir().join("staging")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root_dir.join("output")
    }

    pub fn mapper_dir(&self, port: u16) -> PathBuf {
        self.root_dir.join("mappers").join(format!("m{}", port))
    }

    pub fn reducer_dir(&self, port: u16) -> PathBuf {
        self.root_dir.join("reducers").join(format!("r{}", port))
    }

    /// Builds a config for a local cluster, used by `mr local` and the tests.
    pub fn local(
        root_dir: impl Into<PathBuf>,
        master_port: u16,
        mapper_ports: Vec<u16>,
        reducer_ports: Vec<u16>,
    ) -> Self {
        Self {
            client: ClientSection {
                n_mappers: mapper_ports.len(),
                n_reducers: reducer_ports.len(),
            },
            master: MasterSection { port: master_port },
            mappers: WorkerSection {
                max_allowed: None,
                ports: mapper_ports,
            },
            reducers: WorkerSection {
                max_allowed: None,
                ports: reducer_ports,
            },
            host: default_host(),
            root_dir: root_dir.into(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            retain_buckets: false,
            max_message_bytes: default_max_message_bytes(),
        }
    }
}
