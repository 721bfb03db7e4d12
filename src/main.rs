use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use rpc_map_reduce::client;
use rpc_map_reduce::cluster::{server, ProcessLauncher, WorkerRole};
use rpc_map_reduce::common::Operation;
use rpc_map_reduce::config::ClusterConfig;
use rpc_map_reduce::logging::init_logging;

#[derive(Parser, Debug)]
#[command(name = "mr", about = "MapReduce over gRPC")]
struct Cli {
    /// Cluster configuration file
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Raise log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a job to a running coordinator
    Client {
        input_dir: PathBuf,
        /// wc | ii
        operation: Operation,
        /// Start the coordinator as a child process first
        #[arg(long)]
        launch_master: bool,
    },
    /// Run the coordinator
    Master,
    /// Run one worker; normally launched by the coordinator
    Worker { role: WorkerRole, port: u16 },
    /// Run coordinator and workers in this process and submit one job
    Local {
        input_dir: PathBuf,
        operation: Operation,
    },
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = ClusterConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let config = Arc::new(config);

    match cli.command {
        Command::Master => {
            init_logging(cli.verbose, Some(&config.master_dir()))?;
            let launcher = Arc::new(ProcessLauncher::current_exe(
                cli.config.clone(),
                cli.verbose,
            )?);
            let listener = server::bind(&config.host, config.master.port, "coordinator").await?;
            server::serve_coordinator(config, launcher, listener, ctrl_c()).await?;
        }
        Command::Worker { role, port } => {
            let dir = match role {
                WorkerRole::Mapper => config.mapper_dir(port),
                WorkerRole::Reducer => config.reducer_dir(port),
            };
            init_logging(cli.verbose, Some(&dir))?;
            let listener = server::bind(&config.host, port, role.as_str()).await?;
            server::serve_worker(config, role, listener, ctrl_c()).await?;
        }
        Command::Client {
            input_dir,
            operation,
            launch_master,
        } => {
            init_logging(cli.verbose, None)?;
            let _master = if launch_master {
                Some(client::launch_master(&cli.config, cli.verbose)?)
            } else {
                None
            };
            let report = client::submit_job(&config, &input_dir, operation).await?;
            println!("{}", client::summarize(&report));
            if !report.complete {
                error!("job {} finished with failures", report.job_id);
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Local {
            input_dir,
            operation,
        } => {
            init_logging(cli.verbose, Some(&config.master_dir()))?;
            let report = client::run_local(config, &input_dir, operation).await?;
            println!("{}", client::summarize(&report));
            if !report.complete {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
