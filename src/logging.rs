//! Logging setup for the `mr` processes.
//!
//! Every process logs to stdout; processes with a root directory also append to
//! `logs.txt` there.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use tracing::debug;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{MrError, Result};

pub const LOG_FILE_NAME: &str = "logs.txt";

pub fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        2 => "trace",
        _ => "trace,h2=debug,hyper=debug,tower=debug",
    }
}

pub fn init_logging(verbose: u8, log_dir: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::new(log_level(verbose));
    let stdout = fmt::layer()
        .with_target(verbose >= 2)
        .with_thread_ids(verbose >= 3)
        .with_line_number(verbose >= 3);

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| MrError::io(dir, e))?;
            let path = dir.join(LOG_FILE_NAME);
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| MrError::io(&path, e))?;
            writeln!(file, "{}", "-".repeat(73)).map_err(|e| MrError::io(&path, e))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file_layer)
        .init();

    debug!("logging started with verbosity level: {}", verbose);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_level() {
        assert_eq!(log_level(0), "info");
        assert_eq!(log_level(1), "debug");
        assert!(log_level(5).starts_with("trace"));
    }
}
