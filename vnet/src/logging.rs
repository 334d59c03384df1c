//! Sets up the global tracing subscriber.

use std::{
    fs::{create_dir_all, OpenOptions},
    io,
    path::PathBuf,
    sync::Arc,
};
use tracing::{subscriber::SetGlobalDefaultError, Level};
use tracing_subscriber::FmtSubscriber;

const LOG_DIR: &str = "./logs";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Could not open log file {path}: {source}")]
    File { path: PathBuf, source: io::Error },
    #[error(transparent)]
    AlreadyInitialized(#[from] SetGlobalDefaultError),
}

/// Installs the global subscriber. With `to_file`, events are written as JSON
/// lines to a timestamped file under `./logs`; otherwise they go to stderr.
/// Returns the log file path, if any.
pub fn initialize_logging(to_file: bool, level: Level) -> Result<Option<PathBuf>, LoggingError> {
    if !to_file {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_writer(io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        return Ok(None);
    }

    let path = PathBuf::from(LOG_DIR).join(format!(
        "vnet-{}.log",
        chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
    ));
    let file = create_dir_all(LOG_DIR)
        .and_then(|_| {
            OpenOptions::new()
                .write(true)
                .append(true)
                .create(true)
                .open(&path)
        })
        .map_err(|source| LoggingError::File {
            path: path.clone(),
            source,
        })?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(Arc::new(file))
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(Some(path))
}
