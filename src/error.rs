use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Glob pattern error: {0}")]
    Glob(#[from] ignore::Error),

    #[error("Run queue is no longer accepting requests")]
    RunQueueClosed,

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),
}
