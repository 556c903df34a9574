use std::{fs, io};

use crate::config;

/// Initialize logging for the engine.
///
/// Writes to the configured log directory when it can be created, otherwise
/// falls back to stderr. Safe to call more than once.
pub fn init() {
    let log_dir = config::init().log_dir();
    let target = fs::create_dir_all(&log_dir)
        .and_then(|()| {
            let file = fs::File::create(log_dir.join("engine.log"))?;
            Ok(Box::new(file) as Box<dyn io::Write + Send>)
        })
        .ok();

    let mut builder = env_logger::Builder::from_default_env();
    if let Some(target) = target {
        builder.target(env_logger::Target::Pipe(target));
    }
    let _ = builder.try_init();
}
