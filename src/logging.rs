//! Log output
//!
//! Console narration uses the compact fmt layout. With a log file configured
//! a second layer mirrors the same timestamped stream there without ANSI
//! colors; the console keeps them.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::format::{Compact, DefaultFields, Format};
use tracing_subscriber::prelude::*;

/// Parse a level name; `None` for anything unrecognized
pub fn parse_level(name: &str) -> Option<Level> {
    match name.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the global subscriber
pub fn init(level: Level, file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let console = fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact();
    let mirror = file.map(open_log_file).transpose()?.map(file_layer);

    tracing_subscriber::registry()
        .with(LevelFilter::from_level(level))
        .with(console)
        .with(mirror)
        .try_init()?;
    Ok(())
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

type FileLayer<S> = fmt::Layer<S, DefaultFields, Format<Compact>, Arc<File>>;

/// Plain-text copy of the console stream
fn file_layer<S>(file: File) -> FileLayer<S> {
    fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .with_ansi(false)
        .with_writer(Arc::new(file))
}
