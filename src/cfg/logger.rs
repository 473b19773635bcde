// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt, fmt::writer::BoxMakeWriter};

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum Output {
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogFileOptions {
    pub path: PathBuf,
    #[serde(default)]
    pub rotate_daily: bool,
}

/// Log sink configuration: a filter directive plus an output target.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogOptions {
    /// An `EnvFilter` directive, e.g. `"info"` or `"iomux=debug"`.
    pub level: String,
    pub output: Output,
    pub file: Option<LogFileOptions>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self { level: "info".into(), output: Output::Stderr, file: None }
    }
}

/// Installs the global tracing subscriber for the process.
///
/// The non-blocking writer guard is parked in a process-wide cell so log
/// lines keep flushing for the lifetime of the program; calling this a
/// second time fails when a global subscriber is already set.
pub fn init_logger(options: &LogOptions) -> Result<()> {
    let (writer, guard) = make_writer(options)?;

    let env_filter = EnvFilter::try_new(&options.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("Failed to parse log level from options or env")?;

    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    let _ = LOG_GUARD.set(guard);
    Ok(())
}

fn make_writer(options: &LogOptions) -> Result<(BoxMakeWriter, WorkerGuard)> {
    Ok(match options.output {
        Output::Stdout => {
            let (w, g) = tracing_appender::non_blocking(std::io::stdout());
            (BoxMakeWriter::new(w), g)
        },
        Output::Stderr => {
            let (w, g) = tracing_appender::non_blocking(std::io::stderr());
            (BoxMakeWriter::new(w), g)
        },
        Output::File => {
            let fopts = options
                .file
                .clone()
                .context("log.file is required for output=file")?;
            let dir = fopts.path.parent().unwrap_or_else(|| Path::new(""));
            let rotation = if fopts.rotate_daily {
                Rotation::DAILY
            } else {
                Rotation::NEVER
            };
            let appender = RollingFileAppender::new(
                rotation,
                dir,
                fopts.path.file_name().unwrap_or_default(),
            );
            let (w, g) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(w), g)
        },
    })
}
