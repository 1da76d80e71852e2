// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Global `tracing` subscriber.
//!
//! Layers, each optional:
//!
//! - stdout, text or JSON;
//! - hourly rotated files under [`LoggingOptions::dir`];
//! - an error-only file next to them.
//!
//! The level filter is behind a reload handle so it can be changed at
//! runtime through [`RELOAD_HANDLE`].

use std::{
    env,
    io::IsTerminal,
    sync::{Mutex, Once, PoisonError},
};

use bon::Builder;
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use tracing::Subscriber;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter, layer::SubscriberExt, registry::LookupSpan,
};

/// Deserializes an empty string as `T::default()`.
pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        return Ok(T::default());
    }
    T::deserialize(de::value::StrDeserializer::new(&s)).map_err(|e: de::value::Error| {
        de::Error::custom(format!("invalid value, expect empty string, err: {e}"))
    })
}

pub const DEFAULT_LOGGING_DIR: &str = "logs";

/// Filter used when neither [`LoggingOptions::level`] nor `RUST_LOG` is set.
const DEFAULT_LOG_TARGETS: &str = "info";

const LOG_FILE_PREFIX: &str = "reportq";
const ERROR_LOG_FILE_PREFIX: &str = "reportq-err";

/// Changes the level filter after [`init_global_logging`].
pub static RELOAD_HANDLE: OnceCell<tracing_subscriber::reload::Handle<filter::Targets, Registry>> =
    OnceCell::new();

static GLOBAL_UT_LOG_GUARD: Lazy<Mutex<Option<Vec<WorkerGuard>>>> = Lazy::new(|| Mutex::new(None));

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory of the rotated log files; empty logs to stdout only.
    #[default = ""]
    #[builder(default)]
    pub dir: String,

    /// Filter such as `"info,reportq_storage_queue=debug"`. Falls back to
    /// `RUST_LOG`, then `info`.
    pub level: Option<String>,

    #[serde(default, deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// Rotated files kept per log; 720 hourly files is 30 days.
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,
}

#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, with the current span list.
    Json,
    #[default]
    Text,
}

/// Logging for unit and integration tests.
///
/// Writes debug logs to `UNITTEST_LOG_DIR` (default `/tmp/__unittest_logs`)
/// filtered by `UNITTEST_LOG_LEVEL`. Safe to call from every test.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let dir =
            env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_string());
        let level = env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let opts = LoggingOptions {
            dir: dir.clone(),
            level: Some(level),
            append_stdout: false,
            ..Default::default()
        };
        let guards = init_global_logging(&opts);
        *GLOBAL_UT_LOG_GUARD
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(guards);

        tracing::info!("logs dir = {}", dir);
    });
}

/// Installs the global subscriber described by `opts`.
///
/// Only the first call in a process takes effect. The returned guards flush
/// the background writers when dropped and must be kept alive.
///
/// # Panics
///
/// Panics if the log directory cannot be created.
pub fn init_global_logging(opts: &LoggingOptions) -> Vec<WorkerGuard> {
    static START: Once = Once::new();
    let mut guards = vec![];

    START.call_once(|| {
        // Another logger may already own the `log` facade.
        let _ = LogTracer::init();

        let stdout_layer = opts.append_stdout.then(|| {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            guards.push(guard);
            fmt_layer(writer, opts.log_format, std::io::stdout().is_terminal())
        });

        let (file_layer, err_file_layer) = if opts.dir.is_empty() {
            (None, None)
        } else {
            let (writer, guard) =
                tracing_appender::non_blocking(rolling_appender(opts, LOG_FILE_PREFIX));
            guards.push(guard);
            let file_layer = fmt_layer(writer, opts.log_format, false);

            let (writer, guard) =
                tracing_appender::non_blocking(rolling_appender(opts, ERROR_LOG_FILE_PREFIX));
            guards.push(guard);
            let err_file_layer = fmt_layer(writer, opts.log_format, false)
                .with_filter(filter::LevelFilter::ERROR)
                .boxed();
            (Some(file_layer), Some(err_file_layer))
        };

        let env_level = env::var(EnvFilter::DEFAULT_ENV).ok();
        let targets = opts
            .level
            .as_deref()
            .or(env_level.as_deref())
            .unwrap_or(DEFAULT_LOG_TARGETS);
        let filter = targets.parse::<filter::Targets>().unwrap_or_else(|e| {
            eprintln!("invalid log level {targets:?}: {e}, using {DEFAULT_LOG_TARGETS:?}");
            DEFAULT_LOG_TARGETS
                .parse()
                .unwrap_or_else(|_| filter::Targets::new())
        });
        let (dyn_filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
        let _ = RELOAD_HANDLE.set(reload_handle);

        let subscriber = Registry::default()
            .with(dyn_filter)
            .with(stdout_layer)
            .with(file_layer)
            .with(err_file_layer);
        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("global tracing subscriber already set: {e}");
        }
    });

    guards
}

fn fmt_layer<S>(
    writer: NonBlocking,
    format: LogFormat,
    ansi: bool,
) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::Layer::new()
            .json()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::Layer::new()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
    }
}

fn rolling_appender(opts: &LoggingOptions, prefix: &str) -> RollingFileAppender {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(opts.max_log_files)
        .build(&opts.dir)
        .unwrap_or_else(|e| {
            panic!(
                "initializing rolling file appender at {} failed: {}",
                &opts.dir, e
            )
        })
}
