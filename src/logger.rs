use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use clap::ValueEnum;
use opentelemetry::global;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt as tfmt};

pub const SERVICE_NAME: &str = "proton";
pub const LOG_FILE: &str = "proton.log";
pub const CASCADE_FILE: &str = "cascade.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// `EnvFilter` directive. There is no critical level in tracing; it
    /// filters like error.
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Critical => f.write_str("critical"),
            other => f.write_str(other.directive()),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level `{}`", other)),
        }
    }
}

/// Where log output goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSink {
    /// Human readable lines on stderr.
    Stderr,
    /// Daily rolling text log plus the JSON cascade report file.
    Files { dir: PathBuf },
    /// OTLP/HTTP logs and traces, with a local fmt layer on stdout.
    Otlp { endpoint: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub sink: LogSink,
}

impl LogConfig {
    pub fn new(level: LogLevel, sink: LogSink) -> Self {
        Self { level, sink }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new(LogLevel::Info, LogSink::Stderr)
    }
}

/// Keeps exporters alive; flushes them on drop.
#[derive(Default)]
pub struct TelemetryGuard {
    logger_provider: Option<SdkLoggerProvider>,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.logger_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.tracer_provider.take() {
            let _ = provider.shutdown();
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<TelemetryGuard> {
    let directive = config.level.directive();
    match &config.sink {
        LogSink::Stderr => {
            Registry::default()
                .with(EnvFilter::new(directive))
                .with(tfmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| anyhow!("could not install subscriber: {e}"))?;
            Ok(TelemetryGuard::default())
        }
        LogSink::Files { dir } => {
            FileTelemetry::init_files(directive, dir.join(LOG_FILE), dir.join(CASCADE_FILE))?;
            Ok(TelemetryGuard::default())
        }
        LogSink::Otlp { endpoint } => Telemetry::init(directive, endpoint),
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();

fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_traces(endpoint: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("span exporter")?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

pub struct Telemetry;

impl Telemetry {
    pub fn init(log_level: &str, endpoint: &str) -> Result<TelemetryGuard> {
        let logger_provider = init_logs(endpoint)?;
        let tracer_provider = init_traces(endpoint)?;

        // the exporter's own http stack must not feed back into it
        let bridge_filter = EnvFilter::new(log_level)
            .add_directive("hyper=off".parse()?)
            .add_directive("tonic=off".parse()?)
            .add_directive("h2=off".parse()?)
            .add_directive("reqwest=off".parse()?);
        let otel_logs_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(bridge_filter);

        let fmt_layer = tfmt::layer()
            .with_thread_names(true)
            .with_filter(EnvFilter::new(log_level));

        Registry::default()
            .with(otel_logs_layer)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| anyhow!("could not install subscriber: {e}"))?;

        global::set_tracer_provider(tracer_provider.clone());

        Ok(TelemetryGuard {
            logger_provider: Some(logger_provider),
            tracer_provider: Some(tracer_provider),
        })
    }
}

/// File-only logging.
pub struct FileTelemetry;

impl FileTelemetry {
    /// - `log_level` is an `EnvFilter` directive (e.g. `"info"`).
    /// - `log_file` is the rolling text log.
    /// - `cascade_file` is the rolling JSON log that receives one line per
    ///   finished cascade (`target = "cascade"`).
    pub fn init_files(log_level: &str, log_file: PathBuf, cascade_file: PathBuf) -> Result<()> {
        let (log_dir, log_name) = split_path(&log_file)?;
        let (cascade_dir, cascade_name) = split_path(&cascade_file)?;

        let txt_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, log_name);
        let txt_layer = tfmt::layer()
            .with_writer(txt_appender)
            .with_ansi(false)
            .with_filter(EnvFilter::new(log_level));

        let json_appender = RollingFileAppender::new(Rotation::DAILY, cascade_dir, cascade_name);
        let json_layer = tfmt::layer()
            .json()
            .with_writer(json_appender)
            .with_target(true)
            .with_filter(EnvFilter::new("cascade=info"));

        Registry::default()
            .with(txt_layer)
            .with(json_layer)
            .try_init()
            .map_err(|e| anyhow!("could not install subscriber: {e}"))?;
        Ok(())
    }
}

fn split_path(path: &Path) -> Result<(&Path, &std::ffi::OsStr)> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("log path {} has no parent directory", path.display()))?;
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("log path {} has no file name", path.display()))?;
    Ok((dir, name))
}
