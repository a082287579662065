// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Tracing setup for channel endpoints.
//!
//! Reads the `logger:` section of the main YAML file and installs a
//! global subscriber. The line format puts the channel-relevant parts
//! first: timestamp, level, the span scope path (reactor, bridge,
//! socket spans joined with `/`), then the message and any remaining
//! event fields.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use tracing::{Event, Subscriber, field::Field};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{
        self, FmtContext, FormatEvent, FormatFields,
        format::{DefaultFields, Writer},
        writer::BoxMakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
};

#[derive(Debug, Deserialize, Clone)]
struct LoggerFile {
    logger: LoggerSettings,
}

/// The `logger:` section of the configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct LoggerSettings {
    /// Filter directive set, `EnvFilter` syntax (e.g. `info` or
    /// `vts_channel_rs::vts=debug`).
    #[serde(rename = "Level", default = "default_level")]
    pub level: String,

    /// Line layout.
    #[serde(rename = "Format", default)]
    pub format: LineFormat,

    /// Where lines go.
    #[serde(rename = "Target", default)]
    pub target: LogTarget,
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineFormat {
    /// One JSON object per line, channel fields lifted to the top.
    #[default]
    Json,
    /// Human-oriented output for interactive runs.
    Text,
}

/// Output destination. File targets rotate through `tracing-appender`.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    #[default]
    Stderr,
    Stdout,
    File {
        #[serde(rename = "Path")]
        path: String,
        #[serde(rename = "Rotate", default)]
        rotate: RotateEvery,
    },
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotateEvery {
    Minute,
    Hour,
    Day,
    #[default]
    Never,
}

/// Collects event fields, splitting the message off from the rest.
#[derive(Default)]
struct FieldBag {
    message: Option<String>,
    rest: Vec<(&'static str, serde_json::Value)>,
}

impl tracing::field::Visit for FieldBag {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.rest.push((field.name(), serde_json::Value::from(rendered)));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.rest.push((field.name(), serde_json::Value::from(value)));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.rest.push((field.name(), serde_json::Value::from(value)));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.rest.push((field.name(), serde_json::Value::from(value)));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.rest.push((field.name(), serde_json::Value::from(value)));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.rest.push((field.name(), serde_json::Value::from(value)));
    }
}

/// JSON line formatter: fixed envelope keys, then the event fields.
struct ChannelJson;

impl<S, N> FormatEvent<S, N> for ChannelJson
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut bag = FieldBag::default();
        event.record(&mut bag);

        // Span path like `reactor/channel/handshake`.
        let scope = ctx.event_scope().map(|scope| {
            scope
                .from_root()
                .map(|span| span.name())
                .collect::<Vec<_>>()
                .join("/")
        });

        let mut line = serde_json::Map::new();
        line.insert("ts".into(), Utc::now().to_rfc3339().into());
        line.insert(
            "level".into(),
            event.metadata().level().as_str().into(),
        );
        line.insert("target".into(), event.metadata().target().into());
        if let Some(scope) = scope.filter(|s| !s.is_empty()) {
            line.insert("scope".into(), scope.into());
        }
        if let Some(message) = bag.message {
            line.insert("msg".into(), message.into());
        }
        for (name, value) in bag.rest {
            line.insert(name.into(), value);
        }

        writeln!(
            writer,
            "{}",
            serde_json::Value::Object(line)
        )
    }
}

/// Reads the logger section from `config_path` and installs the global
/// subscriber. The returned guard must stay alive for as long as log
/// output should be flushed.
pub fn init_logger(config_path: &str) -> Result<WorkerGuard> {
    let raw = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config file: {config_path}"))?;
    let parsed: LoggerFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {config_path}"))?;
    init_logger_with(&parsed.logger)
}

/// Installs the global subscriber from already-loaded settings.
pub fn init_logger_with(settings: &LoggerSettings) -> Result<WorkerGuard> {
    let (writer, guard) = writer_for(&settings.target)?;

    let filter = EnvFilter::try_new(&settings.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("failed to parse log level from config or env")?;

    match settings.format {
        LineFormat::Json => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .event_format(ChannelJson)
                .fmt_fields(DefaultFields::new());
            tracing::subscriber::set_global_default(
                Registry::default().with(filter).with(layer),
            )
        },
        LineFormat::Text => {
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            tracing::subscriber::set_global_default(
                Registry::default().with(filter).with(layer),
            )
        },
    }
    .context("failed to set global default subscriber")?;

    Ok(guard)
}

fn writer_for(target: &LogTarget) -> Result<(BoxMakeWriter, WorkerGuard)> {
    Ok(match target {
        LogTarget::Stderr => {
            let (w, g) = tracing_appender::non_blocking(std::io::stderr());
            (BoxMakeWriter::new(w), g)
        },
        LogTarget::Stdout => {
            let (w, g) = tracing_appender::non_blocking(std::io::stdout());
            (BoxMakeWriter::new(w), g)
        },
        LogTarget::File { path, rotate } => {
            let path = Path::new(path);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let rotation = match rotate {
                RotateEvery::Minute => Rotation::MINUTELY,
                RotateEvery::Hour => Rotation::HOURLY,
                RotateEvery::Day => Rotation::DAILY,
                RotateEvery::Never => Rotation::NEVER,
            };
            let appender = RollingFileAppender::new(
                rotation,
                dir,
                path.file_name().unwrap_or_default(),
            );
            let (w, g) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(w), g)
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_section_parses_with_defaults() {
        let settings: LoggerFile = serde_yaml::from_str(
            "logger:\n  Level: debug\n",
        )
        .expect("parse");
        assert_eq!(settings.logger.level, "debug");
        assert_eq!(settings.logger.format, LineFormat::Json);
        assert!(matches!(settings.logger.target, LogTarget::Stderr));
    }

    #[test]
    fn file_target_parses() {
        let settings: LoggerFile = serde_yaml::from_str(
            "logger:\n  Level: info\n  Format: text\n  Target:\n    file:\n      Path: logs/channel.log\n      Rotate: day\n",
        )
        .expect("parse");
        let LogTarget::File { path, rotate } = settings.logger.target else {
            panic!("expected file target");
        };
        assert_eq!(path, "logs/channel.log");
        assert!(matches!(rotate, RotateEvery::Day));
    }
}
