use crate::streaming::StreamOutcome;
use crate::types::StreamDelta;
use colored::*;
use std::panic;
use std::path::Path;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

pub const DEFAULT_LOG_FILTER: &str = "colloquy=info,flight_recorder=info,panic=error";
pub const LOG_FILE_NAME: &str = "colloquy.log";

/// Installs the global subscriber: env filter, a daily-rolling file layer and
/// the span-trace error layer. The returned guard must outlive the program or
/// buffered lines are lost.
pub fn init_tracing(log_dir: &Path, json: bool) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_LOG_FILTER.into(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(tracing_error::ErrorLayer::default())
        .init();

    Ok(guard)
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per-stream counters, logged once when the read ends.
#[derive(Debug, Default)]
pub struct StreamMetric {
    pub chunks: usize,
    pub bytes: usize,
    pub text_chars: usize,
    pub reasoning_chars: usize,
    pub tool_names: Vec<String>,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes += len;
    }

    pub fn record_delta(&mut self, delta: &StreamDelta) {
        match delta {
            StreamDelta::Text(t) => self.text_chars += t.chars().count(),
            StreamDelta::Reasoning(t) => self.reasoning_chars += t.chars().count(),
            StreamDelta::ToolCall(call) => self.tool_names.push(call.function.name.clone()),
            StreamDelta::Usage(_) => {}
        }
    }

    pub fn log_summary(&self, outcome: &StreamOutcome) {
        let tools_str = if self.tool_names.is_empty() {
            "0".to_string()
        } else {
            format!("{} ({})", self.tool_names.len(), self.tool_names.join(", "))
        };

        match outcome {
            StreamOutcome::Failed(reason) => warn!(
                target: "flight_recorder",
                "{} Chunks: {} | Bytes: {} | Text: {} chars | Reason: {}",
                "[STREAM FAILED]".bold().red(),
                self.chunks, self.bytes, self.text_chars, reason
            ),
            _ => info!(
                target: "flight_recorder",
                "[STREAM END] {:?} | Chunks: {} | Bytes: {} | Tools: {} | Text: {} chars | Reasoning: {} chars",
                outcome, self.chunks, self.bytes, tools_str, self.text_chars, self.reasoning_chars
            ),
        }
    }
}
