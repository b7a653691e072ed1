//! Volume filter applied before records leave the process.

use serde::{Deserialize, Serialize};

use crate::model::{LogLevel, Span};

/// How much span detail is shipped to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryMode {
    /// Ship every span and log.
    #[default]
    Full,
    /// Ship only error spans; drop logs below `WARNING`.
    ErrorsOnly,
    /// Ship no spans; drop logs below `WARNING`.
    Disabled,
}

/// Filtering decisions for one mode.
///
/// Error entries and completed-request summaries are always shipped: they
/// are the low-volume records the filter exists to protect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetryPolicy {
    pub mode: TelemetryMode,
}

impl TelemetryPolicy {
    pub fn new(mode: TelemetryMode) -> Self {
        Self { mode }
    }

    pub fn allows_span(&self, span: &Span) -> bool {
        match self.mode {
            TelemetryMode::Full => true,
            TelemetryMode::ErrorsOnly => span.is_error(),
            TelemetryMode::Disabled => false,
        }
    }

    pub fn allows_log(&self, level: LogLevel) -> bool {
        match self.mode {
            TelemetryMode::Full => true,
            TelemetryMode::ErrorsOnly | TelemetryMode::Disabled => level >= LogLevel::Warning,
        }
    }
}
