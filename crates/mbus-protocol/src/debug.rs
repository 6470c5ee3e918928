/// Opt-in traffic logging, filtered by handle and category.
///
/// Lines go to `tracing` at debug level under the `mbus` target, so a
/// subscriber still decides whether they are shown at all.
use std::fmt;

use serde_json::Value;

/// Environment variable holding the handle pattern.
pub const DEBUG_ENV: &str = "MBUS_DEBUG";

/// Environment variable holding comma-separated categories.
pub const DEBUG_LEVEL_ENV: &str = "MBUS_DEBUG_LEVEL";

/// Kind of traffic a log line is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Application messages and their acks.
    Send,
    /// Requests and responses.
    Request,
    /// Discovery traffic received.
    Internal,
    /// Discovery traffic sent.
    InternalSend,
}

impl LogCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            LogCategory::Send => "send",
            LogCategory::Request => "request",
            LogCategory::Internal => "internal",
            LogCategory::InternalSend => "internal_send",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "send" => Some(LogCategory::Send),
            "request" => Some(LogCategory::Request),
            "internal" => Some(LogCategory::Internal),
            "internal_send" => Some(LogCategory::InternalSend),
            _ => None,
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which buses log, and what.
///
/// The handle pattern is `*` for every bus, `prefix*`, `*suffix`, or an
/// exact handle. No pattern means no logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugConfig {
    pub handle_pattern: Option<String>,
    pub categories: Vec<LogCategory>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            handle_pattern: None,
            categories: vec![LogCategory::Send, LogCategory::Request],
        }
    }
}

impl DebugConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `MBUS_DEBUG` and `MBUS_DEBUG_LEVEL`.
    ///
    /// Unknown categories are skipped; if none remain the defaults apply.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.handle_pattern = std::env::var(DEBUG_ENV).ok().filter(|p| !p.is_empty());
        if let Ok(level) = std::env::var(DEBUG_LEVEL_ENV) {
            let parsed: Vec<LogCategory> = level.split(',').filter_map(LogCategory::parse).collect();
            if !parsed.is_empty() {
                config.categories = parsed;
            }
        }
        config
    }

    pub fn handle_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.handle_pattern = Some(pattern.into());
        self
    }

    pub fn categories(mut self, categories: Vec<LogCategory>) -> Self {
        self.categories = categories;
        self
    }

    /// Whether `handle` should log lines of `category`.
    pub fn enabled(&self, handle: &str, category: LogCategory) -> bool {
        let Some(pattern) = self.handle_pattern.as_deref() else {
            return false;
        };
        self.categories.contains(&category) && matches_pattern(pattern, handle)
    }
}

fn matches_pattern(pattern: &str, handle: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return handle.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return handle.starts_with(prefix);
    }
    pattern == handle
}

/// A bus's logger: its handle plus the filter.
#[derive(Debug, Clone)]
pub struct BusLog {
    handle: String,
    config: DebugConfig,
}

impl BusLog {
    pub fn new(handle: &str, config: DebugConfig) -> Self {
        Self {
            handle: handle.to_string(),
            config,
        }
    }

    pub fn enabled(&self, category: LogCategory) -> bool {
        self.config.enabled(&self.handle, category)
    }

    /// Log `title` with `detail` if the filter lets it through. `detail`
    /// is only built when it will be used.
    pub fn trace(&self, category: LogCategory, title: &str, detail: impl FnOnce() -> Value) {
        if !self.enabled(category) {
            return;
        }
        let detail = detail();
        tracing::debug!(
            target: "mbus",
            handle = %self.handle,
            category = category.as_str(),
            %detail,
            "{title}"
        );
    }
}
