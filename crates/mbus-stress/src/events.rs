use serde::Serialize;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}

/// Seconds since the epoch, as a string for JSONL events.
pub fn now_iso() -> String {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}s", d.as_secs())
}

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub mode: String,
    pub depth: u32,
    pub fanout: u32,
    pub contexts: usize,
    pub timestamp: String,
}

impl EventStarted {
    pub fn new(mode: &str, depth: u32, fanout: u32, contexts: usize) -> Self {
        Self {
            event: "started",
            mode: mode.to_string(),
            depth,
            fanout,
            contexts,
            timestamp: now_iso(),
        }
    }
}

#[derive(Serialize)]
pub struct EventConverged {
    pub event: &'static str,
    pub peers: usize,
    pub expected: usize,
    pub converge_ms: f64,
    pub elapsed_s: f64,
}

// ── Ping events ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventPing {
    pub event: &'static str,
    pub seq: u32,
    pub target: String,
    pub ok: bool,
    pub rtt_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventPingSummary {
    pub event: &'static str,
    pub rounds: u32,
    pub total_pings: u32,
    pub successful: u32,
    pub failed: u32,
    pub rtt_min_ms: f64,
    pub rtt_max_ms: f64,
    pub rtt_avg_ms: f64,
    pub elapsed_s: f64,
}

// ── Fanout result ───────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventFanoutResult {
    pub event: &'static str,
    pub policy: &'static str,
    pub target_count: usize,
    pub silent: Vec<String>,
    pub answered: usize,
    pub timed_out: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: f64,
    pub elapsed_s: f64,
}

// ── Churn events ────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventChurnRound {
    pub event: &'static str,
    pub round: u32,
    pub handle: String,
    pub deregistered: bool,
    pub deregister_ms: f64,
    pub reregistered: bool,
    pub reregister_ms: f64,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventChurnSummary {
    pub event: &'static str,
    pub rounds: u32,
    pub clean_rounds: u32,
    pub elapsed_s: f64,
}
