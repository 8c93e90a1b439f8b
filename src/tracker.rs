#![forbid(unsafe_code)]

//! Tracks every in-flight download and renders live progress for the UI.
//!
//! Sessions are keyed by a sanitized title/format/extension triple, so
//! re-requesting the same variant replaces its predecessor instead of piling
//! up. Byte counts come from the streaming proxy; the wall clock is passed in
//! explicitly so the rate math can be driven deterministically in tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

const BYTES_PER_MB: f64 = 1_048_576.0;
const CALCULATING: &str = "Calculating...";
const IDLE_SPEED: &str = "0 MB/s";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    InProgress,
    Complete,
    /// Only ever seen on the snapshot returned by [`DownloadTracker::cancel`];
    /// cancelled sessions are removed, never stored.
    Cancelled,
}

/// Snapshot of one tracked download, display-ready.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSession {
    pub id: String,
    pub state: SessionState,
    pub percentage: u8,
    pub speed: String,
    pub eta: String,
    pub downloaded: String,
    pub total: String,
    pub bytes_loaded: u64,
    pub bytes_total: u64,
}

/// Handle returned by `start`; the token fires when the session is cancelled,
/// replaced, or swept by a reset, and the transfer driving it must stop.
pub struct StartedDownload {
    pub id: String,
    pub token: CancellationToken,
}

struct SessionEntry {
    session: DownloadSession,
    started: Instant,
    token: CancellationToken,
}

#[derive(Default)]
struct SessionTable {
    entries: HashMap<String, SessionEntry>,
    // Insertion order; listings must not depend on map iteration order.
    order: Vec<String>,
}

#[derive(Clone)]
pub struct DownloadTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    sessions: Mutex<SessionTable>,
}

/// Derives the session key: the title with every non-alphanumeric character
/// replaced one-for-one by `_` ("download" when the title is empty), then the
/// format id and extension appended.
pub fn session_id(title: &str, format_id: &str, extension: &str) -> String {
    let mut sanitized: String = title
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    if sanitized.is_empty() {
        sanitized = "download".to_string();
    }
    format!("{sanitized}_{format_id}_{extension}")
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                sessions: Mutex::new(SessionTable::default()),
            }),
        }
    }

    /// Registers a session for the given variant, replacing (and cancelling)
    /// any live session under the same key. `total_display` is the size string
    /// from the chosen catalog entry and may be empty.
    pub fn start(
        &self,
        title: &str,
        format_id: &str,
        extension: &str,
        total_display: &str,
    ) -> StartedDownload {
        self.start_at(title, format_id, extension, total_display, Instant::now())
    }

    pub fn start_at(
        &self,
        title: &str,
        format_id: &str,
        extension: &str,
        total_display: &str,
        started: Instant,
    ) -> StartedDownload {
        let id = session_id(title, format_id, extension);
        let token = CancellationToken::new();
        let entry = SessionEntry {
            session: DownloadSession {
                id: id.clone(),
                state: SessionState::Pending,
                percentage: 0,
                speed: IDLE_SPEED.to_string(),
                eta: CALCULATING.to_string(),
                downloaded: "0 MB".to_string(),
                total: total_display.to_string(),
                bytes_loaded: 0,
                bytes_total: 0,
            },
            started,
            token: token.clone(),
        };

        let mut table = self.inner.sessions.lock();
        if let Some(previous) = table.entries.insert(id.clone(), entry) {
            // Replaced in place; the key keeps its original listing position.
            previous.token.cancel();
        } else {
            table.order.push(id.clone());
        }
        StartedDownload { id, token }
    }

    pub fn on_progress_now(&self, id: &str, bytes_loaded: u64, bytes_total: u64) {
        self.on_progress(id, bytes_loaded, bytes_total, Instant::now());
    }

    /// Applies one byte-progress sample. Unknown ids and completed sessions
    /// are left untouched. A sample with an unknown total (0) updates the
    /// byte counters and speed but keeps the previous percentage.
    pub fn on_progress(&self, id: &str, bytes_loaded: u64, bytes_total: u64, at: Instant) {
        let mut table = self.inner.sessions.lock();
        let Some(entry) = table.entries.get_mut(id) else {
            return;
        };
        if entry.session.state == SessionState::Complete {
            return;
        }

        let elapsed = at.saturating_duration_since(entry.started).as_secs_f64();
        let loaded_mb = bytes_loaded as f64 / BYTES_PER_MB;
        let speed = if elapsed > 0.0 { loaded_mb / elapsed } else { 0.0 };

        let session = &mut entry.session;
        session.state = SessionState::InProgress;
        session.bytes_loaded = bytes_loaded;
        session.bytes_total = bytes_total;
        if bytes_total > 0 {
            let ratio = bytes_loaded as f64 * 100.0 / bytes_total as f64;
            session.percentage = ratio.round().clamp(0.0, 100.0) as u8;
            session.total = format!("{:.2} MB", bytes_total as f64 / BYTES_PER_MB);
        }
        session.speed = format_speed(speed);
        session.eta = format_eta(speed, bytes_loaded, bytes_total);
        session.downloaded = format!("{loaded_mb:.2} MB");
    }

    /// Marks a session finished: 100%, "Complete", byte counters pinned to
    /// the total. The entry stays listed until cancelled or reset.
    pub fn complete(&self, id: &str, total_display: &str) {
        let mut table = self.inner.sessions.lock();
        let Some(entry) = table.entries.get_mut(id) else {
            return;
        };
        let session = &mut entry.session;
        session.state = SessionState::Complete;
        session.percentage = 100;
        session.speed = IDLE_SPEED.to_string();
        session.eta = "Complete".to_string();
        session.downloaded = total_display.to_string();
        session.total = total_display.to_string();
        session.bytes_loaded = session.bytes_total;
    }

    /// Removes a session and fires its cancellation token. Returns the
    /// removed snapshot marked `Cancelled`; `None` for unknown ids (a no-op,
    /// not an error).
    pub fn cancel(&self, id: &str) -> Option<DownloadSession> {
        let mut table = self.inner.sessions.lock();
        let entry = table.entries.remove(id)?;
        table.order.retain(|existing| existing != id);
        entry.token.cancel();
        let mut session = entry.session;
        session.state = SessionState::Cancelled;
        Some(session)
    }

    /// Cancels every live token and clears the table.
    pub fn reset(&self) {
        let mut table = self.inner.sessions.lock();
        for entry in table.entries.values() {
            entry.token.cancel();
        }
        table.entries.clear();
        table.order.clear();
    }

    /// Snapshots in insertion order, completed sessions included.
    pub fn sessions(&self) -> Vec<DownloadSession> {
        let table = self.inner.sessions.lock();
        table
            .order
            .iter()
            .filter_map(|id| table.entries.get(id))
            .map(|entry| entry.session.clone())
            .collect()
    }
}

impl Default for DownloadTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn format_speed(speed: f64) -> String {
    if speed > 0.0 {
        format!("{speed:.2} MB/s")
    } else {
        CALCULATING.to_string()
    }
}

/// Remaining-time estimate from the current average speed. Buckets compare
/// the raw second count, then round up within the chosen unit, so 59.9s and
/// 60.0s render as "60s" and "1m" respectively.
fn format_eta(speed: f64, bytes_loaded: u64, bytes_total: u64) -> String {
    if speed <= 0.0 || bytes_total == 0 {
        return CALCULATING.to_string();
    }
    let remaining_mb = bytes_total.saturating_sub(bytes_loaded) as f64 / BYTES_PER_MB;
    let eta_seconds = remaining_mb / speed;
    if eta_seconds < 60.0 {
        format!("{}s", eta_seconds.ceil() as i64)
    } else if eta_seconds < 3600.0 {
        format!("{}m", (eta_seconds / 60.0).ceil() as i64)
    } else {
        format!("{}h", (eta_seconds / 3600.0).ceil() as i64)
    }
}
