//! Agent turn-completion signals.
//!
//! tmux bell hooks and agent lifecycle hooks append lines to a shared log:
//! either `<session>` or `<epoch-seconds>\t<session>`. The reconciliation
//! loop drains the log every tick and folds the events into thread state.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub session: String,
    pub at: DateTime<Utc>,
}

/// Parse one completion log line. Lines without a timestamp get `received_at`.
pub fn parse_completion_line(line: &str, received_at: DateTime<Utc>) -> Option<CompletionEvent> {
    // Only line endings and indentation go: a trailing tab marks an empty
    // session field.
    let line = line.trim_end_matches(&['\r', '\n'][..]).trim_start();
    if line.trim_end().is_empty() {
        return None;
    }
    let (at, session) = match line.split_once('\t') {
        Some((ts, session)) => {
            let at = ts
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .unwrap_or(received_at);
            (at, session.trim())
        }
        None => (received_at, line.trim_end()),
    };
    if session.is_empty() {
        return None;
    }
    Some(CompletionEvent {
        session: session.to_string(),
        at,
    })
}

/// Absorbs duplicate completion signals for the same session (a bell and a
/// lifecycle hook usually both fire for one turn).
#[derive(Debug)]
pub struct CompletionDeduper {
    window: Duration,
    last_seen: HashMap<String, Instant>,
}

impl CompletionDeduper {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    /// Returns true when the event should be processed.
    pub fn accept(&mut self, session: &str, now: Instant) -> bool {
        if let Some(prev) = self.last_seen.get(session) {
            if now.saturating_duration_since(*prev) < self.window {
                return false;
            }
        }
        self.last_seen.insert(session.to_string(), now);
        true
    }

    /// Time of the last accepted signal for `session`.
    pub fn last_signal(&self, session: &str) -> Option<Instant> {
        self.last_seen.get(session).copied()
    }

    /// Drop entries older than the window.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.last_seen
            .retain(|_, at| now.saturating_duration_since(*at) < window.max(Duration::from_secs(60)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_timestamped_lines() {
        let now = Utc::now();
        let plain = parse_completion_line("otter\n", now).unwrap();
        assert_eq!(plain.session, "otter");
        assert_eq!(plain.at, now);

        let stamped = parse_completion_line("1700000000\theron", now).unwrap();
        assert_eq!(stamped.session, "heron");
        assert_eq!(stamped.at.timestamp(), 1_700_000_000);

        assert!(parse_completion_line("   ", now).is_none());
        assert!(parse_completion_line("1700000000\t", now).is_none());
        assert!(parse_completion_line("1700000000\t\r\n", now).is_none());
        assert_eq!(
            parse_completion_line("  otter \r\n", now).unwrap().session,
            "otter"
        );
    }

    #[test]
    fn bad_timestamp_falls_back_to_receipt_time() {
        let now = Utc::now();
        let event = parse_completion_line("soon\totter", now).unwrap();
        assert_eq!(event.at, now);
        assert_eq!(event.session, "otter");
    }

    #[test]
    fn dedups_within_window_per_session() {
        let start = Instant::now();
        let mut dedup = CompletionDeduper::new(Duration::from_secs(2));
        assert!(dedup.accept("otter", start));
        assert!(!dedup.accept("otter", start + Duration::from_millis(500)));
        assert!(dedup.accept("heron", start + Duration::from_millis(500)));
        assert!(dedup.accept("otter", start + Duration::from_secs(3)));
    }
}
