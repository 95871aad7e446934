//! tmux session naming for thread tabs.
//!
//! The first tab of a thread is named after the thread, later tabs get a
//! numeric suffix: `otter`, `otter_2`, `otter_3`. tmux rejects `.` and `:`
//! in session names, so everything outside `[A-Za-z0-9_-]` becomes `-`.

use std::collections::HashMap;

pub fn sanitize_session_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "thread".to_string()
    } else {
        cleaned
    }
}

/// Session name of tab number `n` (1-based) of a thread.
pub fn tab_session_name(thread_name: &str, n: usize) -> String {
    let base = sanitize_session_name(thread_name);
    if n <= 1 {
        base
    } else {
        format!("{base}_{n}")
    }
}

/// First free tab session name, starting at tab number `start` and bumping
/// the suffix while `taken` reports a collision.
pub fn next_tab_session_name(
    thread_name: &str,
    start: usize,
    taken: impl Fn(&str) -> bool,
) -> String {
    let mut n = start.max(1);
    loop {
        let candidate = tab_session_name(thread_name, n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Map of the thread's session names that derive from `old_name` to their
/// equivalents under `new_name`.
///
/// Only an exact match or `<old>_<digits>` counts as derived, so a session
/// such as `otter_tools` (or `otterly`) under thread `otter` is left alone.
pub fn session_rename_map(
    old_name: &str,
    new_name: &str,
    sessions: &[String],
) -> Vec<(String, String)> {
    let old_base = sanitize_session_name(old_name);
    let new_base = sanitize_session_name(new_name);
    sessions
        .iter()
        .filter_map(|session| {
            if *session == old_base {
                return Some((session.clone(), new_base.clone()));
            }
            let suffix = session.strip_prefix(&old_base)?.strip_prefix('_')?;
            if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            Some((session.clone(), format!("{new_base}_{suffix}")))
        })
        .filter(|(from, to)| from != to)
        .collect()
}

/// Collision-proof intermediate name used by the two-phase session rename.
pub fn temp_session_name(nonce: &str, index: usize) -> String {
    format!("fdrename-{nonce}-{index}")
}

pub fn as_lookup(pairs: &[(String, String)]) -> HashMap<String, String> {
    pairs.iter().cloned().collect()
}
