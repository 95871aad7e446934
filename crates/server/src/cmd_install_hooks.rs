//! `fleetdock install-hooks`: configure agent completion hooks.
//!
//! Safely merges fleetdock hook entries into `~/.claude/settings.json`. The
//! hooks append `<epoch>\t<session>` to the completion log whenever an agent
//! running inside a fleetdock session finishes a turn.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::orchestrator::SESSION_ENV;
use crate::paths;

/// Agent hook events that mean "the agent finished its turn".
const HOOK_EVENTS: &[&str] = &["Stop"];

pub fn run(settings_path: Option<&Path>) -> anyhow::Result<()> {
    let settings_file = match settings_path {
        Some(path) => PathBuf::from(path),
        None => dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("HOME directory not found"))?
            .join(".claude/settings.json"),
    };

    // Read existing settings or start with empty object
    let mut settings = if settings_file.exists() {
        let content = std::fs::read_to_string(&settings_file)?;
        serde_json::from_str::<Value>(&content)?
    } else {
        json!({})
    };

    let command = hook_command(&paths::completion_log_path());
    let (added, updated) = merge_hooks(&mut settings, &command)?;

    // Back up original
    if settings_file.exists() {
        let backup = settings_file.with_extension("json.bak");
        std::fs::copy(&settings_file, &backup)?;
        println!(
            "  Backed up {} → {}",
            settings_file.display(),
            backup.display()
        );
    }

    if let Some(parent) = settings_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&settings_file, serde_json::to_string_pretty(&settings)?)?;

    println!();
    if !added.is_empty() {
        println!("  Added {} hook(s):", added.len());
        for h in &added {
            println!("    + hooks.{}", h);
        }
    }
    if !updated.is_empty() {
        println!("  Updated {} hook(s):", updated.len());
        for h in &updated {
            println!("    ~ hooks.{}", h);
        }
    }
    println!();
    println!("  Settings written to {}", settings_file.display());
    println!();

    Ok(())
}

/// Shell command run by the hook. A no-op outside fleetdock sessions.
fn hook_command(log: &Path) -> String {
    format!(
        "[ -n \"${env}\" ] && printf '%s\\t%s\\n' \"$(date +%s)\" \"${env}\" >> '{log}' || true",
        env = SESSION_ENV,
        log = log.display()
    )
}

fn is_fleetdock_entry(entry: &Value) -> bool {
    let mentions = |v: &Value| {
        v.get("command")
            .and_then(Value::as_str)
            .is_some_and(|c| c.contains(SESSION_ENV))
    };
    match entry.get("hooks").and_then(Value::as_array) {
        Some(hooks) => hooks.iter().any(mentions),
        None => mentions(entry),
    }
}

/// Insert or replace our entry under each hook event. Entries owned by other
/// tools are left alone. Returns the (added, updated) event names.
fn merge_hooks(
    settings: &mut Value,
    command: &str,
) -> anyhow::Result<(Vec<&'static str>, Vec<&'static str>)> {
    let obj = settings
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("settings.json is not a JSON object"))?;
    let hooks = obj
        .entry("hooks")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("settings.json 'hooks' is not an object"))?;

    let mut added = Vec::new();
    let mut updated = Vec::new();
    for &event in HOOK_EVENTS {
        let entry = json!({
            "hooks": [{
                "type": "command",
                "command": command,
            }]
        });
        let entries = hooks.entry(event).or_insert_with(|| json!([]));
        let arr = entries
            .as_array_mut()
            .ok_or_else(|| anyhow::anyhow!("settings.json 'hooks.{}' is not an array", event))?;
        match arr.iter().position(is_fleetdock_entry) {
            Some(idx) => {
                arr[idx] = entry;
                updated.push(event);
            }
            None => {
                arr.push(entry);
                added.push(event);
            }
        }
    }
    Ok((added, updated))
}
