//! Pre-trust worktrees in an agent's JSON config so the first tab does not
//! stop on a "do you trust this folder" dialog.

use std::path::Path;

use serde_json::{json, Value};

/// Set `projects.<dir>.hasTrustDialogAccepted = true` in `config`,
/// preserving every other key. Returns whether anything changed.
pub fn merge_trust(config: &mut Value, dir: &Path) -> anyhow::Result<bool> {
    let root = config
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("agent config is not a JSON object"))?;
    let projects = root
        .entry("projects")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("agent config 'projects' is not an object"))?;
    let entry = projects
        .entry(dir.to_string_lossy().into_owned())
        .or_insert_with(|| json!({}));
    let Some(entry) = entry.as_object_mut() else {
        anyhow::bail!("agent config entry for {} is not an object", dir.display());
    };
    if entry.get("hasTrustDialogAccepted") == Some(&Value::Bool(true)) {
        return Ok(false);
    }
    entry.insert("hasTrustDialogAccepted".to_string(), Value::Bool(true));
    Ok(true)
}

/// Mark `dir` trusted in the agent config at `config_path`. A missing file
/// is created; the write goes through a temp file and a rename.
pub async fn trust_directory(config_path: &Path, dir: &Path) -> anyhow::Result<()> {
    let mut config = match tokio::fs::read_to_string(config_path).await {
        Ok(content) if !content.trim().is_empty() => serde_json::from_str::<Value>(&content)?,
        Ok(_) => json!({}),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => json!({}),
        Err(e) => return Err(e.into()),
    };
    if !merge_trust(&mut config, dir)? {
        return Ok(());
    }
    if let Some(parent) = config_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = config_path.with_extension("json.fleetdock-tmp");
    tokio::fs::write(&tmp, serde_json::to_string_pretty(&config)?).await?;
    tokio::fs::rename(&tmp, config_path).await?;
    tracing::debug!(
        component = "agent_trust",
        event = "agent_trust.granted",
        dir = %dir.display(),
        config = %config_path.display(),
        "Pre-trusted worktree for agent"
    );
    Ok(())
}
