//! Tab operations on a thread.

use std::collections::HashSet;

use tracing::info;

use fleetdock_protocol::TabInfo;

use crate::error::{CleanupReport, OrchestratorError, Result};
use crate::orchestrator::Orchestrator;
use crate::session_names::next_tab_session_name;

/// Addresses a tab by position or session name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabRef {
    Index(usize),
    Session(String),
}

impl Orchestrator {
    /// Add a tab running `agent` (a plain shell when `None` or `"shell"`).
    pub async fn add_tab(&self, thread_id: &str, agent: Option<&str>) -> Result<TabInfo> {
        let _guard = self.lock_thread(thread_id).await;
        let thread = self.resolve_thread(Some(thread_id), None)?;

        let agent = match agent {
            None | Some("") | Some("shell") => None,
            Some(id) => Some(
                self.read(|s| s.settings.agent(id).cloned())
                    .ok_or_else(|| OrchestratorError::UnknownAgent(id.to_string()))?,
            ),
        };

        let live: HashSet<String> = self.mux.list_sessions().await?.into_iter().collect();
        let recorded = self.read(|s| s.recorded_sessions());
        let session = next_tab_session_name(&thread.name, thread.tmux_session_names.len() + 1, |c| {
            thread.has_session(c) || live.contains(c) || recorded.contains(c)
        });

        if let Some(agent) = &agent {
            self.pretrust(agent, &thread.worktree_path).await;
        }
        self.start_session(&thread, &session, agent.as_ref()).await?;

        let updated = self.update_thread(thread_id, |t| {
            t.push_session(&session, agent.is_some());
            if t.selected_agent_type.is_none() {
                t.selected_agent_type = agent.as_ref().map(|a| a.id.clone());
            }
        })?;
        self.persist().await?;

        info!(
            component = "tabs",
            event = "tabs.added",
            thread_id = %thread_id,
            session = %session,
            agent = ?agent.as_ref().map(|a| a.id.as_str()),
            "Tab added"
        );
        updated
            .tabs()
            .into_iter()
            .find(|tab| tab.session_name == session)
            .ok_or(OrchestratorError::SessionNotFound(session))
    }

    /// Close a tab. The last tab cannot be closed; archive or delete the
    /// thread instead.
    pub async fn remove_tab(&self, thread_id: &str, tab: TabRef) -> Result<CleanupReport> {
        let _guard = self.lock_thread(thread_id).await;
        let thread = self.resolve_thread(Some(thread_id), None)?;
        let session = match tab {
            TabRef::Index(index) => thread
                .session_at(index)
                .map(str::to_string)
                .ok_or(OrchestratorError::InvalidTabIndex {
                    index,
                    count: thread.tmux_session_names.len(),
                })?,
            TabRef::Session(name) if thread.has_session(&name) => name,
            TabRef::Session(name) => return Err(OrchestratorError::SessionNotFound(name)),
        };
        if thread.tmux_session_names.len() <= 1 {
            return Err(OrchestratorError::LastTab);
        }

        self.update_thread(thread_id, |t| {
            t.remove_session(&session);
        })?;
        self.mutate(|s| {
            if s.focused_session.as_deref() == Some(session.as_str()) {
                s.focused_session = None;
            }
        });
        self.pending_cwd.lock().remove(&session);
        self.persist().await?;

        let mut cleanup = CleanupReport::default();
        cleanup.check("kill session", self.mux.kill_session(&session).await);
        info!(
            component = "tabs",
            event = "tabs.removed",
            thread_id = %thread_id,
            session = %session,
            "Tab removed"
        );
        Ok(cleanup)
    }

    pub async fn pin_tab(&self, thread_id: &str, session: &str, pinned: bool) -> Result<()> {
        let _guard = self.lock_thread(thread_id).await;
        self.session_of(thread_id, session)?;
        self.update_thread(thread_id, |t| {
            if pinned {
                t.pinned_sessions.insert(session.to_string());
            } else {
                t.pinned_sessions.remove(session);
            }
        })?;
        self.persist().await
    }

    /// Set (or clear with `None`) the label shown for a tab.
    pub async fn set_tab_display_name(
        &self,
        thread_id: &str,
        session: &str,
        display_name: Option<&str>,
    ) -> Result<()> {
        let _guard = self.lock_thread(thread_id).await;
        self.session_of(thread_id, session)?;
        let label = display_name.map(str::trim).filter(|n| !n.is_empty());
        self.update_thread(thread_id, |t| match label {
            Some(label) => {
                t.custom_tab_names
                    .insert(session.to_string(), label.to_string());
            }
            None => {
                t.custom_tab_names.remove(session);
            }
        })?;
        self.persist().await
    }

    fn session_of(&self, thread_id: &str, session: &str) -> Result<()> {
        let thread = self.resolve_thread(Some(thread_id), None)?;
        if thread.has_session(session) {
            Ok(())
        } else {
            Err(OrchestratorError::SessionNotFound(session.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestFleet;

    #[tokio::test]
    async fn add_tab_names_and_bumps_on_live_collision() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("otter")).await;
        fleet.mux.spawn_stray("otter_2");

        let tab = fleet.orchestrator.add_tab(&t.id, None).await.unwrap();
        assert_eq!(tab.session_name, "otter_3");
        assert_eq!(tab.index, 1);
        assert!(!tab.is_agent);

        let agent_tab = fleet.orchestrator.add_tab(&t.id, Some("claude")).await.unwrap();
        assert_eq!(agent_tab.session_name, "otter_4");
        assert!(agent_tab.is_agent);
        assert!(fleet.mux.has_hook("otter_4"));
    }

    #[tokio::test]
    async fn remove_tab_by_index_and_name() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("otter")).await;
        fleet.orchestrator.add_tab(&t.id, None).await.unwrap();
        fleet.orchestrator.add_tab(&t.id, None).await.unwrap();
        fleet
            .orchestrator
            .set_tab_display_name(&t.id, "otter_2", Some("server"))
            .await
            .unwrap();
        fleet.orchestrator.pin_tab(&t.id, "otter_2", true).await.unwrap();

        let report = fleet.orchestrator.remove_tab(&t.id, TabRef::Index(1)).await.unwrap();
        assert!(report.is_clean());
        assert!(!fleet.mux.is_live("otter_2"));
        let after = fleet.orchestrator.resolve_thread(Some(&t.id), None).unwrap();
        assert_eq!(after.tmux_session_names, vec!["otter", "otter_3"]);
        assert!(after.custom_tab_names.is_empty());
        assert!(after.pinned_sessions.is_empty());

        fleet
            .orchestrator
            .remove_tab(&t.id, TabRef::Session("otter_3".to_string()))
            .await
            .unwrap();
        assert!(matches!(
            fleet.orchestrator.remove_tab(&t.id, TabRef::Index(0)).await,
            Err(OrchestratorError::LastTab)
        ));
    }

    #[tokio::test]
    async fn remove_tab_rejects_bad_references() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("otter")).await;
        fleet.orchestrator.add_tab(&t.id, None).await.unwrap();
        assert!(matches!(
            fleet.orchestrator.remove_tab(&t.id, TabRef::Index(7)).await,
            Err(OrchestratorError::InvalidTabIndex { index: 7, count: 2 })
        ));
        assert!(matches!(
            fleet
                .orchestrator
                .remove_tab(&t.id, TabRef::Session("nope".to_string()))
                .await,
            Err(OrchestratorError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn killing_a_tab_is_best_effort() {
        let fleet = TestFleet::new().await;
        let t = fleet.create("webapp", Some("otter")).await;
        fleet.orchestrator.add_tab(&t.id, None).await.unwrap();
        fleet.mux.fail_kill("otter_2");

        let report = fleet
            .orchestrator
            .remove_tab(&t.id, TabRef::Index(1))
            .await
            .unwrap();
        assert_eq!(report.failures.len(), 1);
        let after = fleet.orchestrator.resolve_thread(Some(&t.id), None).unwrap();
        assert_eq!(after.tmux_session_names, vec!["otter"]);
    }
}
