//! Client → Server requests

use serde::{Deserialize, Serialize};

/// One request read from the control socket.
///
/// `id` is an optional correlation id echoed back in the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub command: ControlCommand,
}

/// Commands understood by the control socket, tagged by `command`.
///
/// Commands that target a thread accept either `threadId` or `threadName`;
/// section commands operate globally unless `project` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "command",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ControlCommand {
    Ping,

    // Threads
    CreateThread {
        project: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    ListProjects,
    ListThreads {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        #[serde(default)]
        include_archived: bool,
    },
    SendPrompt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_name: Option<String>,
        prompt: String,
    },
    ArchiveThread {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
    },
    DeleteThread {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
    },
    RenameThread {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
        description: String,
    },
    RenameThreadExact {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
        new_name: String,
    },
    CurrentThread {
        session_name: String,
    },
    ThreadInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
    },
    ThreadDiff {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
    },
    PinThread {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
    },
    UnpinThread {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
    },
    MoveThread {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        section_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
    },
    RecoverThread {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
    },

    // Tabs
    ListTabs {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
    },
    CreateTab {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_type: Option<String>,
    },
    CloseTab {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab_index: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_name: Option<String>,
    },
    FocusTab {
        session_name: String,
    },
    PinTab {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
        session_name: String,
    },
    UnpinTab {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
        session_name: String,
    },
    /// Set a tab's display label; an absent or empty `newName` clears it.
    RenameTab {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
        session_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_name: Option<String>,
    },

    // Sections
    ListSections {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
    },
    AddSection {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        section_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        section_color: Option<String>,
    },
    RemoveSection {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        section_name: String,
    },
    ReorderSection {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        section_name: String,
        position: usize,
    },
    RenameSection {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        section_name: String,
        new_name: String,
    },
    HideSection {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        section_name: String,
    },
    ShowSection {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        section_name: String,
    },

    // Maintenance
    RestartMux,
}

impl ControlCommand {
    /// Wire name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Ping => "ping",
            ControlCommand::CreateThread { .. } => "create-thread",
            ControlCommand::ListProjects => "list-projects",
            ControlCommand::ListThreads { .. } => "list-threads",
            ControlCommand::SendPrompt { .. } => "send-prompt",
            ControlCommand::ArchiveThread { .. } => "archive-thread",
            ControlCommand::DeleteThread { .. } => "delete-thread",
            ControlCommand::RenameThread { .. } => "rename-thread",
            ControlCommand::RenameThreadExact { .. } => "rename-thread-exact",
            ControlCommand::CurrentThread { .. } => "current-thread",
            ControlCommand::ThreadInfo { .. } => "thread-info",
            ControlCommand::ThreadDiff { .. } => "thread-diff",
            ControlCommand::PinThread { .. } => "pin-thread",
            ControlCommand::UnpinThread { .. } => "unpin-thread",
            ControlCommand::MoveThread { .. } => "move-thread",
            ControlCommand::RecoverThread { .. } => "recover-thread",
            ControlCommand::ListTabs { .. } => "list-tabs",
            ControlCommand::CreateTab { .. } => "create-tab",
            ControlCommand::CloseTab { .. } => "close-tab",
            ControlCommand::FocusTab { .. } => "focus-tab",
            ControlCommand::PinTab { .. } => "pin-tab",
            ControlCommand::UnpinTab { .. } => "unpin-tab",
            ControlCommand::RenameTab { .. } => "rename-tab",
            ControlCommand::ListSections { .. } => "list-sections",
            ControlCommand::AddSection { .. } => "add-section",
            ControlCommand::RemoveSection { .. } => "remove-section",
            ControlCommand::ReorderSection { .. } => "reorder-section",
            ControlCommand::RenameSection { .. } => "rename-section",
            ControlCommand::HideSection { .. } => "hide-section",
            ControlCommand::ShowSection { .. } => "show-section",
            ControlCommand::RestartMux => "restart-mux",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ControlCommand, ControlRequest};

    #[test]
    fn deserializes_create_thread_with_camel_case_fields() {
        let json = r#"{
          "command":"create-thread",
          "id":"req-1",
          "project":"webapp",
          "agentType":"claude",
          "prompt":"Fix the login redirect"
        }"#;

        let parsed: ControlRequest = serde_json::from_str(json).expect("parse create-thread");
        assert_eq!(parsed.id.as_deref(), Some("req-1"));
        match parsed.command {
            ControlCommand::CreateThread {
                project,
                agent_type,
                thread_name,
                prompt,
            } => {
                assert_eq!(project, "webapp");
                assert_eq!(agent_type.as_deref(), Some("claude"));
                assert!(thread_name.is_none());
                assert_eq!(prompt.as_deref(), Some("Fix the login redirect"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn deserializes_close_tab_by_index() {
        let json = r#"{"command":"close-tab","threadName":"brave-otter","tabIndex":1}"#;
        let parsed: ControlRequest = serde_json::from_str(json).expect("parse close-tab");
        assert!(parsed.id.is_none());
        match parsed.command {
            ControlCommand::CloseTab {
                thread_id,
                thread_name,
                tab_index,
                session_name,
            } => {
                assert!(thread_id.is_none());
                assert_eq!(thread_name.as_deref(), Some("brave-otter"));
                assert_eq!(tab_index, Some(1));
                assert!(session_name.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn deserializes_unit_commands() {
        let parsed: ControlRequest =
            serde_json::from_str(r#"{"command":"list-projects"}"#).expect("parse list-projects");
        assert!(matches!(parsed.command, ControlCommand::ListProjects));
        assert_eq!(parsed.command.name(), "list-projects");
    }

    #[test]
    fn rename_tab_without_name_clears_label() {
        let parsed: ControlRequest = serde_json::from_str(
            r#"{"command":"rename-tab","threadId":"t1","sessionName":"otter_2"}"#,
        )
        .expect("parse rename-tab");
        assert_eq!(parsed.command.name(), "rename-tab");
        match parsed.command {
            ControlCommand::RenameTab {
                thread_id,
                session_name,
                new_name,
                ..
            } => {
                assert_eq!(thread_id.as_deref(), Some("t1"));
                assert_eq!(session_name, "otter_2");
                assert!(new_name.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_command() {
        let result = serde_json::from_str::<ControlRequest>(r#"{"command":"format-disk"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn section_commands_default_to_global_scope() {
        let parsed: ControlRequest = serde_json::from_str(
            r##"{"command":"add-section","sectionName":"Review","sectionColor":"#ff0000"}"##,
        )
        .expect("parse add-section");
        match parsed.command {
            ControlCommand::AddSection {
                project,
                section_name,
                section_color,
            } => {
                assert!(project.is_none());
                assert_eq!(section_name, "Review");
                assert_eq!(section_color.as_deref(), Some("#ff0000"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
