//! Sidebar sections.
//!
//! Every command works on the global list, or on one project's list when a
//! project is named. A project's own list starts as a copy of the global one
//! the first time it is edited; from then on global edits no longer reach it.

use tracing::info;

use fleetdock_protocol::SectionSummary;

use crate::config::{Section, Settings};
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::Orchestrator;

fn summaries(sections: &[Section]) -> Vec<SectionSummary> {
    sections
        .iter()
        .enumerate()
        .map(|(position, s)| SectionSummary {
            id: s.id.clone(),
            name: s.name.clone(),
            color: s.color.clone(),
            hidden: s.hidden,
            position,
        })
        .collect()
}

fn find(sections: &[Section], key: &str) -> Result<usize> {
    sections
        .iter()
        .position(|s| s.name == key || s.id == key)
        .ok_or_else(|| OrchestratorError::SectionNotFound(key.to_string()))
}

fn clean_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(OrchestratorError::InvalidName(name.to_string()));
    }
    Ok(name.to_string())
}

fn ensure_unique(sections: &[Section], name: &str, except: Option<usize>) -> Result<()> {
    let clash = sections
        .iter()
        .enumerate()
        .any(|(i, s)| Some(i) != except && s.name.eq_ignore_ascii_case(name));
    if clash {
        return Err(OrchestratorError::DuplicateName(name.to_string()));
    }
    Ok(())
}

impl Orchestrator {
    pub fn list_sections(&self, project: Option<&str>) -> Result<Vec<SectionSummary>> {
        let project = project.map(|key| self.project(key)).transpose()?;
        Ok(self.read(|s| summaries(s.settings.sections_for(project.as_ref()))))
    }

    /// Apply `edit` to a copy of the scoped list and store it on success.
    async fn edit_sections<R>(
        &self,
        project: Option<&str>,
        edit: impl FnOnce(&mut Vec<Section>) -> Result<R>,
    ) -> Result<R> {
        let project = project.map(|key| self.project(key)).transpose()?;
        let (result, threads_touched) = self.mutate(|s| {
            let mut list = s.settings.sections_for(project.as_ref()).to_vec();
            let result = edit(&mut list)?;
            match &project {
                Some(p) => {
                    if let Some(target) = s.settings.project_mut(&p.id) {
                        target.section_overrides = Some(list);
                    }
                }
                None => s.settings.sections = list,
            }
            let touched = detach_missing_sections(&s.settings, s.threads.iter_mut());
            Ok::<_, OrchestratorError>((result, touched))
        })?;
        self.persist_settings().await?;
        if threads_touched > 0 {
            self.persist().await?;
        }
        Ok(result)
    }

    pub async fn add_section(
        &self,
        project: Option<&str>,
        name: &str,
        color: Option<&str>,
    ) -> Result<SectionSummary> {
        let name = clean_name(name)?;
        let section = Section {
            id: fleetdock_protocol::new_id(),
            name: name.clone(),
            color: color.map(str::to_string),
            hidden: false,
        };
        let summary = self
            .edit_sections(project, |list| {
                ensure_unique(list, &name, None)?;
                list.push(section);
                Ok(summaries(list).pop())
            })
            .await?
            .ok_or_else(|| OrchestratorError::SectionNotFound(name.clone()))?;
        info!(
            component = "sections",
            event = "sections.added",
            section = %summary.name,
            project = ?project,
            "Section added"
        );
        Ok(summary)
    }

    /// Threads in the removed section fall back to the default section.
    pub async fn remove_section(&self, project: Option<&str>, key: &str) -> Result<()> {
        let removed = self
            .edit_sections(project, |list| {
                let index = find(list, key)?;
                Ok(list.remove(index))
            })
            .await?;
        info!(
            component = "sections",
            event = "sections.removed",
            section = %removed.name,
            project = ?project,
            "Section removed"
        );
        Ok(())
    }

    pub async fn reorder_section(&self, project: Option<&str>, key: &str, position: usize) -> Result<()> {
        self.edit_sections(project, |list| {
            let section = list.remove(find(list, key)?);
            let position = position.min(list.len());
            list.insert(position, section);
            Ok(())
        })
        .await
    }

    pub async fn rename_section(&self, project: Option<&str>, key: &str, new_name: &str) -> Result<()> {
        let new_name = clean_name(new_name)?;
        self.edit_sections(project, |list| {
            let index = find(list, key)?;
            ensure_unique(list, &new_name, Some(index))?;
            list[index].name = new_name.clone();
            Ok(())
        })
        .await
    }

    pub async fn set_section_hidden(&self, project: Option<&str>, key: &str, hidden: bool) -> Result<()> {
        self.edit_sections(project, |list| {
            let index = find(list, key)?;
            list[index].hidden = hidden;
            Ok(())
        })
        .await
    }
}

/// Clear `section_id` on threads whose section no longer exists for their
/// project. Returns how many threads changed.
fn detach_missing_sections<'a>(
    settings: &Settings,
    threads: impl Iterator<Item = &'a mut crate::thread::Thread>,
) -> usize {
    let mut touched = 0;
    for thread in threads {
        let Some(section_id) = thread.section_id.as_deref() else {
            continue;
        };
        let project = settings.projects.iter().find(|p| p.id == thread.project_id);
        if !settings
            .sections_for(project)
            .iter()
            .any(|s| s.id == section_id)
        {
            thread.section_id = None;
            touched += 1;
        }
    }
    touched
}
