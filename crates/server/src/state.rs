//! In-memory fleet state
//!
//! Held behind the orchestrator's mutex; every method here is synchronous
//! and cheap so the lock is never held across IO.

use std::collections::HashSet;

use crate::config::Settings;
use crate::thread::Thread;

pub struct FleetState {
    /// Active threads and archived records.
    pub threads: Vec<Thread>,
    pub settings: Settings,
    /// Names claimed by an in-progress create or rename.
    reserved_names: HashSet<String>,
    /// Tab the user is looking at; completions there are not marked unread.
    pub focused_session: Option<String>,
}

impl FleetState {
    pub fn new(settings: Settings, threads: Vec<Thread>) -> Self {
        Self {
            threads,
            settings,
            reserved_names: HashSet::new(),
            focused_session: None,
        }
    }

    pub fn active(&self) -> impl Iterator<Item = &Thread> {
        self.threads.iter().filter(|t| !t.is_archived)
    }

    pub fn thread(&self, id: &str) -> Option<&Thread> {
        self.threads.iter().find(|t| t.id == id)
    }

    pub fn thread_mut(&mut self, id: &str) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| t.id == id)
    }

    pub fn thread_for_session(&self, session: &str) -> Option<&Thread> {
        self.active().find(|t| t.has_session(session))
    }

    pub fn main_thread(&self, project_id: &str) -> Option<&Thread> {
        self.active()
            .find(|t| t.is_main && t.project_id == project_id)
    }

    /// Name used by an active thread (other than `except`) or reserved.
    pub fn name_taken(&self, name: &str, except: Option<&str>) -> bool {
        self.reserved_names.contains(name)
            || self
                .active()
                .any(|t| t.name == name && Some(t.id.as_str()) != except)
    }

    /// Session names recorded on active threads.
    pub fn recorded_sessions(&self) -> HashSet<String> {
        self.active()
            .flat_map(|t| t.tmux_session_names.iter().cloned())
            .collect()
    }

    /// Claim a name. Fails when it is already reserved or in use.
    pub fn reserve(&mut self, name: &str) -> bool {
        if self.name_taken(name, None) {
            return false;
        }
        self.reserved_names.insert(name.to_string())
    }

    pub fn release(&mut self, name: &str) {
        self.reserved_names.remove(name);
    }

    fn group(&self, project_id: &str, section_id: Option<&str>) -> impl Iterator<Item = &Thread> {
        let section_id = section_id.map(str::to_string);
        let project_id = project_id.to_string();
        self.active()
            .filter(move |t| t.project_id == project_id && t.section_id == section_id)
    }

    /// Append at the bottom of the thread's section.
    pub fn push_bottom(&mut self, mut thread: Thread) {
        thread.display_order = self
            .group(&thread.project_id, thread.section_id.as_deref())
            .map(|t| t.display_order)
            .max()
            .map_or(0, |max| max + 1);
        self.threads.push(thread);
    }

    /// Insert at the top of the thread's section.
    pub fn push_front(&mut self, mut thread: Thread) {
        thread.display_order = self
            .group(&thread.project_id, thread.section_id.as_deref())
            .map(|t| t.display_order)
            .min()
            .map_or(0, |min| min - 1);
        self.threads.insert(0, thread);
    }

    /// Move `id` into `section_id` at `position` (end when `None`) and
    /// renumber that section densely.
    pub fn place(&mut self, id: &str, section_id: Option<String>, position: Option<usize>) -> bool {
        let Some(project_id) = self.thread(id).map(|t| t.project_id.clone()) else {
            return false;
        };
        let mut order: Vec<(i64, String)> = self
            .group(&project_id, section_id.as_deref())
            .filter(|t| t.id != id)
            .map(|t| (t.display_order, t.id.clone()))
            .collect();
        order.sort();
        let mut ids: Vec<String> = order.into_iter().map(|(_, id)| id).collect();
        let at = position.unwrap_or(ids.len()).min(ids.len());
        ids.insert(at, id.to_string());

        for (index, member) in ids.iter().enumerate() {
            if let Some(t) = self.thread_mut(member) {
                t.display_order = index as i64;
                t.section_id = section_id.clone();
            }
        }
        true
    }

    /// Active threads in display order: project, main thread, pinned, then
    /// order.
    pub fn ordered(&self, include_archived: bool) -> Vec<&Thread> {
        let mut list: Vec<&Thread> = self
            .threads
            .iter()
            .filter(|t| include_archived || !t.is_archived)
            .collect();
        let project_rank = |project_id: &str| {
            self.settings
                .projects
                .iter()
                .position(|p| p.id == project_id)
                .unwrap_or(usize::MAX)
        };
        list.sort_by(|a, b| {
            let key = |t: &Thread| {
                (
                    project_rank(&t.project_id),
                    t.is_archived,
                    !t.is_main,
                    !t.is_pinned,
                    t.display_order,
                )
            };
            key(a).cmp(&key(b))
        });
        list
    }
}
