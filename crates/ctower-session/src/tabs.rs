//! Tab and project-group bookkeeping.

use std::collections::HashMap;

use ctower_db::SessionRecord;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{CommandKind, Pane, PersistKey, ProjectId, ProjectTerminals, Tab, TabId};

/// All project groups in creation order, plus each project's working directory.
#[derive(Debug, Default)]
pub struct TabStore {
    groups: Vec<ProjectTerminals>,
    paths: HashMap<ProjectId, String>,
}

impl TabStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a project's working directory. Returns `false` if it was already set to it.
    pub fn register_project(&mut self, project_id: &str, working_directory: &str) -> bool {
        if self.paths.get(project_id).map(String::as_str) == Some(working_directory) {
            return false;
        }
        self.paths
            .insert(project_id.to_string(), working_directory.to_string());
        true
    }

    pub fn project_path(&self, project_id: &str) -> Option<&str> {
        self.paths.get(project_id).map(String::as_str)
    }

    pub fn groups(&self) -> &[ProjectTerminals] {
        &self.groups
    }

    pub fn group(&self, project_id: &str) -> Option<&ProjectTerminals> {
        self.groups.iter().find(|g| g.project_id == project_id)
    }

    fn group_mut(&mut self, project_id: &str) -> Option<&mut ProjectTerminals> {
        self.groups.iter_mut().find(|g| g.project_id == project_id)
    }

    fn group_or_insert(&mut self, project_id: &str) -> &mut ProjectTerminals {
        let index = match self.groups.iter().position(|g| g.project_id == project_id) {
            Some(index) => index,
            None => {
                self.groups.push(ProjectTerminals::new(project_id));
                self.groups.len() - 1
            }
        };
        &mut self.groups[index]
    }

    pub fn has_terminals(&self, project_id: &str) -> bool {
        self.group(project_id).is_some_and(|g| !g.tabs.is_empty())
    }

    pub fn tab(&self, project_id: &str, tab_id: &str) -> Option<&Tab> {
        self.group(project_id).and_then(|g| g.tab(tab_id))
    }

    pub fn tab_mut(&mut self, project_id: &str, tab_id: &str) -> Option<&mut Tab> {
        self.group_mut(project_id)
            .and_then(|g| g.tabs.iter_mut().find(|t| t.id == tab_id))
    }

    fn require_tab_mut(&mut self, project_id: &str, tab_id: &str) -> Result<&mut Tab, EngineError> {
        self.tab_mut(project_id, tab_id)
            .ok_or_else(|| EngineError::TabNotFound(PersistKey::main(project_id, tab_id).to_string()))
    }

    /// Every tab of every project.
    pub fn tabs(&self) -> impl Iterator<Item = &Tab> {
        self.groups.iter().flat_map(|g| g.tabs.iter())
    }

    /// Create a tab with a fresh id and make it active.
    pub fn add_tab(&mut self, project_id: &str, kind: CommandKind) -> Tab {
        let tab = Tab::new(
            Uuid::new_v4().to_string(),
            project_id,
            kind.default_label(),
            kind,
        );
        self.push_tab(tab.clone(), true);
        tab
    }

    /// Append an existing tab, optionally making it active.
    pub fn push_tab(&mut self, tab: Tab, activate: bool) {
        let group = self.group_or_insert(&tab.project_id);
        if activate || group.active_tab_id.is_none() {
            group.active_tab_id = Some(tab.id.clone());
        }
        group.tabs.push(tab);
    }

    /// Remove a tab. Closing the active tab activates the last remaining one;
    /// closing the last tab removes the group.
    pub fn close_tab(&mut self, project_id: &str, tab_id: &str) -> Option<Tab> {
        let index = self.groups.iter().position(|g| g.project_id == project_id)?;
        let group = &mut self.groups[index];
        let position = group.tabs.iter().position(|t| t.id == tab_id)?;
        let removed = group.tabs.remove(position);

        if group.tabs.is_empty() {
            self.groups.remove(index);
        } else if group.active_tab_id.as_deref() == Some(tab_id) {
            group.active_tab_id = group.tabs.last().map(|t| t.id.clone());
        }
        Some(removed)
    }

    pub fn set_active(&mut self, project_id: &str, tab_id: &str) -> Result<(), EngineError> {
        let group = self
            .group_mut(project_id)
            .filter(|g| g.tab(tab_id).is_some())
            .ok_or_else(|| EngineError::TabNotFound(PersistKey::main(project_id, tab_id).to_string()))?;
        group.active_tab_id = Some(tab_id.to_string());
        Ok(())
    }

    pub fn rename(&mut self, project_id: &str, tab_id: &str, label: &str) -> Result<(), EngineError> {
        self.require_tab_mut(project_id, tab_id)?.label = label.to_string();
        Ok(())
    }

    /// Flip the split flag, resetting split pane state. Returns the new flag.
    pub fn toggle_split(&mut self, project_id: &str, tab_id: &str) -> Result<bool, EngineError> {
        let tab = self.require_tab_mut(project_id, tab_id)?;
        tab.split = !tab.split;
        tab.split_session_id = None;
        tab.split_exited = false;
        tab.split_exit_code = None;
        Ok(tab.split)
    }

    pub fn set_exited(&mut self, key: &PersistKey, exit_code: Option<i32>) -> bool {
        match self.tab_mut(&key.project_id, &key.tab_id) {
            Some(tab) => {
                tab.set_exit(key.pane, true, exit_code);
                true
            }
            None => false,
        }
    }

    pub fn set_ready(&mut self, key: &PersistKey) -> bool {
        match self.tab_mut(&key.project_id, &key.tab_id) {
            Some(tab) => {
                tab.set_exit(key.pane, false, None);
                true
            }
            None => false,
        }
    }

    /// Snapshot for the registry: live tabs of projects with a known working
    /// directory, numbered in one global sort order.
    pub fn records(&self) -> Vec<SessionRecord> {
        let mut records = Vec::new();
        for group in &self.groups {
            let Some(working_directory) = self.paths.get(&group.project_id) else {
                continue;
            };
            for tab in group.tabs.iter().filter(|t| !t.is_exited) {
                records.push(SessionRecord {
                    project_id: group.project_id.clone(),
                    tab_name: tab.label.clone(),
                    tab_type: tab.kind.as_str().to_string(),
                    working_directory: working_directory.clone(),
                    sort_order: records.len() as i64,
                    durable_session: tab.durable_name.clone(),
                });
            }
        }
        records
    }

    /// Seed tabs from saved records. Projects that already have tabs are left
    /// alone. Returns the ids of the created tabs.
    pub fn seed_from_records(&mut self, records: &[SessionRecord]) -> Vec<TabId> {
        let mut order: Vec<&str> = Vec::new();
        let mut by_project: HashMap<&str, Vec<&SessionRecord>> = HashMap::new();
        for record in records {
            let entry = by_project.entry(record.project_id.as_str()).or_default();
            if entry.is_empty() {
                order.push(record.project_id.as_str());
            }
            entry.push(record);
        }

        let mut created = Vec::new();
        for project_id in order {
            if self.has_terminals(project_id) {
                log::debug!("project {project_id} already has tabs, skipping restore");
                continue;
            }
            let project_records = &by_project[project_id];
            if let Some(first) = project_records.first() {
                if !self.paths.contains_key(project_id) {
                    self.paths
                        .insert(project_id.to_string(), first.working_directory.clone());
                }
            }
            for record in project_records {
                let kind = CommandKind::parse(&record.tab_type).unwrap_or_else(|| {
                    log::warn!("unknown tab type {:?}, restoring as shell", record.tab_type);
                    CommandKind::Shell
                });
                let mut tab = Tab::new(Uuid::new_v4().to_string(), project_id, &record.tab_name, kind);
                tab.durable_name = record.durable_session.clone();
                created.push(tab.id.clone());
                self.push_tab(tab, false);
            }
        }
        created
    }

    /// Durable names referenced by any tab.
    pub fn durable_names(&self) -> Vec<String> {
        self.tabs().filter_map(|t| t.durable_name.clone()).collect()
    }

    /// Whether a key names an existing pane.
    pub fn has_pane(&self, key: &PersistKey) -> bool {
        self.tab(&key.project_id, &key.tab_id)
            .is_some_and(|t| key.pane == Pane::Main || t.split)
    }
}
