//! Tabs, project groups and the keys that address them.

use std::fmt;

use ctower_pty::SessionId;

pub type ProjectId = String;
pub type TabId = String;

/// Which pane of a tab a key refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pane {
    Main,
    Split,
}

/// Composite key of a cached terminal instance: `projectId:tabId[:split]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PersistKey {
    pub project_id: ProjectId,
    pub tab_id: TabId,
    pub pane: Pane,
}

impl PersistKey {
    pub fn main(project_id: &str, tab_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            tab_id: tab_id.to_string(),
            pane: Pane::Main,
        }
    }

    pub fn split(project_id: &str, tab_id: &str) -> Self {
        Self {
            pane: Pane::Split,
            ..Self::main(project_id, tab_id)
        }
    }

    /// Parse the `projectId:tabId[:split]` form.
    pub fn parse(s: &str) -> Option<Self> {
        let (rest, pane) = match s.strip_suffix(":split") {
            Some(rest) => (rest, Pane::Split),
            None => (s, Pane::Main),
        };
        let (project_id, tab_id) = rest.rsplit_once(':')?;
        if project_id.is_empty() || tab_id.is_empty() {
            return None;
        }
        Some(Self {
            project_id: project_id.to_string(),
            tab_id: tab_id.to_string(),
            pane,
        })
    }

    /// Both keys of a tab.
    pub fn panes(project_id: &str, tab_id: &str) -> [Self; 2] {
        [Self::main(project_id, tab_id), Self::split(project_id, tab_id)]
    }
}

impl fmt::Display for PersistKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pane {
            Pane::Main => write!(f, "{}:{}", self.project_id, self.tab_id),
            Pane::Split => write!(f, "{}:{}:split", self.project_id, self.tab_id),
        }
    }
}

/// What a tab runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Shell,
    Claude,
    Yolo,
}

impl CommandKind {
    /// Stored `tab_type` value.
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Shell => "shell",
            CommandKind::Claude => "claude",
            CommandKind::Yolo => "yolo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shell" => Some(CommandKind::Shell),
            "claude" => Some(CommandKind::Claude),
            "yolo" => Some(CommandKind::Yolo),
            _ => None,
        }
    }

    /// Command line to run, or `None` for an interactive shell.
    pub fn command(self) -> Option<&'static str> {
        match self {
            CommandKind::Shell => None,
            CommandKind::Claude => Some("claude"),
            CommandKind::Yolo => Some("claude --dangerously-skip-permissions"),
        }
    }

    pub fn default_label(self) -> &'static str {
        match self {
            CommandKind::Shell => "Shell",
            CommandKind::Claude => "Claude",
            CommandKind::Yolo => "Claude YOLO",
        }
    }

    /// Inverse of [`CommandKind::command`]. Unknown commands count as shells.
    pub fn from_command(command: Option<&str>) -> Self {
        match command {
            Some("claude") => CommandKind::Claude,
            Some("claude --dangerously-skip-permissions") => CommandKind::Yolo,
            _ => CommandKind::Shell,
        }
    }
}

/// One terminal tab. Session fields are written only by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tab {
    pub id: TabId,
    pub project_id: ProjectId,
    pub label: String,
    pub kind: CommandKind,
    pub session_id: Option<SessionId>,
    pub durable_name: Option<String>,
    pub is_exited: bool,
    pub exit_code: Option<i32>,
    pub split: bool,
    pub split_session_id: Option<SessionId>,
    pub split_exited: bool,
    pub split_exit_code: Option<i32>,
}

impl Tab {
    pub fn new(id: TabId, project_id: &str, label: &str, kind: CommandKind) -> Self {
        Self {
            id,
            project_id: project_id.to_string(),
            label: label.to_string(),
            kind,
            session_id: None,
            durable_name: None,
            is_exited: false,
            exit_code: None,
            split: false,
            split_session_id: None,
            split_exited: false,
            split_exit_code: None,
        }
    }

    pub fn key(&self, pane: Pane) -> PersistKey {
        match pane {
            Pane::Main => PersistKey::main(&self.project_id, &self.id),
            Pane::Split => PersistKey::split(&self.project_id, &self.id),
        }
    }

    pub fn session_of(&self, pane: Pane) -> Option<&SessionId> {
        match pane {
            Pane::Main => self.session_id.as_ref(),
            Pane::Split => self.split_session_id.as_ref(),
        }
    }

    pub fn exited(&self, pane: Pane) -> bool {
        match pane {
            Pane::Main => self.is_exited,
            Pane::Split => self.split_exited,
        }
    }

    pub(crate) fn set_exit(&mut self, pane: Pane, exited: bool, exit_code: Option<i32>) {
        match pane {
            Pane::Main => {
                self.is_exited = exited;
                self.exit_code = exit_code;
            }
            Pane::Split => {
                self.split_exited = exited;
                self.split_exit_code = exit_code;
            }
        }
    }

    pub(crate) fn set_session(&mut self, pane: Pane, session_id: Option<SessionId>) {
        match pane {
            Pane::Main => self.session_id = session_id,
            Pane::Split => self.split_session_id = session_id,
        }
    }
}

/// Ordered tabs of one project.
///
/// `active_tab_id`, when set, always names a tab in `tabs`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectTerminals {
    pub project_id: ProjectId,
    pub tabs: Vec<Tab>,
    pub active_tab_id: Option<TabId>,
}

impl ProjectTerminals {
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            tabs: Vec::new(),
            active_tab_id: None,
        }
    }

    pub fn tab(&self, tab_id: &str) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.id == tab_id)
    }

    pub fn active_tab(&self) -> Option<&Tab> {
        self.active_tab_id.as_deref().and_then(|id| self.tab(id))
    }
}

/// Connection status of one pane, for the UI.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Exited(Option<i32>),
    /// Retryable failure with its message.
    Error(String),
}

/// Which tier produced a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectTier {
    /// Tracked session still alive; listeners re-registered.
    Reused,
    /// New session attached to an existing durable session.
    Reattached,
    /// Native session re-established by id.
    Reconnected,
    /// Brand-new session.
    Fresh,
}

/// Result of a connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRef {
    pub session_id: SessionId,
    pub durable_name: Option<String>,
    pub tier: ConnectTier,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_key_display_and_parse() {
        let main = PersistKey::main("p1", "t1");
        let split = PersistKey::split("p1", "t1");
        assert_eq!(main.to_string(), "p1:t1");
        assert_eq!(split.to_string(), "p1:t1:split");
        assert_eq!(PersistKey::parse("p1:t1"), Some(main));
        assert_eq!(PersistKey::parse("p1:t1:split"), Some(split));
        assert_eq!(PersistKey::parse("nocolon"), None);
        assert_eq!(PersistKey::parse(":t1"), None);
    }

    #[test]
    fn test_command_kind_mapping() {
        for kind in [CommandKind::Shell, CommandKind::Claude, CommandKind::Yolo] {
            assert_eq!(CommandKind::parse(kind.as_str()), Some(kind));
            assert_eq!(CommandKind::from_command(kind.command()), kind);
        }
        assert_eq!(CommandKind::Yolo.default_label(), "Claude YOLO");
        assert_eq!(CommandKind::parse("python"), None);
        assert_eq!(CommandKind::from_command(Some("vim")), CommandKind::Shell);
    }

    #[test]
    fn test_tab_pane_fields() {
        let mut tab = Tab::new("t1".into(), "p1", "Shell", CommandKind::Shell);
        tab.set_session(Pane::Split, Some("s9".into()));
        tab.set_exit(Pane::Split, true, Some(1));
        assert_eq!(tab.session_of(Pane::Split).map(String::as_str), Some("s9"));
        assert!(tab.exited(Pane::Split));
        assert!(!tab.exited(Pane::Main));
        assert_eq!(tab.split_exit_code, Some(1));
        assert_eq!(tab.key(Pane::Split), PersistKey::split("p1", "t1"));
    }

    #[test]
    fn test_active_tab_lookup() {
        let mut group = ProjectTerminals::new("p1");
        group.tabs.push(Tab::new("t1".into(), "p1", "Shell", CommandKind::Shell));
        assert!(group.active_tab().is_none());
        group.active_tab_id = Some("t1".into());
        assert_eq!(group.active_tab().map(|t| t.id.as_str()), Some("t1"));
    }
}
