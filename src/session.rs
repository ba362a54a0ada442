use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown display mode {0:?} (expected posts, likes or dashboard)")]
    UnknownMode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Posts,
    Likes,
    Dashboard,
}

impl DisplayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayMode::Posts => "posts",
            DisplayMode::Likes => "likes",
            DisplayMode::Dashboard => "dashboard",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            DisplayMode::Posts => "Posts",
            DisplayMode::Likes => "Likes",
            DisplayMode::Dashboard => "Dashboard",
        }
    }
}

impl FromStr for DisplayMode {
    type Err = SessionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "posts" => Ok(DisplayMode::Posts),
            "likes" => Ok(DisplayMode::Likes),
            "dashboard" => Ok(DisplayMode::Dashboard),
            other => Err(SessionError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug)]
pub struct ViewingSession {
    id: SessionId,
    blog: String,
    mode: DisplayMode,
    own_blog: bool,
    page_index: AtomicU64,
    closed: AtomicBool,
}

impl ViewingSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn blog(&self) -> &str {
        &self.blog
    }

    pub fn mode(&self) -> DisplayMode {
        self.mode
    }

    pub fn is_own_blog(&self) -> bool {
        self.own_blog
    }

    pub fn title(&self) -> String {
        format!("{} for {}", self.mode.display_name(), self.blog)
    }

    pub fn page_index(&self) -> u64 {
        self.page_index.load(Ordering::SeqCst)
    }

    pub(crate) fn advance(&self) -> u64 {
        self.page_index.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct Manager {
    current_blog: String,
    sessions: RwLock<HashMap<SessionId, Arc<ViewingSession>>>,
    next_id: AtomicU64,
}

impl Manager {
    pub fn new(current_blog: impl Into<String>) -> Self {
        Self {
            current_blog: current_blog.into(),
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    // Opens a session; `blog` of `None` views the signed-in user's blog.
    pub fn open(&self, mode: DisplayMode, blog: Option<&str>) -> Arc<ViewingSession> {
        let blog = blog
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.current_blog)
            .to_string();
        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let session = Arc::new(ViewingSession {
            id,
            own_blog: blog == self.current_blog,
            blog,
            mode,
            page_index: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.sessions.write().insert(id, session.clone());
        session
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<ViewingSession>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn close(&self, id: SessionId) -> Option<Arc<ViewingSession>> {
        let session = self.sessions.write().remove(&id)?;
        session.closed.store(true, Ordering::SeqCst);
        Some(session)
    }

    pub fn list(&self) -> Vec<Arc<ViewingSession>> {
        let mut sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|session| session.id);
        sessions
    }

    pub fn current_blog(&self) -> &str {
        &self.current_blog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_defaults_to_current_blog() {
        let manager = Manager::new("me");
        let session = manager.open(DisplayMode::Posts, None);
        assert_eq!(session.blog(), "me");
        assert!(session.is_own_blog());
        assert_eq!(session.title(), "Posts for me");

        let other = manager.open(DisplayMode::Likes, Some("  staff "));
        assert_eq!(other.blog(), "staff");
        assert!(!other.is_own_blog());
        assert_ne!(session.id(), other.id());
    }

    #[test]
    fn advance_counts_pages() {
        let manager = Manager::new("me");
        let session = manager.open(DisplayMode::Dashboard, None);
        assert_eq!(session.page_index(), 0);
        assert_eq!(session.advance(), 1);
        assert_eq!(session.advance(), 2);
        assert_eq!(session.page_index(), 2);
    }

    #[test]
    fn close_removes_and_marks_session() {
        let manager = Manager::new("me");
        let session = manager.open(DisplayMode::Posts, Some("staff"));
        assert!(manager.get(session.id()).is_some());
        manager.close(session.id()).unwrap();
        assert!(session.is_closed());
        assert!(manager.get(session.id()).is_none());
        assert!(manager.close(session.id()).is_none());
    }

    #[test]
    fn modes_parse_case_insensitively() {
        assert_eq!("Likes".parse::<DisplayMode>().unwrap(), DisplayMode::Likes);
        assert!("reblogs".parse::<DisplayMode>().is_err());
    }
}
