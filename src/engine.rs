use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::data::{RemoteFeed, UserInfo};
use crate::follow_graph::{self, FollowGraph};
use crate::item::ContentItem;
use crate::pagination::{PaginationOptions, Paginator};
use crate::refresh::{RefreshContext, RefreshCoordinator, RefreshSubject};
use crate::resolve::{self, LinkMenu, DEFAULT_MAX_LINKS, LARGE_AVATAR, SMALL_AVATAR};
use crate::session::{DisplayMode, Manager, SessionId, ViewingSession};
use crate::singleflight::{FlightKey, Policy, SingleFlight, Submission};
use crate::sink::{PageSummary, Preview, ViewSink};
use crate::task::{AsyncResult, TaskKind, TaskPool};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("engine: could not sign in to the remote service")]
    Connect,
    #[error("engine: could not start background workers")]
    Workers,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub pagination: PaginationOptions,
    pub workers: usize,
    pub max_links_per_menu: usize,
    pub load_avatar_menu_icons: bool,
    pub relationship_page_size: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            pagination: PaginationOptions::default(),
            workers: crate::task::DEFAULT_WORKERS,
            max_links_per_menu: DEFAULT_MAX_LINKS,
            load_avatar_menu_icons: true,
            relationship_page_size: follow_graph::DEFAULT_PAGE_SIZE,
        }
    }
}

pub struct Engine {
    remote: Arc<dyn RemoteFeed>,
    sink: Arc<dyn ViewSink>,
    user: UserInfo,
    options: EngineOptions,
    sessions: Manager,
    graph: Arc<FollowGraph>,
    paginator: Arc<Paginator>,
    refresher: RefreshCoordinator,
    // load-more and toggle actions
    actions: SingleFlight,
    // hover previews and menu icons, keyed by element
    previews: SingleFlight,
    previewed: Mutex<HashMap<String, String>>,
    pool: TaskPool,
}

impl Engine {
    // Signs in as the current user and starts the workers. Failing here is
    // the one unrecoverable error: there is nothing to show without a user.
    pub fn connect(
        remote: Arc<dyn RemoteFeed>,
        sink: Arc<dyn ViewSink>,
        options: EngineOptions,
    ) -> Result<Self> {
        let user = remote.current_user().context(StartupError::Connect)?;
        let pool = TaskPool::new(options.workers).context(StartupError::Workers)?;
        let blog = user.primary_blog().to_string();
        info!("engine: signed in as {} ({blog})", user.name);

        let graph = Arc::new(FollowGraph::new(
            remote.clone(),
            blog.clone(),
            options.relationship_page_size,
        ));
        let refresher = RefreshCoordinator::new(
            pool.spawner(),
            RefreshContext {
                remote: remote.clone(),
                graph: graph.clone(),
                user: blog.clone(),
                max_links: options.max_links_per_menu,
            },
            sink.clone(),
        );

        Ok(Self {
            paginator: Arc::new(Paginator::new(remote.clone(), options.pagination)),
            sessions: Manager::new(blog),
            remote,
            sink,
            user,
            options,
            graph,
            refresher,
            actions: SingleFlight::new(Policy::Suppress),
            previews: SingleFlight::new(Policy::Supersede),
            previewed: Mutex::new(HashMap::new()),
            pool,
        })
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    pub fn current_blog(&self) -> &str {
        self.sessions.current_blog()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn follow_graph(&self) -> &Arc<FollowGraph> {
        &self.graph
    }

    pub fn open_session(&self, mode: DisplayMode, blog: Option<&str>) -> Arc<ViewingSession> {
        let session = self.sessions.open(mode, blog);
        info!("engine: opened {} ({})", session.id(), session.title());
        session
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<ViewingSession>> {
        self.sessions.get(id)
    }

    pub fn sessions(&self) -> Vec<Arc<ViewingSession>> {
        self.sessions.list()
    }

    pub fn close_session(&self, id: SessionId) -> bool {
        if self.sessions.close(id).is_none() {
            return false;
        }
        let scope = id.to_string();
        let actions = self.actions.cancel_scope(&scope);
        let cycles = self.refresher.forget(id);
        debug!("engine: closed {id}, cancelled {actions} actions and {cycles} refresh cycles");
        true
    }

    // Fetches the next page for `session`. While one is outstanding further
    // calls are suppressed and leave the cursor alone.
    pub fn load_more(&self, session: &Arc<ViewingSession>) -> Submission {
        let paginator = self.paginator.clone();
        let sink = self.sink.clone();
        let session = session.clone();
        let key = FlightKey::load_more(session.id());
        self.actions.submit(
            &self.pool.spawner(),
            key,
            TaskKind::LoadMore,
            move |cancel| {
                if session.is_closed() {
                    return AsyncResult::Cancelled;
                }
                let mut page = paginator.fetch_page(&session);
                let mut delivered = 0;
                for item in page.by_ref() {
                    if cancel.is_cancelled() {
                        return AsyncResult::Cancelled;
                    }
                    sink.on_item_loaded(session.id(), item);
                    delivered += 1;
                }
                let failure = page.failure().map(str::to_string);
                sink.on_page_loaded(
                    session.id(),
                    PageSummary {
                        page_index: page.page_index(),
                        fetched: page.fetched(),
                        delivered,
                        failure: failure.clone(),
                    },
                );
                match failure {
                    Some(reason) => AsyncResult::Failed(reason),
                    None => AsyncResult::Success(delivered),
                }
            },
            |_| {},
        )
    }

    pub fn refresh_session(&self, session: &Arc<ViewingSession>) -> u64 {
        self.refresher.refresh(RefreshSubject::Session(session.clone()))
    }

    pub fn refresh_item(&self, session: &Arc<ViewingSession>, item: &ContentItem) -> u64 {
        self.refresher.refresh(RefreshSubject::Item {
            session: session.clone(),
            item: item.clone(),
        })
    }

    // Follows or unfollows the session's blog. Viewing your own blog there
    // is nothing to toggle and the request is rejected.
    pub fn toggle_follow(&self, session: &Arc<ViewingSession>, follow: bool) -> Submission {
        if session.is_own_blog() {
            warn!("engine: {} views the signed-in blog, not following it", session.id());
            return Submission::Rejected;
        }
        let kind = if follow {
            TaskKind::Follow
        } else {
            TaskKind::Unfollow
        };
        let graph = self.graph.clone();
        let blog = session.blog().to_string();
        let subject = RefreshSubject::Session(session.clone());
        self.run_action(session, FlightKey::new(session.id(), "follow"), kind, subject, move || {
            if follow {
                graph.follow(&blog)
            } else {
                graph.unfollow(&blog)
            }
        })
    }

    pub fn toggle_like(
        &self,
        session: &Arc<ViewingSession>,
        item: &ContentItem,
        like: bool,
    ) -> Submission {
        let kind = if like { TaskKind::Like } else { TaskKind::Unlike };
        let remote = self.remote.clone();
        let post = item.post().clone();
        let key = FlightKey::new(session.id(), format!("like:{}", item.key()));
        let subject = RefreshSubject::Item {
            session: session.clone(),
            item: item.clone(),
        };
        self.run_action(session, key, kind, subject, move || {
            let result = if like {
                remote.like(post.id, &post.reblog_key)
            } else {
                remote.unlike(post.id, &post.reblog_key)
            };
            result.with_context(|| format!("engine: {kind} {}/{}", post.blog_name, post.id))
        })
    }

    pub fn reblog(&self, session: &Arc<ViewingSession>, item: &ContentItem) -> Submission {
        let remote = self.remote.clone();
        let post = item.post().clone();
        let onto = self.current_blog().to_string();
        let key = FlightKey::new(session.id(), format!("reblog:{}", item.key()));
        let subject = RefreshSubject::Item {
            session: session.clone(),
            item: item.clone(),
        };
        self.run_action(session, key, TaskKind::Reblog, subject, move || {
            remote
                .reblog(&onto, post.id, &post.reblog_key)
                .with_context(|| {
                    format!("engine: reblog {}/{} onto {onto}", post.blog_name, post.id)
                })
        })
    }

    fn run_action<F>(
        &self,
        session: &Arc<ViewingSession>,
        key: FlightKey,
        kind: TaskKind,
        subject: RefreshSubject,
        action: F,
    ) -> Submission
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let sink = self.sink.clone();
        let refresher = self.refresher.clone();
        let id = session.id();
        self.actions.submit(
            &self.pool.spawner(),
            key,
            kind,
            move |_| AsyncResult::from_result(action()),
            move |result| {
                if let AsyncResult::Failed(reason) = &result {
                    warn!("engine: {kind} failed for {id}: {reason}");
                }
                sink.on_action_finished(id, kind, result);
                refresher.refresh(subject);
            },
        )
    }

    // Shows `blog`'s large avatar and title on the hover preview `element`.
    // Returns false when that blog is already the one being previewed.
    pub fn preview(&self, element: &str, blog: &str) -> bool {
        {
            let mut previewed = self.previewed.lock();
            if previewed.get(element).map(String::as_str) == Some(blog) {
                debug!("engine: {element} already previews {blog}");
                return false;
            }
            previewed.insert(element.to_string(), blog.to_string());
        }
        self.preview_avatar(element, blog);
        self.preview_title(element, blog);
        true
    }

    pub fn preview_avatar(&self, element: &str, blog: &str) -> Submission {
        let remote = self.remote.clone();
        let sink = self.sink.clone();
        let owner = element.to_string();
        let name = blog.to_string();
        self.previews.submit(
            &self.pool.spawner(),
            FlightKey::new(element, "preview-avatar"),
            TaskKind::Avatar,
            move |cancel| {
                resolve::avatar(remote.as_ref(), &name, LARGE_AVATAR, cancel)
                    .map(|avatar| (name, avatar))
            },
            move |result| {
                if let AsyncResult::Success((blog, avatar)) = result {
                    sink.on_preview(&owner, Preview::Avatar { blog, avatar });
                }
            },
        )
    }

    pub fn preview_title(&self, element: &str, blog: &str) -> Submission {
        let remote = self.remote.clone();
        let sink = self.sink.clone();
        let owner = element.to_string();
        let name = blog.to_string();
        self.previews.submit(
            &self.pool.spawner(),
            FlightKey::new(element, "preview-title"),
            TaskKind::BlogTitle,
            move |cancel| match resolve::blog_title(remote.as_ref(), &name, cancel) {
                AsyncResult::Cancelled => AsyncResult::Cancelled,
                title => AsyncResult::Success((name, title)),
            },
            move |result| {
                if let AsyncResult::Success((blog, title)) = result {
                    sink.on_preview(&owner, Preview::Title { blog, title });
                }
            },
        )
    }

    pub fn menu_icons(&self, element: &str, menu: &LinkMenu) -> usize {
        if !self.options.load_avatar_menu_icons {
            return 0;
        }
        let mut started = 0;
        for link in &menu.links {
            let remote = self.remote.clone();
            let sink = self.sink.clone();
            let owner = element.to_string();
            let name = link.blog.clone();
            let submission = self.previews.submit(
                &self.pool.spawner(),
                FlightKey::avatar(element, &link.blog, SMALL_AVATAR),
                TaskKind::Avatar,
                move |cancel| {
                    resolve::avatar(remote.as_ref(), &name, SMALL_AVATAR, cancel)
                        .map(|avatar| (name, avatar))
                },
                move |result| {
                    if let AsyncResult::Success((blog, avatar)) = result {
                        sink.on_preview(&owner, Preview::Icon { blog, avatar });
                    }
                },
            );
            if submission.is_started() {
                started += 1;
            }
        }
        started
    }

    pub fn blog_exists(&self, blog: &str) -> bool {
        resolve::blog_exists(self.remote.as_ref(), blog)
    }
}
