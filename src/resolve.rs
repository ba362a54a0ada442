use std::sync::Arc;

use anyhow::{Context, Result};
use image::RgbaImage;
use log::debug;

use crate::data::{Note, Post, RemoteFeed};
use crate::follow_graph::{FollowGraph, Relation};
use crate::item::ItemKey;
use crate::session::ViewingSession;
use crate::task::{AsyncResult, CancelToken};

pub const SMALL_AVATAR: u32 = 16;
pub const LARGE_AVATAR: u32 = 64;
pub const DEFAULT_MAX_LINKS: usize = 30;

#[derive(Debug, Clone, PartialEq)]
pub enum Avatar {
    Image(Arc<RgbaImage>),
    Placeholder { size: u32 },
}

impl Avatar {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Avatar::Placeholder { .. })
    }

    pub fn size(&self) -> u32 {
        match self {
            Avatar::Image(img) => img.width(),
            Avatar::Placeholder { size } => *size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuLink {
    pub blog: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkMenu {
    pub total: usize,
    pub links: Vec<MenuLink>,
    pub overflow: usize,
}

impl LinkMenu {
    pub fn build<I>(entries: I, max_links: usize) -> Self
    where
        I: IntoIterator<Item = MenuLink>,
    {
        let all: Vec<MenuLink> = entries.into_iter().collect();
        let total = all.len();
        let links: Vec<MenuLink> = all.into_iter().take(max_links).collect();
        Self {
            total,
            overflow: total - links.len(),
            links,
        }
    }

    pub fn overflow_label(&self) -> Option<String> {
        (self.overflow > 0).then(|| format!("+{} more blogs", self.overflow))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NoteInfo {
    pub count: u64,
    pub notes: Vec<Note>,
}

impl NoteInfo {
    pub fn menu(&self, max_links: usize) -> LinkMenu {
        LinkMenu::build(
            self.notes.iter().map(|note| MenuLink {
                blog: note.blog_name.clone(),
                label: note.describe(),
            }),
            max_links,
        )
    }

    pub fn count_label(&self) -> String {
        format!("{} notes", self.count)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReblogSource {
    pub blog: String,
    pub small_avatar: Avatar,
    pub large_avatar: Avatar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowState {
    OwnBlog,
    Following,
    NotFollowing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModeMenu {
    pub blog: String,
    pub own_blog: bool,
    pub can_view_likes: bool,
    pub posts_total: u64,
    pub likes_total: Option<u64>,
    pub small_avatar: Avatar,
    pub large_avatar: Avatar,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CurrentUserMenu {
    pub name: String,
    pub avatar: Avatar,
    pub go_to_visible: bool,
}

// Fetches and decodes an avatar. Never fails: anything that goes wrong
// yields a placeholder of the requested size.
pub fn avatar(
    remote: &dyn RemoteFeed,
    blog: &str,
    size: u32,
    cancel: &CancelToken,
) -> AsyncResult<Avatar> {
    if cancel.is_cancelled() {
        return AsyncResult::Cancelled;
    }
    let fetched = remote
        .avatar(blog, size)
        .and_then(|bytes| {
            decode(&bytes).with_context(|| format!("resolve: decode avatar of {blog}"))
        });
    let avatar = match fetched {
        Ok(img) => Avatar::Image(Arc::new(img)),
        Err(err) => {
            debug!("resolve: avatar {blog}@{size} unavailable: {err:#}");
            Avatar::Placeholder { size }
        }
    };
    cancel.guard(AsyncResult::Success(avatar))
}

fn decode(bytes: &[u8]) -> Result<RgbaImage> {
    Ok(image::load_from_memory(bytes)?.to_rgba8())
}

pub fn blog_title(
    remote: &dyn RemoteFeed,
    blog: &str,
    cancel: &CancelToken,
) -> AsyncResult<String> {
    if cancel.is_cancelled() {
        return AsyncResult::Cancelled;
    }
    let result = remote
        .blog_info(blog)
        .map(|info| info.title)
        .with_context(|| format!("resolve: title of {blog}"));
    cancel.guard(AsyncResult::from_result(result))
}

pub fn blog_exists(remote: &dyn RemoteFeed, blog: &str) -> bool {
    remote.blog_info(blog).is_ok()
}

pub fn like_state(
    remote: &dyn RemoteFeed,
    key: &ItemKey,
    cancel: &CancelToken,
) -> AsyncResult<bool> {
    if cancel.is_cancelled() {
        return AsyncResult::Cancelled;
    }
    let result = remote
        .post_detail(&key.blog, key.post_id)
        .map(|post| post.liked.unwrap_or(false))
        .with_context(|| format!("resolve: like state of {key}"));
    cancel.guard(AsyncResult::from_result(result))
}

// Note count and note list from the detailed post. A post without notes is
// a success with an empty list; only a failed fetch is `Failed`.
pub fn notes(
    remote: &dyn RemoteFeed,
    key: &ItemKey,
    cancel: &CancelToken,
) -> AsyncResult<NoteInfo> {
    if cancel.is_cancelled() {
        return AsyncResult::Cancelled;
    }
    let result = remote
        .post_detail(&key.blog, key.post_id)
        .map(|post| NoteInfo {
            count: post.note_count,
            notes: post.notes,
        })
        .with_context(|| format!("resolve: notes of {key}"));
    cancel.guard(AsyncResult::from_result(result))
}

pub fn reblog_source(
    remote: &dyn RemoteFeed,
    post: &Post,
    cancel: &CancelToken,
) -> AsyncResult<Option<ReblogSource>> {
    let Some(blog) = post.reblogged_from.clone().filter(|name| !name.is_empty()) else {
        return cancel.guard(AsyncResult::Success(None));
    };
    let small = avatar(remote, &blog, SMALL_AVATAR, cancel);
    let large = avatar(remote, &blog, LARGE_AVATAR, cancel);
    match (small, large) {
        (AsyncResult::Success(small_avatar), AsyncResult::Success(large_avatar)) => {
            cancel.guard(AsyncResult::Success(Some(ReblogSource {
                blog,
                small_avatar,
                large_avatar,
            })))
        }
        _ => AsyncResult::Cancelled,
    }
}

pub fn follow_state(
    graph: &FollowGraph,
    session: &ViewingSession,
    cancel: &CancelToken,
) -> AsyncResult<FollowState> {
    if session.is_own_blog() {
        return cancel.guard(AsyncResult::Success(FollowState::OwnBlog));
    }
    if cancel.is_cancelled() {
        return AsyncResult::Cancelled;
    }
    let result = graph.is_following(session.blog()).map(|following| {
        if following {
            FollowState::Following
        } else {
            FollowState::NotFollowing
        }
    });
    cancel.guard(AsyncResult::from_result(result))
}

pub fn relationship_menu(
    graph: &FollowGraph,
    relation: Relation,
    max_links: usize,
    cancel: &CancelToken,
) -> AsyncResult<LinkMenu> {
    if cancel.is_cancelled() {
        return AsyncResult::Cancelled;
    }
    let result = graph.relation(relation).map(|names| {
        LinkMenu::build(
            names.into_iter().map(|name| MenuLink {
                label: name.clone(),
                blog: name,
            }),
            max_links,
        )
    });
    cancel.guard(AsyncResult::from_result(result))
}

pub fn mode_menu(
    remote: &dyn RemoteFeed,
    session: &ViewingSession,
    cancel: &CancelToken,
) -> AsyncResult<ModeMenu> {
    if cancel.is_cancelled() {
        return AsyncResult::Cancelled;
    }
    let result = build_mode_menu(remote, session, cancel);
    cancel.guard(AsyncResult::from_result(result))
}

fn build_mode_menu(
    remote: &dyn RemoteFeed,
    session: &ViewingSession,
    cancel: &CancelToken,
) -> Result<ModeMenu> {
    let blog = session.blog();
    let info = remote
        .blog_info(blog)
        .with_context(|| format!("resolve: info of {blog}"))?;

    let (can_view_likes, likes_total) = if session.is_own_blog() {
        let user = remote.current_user().context("resolve: current user")?;
        (user.likes > 0, Some(user.likes))
    } else {
        match info.likes {
            Some(count) => (count > 0, Some(count)),
            None => (false, None),
        }
    };

    let small_avatar = avatar(remote, blog, SMALL_AVATAR, cancel)
        .success()
        .unwrap_or(Avatar::Placeholder { size: SMALL_AVATAR });
    let large_avatar = avatar(remote, blog, LARGE_AVATAR, cancel)
        .success()
        .unwrap_or(Avatar::Placeholder { size: LARGE_AVATAR });

    Ok(ModeMenu {
        blog: blog.to_string(),
        own_blog: session.is_own_blog(),
        can_view_likes,
        posts_total: info.posts,
        likes_total: likes_total.filter(|_| can_view_likes),
        small_avatar,
        large_avatar,
    })
}

pub fn current_user(
    remote: &dyn RemoteFeed,
    user: &str,
    session: &ViewingSession,
    cancel: &CancelToken,
) -> AsyncResult<CurrentUserMenu> {
    match avatar(remote, user, LARGE_AVATAR, cancel) {
        AsyncResult::Success(avatar) => cancel.guard(AsyncResult::Success(CurrentUserMenu {
            name: user.to_string(),
            avatar,
            go_to_visible: !session.is_own_blog(),
        })),
        _ => AsyncResult::Cancelled,
    }
}
