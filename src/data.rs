use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use image::{ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;

// Capability to talk to the remote blog service. Every call blocks the
// calling thread for the duration of the request.
pub trait RemoteFeed: Send + Sync {
    fn current_user(&self) -> Result<UserInfo>;
    fn blog_info(&self, blog: &str) -> Result<BlogInfo>;
    fn blog_posts(&self, blog: &str, page: PageRequest) -> Result<Vec<Post>>;
    fn blog_likes(&self, blog: &str, page: PageRequest) -> Result<Vec<Post>>;
    fn user_likes(&self, page: PageRequest) -> Result<Vec<Post>>;
    fn dashboard(&self, page: PageRequest) -> Result<Vec<Post>>;
    fn post_detail(&self, blog: &str, id: u64) -> Result<Post>;
    fn avatar(&self, blog: &str, size: u32) -> Result<Vec<u8>>;
    fn following(&self, page: PageRequest) -> Result<RelationPage>;
    fn followers(&self, blog: &str, page: PageRequest) -> Result<RelationPage>;
    fn follow(&self, blog: &str) -> Result<()>;
    fn unfollow(&self, blog: &str) -> Result<()>;
    fn like(&self, id: u64, reblog_key: &str) -> Result<()>;
    fn unlike(&self, id: u64, reblog_key: &str) -> Result<()>;
    fn reblog(&self, onto_blog: &str, id: u64, reblog_key: &str) -> Result<()>;
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited,
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageRequest {
    pub offset: u64,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(offset: u64, limit: u32) -> Self {
        Self { offset, limit }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserInfo {
    pub name: String,
    pub likes: u64,
    pub following: u64,
    pub blogs: Vec<BlogInfo>,
}

impl UserInfo {
    pub fn primary_blog(&self) -> &str {
        self.blogs
            .first()
            .map(|blog| blog.name.as_str())
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlogInfo {
    pub name: String,
    pub title: String,
    pub posts: u64,
    // `None` when the blog does not share its likes.
    pub likes: Option<u64>,
    pub followers: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PostKind {
    Photo,
    #[default]
    Text,
    Quote,
    Link,
    Chat,
    Audio,
    Video,
    Answer,
    Other,
}

impl PostKind {
    pub fn parse(value: &str) -> Self {
        match value {
            "photo" => PostKind::Photo,
            "text" => PostKind::Text,
            "quote" => PostKind::Quote,
            "link" => PostKind::Link,
            "chat" => PostKind::Chat,
            "audio" => PostKind::Audio,
            "video" => PostKind::Video,
            "answer" => PostKind::Answer,
            _ => PostKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PostKind::Photo => "photo",
            PostKind::Text => "text",
            PostKind::Quote => "quote",
            PostKind::Link => "link",
            PostKind::Chat => "chat",
            PostKind::Audio => "audio",
            PostKind::Video => "video",
            PostKind::Answer => "answer",
            PostKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Post {
    pub id: u64,
    pub blog_name: String,
    pub kind: PostKind,
    pub reblog_key: String,
    pub reblogged_from: Option<String>,
    pub note_count: u64,
    pub liked: Option<bool>,
    pub timestamp: i64,
    pub photos: Vec<Photo>,
    pub notes: Vec<Note>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Photo {
    pub caption: String,
    // Largest first: the original upload, then the resized variants.
    pub sizes: Vec<PhotoSize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PhotoSize {
    pub width: u32,
    pub height: u32,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoteKind {
    Like,
    Reblog,
    Posted,
    Reply,
    Answer,
    Other,
}

impl NoteKind {
    pub fn parse(value: &str) -> Self {
        match value {
            "like" => NoteKind::Like,
            "reblog" => NoteKind::Reblog,
            "posted" => NoteKind::Posted,
            "reply" => NoteKind::Reply,
            "answer" => NoteKind::Answer,
            _ => NoteKind::Other,
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            NoteKind::Like => "liked",
            NoteKind::Reblog => "reblogged",
            NoteKind::Posted => "posted",
            NoteKind::Reply => "replied to",
            NoteKind::Answer => "answered",
            NoteKind::Other => "noted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub blog_name: String,
    pub kind: NoteKind,
    pub timestamp: i64,
}

impl Note {
    pub fn describe(&self) -> String {
        format!("{} {} this", self.blog_name, self.kind.past_tense())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelationPage {
    pub total: u64,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    CurrentUser,
    BlogInfo,
    BlogPosts,
    BlogLikes,
    UserLikes,
    Dashboard,
    PostDetail,
    Avatar,
    Following,
    Followers,
    Follow,
    Unfollow,
    Like,
    Unlike,
    Reblog,
}

#[derive(Default)]
struct MockBlog {
    info: BlogInfo,
    posts: Vec<Post>,
    likes: Vec<Post>,
    avatar: Option<Vec<u8>>,
}

#[derive(Default)]
struct MockState {
    user: UserInfo,
    blogs: HashMap<String, MockBlog>,
    dashboard: Vec<Post>,
    user_likes: Vec<Post>,
    following: Vec<String>,
    followers: Vec<String>,
    liked: HashSet<u64>,
    reblogged: Vec<u64>,
}

pub struct MockRemote {
    state: Mutex<MockState>,
    calls: Mutex<HashMap<Endpoint, usize>>,
    failing: Mutex<HashSet<Endpoint>>,
    gates: Mutex<HashMap<Endpoint, Receiver<()>>>,
}

impl MockRemote {
    pub fn new(user: &str) -> Self {
        let remote = Self {
            state: Mutex::new(MockState::default()),
            calls: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            gates: Mutex::new(HashMap::new()),
        };
        {
            let mut state = remote.state.lock();
            state.user = UserInfo {
                name: user.to_string(),
                likes: 0,
                following: 0,
                blogs: vec![BlogInfo {
                    name: user.to_string(),
                    title: String::new(),
                    posts: 0,
                    likes: Some(0),
                    followers: 0,
                }],
            };
            state.blogs.insert(
                user.to_string(),
                MockBlog {
                    info: BlogInfo {
                        name: user.to_string(),
                        likes: Some(0),
                        ..BlogInfo::default()
                    },
                    ..MockBlog::default()
                },
            );
        }
        remote
    }

    pub fn with_blog(self, name: &str, title: &str) -> Self {
        {
            let mut state = self.state.lock();
            let blog = state.blogs.entry(name.to_string()).or_default();
            blog.info.name = name.to_string();
            blog.info.title = title.to_string();
        }
        self
    }

    pub fn with_posts(self, blog: &str, posts: Vec<Post>) -> Self {
        {
            let mut state = self.state.lock();
            let entry = state.blogs.entry(blog.to_string()).or_default();
            entry.info.name = blog.to_string();
            entry.info.posts = posts.len() as u64;
            entry.posts = posts;
        }
        self
    }

    pub fn with_likes(self, blog: &str, posts: Vec<Post>) -> Self {
        {
            let mut state = self.state.lock();
            let is_user = state.user.name == blog;
            let count = posts.len() as u64;
            if is_user {
                state.user.likes = count;
                state.user_likes = posts.clone();
            }
            let entry = state.blogs.entry(blog.to_string()).or_default();
            entry.info.name = blog.to_string();
            entry.info.likes = Some(count);
            entry.likes = posts;
        }
        self
    }

    pub fn with_private_likes(self, blog: &str) -> Self {
        {
            let mut state = self.state.lock();
            let entry = state.blogs.entry(blog.to_string()).or_default();
            entry.info.name = blog.to_string();
            entry.info.likes = None;
        }
        self
    }

    pub fn with_dashboard(self, posts: Vec<Post>) -> Self {
        self.state.lock().dashboard = posts;
        self
    }

    pub fn with_following(self, names: &[&str]) -> Self {
        {
            let mut state = self.state.lock();
            state.following = names.iter().map(|name| name.to_string()).collect();
            state.user.following = names.len() as u64;
        }
        self
    }

    pub fn with_followers(self, names: &[&str]) -> Self {
        {
            let mut state = self.state.lock();
            state.followers = names.iter().map(|name| name.to_string()).collect();
            let user = state.user.name.clone();
            if let Some(blog) = state.blogs.get_mut(&user) {
                blog.info.followers = names.len() as u64;
            }
        }
        self
    }

    pub fn with_avatar(self, blog: &str, bytes: Vec<u8>) -> Self {
        {
            let mut state = self.state.lock();
            let entry = state.blogs.entry(blog.to_string()).or_default();
            entry.info.name = blog.to_string();
            entry.avatar = Some(bytes);
        }
        self
    }

    pub fn with_liked(self, id: u64) -> Self {
        self.state.lock().liked.insert(id);
        self
    }

    pub fn fail(&self, endpoint: Endpoint) {
        self.failing.lock().insert(endpoint);
    }

    pub fn recover(&self, endpoint: Endpoint) {
        self.failing.lock().remove(&endpoint);
    }

    // Blocks every later call to `endpoint` until a unit is sent on the
    // returned channel (one unit releases one call). Dropping the sender
    // releases all calls.
    pub fn gate(&self, endpoint: Endpoint) -> Sender<()> {
        let (tx, rx) = unbounded();
        self.gates.lock().insert(endpoint, rx);
        tx
    }

    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.calls.lock().get(&endpoint).copied().unwrap_or(0)
    }

    pub fn following_snapshot(&self) -> Vec<String> {
        self.state.lock().following.clone()
    }

    pub fn reblogged(&self) -> Vec<u64> {
        self.state.lock().reblogged.clone()
    }

    pub fn follow_externally(&self, blog: &str) {
        let mut state = self.state.lock();
        state.following.push(blog.to_string());
        state.user.following += 1;
    }

    fn enter(&self, endpoint: Endpoint) -> Result<()> {
        *self.calls.lock().entry(endpoint).or_insert(0) += 1;
        let gate = self.gates.lock().get(&endpoint).cloned();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if self.failing.lock().contains(&endpoint) {
            return Err(RemoteError::Api {
                status: 503,
                message: format!("{endpoint:?} unavailable"),
            }
            .into());
        }
        Ok(())
    }

    fn find_post(state: &MockState, blog: &str, id: u64) -> Option<Post> {
        let from_blog = state
            .blogs
            .get(blog)
            .and_then(|entry| entry.posts.iter().chain(entry.likes.iter()).find(|p| p.id == id));
        from_blog
            .or_else(|| state.dashboard.iter().find(|p| p.id == id))
            .or_else(|| state.user_likes.iter().find(|p| p.id == id))
            .cloned()
    }
}

fn page_of<T: Clone>(items: &[T], page: PageRequest) -> Vec<T> {
    items
        .iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .cloned()
        .collect()
}

impl RemoteFeed for MockRemote {
    fn current_user(&self) -> Result<UserInfo> {
        self.enter(Endpoint::CurrentUser)?;
        Ok(self.state.lock().user.clone())
    }

    fn blog_info(&self, blog: &str) -> Result<BlogInfo> {
        self.enter(Endpoint::BlogInfo)?;
        self.state
            .lock()
            .blogs
            .get(blog)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| RemoteError::NotFound(blog.to_string()).into())
    }

    fn blog_posts(&self, blog: &str, page: PageRequest) -> Result<Vec<Post>> {
        self.enter(Endpoint::BlogPosts)?;
        let state = self.state.lock();
        let entry = state
            .blogs
            .get(blog)
            .ok_or_else(|| RemoteError::NotFound(blog.to_string()))?;
        Ok(page_of(&entry.posts, page))
    }

    fn blog_likes(&self, blog: &str, page: PageRequest) -> Result<Vec<Post>> {
        self.enter(Endpoint::BlogLikes)?;
        let state = self.state.lock();
        let entry = state
            .blogs
            .get(blog)
            .ok_or_else(|| RemoteError::NotFound(blog.to_string()))?;
        if entry.info.likes.is_none() {
            return Err(RemoteError::Unauthorized.into());
        }
        Ok(page_of(&entry.likes, page))
    }

    fn user_likes(&self, page: PageRequest) -> Result<Vec<Post>> {
        self.enter(Endpoint::UserLikes)?;
        Ok(page_of(&self.state.lock().user_likes, page))
    }

    fn dashboard(&self, page: PageRequest) -> Result<Vec<Post>> {
        self.enter(Endpoint::Dashboard)?;
        Ok(page_of(&self.state.lock().dashboard, page))
    }

    fn post_detail(&self, blog: &str, id: u64) -> Result<Post> {
        self.enter(Endpoint::PostDetail)?;
        let state = self.state.lock();
        let mut post = Self::find_post(&state, blog, id)
            .ok_or_else(|| RemoteError::NotFound(format!("{blog}/{id}")))?;
        post.liked = Some(state.liked.contains(&id));
        Ok(post)
    }

    fn avatar(&self, blog: &str, _size: u32) -> Result<Vec<u8>> {
        self.enter(Endpoint::Avatar)?;
        self.state
            .lock()
            .blogs
            .get(blog)
            .and_then(|entry| entry.avatar.clone())
            .ok_or_else(|| RemoteError::NotFound(blog.to_string()).into())
    }

    fn following(&self, page: PageRequest) -> Result<RelationPage> {
        self.enter(Endpoint::Following)?;
        let state = self.state.lock();
        Ok(RelationPage {
            total: state.following.len() as u64,
            names: page_of(&state.following, page),
        })
    }

    fn followers(&self, blog: &str, page: PageRequest) -> Result<RelationPage> {
        self.enter(Endpoint::Followers)?;
        let state = self.state.lock();
        if !state.blogs.contains_key(blog) {
            return Err(RemoteError::NotFound(blog.to_string()).into());
        }
        Ok(RelationPage {
            total: state.followers.len() as u64,
            names: page_of(&state.followers, page),
        })
    }

    fn follow(&self, blog: &str) -> Result<()> {
        self.enter(Endpoint::Follow)?;
        let mut state = self.state.lock();
        if !state.following.iter().any(|name| name == blog) {
            state.following.insert(0, blog.to_string());
            state.user.following += 1;
        }
        Ok(())
    }

    fn unfollow(&self, blog: &str) -> Result<()> {
        self.enter(Endpoint::Unfollow)?;
        let mut state = self.state.lock();
        let before = state.following.len();
        state.following.retain(|name| name != blog);
        if state.following.len() < before {
            state.user.following -= 1;
        }
        Ok(())
    }

    fn like(&self, id: u64, _reblog_key: &str) -> Result<()> {
        self.enter(Endpoint::Like)?;
        self.state.lock().liked.insert(id);
        Ok(())
    }

    fn unlike(&self, id: u64, _reblog_key: &str) -> Result<()> {
        self.enter(Endpoint::Unlike)?;
        self.state.lock().liked.remove(&id);
        Ok(())
    }

    fn reblog(&self, onto_blog: &str, id: u64, _reblog_key: &str) -> Result<()> {
        self.enter(Endpoint::Reblog)?;
        let mut state = self.state.lock();
        if !state.blogs.contains_key(onto_blog) {
            return Err(anyhow!("mock: no blog named {onto_blog}"));
        }
        state.reblogged.push(id);
        Ok(())
    }
}

pub fn mock_photo_post(blog: &str, id: u64, widths: &[u32]) -> Post {
    let sizes = widths
        .iter()
        .map(|width| PhotoSize {
            width: *width,
            height: *width,
            url: format!("https://media.example/{blog}/{id}_{width}.jpg"),
        })
        .collect();
    Post {
        id,
        blog_name: blog.to_string(),
        kind: PostKind::Photo,
        reblog_key: format!("key-{id}"),
        photos: vec![Photo {
            caption: String::new(),
            sizes,
        }],
        ..Post::default()
    }
}

pub fn mock_text_post(blog: &str, id: u64) -> Post {
    Post {
        id,
        blog_name: blog.to_string(),
        kind: PostKind::Text,
        reblog_key: format!("key-{id}"),
        ..Post::default()
    }
}

pub fn solid_png(size: u32) -> Result<Vec<u8>> {
    let img = RgbaImage::from_pixel(size, size, Rgba([0x35, 0x46, 0x5c, 0xff]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .context("mock: encode png")?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_sliced_by_offset_and_limit() {
        let posts: Vec<Post> = (0..5).map(|id| mock_text_post("staff", id)).collect();
        let remote = MockRemote::new("me").with_posts("staff", posts);
        let page = remote.blog_posts("staff", PageRequest::new(3, 2)).unwrap();
        assert_eq!(page.iter().map(|p| p.id).collect::<Vec<_>>(), vec![3, 4]);
        assert!(remote
            .blog_posts("staff", PageRequest::new(10, 2))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn failing_endpoint_reports_remote_error() {
        let remote = MockRemote::new("me");
        remote.fail(Endpoint::Dashboard);
        let err = remote.dashboard(PageRequest::new(0, 20)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RemoteError>(),
            Some(RemoteError::Api { status: 503, .. })
        ));
        remote.recover(Endpoint::Dashboard);
        assert!(remote.dashboard(PageRequest::new(0, 20)).is_ok());
        assert_eq!(remote.calls(Endpoint::Dashboard), 2);
    }

    #[test]
    fn primary_blog_falls_back_to_user_name() {
        let user = UserInfo {
            name: "solo".into(),
            ..UserInfo::default()
        };
        assert_eq!(user.primary_blog(), "solo");
    }

    #[test]
    fn note_descriptions_use_past_tense() {
        let note = Note {
            blog_name: "staff".into(),
            kind: NoteKind::Reply,
            timestamp: 0,
        };
        assert_eq!(note.describe(), "staff replied to this");
        assert_eq!(NoteKind::parse("reblog").past_tense(), "reblogged");
        assert_eq!(NoteKind::parse("mystery"), NoteKind::Other);
    }

    #[test]
    fn solid_png_decodes() {
        let bytes = solid_png(16).unwrap();
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!(img.width(), 16);
    }
}
