use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::data::{
    BlogInfo, Note, NoteKind, PageRequest, Photo, PhotoSize, Post, PostKind, RelationPage,
    RemoteError, RemoteFeed, UserInfo,
};
use crate::oauth::{Credentials, Signer};

pub const DEFAULT_BASE_URL: &str = "https://api.tumblr.com/v2/";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub credentials: Credentials,
    pub base_url: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
    pub avatar_timeout: Duration,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    http: HttpClient,
    signer: Signer,
    base_url: Url,
    user_agent: String,
    avatar_timeout: Duration,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("tumblr: client user agent required");
        }
        let base = config
            .base_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(&base).with_context(|| format!("tumblr: parse base url {base}"))?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout)
                .build()
                .context("tumblr: build http client")?,
        };

        Ok(Self {
            http,
            signer: Signer::new(config.credentials),
            base_url,
            user_agent: config.user_agent,
            avatar_timeout: config.avatar_timeout,
        })
    }

    fn get<T: DeserializeOwned>(&self, path: &str, params: &[(String, String)]) -> Result<T> {
        let resp = self.request(Method::GET, path, params, None, |req| req)?;
        decode(resp)
    }

    fn post(&self, path: &str, form: Vec<(String, String)>) -> Result<()> {
        let resp = self.request(Method::POST, path, &[], Some(form), |req| req)?;
        let _: serde_json::Value = decode(resp)?;
        Ok(())
    }

    fn request<F>(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        form: Option<Vec<(String, String)>>,
        customize: F,
    ) -> Result<Response>
    where
        F: FnOnce(RequestBuilder) -> RequestBuilder,
    {
        let mut url = self.base_url.join(path)?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }

        let form = form.unwrap_or_default();
        let auth = self.signer.authorization(method.as_str(), &url, &form)?;
        debug!("tumblr: {method} {}", url.path());

        let mut req = self
            .http
            .request(method, url)
            .header(USER_AGENT, self.user_agent.clone())
            .header(AUTHORIZATION, auth);
        if !form.is_empty() {
            req = req
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .form(&form);
        }
        req = customize(req);

        let resp = req.send().with_context(|| format!("tumblr: send {path}"))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().unwrap_or_default();
        let message = serde_json::from_str::<Envelope<serde_json::Value>>(&body)
            .map(|envelope| envelope.meta.msg)
            .unwrap_or(body);
        Err(status_error(status, path, message).into())
    }

    fn page_params(page: PageRequest) -> Vec<(String, String)> {
        vec![
            ("offset".into(), page.offset.to_string()),
            ("limit".into(), page.limit.to_string()),
            ("reblog_info".into(), "true".into()),
        ]
    }
}

fn status_error(status: u16, path: &str, message: String) -> RemoteError {
    match status {
        401 | 403 => RemoteError::Unauthorized,
        404 => RemoteError::NotFound(path.to_string()),
        429 => RemoteError::RateLimited,
        _ => RemoteError::Api { status, message },
    }
}

fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let envelope: Envelope<T> = resp.json().context("tumblr: decode response")?;
    Ok(envelope.response)
}

fn blog_path(blog: &str, rest: &str) -> String {
    let host = if blog.contains('.') {
        blog.to_string()
    } else {
        format!("{blog}.tumblr.com")
    };
    format!("blog/{host}/{rest}")
}

fn blog_url(blog: &str) -> String {
    if blog.contains('.') {
        blog.to_string()
    } else {
        format!("{blog}.tumblr.com")
    }
}

impl RemoteFeed for Client {
    fn current_user(&self) -> Result<UserInfo> {
        let resp: UserResponse = self.get("user/info", &[]).context("tumblr: user info")?;
        Ok(resp.user.into())
    }

    fn blog_info(&self, blog: &str) -> Result<BlogInfo> {
        let resp: BlogResponse = self
            .get(&blog_path(blog, "info"), &[])
            .with_context(|| format!("tumblr: info of {blog}"))?;
        Ok(resp.blog.into())
    }

    fn blog_posts(&self, blog: &str, page: PageRequest) -> Result<Vec<Post>> {
        let resp: PostsResponse = self
            .get(&blog_path(blog, "posts"), &Self::page_params(page))
            .with_context(|| format!("tumblr: posts of {blog}"))?;
        Ok(decode_posts(resp.posts))
    }

    fn blog_likes(&self, blog: &str, page: PageRequest) -> Result<Vec<Post>> {
        let resp: LikesResponse = self
            .get(&blog_path(blog, "likes"), &Self::page_params(page))
            .with_context(|| format!("tumblr: likes of {blog}"))?;
        Ok(decode_posts(resp.liked_posts))
    }

    fn user_likes(&self, page: PageRequest) -> Result<Vec<Post>> {
        let resp: LikesResponse = self
            .get("user/likes", &Self::page_params(page))
            .context("tumblr: user likes")?;
        Ok(decode_posts(resp.liked_posts))
    }

    fn dashboard(&self, page: PageRequest) -> Result<Vec<Post>> {
        let resp: PostsResponse = self
            .get("user/dashboard", &Self::page_params(page))
            .context("tumblr: dashboard")?;
        Ok(decode_posts(resp.posts))
    }

    fn post_detail(&self, blog: &str, id: u64) -> Result<Post> {
        let params = vec![
            ("id".to_string(), id.to_string()),
            ("notes_info".to_string(), "true".to_string()),
            ("reblog_info".to_string(), "true".to_string()),
        ];
        let resp: PostsResponse = self
            .get(&blog_path(blog, "posts"), &params)
            .with_context(|| format!("tumblr: post {blog}/{id}"))?;
        let raw = resp
            .posts
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::NotFound(format!("{blog}/{id}")))?;
        let post: WirePost = serde_json::from_value(raw)
            .with_context(|| format!("tumblr: decode post {blog}/{id}"))?;
        Ok(post.into())
    }

    fn avatar(&self, blog: &str, size: u32) -> Result<Vec<u8>> {
        let timeout = self.avatar_timeout;
        let resp = self
            .request(
                Method::GET,
                &blog_path(blog, &format!("avatar/{size}")),
                &[],
                None,
                |req| req.timeout(timeout),
            )
            .with_context(|| format!("tumblr: avatar of {blog}"))?;
        let bytes = resp.bytes().context("tumblr: read avatar")?;
        Ok(bytes.to_vec())
    }

    fn following(&self, page: PageRequest) -> Result<RelationPage> {
        let params = vec![
            ("offset".to_string(), page.offset.to_string()),
            ("limit".to_string(), page.limit.to_string()),
        ];
        let resp: FollowingResponse =
            self.get("user/following", &params).context("tumblr: following")?;
        Ok(RelationPage {
            total: resp.total_blogs,
            names: resp.blogs.into_iter().map(|blog| blog.name).collect(),
        })
    }

    fn followers(&self, blog: &str, page: PageRequest) -> Result<RelationPage> {
        let params = vec![
            ("offset".to_string(), page.offset.to_string()),
            ("limit".to_string(), page.limit.to_string()),
        ];
        let resp: FollowersResponse = self
            .get(&blog_path(blog, "followers"), &params)
            .with_context(|| format!("tumblr: followers of {blog}"))?;
        Ok(RelationPage {
            total: resp.total_users,
            names: resp.users.into_iter().map(|user| user.name).collect(),
        })
    }

    fn follow(&self, blog: &str) -> Result<()> {
        self.post("user/follow", vec![("url".into(), blog_url(blog))])
            .with_context(|| format!("tumblr: follow {blog}"))
    }

    fn unfollow(&self, blog: &str) -> Result<()> {
        self.post("user/unfollow", vec![("url".into(), blog_url(blog))])
            .with_context(|| format!("tumblr: unfollow {blog}"))
    }

    fn like(&self, id: u64, reblog_key: &str) -> Result<()> {
        self.post("user/like", id_form(id, reblog_key))
            .with_context(|| format!("tumblr: like {id}"))
    }

    fn unlike(&self, id: u64, reblog_key: &str) -> Result<()> {
        self.post("user/unlike", id_form(id, reblog_key))
            .with_context(|| format!("tumblr: unlike {id}"))
    }

    fn reblog(&self, onto_blog: &str, id: u64, reblog_key: &str) -> Result<()> {
        if reblog_key.is_empty() {
            return Err(anyhow!("tumblr: post {id} has no reblog key"));
        }
        self.post(&blog_path(onto_blog, "post/reblog"), id_form(id, reblog_key))
            .with_context(|| format!("tumblr: reblog {id} onto {onto_blog}"))
    }
}

// A post that does not decode is dropped; the rest of the page survives.
fn decode_posts(raw: Vec<serde_json::Value>) -> Vec<Post> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value::<WirePost>(value) {
            Ok(post) => Some(Post::from(post)),
            Err(err) => {
                debug!("tumblr: skipping undecodable post: {err}");
                None
            }
        })
        .collect()
}

fn id_form(id: u64, reblog_key: &str) -> Vec<(String, String)> {
    vec![
        ("id".to_string(), id.to_string()),
        ("reblog_key".to_string(), reblog_key.to_string()),
    ]
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    meta: Meta,
    response: T,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    user: WireUser,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    name: String,
    #[serde(default)]
    likes: u64,
    #[serde(default)]
    following: u64,
    #[serde(default)]
    blogs: Vec<WireBlog>,
}

impl From<WireUser> for UserInfo {
    fn from(user: WireUser) -> Self {
        Self {
            name: user.name,
            likes: user.likes,
            following: user.following,
            blogs: user.blogs.into_iter().map(BlogInfo::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BlogResponse {
    blog: WireBlog,
}

#[derive(Debug, Deserialize)]
struct WireBlog {
    name: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    posts: u64,
    // Absent when the blog keeps its likes private.
    #[serde(default)]
    likes: Option<u64>,
    #[serde(default)]
    share_likes: Option<bool>,
    #[serde(default)]
    followers: u64,
}

impl From<WireBlog> for BlogInfo {
    fn from(blog: WireBlog) -> Self {
        let likes = match blog.share_likes {
            Some(false) => None,
            _ => blog.likes,
        };
        Self {
            name: blog.name,
            title: blog.title,
            posts: blog.posts,
            likes,
            followers: blog.followers,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostsResponse {
    #[serde(default)]
    posts: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct LikesResponse {
    #[serde(default)]
    liked_posts: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WirePost {
    id: u64,
    blog_name: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    reblog_key: String,
    #[serde(default)]
    reblogged_from_name: Option<String>,
    #[serde(default)]
    note_count: u64,
    #[serde(default)]
    liked: Option<bool>,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    photos: Vec<WirePhoto>,
    #[serde(default)]
    notes: Vec<WireNote>,
}

impl From<WirePost> for Post {
    fn from(post: WirePost) -> Self {
        Self {
            id: post.id,
            blog_name: post.blog_name,
            kind: PostKind::parse(&post.kind),
            reblog_key: post.reblog_key,
            reblogged_from: post.reblogged_from_name.filter(|name| !name.is_empty()),
            note_count: post.note_count,
            liked: post.liked,
            timestamp: post.timestamp,
            photos: post.photos.into_iter().map(Photo::from).collect(),
            notes: post.notes.into_iter().map(Note::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WirePhoto {
    #[serde(default)]
    caption: String,
    original_size: WireSize,
    #[serde(default)]
    alt_sizes: Vec<WireSize>,
}

impl From<WirePhoto> for Photo {
    fn from(photo: WirePhoto) -> Self {
        let original = PhotoSize::from(photo.original_size);
        // alt_sizes usually repeats the original as its first entry.
        let alternates: Vec<PhotoSize> = photo
            .alt_sizes
            .into_iter()
            .map(PhotoSize::from)
            .filter(|size| size.url != original.url)
            .collect();
        let mut sizes = vec![original];
        sizes.extend(alternates);
        Self {
            caption: photo.caption,
            sizes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireSize {
    width: u32,
    height: u32,
    url: String,
}

impl From<WireSize> for PhotoSize {
    fn from(size: WireSize) -> Self {
        Self {
            width: size.width,
            height: size.height,
            url: size.url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireNote {
    blog_name: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    timestamp: i64,
}

impl From<WireNote> for Note {
    fn from(note: WireNote) -> Self {
        Self {
            blog_name: note.blog_name,
            kind: NoteKind::parse(&note.kind),
            timestamp: note.timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FollowingResponse {
    #[serde(default)]
    total_blogs: u64,
    #[serde(default)]
    blogs: Vec<WireName>,
}

#[derive(Debug, Deserialize)]
struct FollowersResponse {
    #[serde(default)]
    total_users: u64,
    #[serde(default)]
    users: Vec<WireName>,
}

#[derive(Debug, Deserialize)]
struct WireName {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_str<T: DeserializeOwned>(json: &str) -> T {
        serde_json::from_str::<Envelope<T>>(json).unwrap().response
    }

    #[test]
    fn blog_paths_accept_names_and_hosts() {
        assert_eq!(blog_path("staff", "info"), "blog/staff.tumblr.com/info");
        assert_eq!(blog_path("example.com", "avatar/64"), "blog/example.com/avatar/64");
        assert_eq!(blog_url("staff"), "staff.tumblr.com");
    }

    #[test]
    fn statuses_map_to_remote_errors() {
        assert_eq!(status_error(401, "user/info", String::new()), RemoteError::Unauthorized);
        assert_eq!(
            status_error(404, "blog/x/info", String::new()),
            RemoteError::NotFound("blog/x/info".into())
        );
        assert_eq!(status_error(429, "p", String::new()), RemoteError::RateLimited);
        assert_eq!(
            status_error(500, "p", "boom".into()),
            RemoteError::Api {
                status: 500,
                message: "boom".into()
            }
        );
    }

    #[test]
    fn decodes_photo_post() {
        let resp: PostsResponse = decode_str(
            r#"{"meta":{"status":200,"msg":"OK"},"response":{"posts":[{
                "id": 42, "blog_name": "staff", "type": "photo", "reblog_key": "abc",
                "reblogged_from_name": "origin", "note_count": 7, "liked": false,
                "timestamp": 1700000000,
                "photos": [{"caption": "", "original_size": {"width": 1280, "height": 960, "url": "https://64.media/x_1280.jpg"},
                  "alt_sizes": [{"width": 500, "height": 375, "url": "https://64.media/x_500.jpg"}]}],
                "notes": [{"blog_name": "fan", "type": "reblog", "timestamp": 1}]
            }]}}"#,
        );
        let post = decode_posts(resp.posts).remove(0);
        assert_eq!(post.kind, PostKind::Photo);
        assert_eq!(post.reblogged_from.as_deref(), Some("origin"));
        let widths: Vec<u32> = post.photos[0].sizes.iter().map(|size| size.width).collect();
        assert_eq!(widths, vec![1280, 500]);
        assert_eq!(post.notes[0].describe(), "fan reblogged this");
    }

    #[test]
    fn undecodable_post_is_skipped() {
        let resp: PostsResponse = decode_str(
            r#"{"meta":{"status":200,"msg":"OK"},"response":{"posts":[
                {"id": 1, "blog_name": "staff", "type": "photo",
                 "photos": [{"original_size": {"width": 500, "height": 500, "url": "https://64.media/a_500.jpg"}}]},
                {"id": 2, "blog_name": "staff", "type": "photo",
                 "photos": [{"caption": "no sizes"}]},
                {"blog_name": "staff", "type": "text"}
            ]}}"#,
        );
        let posts = decode_posts(resp.posts);
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, 1);
    }

    #[test]
    fn private_likes_decode_as_none() {
        let resp: BlogResponse = decode_str(
            r#"{"meta":{"status":200,"msg":"OK"},"response":{"blog":{"name":"staff","title":"Staff","posts":3,"share_likes":false}}}"#,
        );
        let info = BlogInfo::from(resp.blog);
        assert_eq!(info.likes, None);
        assert_eq!(info.posts, 3);
    }

    #[test]
    fn relation_pages_decode() {
        let resp: FollowingResponse = decode_str(
            r#"{"meta":{"status":200,"msg":"OK"},"response":{"total_blogs":2,"blogs":[{"name":"a"},{"name":"b"}]}}"#,
        );
        assert_eq!(resp.total_blogs, 2);
        assert_eq!(resp.blogs[1].name, "b");
    }
}
