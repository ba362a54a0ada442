use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::data::{PageRequest, PhotoSize, Post, PostKind, RemoteFeed};
use crate::item::ContentItem;
use crate::session::{DisplayMode, ViewingSession};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_PREFERRED_SIZE: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePolicy {
    FullSize,
    Preferred(u32),
    Exact(u32),
}

impl SizePolicy {
    pub fn from_options(fullsize: bool, preferred: u32, exact: bool) -> Self {
        if fullsize {
            SizePolicy::FullSize
        } else if exact {
            SizePolicy::Exact(preferred)
        } else {
            SizePolicy::Preferred(preferred)
        }
    }

    pub fn select<'a>(&self, sizes: &'a [PhotoSize]) -> Option<&'a PhotoSize> {
        match *self {
            SizePolicy::FullSize => sizes.first(),
            SizePolicy::Preferred(width) => sizes
                .iter()
                .find(|size| matches_width(size, width))
                .or_else(|| sizes.first()),
            SizePolicy::Exact(width) => sizes.iter().find(|size| matches_width(size, width)),
        }
    }
}

impl Default for SizePolicy {
    fn default() -> Self {
        SizePolicy::Exact(DEFAULT_PREFERRED_SIZE)
    }
}

fn matches_width(size: &PhotoSize, width: u32) -> bool {
    size.width == width || size.url.contains(&format!("_{width}."))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationOptions {
    pub page_size: u32,
    pub size_policy: SizePolicy,
}

impl Default for PaginationOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            size_policy: SizePolicy::default(),
        }
    }
}

pub struct Paginator {
    remote: Arc<dyn RemoteFeed>,
    options: PaginationOptions,
}

impl Paginator {
    pub fn new(remote: Arc<dyn RemoteFeed>, options: PaginationOptions) -> Self {
        let mut options = options;
        if options.page_size == 0 {
            options.page_size = DEFAULT_PAGE_SIZE;
        }
        Self { remote, options }
    }

    pub fn options(&self) -> PaginationOptions {
        self.options
    }

    // Fetches the page at the session's cursor and moves the cursor on by
    // one page whether or not the fetch worked. Callers must not run two of
    // these for one session at once.
    pub fn fetch_page(&self, session: &ViewingSession) -> PageItems {
        let page_index = session.page_index();
        let fetched = self.request(session, page_index);
        session.advance();

        match fetched {
            Ok(posts) => {
                debug!(
                    "pagination: {} page {page_index} returned {} posts",
                    session.id(),
                    posts.len()
                );
                PageItems::new(page_index, posts, self.options.size_policy)
            }
            Err(err) => {
                warn!(
                    "pagination: {} page {page_index} failed: {err:#}",
                    session.id()
                );
                PageItems::failed(page_index, format!("{err:#}"), self.options.size_policy)
            }
        }
    }

    fn request(&self, session: &ViewingSession, page_index: u64) -> Result<Vec<Post>> {
        let page = PageRequest::new(
            page_index * u64::from(self.options.page_size),
            self.options.page_size,
        );
        let remote = self.remote.as_ref();
        match session.mode() {
            DisplayMode::Posts => remote
                .blog_posts(session.blog(), page)
                .with_context(|| format!("pagination: posts of {}", session.blog())),
            // The user-likes endpoint also sees likes the user keeps private.
            DisplayMode::Likes if session.is_own_blog() => {
                remote.user_likes(page).context("pagination: own likes")
            }
            DisplayMode::Likes => remote
                .blog_likes(session.blog(), page)
                .with_context(|| format!("pagination: likes of {}", session.blog())),
            DisplayMode::Dashboard => remote.dashboard(page).context("pagination: dashboard"),
        }
    }
}

pub struct PageItems {
    page_index: u64,
    fetched: usize,
    failure: Option<String>,
    policy: SizePolicy,
    posts: std::vec::IntoIter<Post>,
    current: Option<(Arc<Post>, usize)>,
}

impl PageItems {
    fn new(page_index: u64, posts: Vec<Post>, policy: SizePolicy) -> Self {
        Self {
            page_index,
            fetched: posts.len(),
            failure: None,
            policy,
            posts: posts.into_iter(),
            current: None,
        }
    }

    fn failed(page_index: u64, reason: String, policy: SizePolicy) -> Self {
        Self {
            failure: Some(reason),
            ..Self::new(page_index, Vec::new(), policy)
        }
    }

    pub fn page_index(&self) -> u64 {
        self.page_index
    }

    pub fn fetched(&self) -> usize {
        self.fetched
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    fn next_post(&mut self) -> Option<Arc<Post>> {
        for post in self.posts.by_ref() {
            if post.kind == PostKind::Photo {
                return Some(Arc::new(post));
            }
            debug!("pagination: skipping {} post {}", post.kind.as_str(), post.id);
        }
        None
    }
}

impl Iterator for PageItems {
    type Item = ContentItem;

    fn next(&mut self) -> Option<ContentItem> {
        loop {
            if let Some((post, index)) = self.current.take() {
                if index < post.photos.len() {
                    self.current = Some((post.clone(), index + 1));
                    match self.policy.select(&post.photos[index].sizes) {
                        Some(size) => {
                            return Some(ContentItem::new(post.clone(), index, size.clone()))
                        }
                        None => {
                            debug!(
                                "pagination: no {:?} variant for {}/{} photo {index}",
                                self.policy, post.blog_name, post.id
                            );
                            continue;
                        }
                    }
                }
            }
            let post = self.next_post()?;
            self.current = Some((post, 0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{mock_photo_post, mock_text_post, Endpoint, MockRemote, Photo};
    use crate::session::Manager;
    use pretty_assertions::assert_eq;

    fn sizes(widths: &[u32]) -> Vec<PhotoSize> {
        widths
            .iter()
            .map(|w| PhotoSize {
                width: *w,
                height: *w,
                url: format!("https://media.example/x_{w}.jpg"),
            })
            .collect()
    }

    #[test]
    fn size_policies_pick_variants() {
        let all = sizes(&[1280, 500, 250]);
        assert_eq!(SizePolicy::FullSize.select(&all).unwrap().width, 1280);
        assert_eq!(SizePolicy::Preferred(500).select(&all).unwrap().width, 500);
        assert_eq!(SizePolicy::Preferred(400).select(&all).unwrap().width, 1280);
        assert_eq!(SizePolicy::Exact(500).select(&all).unwrap().width, 500);
        assert!(SizePolicy::Exact(400).select(&all).is_none());
        assert!(SizePolicy::FullSize.select(&[]).is_none());
    }

    #[test]
    fn size_matches_on_url_suffix() {
        let odd = vec![PhotoSize {
            width: 499,
            height: 300,
            url: "https://media.example/tumblr_abc_500.gif".into(),
        }];
        assert!(SizePolicy::Exact(500).select(&odd).is_some());
    }

    #[test]
    fn policy_from_options() {
        assert_eq!(SizePolicy::from_options(true, 500, true), SizePolicy::FullSize);
        assert_eq!(SizePolicy::from_options(false, 400, true), SizePolicy::Exact(400));
        assert_eq!(
            SizePolicy::from_options(false, 250, false),
            SizePolicy::Preferred(250)
        );
    }

    #[test]
    fn multi_photo_posts_yield_one_item_per_photo() {
        let mut post = mock_photo_post("staff", 1, &[1280, 500]);
        post.photos.push(Photo {
            caption: String::new(),
            sizes: sizes(&[640, 500]),
        });
        post.photos.push(Photo {
            caption: String::new(),
            sizes: sizes(&[640]),
        });
        let items: Vec<_> = PageItems::new(0, vec![post], SizePolicy::Exact(500)).collect();
        let indices: Vec<usize> = items.iter().map(|item| item.key().photo_index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn likes_of_own_blog_use_user_endpoint() {
        let remote = Arc::new(
            MockRemote::new("me")
                .with_likes("me", vec![mock_photo_post("staff", 1, &[500])])
                .with_likes("staff", vec![mock_photo_post("me", 2, &[500])]),
        );
        let manager = Manager::new("me");
        let paginator = Paginator::new(remote.clone(), PaginationOptions::default());

        let own = manager.open(DisplayMode::Likes, None);
        assert_eq!(paginator.fetch_page(&own).count(), 1);
        assert_eq!(remote.calls(Endpoint::UserLikes), 1);

        let other = manager.open(DisplayMode::Likes, Some("staff"));
        assert_eq!(paginator.fetch_page(&other).count(), 1);
        assert_eq!(remote.calls(Endpoint::BlogLikes), 1);
    }

    #[test]
    fn dashboard_ignores_blog_name() {
        let remote = Arc::new(
            MockRemote::new("me").with_dashboard(vec![
                mock_photo_post("a", 1, &[500]),
                mock_text_post("b", 2),
            ]),
        );
        let manager = Manager::new("me");
        let paginator = Paginator::new(remote.clone(), PaginationOptions::default());
        let session = manager.open(DisplayMode::Dashboard, Some("ignored"));
        let page = paginator.fetch_page(&session);
        assert_eq!(page.fetched(), 2);
        assert_eq!(page.count(), 1);
    }

    #[test]
    fn failed_page_is_empty_and_still_advances() {
        let remote = Arc::new(MockRemote::new("me"));
        remote.fail(Endpoint::BlogPosts);
        let manager = Manager::new("me");
        let paginator = Paginator::new(remote.clone(), PaginationOptions::default());
        let session = manager.open(DisplayMode::Posts, None);
        let mut page = paginator.fetch_page(&session);
        assert!(page.failure().is_some());
        assert!(page.next().is_none());
        assert_eq!(session.page_index(), 1);
    }
}
