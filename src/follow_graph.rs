use std::sync::Arc;

use anyhow::{Context, Result};
use indexmap::IndexSet;
use log::{debug, info};
use parking_lot::Mutex;

use crate::data::{PageRequest, RelationPage, RemoteFeed};

pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Following,
    Followers,
}

impl Relation {
    pub fn label(&self) -> &'static str {
        match self {
            Relation::Following => "Following",
            Relation::Followers => "Followers",
        }
    }
}

#[derive(Default)]
struct GraphState {
    following: Option<IndexSet<String>>,
    followers: Option<IndexSet<String>>,
}

impl GraphState {
    fn slot(&mut self, relation: Relation) -> &mut Option<IndexSet<String>> {
        match relation {
            Relation::Following => &mut self.following,
            Relation::Followers => &mut self.followers,
        }
    }
}

// Who the signed-in user follows and who follows them.
// Each set is built on first read by paginating the remote relationship
// endpoint to the end, then patched in place by `FollowGraph::follow` and
// `FollowGraph::unfollow`. Changes made from other clients are not seen
// until `FollowGraph::reset`. One lock covers every read and patch of
// both sets.
pub struct FollowGraph {
    remote: Arc<dyn RemoteFeed>,
    owner_blog: String,
    page_size: u32,
    state: Mutex<GraphState>,
}

impl FollowGraph {
    pub fn new(remote: Arc<dyn RemoteFeed>, owner_blog: impl Into<String>, page_size: u32) -> Self {
        let page_size = if page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size
        };
        Self {
            remote,
            owner_blog: owner_blog.into(),
            page_size,
            state: Mutex::new(GraphState::default()),
        }
    }

    pub fn owner_blog(&self) -> &str {
        &self.owner_blog
    }

    // Blogs the user follows, most recently followed first.
    pub fn following(&self) -> Result<Vec<String>> {
        self.snapshot(Relation::Following)
    }

    pub fn followers(&self) -> Result<Vec<String>> {
        self.snapshot(Relation::Followers)
    }

    pub fn relation(&self, relation: Relation) -> Result<Vec<String>> {
        self.snapshot(relation)
    }

    pub fn is_following(&self, blog: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let set = self.populated(&mut state, Relation::Following)?;
        Ok(set.contains(blog))
    }

    pub fn is_populated(&self, relation: Relation) -> bool {
        self.state.lock().slot(relation).is_some()
    }

    pub fn follow(&self, blog: &str) -> Result<()> {
        self.remote
            .follow(blog)
            .with_context(|| format!("follow graph: follow {blog}"))?;
        let mut state = self.state.lock();
        if let Some(set) = state.following.as_mut() {
            let mut patched = IndexSet::with_capacity(set.len() + 1);
            patched.insert(blog.to_string());
            patched.extend(std::mem::take(set).into_iter().filter(|name| name != blog));
            *set = patched;
        }
        info!("follow graph: now following {blog}");
        Ok(())
    }

    pub fn unfollow(&self, blog: &str) -> Result<()> {
        self.remote
            .unfollow(blog)
            .with_context(|| format!("follow graph: unfollow {blog}"))?;
        let mut state = self.state.lock();
        if let Some(set) = state.following.as_mut() {
            set.shift_remove(blog);
        }
        info!("follow graph: unfollowed {blog}");
        Ok(())
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.following = None;
        state.followers = None;
    }

    fn snapshot(&self, relation: Relation) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        let set = self.populated(&mut state, relation)?;
        Ok(set.iter().cloned().collect())
    }

    fn populated<'a>(
        &self,
        state: &'a mut GraphState,
        relation: Relation,
    ) -> Result<&'a IndexSet<String>> {
        let slot = state.slot(relation);
        if slot.is_none() {
            *slot = Some(self.load(relation)?);
        }
        Ok(slot.get_or_insert_with(IndexSet::new))
    }

    fn load(&self, relation: Relation) -> Result<IndexSet<String>> {
        let mut names = IndexSet::new();
        let mut offset = 0u64;
        loop {
            let page = PageRequest::new(offset, self.page_size);
            let RelationPage { total, names: batch } = match relation {
                Relation::Following => self.remote.following(page),
                Relation::Followers => self.remote.followers(&self.owner_blog, page),
            }
            .with_context(|| {
                format!("follow graph: load {} at offset {offset}", relation.label())
            })?;

            let fetched = batch.len();
            names.extend(batch);
            offset += u64::from(self.page_size);
            debug!(
                "follow graph: {} page at {} gave {fetched} of {total}",
                relation.label(),
                offset - u64::from(self.page_size)
            );
            if offset >= total || fetched == 0 {
                break;
            }
        }
        info!(
            "follow graph: loaded {} {}",
            names.len(),
            relation.label().to_lowercase()
        );
        Ok(names)
    }
}
