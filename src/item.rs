use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::data::{Note, PhotoSize, Post};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub blog: String,
    pub post_id: u64,
    pub photo_index: usize,
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.blog, self.post_id, self.photo_index)
    }
}

// State resolved in the background for an item during one refresh cycle.
// `None` means the field has not arrived yet in this cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedFields {
    pub cycle: u64,
    pub liked: Option<bool>,
    pub note_count: Option<u64>,
    pub notes: Option<Vec<Note>>,
    // `Some(None)` once resolved to "not a reblog".
    pub reblog_source: Option<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct ContentItem {
    key: ItemKey,
    post: Arc<Post>,
    image: PhotoSize,
    derived: Arc<RwLock<Arc<DerivedFields>>>,
}

impl ContentItem {
    pub fn new(post: Arc<Post>, photo_index: usize, image: PhotoSize) -> Self {
        Self {
            key: ItemKey {
                blog: post.blog_name.clone(),
                post_id: post.id,
                photo_index,
            },
            post,
            image,
            derived: Arc::new(RwLock::new(Arc::new(DerivedFields::default()))),
        }
    }

    pub fn key(&self) -> &ItemKey {
        &self.key
    }

    pub fn post(&self) -> &Arc<Post> {
        &self.post
    }

    pub fn image(&self) -> &PhotoSize {
        &self.image
    }

    pub fn image_url(&self) -> &str {
        &self.image.url
    }

    // Current derived bundle. Clones share it, so every holder of this item
    // sees the same cycle.
    pub fn derived(&self) -> Arc<DerivedFields> {
        self.derived.read().clone()
    }

    pub(crate) fn begin_cycle(&self, cycle: u64) {
        *self.derived.write() = Arc::new(DerivedFields {
            cycle,
            ..DerivedFields::default()
        });
    }

    // Writes one field into the bundle of `cycle`. Returns false, leaving
    // the bundle alone, when a newer cycle has already replaced it.
    pub(crate) fn apply<F>(&self, cycle: u64, update: F) -> bool
    where
        F: FnOnce(&mut DerivedFields),
    {
        let mut slot = self.derived.write();
        if slot.cycle != cycle {
            return false;
        }
        let mut next = DerivedFields::clone(&slot);
        update(&mut next);
        *slot = Arc::new(next);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::mock_photo_post;

    fn item() -> ContentItem {
        let post = Arc::new(mock_photo_post("staff", 7, &[1280, 500]));
        let size = post.photos[0].sizes[1].clone();
        ContentItem::new(post, 0, size)
    }

    #[test]
    fn key_identifies_photo() {
        let item = item();
        assert_eq!(item.key().to_string(), "staff/7#0");
        assert!(item.image_url().ends_with("7_500.jpg"));
    }

    #[test]
    fn new_cycle_replaces_bundle() {
        let item = item();
        item.begin_cycle(1);
        assert!(item.apply(1, |fields| fields.liked = Some(true)));
        assert_eq!(item.derived().liked, Some(true));

        item.begin_cycle(2);
        assert_eq!(item.derived().liked, None);
        assert_eq!(item.derived().cycle, 2);
    }

    #[test]
    fn stale_cycle_cannot_write() {
        let item = item();
        item.begin_cycle(1);
        item.begin_cycle(2);
        assert!(!item.apply(1, |fields| fields.note_count = Some(9)));
        assert_eq!(item.derived().note_count, None);
    }

    #[test]
    fn clones_share_derived_state() {
        let item = item();
        let copy = item.clone();
        item.begin_cycle(3);
        item.apply(3, |fields| fields.reblog_source = Some(None));
        assert_eq!(copy.derived().reblog_source, Some(None));
    }
}
