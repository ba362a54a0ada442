use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::item::ContentItem;
use crate::refresh::FieldUpdate;
use crate::resolve::Avatar;
use crate::session::SessionId;
use crate::task::{AsyncResult, TaskKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSummary {
    pub page_index: u64,
    pub fetched: usize,
    pub delivered: usize,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Preview {
    Avatar { blog: String, avatar: Avatar },
    Title { blog: String, title: AsyncResult<String> },
    Icon { blog: String, avatar: Avatar },
}

impl Preview {
    pub fn blog(&self) -> &str {
        match self {
            Preview::Avatar { blog, .. }
            | Preview::Title { blog, .. }
            | Preview::Icon { blog, .. } => blog,
        }
    }
}

// Presentation layer callbacks. Every method is called from a background
// worker, some while engine locks are held: implementations hand off to
// their own thread and must not call back into the engine synchronously.
pub trait ViewSink: Send + Sync {
    fn on_item_loaded(&self, session: SessionId, item: ContentItem);

    fn on_refresh_field(&self, update: FieldUpdate);

    fn on_page_loaded(&self, _session: SessionId, _summary: PageSummary) {}

    fn on_action_finished(
        &self,
        _session: SessionId,
        _action: TaskKind,
        _result: AsyncResult<()>,
    ) {
    }

    fn on_preview(&self, _element: &str, _preview: Preview) {}
}

#[derive(Debug, Clone)]
pub enum SinkEvent {
    Item {
        session: SessionId,
        item: ContentItem,
    },
    Page {
        session: SessionId,
        summary: PageSummary,
    },
    Field(FieldUpdate),
    Action {
        session: SessionId,
        action: TaskKind,
        result: AsyncResult<()>,
    },
    Preview {
        element: String,
        preview: Preview,
    },
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn channel() -> (Self, Receiver<SinkEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) {
        // The receiver going away just means nobody is watching any more.
        let _ = self.tx.send(event);
    }
}

impl ViewSink for ChannelSink {
    fn on_item_loaded(&self, session: SessionId, item: ContentItem) {
        self.send(SinkEvent::Item { session, item });
    }

    fn on_refresh_field(&self, update: FieldUpdate) {
        self.send(SinkEvent::Field(update));
    }

    fn on_page_loaded(&self, session: SessionId, summary: PageSummary) {
        self.send(SinkEvent::Page { session, summary });
    }

    fn on_action_finished(&self, session: SessionId, action: TaskKind, result: AsyncResult<()>) {
        self.send(SinkEvent::Action {
            session,
            action,
            result,
        });
    }

    fn on_preview(&self, element: &str, preview: Preview) {
        self.send(SinkEvent::Preview {
            element: element.to_string(),
            preview,
        });
    }
}
