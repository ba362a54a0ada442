use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::data::RemoteFeed;
use crate::follow_graph::{FollowGraph, Relation};
use crate::item::{ContentItem, DerivedFields, ItemKey};
use crate::resolve::{
    self, CurrentUserMenu, FollowState, LinkMenu, ModeMenu, NoteInfo, ReblogSource,
};
use crate::session::{SessionId, ViewingSession};
use crate::sink::ViewSink;
use crate::task::{AsyncResult, CancelToken, Spawner, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    LikeState,
    Notes,
    ReblogSource,
    FollowState,
    FollowingMenu,
    FollowersMenu,
    ModeMenu,
    CurrentUser,
}

impl Field {
    pub const ITEM: [Field; 3] = [Field::LikeState, Field::Notes, Field::ReblogSource];
    pub const SESSION: [Field; 5] = [
        Field::FollowState,
        Field::FollowingMenu,
        Field::FollowersMenu,
        Field::ModeMenu,
        Field::CurrentUser,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Field::LikeState => "like-state",
            Field::Notes => "notes",
            Field::ReblogSource => "reblog-source",
            Field::FollowState => "follow-state",
            Field::FollowingMenu => "following-menu",
            Field::FollowersMenu => "followers-menu",
            Field::ModeMenu => "mode-menu",
            Field::CurrentUser => "current-user",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    LikeState(bool),
    Notes(NoteInfo),
    ReblogSource(Option<ReblogSource>),
    FollowState(FollowState),
    FollowingMenu(LinkMenu),
    FollowersMenu(LinkMenu),
    ModeMenu(ModeMenu),
    CurrentUser(CurrentUserMenu),
}

impl FieldValue {
    pub fn field(&self) -> Field {
        match self {
            FieldValue::LikeState(_) => Field::LikeState,
            FieldValue::Notes(_) => Field::Notes,
            FieldValue::ReblogSource(_) => Field::ReblogSource,
            FieldValue::FollowState(_) => Field::FollowState,
            FieldValue::FollowingMenu(_) => Field::FollowingMenu,
            FieldValue::FollowersMenu(_) => Field::FollowersMenu,
            FieldValue::ModeMenu(_) => Field::ModeMenu,
            FieldValue::CurrentUser(_) => Field::CurrentUser,
        }
    }

    fn write_into(&self, fields: &mut DerivedFields) {
        match self {
            FieldValue::LikeState(liked) => fields.liked = Some(*liked),
            FieldValue::Notes(info) => {
                fields.note_count = Some(info.count);
                fields.notes = Some(info.notes.clone());
            }
            FieldValue::ReblogSource(source) => {
                fields.reblog_source = Some(source.as_ref().map(|source| source.blog.clone()));
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubjectId {
    Session(SessionId),
    Item { session: SessionId, key: ItemKey },
}

impl SubjectId {
    pub fn session(&self) -> SessionId {
        match self {
            SubjectId::Session(id) => *id,
            SubjectId::Item { session, .. } => *session,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RefreshSubject {
    Session(Arc<ViewingSession>),
    Item {
        session: Arc<ViewingSession>,
        item: ContentItem,
    },
}

impl RefreshSubject {
    pub fn id(&self) -> SubjectId {
        match self {
            RefreshSubject::Session(session) => SubjectId::Session(session.id()),
            RefreshSubject::Item { session, item } => SubjectId::Item {
                session: session.id(),
                key: item.key().clone(),
            },
        }
    }

    pub fn fields(&self) -> &'static [Field] {
        match self {
            RefreshSubject::Session(_) => &Field::SESSION,
            RefreshSubject::Item { .. } => &Field::ITEM,
        }
    }

    pub fn session(&self) -> &Arc<ViewingSession> {
        match self {
            RefreshSubject::Session(session) | RefreshSubject::Item { session, .. } => session,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub subject: SubjectId,
    pub cycle: u64,
    pub field: Field,
    pub result: AsyncResult<FieldValue>,
}

impl FieldUpdate {
    pub fn is_consistent(&self) -> bool {
        match &self.result {
            AsyncResult::Success(value) => value.field() == self.field,
            _ => true,
        }
    }
}

pub struct RefreshContext {
    pub remote: Arc<dyn RemoteFeed>,
    pub graph: Arc<FollowGraph>,
    pub user: String,
    pub max_links: usize,
}

struct Cycle {
    number: u64,
    cancel: CancelToken,
    pending: usize,
}

struct Inner {
    spawner: Spawner,
    context: RefreshContext,
    sink: Arc<dyn ViewSink>,
    cycles: Mutex<HashMap<SubjectId, Cycle>>,
    next_cycle: AtomicU64,
}

impl Inner {
    // The cycle table stays locked until the sink returns, so nothing from
    // cycle N reaches the sink once `refresh` has started cycle N+1.
    fn deliver(
        &self,
        subject: &RefreshSubject,
        cycle: u64,
        field: Field,
        result: AsyncResult<FieldValue>,
    ) {
        let id = subject.id();
        let mut cycles = self.cycles.lock();
        let remaining = match cycles.get_mut(&id) {
            Some(current) if current.number == cycle => {
                current.pending = current.pending.saturating_sub(1);
                current.pending
            }
            _ => {
                debug!("refresh: dropping stale {} for cycle {cycle}", field.name());
                return;
            }
        };
        // Item entries go once their cycle is complete; sessions keep theirs
        // until closed.
        if remaining == 0 && matches!(id, SubjectId::Item { .. }) {
            cycles.remove(&id);
        }
        if result.is_cancelled() {
            return;
        }
        if let (RefreshSubject::Item { item, .. }, AsyncResult::Success(value)) = (subject, &result)
        {
            if !item.apply(cycle, |fields| value.write_into(fields)) {
                debug!("refresh: {} bundle moved past cycle {cycle}", item.key());
                return;
            }
        }
        self.sink.on_refresh_field(FieldUpdate {
            subject: id,
            cycle,
            field,
            result,
        });
    }
}

// Fans a refresh out into one background task per field. Tasks are not
// joined: each result goes to the sink as soon as it is ready, provided no
// newer cycle for the same subject has started in the meantime.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(spawner: Spawner, context: RefreshContext, sink: Arc<dyn ViewSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                spawner,
                context,
                sink,
                cycles: Mutex::new(HashMap::new()),
                next_cycle: AtomicU64::new(1),
            }),
        }
    }

    // Starts a new cycle for `subject`, cancelling whatever the previous one
    // still has outstanding, and returns the cycle number.
    pub fn refresh(&self, subject: RefreshSubject) -> u64 {
        let cycle = self.inner.next_cycle.fetch_add(1, Ordering::SeqCst);
        let token = CancelToken::new();
        let id = subject.id();
        {
            let mut cycles = self.inner.cycles.lock();
            let entry = Cycle {
                number: cycle,
                cancel: token.clone(),
                pending: subject.fields().len(),
            };
            if let Some(previous) = cycles.insert(id.clone(), entry) {
                previous.cancel.cancel();
            }
            if let RefreshSubject::Item { item, .. } = &subject {
                item.begin_cycle(cycle);
            }
        }
        debug!("refresh: cycle {cycle} for {id:?}");

        for &field in subject.fields() {
            let inner = self.inner.clone();
            let subject = subject.clone();
            let token = token.clone();
            self.inner.spawner.spawn(TaskKind::Refresh(field), move || {
                let result = resolve_field(&inner.context, &subject, field, &token);
                inner.deliver(&subject, cycle, field, result);
            });
        }
        cycle
    }

    pub fn current_cycle(&self, subject: &SubjectId) -> Option<u64> {
        self.inner.cycles.lock().get(subject).map(|current| current.number)
    }

    pub fn forget(&self, session: SessionId) -> usize {
        let mut cycles = self.inner.cycles.lock();
        let before = cycles.len();
        cycles.retain(|subject, current| {
            if subject.session() == session {
                current.cancel.cancel();
                false
            } else {
                true
            }
        });
        before - cycles.len()
    }
}

fn resolve_field(
    context: &RefreshContext,
    subject: &RefreshSubject,
    field: Field,
    cancel: &CancelToken,
) -> AsyncResult<FieldValue> {
    let remote = context.remote.as_ref();
    let session = subject.session();
    match (field, subject) {
        (Field::LikeState, RefreshSubject::Item { item, .. }) => {
            resolve::like_state(remote, item.key(), cancel).map(FieldValue::LikeState)
        }
        (Field::Notes, RefreshSubject::Item { item, .. }) => {
            resolve::notes(remote, item.key(), cancel).map(FieldValue::Notes)
        }
        (Field::ReblogSource, RefreshSubject::Item { item, .. }) => {
            resolve::reblog_source(remote, item.post(), cancel).map(FieldValue::ReblogSource)
        }
        (Field::FollowState, _) => {
            resolve::follow_state(&context.graph, session, cancel).map(FieldValue::FollowState)
        }
        (Field::FollowingMenu, _) => {
            let max = context.max_links;
            resolve::relationship_menu(&context.graph, Relation::Following, max, cancel)
                .map(FieldValue::FollowingMenu)
        }
        (Field::FollowersMenu, _) => {
            let max = context.max_links;
            resolve::relationship_menu(&context.graph, Relation::Followers, max, cancel)
                .map(FieldValue::FollowersMenu)
        }
        (Field::ModeMenu, _) => {
            resolve::mode_menu(remote, session, cancel).map(FieldValue::ModeMenu)
        }
        (Field::CurrentUser, _) => {
            resolve::current_user(remote, &context.user, session, cancel)
                .map(FieldValue::CurrentUser)
        }
        (field, _) => AsyncResult::Failed(format!("refresh: {} needs an item", field.name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{mock_photo_post, Endpoint, MockRemote};
    use crate::session::{DisplayMode, Manager};
    use crate::sink::{ChannelSink, SinkEvent};
    use crate::task::TaskPool;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        remote: Arc<MockRemote>,
        coordinator: RefreshCoordinator,
        events: Receiver<SinkEvent>,
        manager: Manager,
        _pool: TaskPool,
    }

    fn fixture(remote: MockRemote) -> Fixture {
        let remote = Arc::new(remote);
        let pool = TaskPool::new(4).unwrap();
        let (sink, events) = ChannelSink::channel();
        let context = RefreshContext {
            remote: remote.clone(),
            graph: Arc::new(FollowGraph::new(remote.clone(), "me", 20)),
            user: "me".into(),
            max_links: 30,
        };
        Fixture {
            coordinator: RefreshCoordinator::new(pool.spawner(), context, Arc::new(sink)),
            remote,
            events,
            manager: Manager::new("me"),
            _pool: pool,
        }
    }

    fn collect(events: &Receiver<SinkEvent>, n: usize) -> Vec<FieldUpdate> {
        (0..n)
            .map(|_| match events.recv_timeout(WAIT).unwrap() {
                SinkEvent::Field(update) => update,
                other => panic!("unexpected event {other:?}"),
            })
            .collect()
    }

    fn item_of(remote: &MockRemote, blog: &str, id: u64) -> ContentItem {
        let post = remote.post_detail(blog, id).unwrap();
        let size = post.photos[0].sizes[0].clone();
        ContentItem::new(Arc::new(post), 0, size)
    }

    #[test]
    fn session_refresh_delivers_every_field_once() {
        let fx = fixture(MockRemote::new("me").with_following(&["staff"]));
        let session = fx.manager.open(DisplayMode::Posts, Some("staff"));
        let cycle = fx.coordinator.refresh(RefreshSubject::Session(session.clone()));

        let mut updates = collect(&fx.events, Field::SESSION.len());
        updates.sort_by_key(|update| update.field.name());
        let fields: Vec<Field> = updates.iter().map(|update| update.field).collect();
        let mut expected = Field::SESSION.to_vec();
        expected.sort_by_key(|field| field.name());
        assert_eq!(fields, expected);
        assert!(updates.iter().all(|update| update.cycle == cycle && update.is_consistent()));

        let follow = updates.iter().find(|u| u.field == Field::FollowState).unwrap();
        assert_eq!(
            follow.result,
            AsyncResult::Success(FieldValue::FollowState(FollowState::Following))
        );
    }

    #[test]
    fn item_refresh_fills_derived_bundle() {
        let mut post = mock_photo_post("staff", 9, &[500]);
        post.reblogged_from = Some("origin".into());
        post.note_count = 3;
        let fx = fixture(MockRemote::new("me").with_posts("staff", vec![post]).with_liked(9));
        let session = fx.manager.open(DisplayMode::Posts, Some("staff"));
        let item = item_of(&fx.remote, "staff", 9);

        let cycle = fx.coordinator.refresh(RefreshSubject::Item {
            session,
            item: item.clone(),
        });
        let updates = collect(&fx.events, Field::ITEM.len());
        assert!(updates.iter().all(FieldUpdate::is_consistent));

        let derived = item.derived();
        assert_eq!(derived.cycle, cycle);
        assert_eq!(derived.liked, Some(true));
        assert_eq!(derived.note_count, Some(3));
        assert_eq!(derived.reblog_source, Some(Some("origin".to_string())));
    }

    #[test]
    fn newer_cycle_drops_late_results() {
        let mut post = mock_photo_post("staff", 1, &[500]);
        post.reblogged_from = Some("origin".into());
        let fx = fixture(MockRemote::new("me").with_posts("staff", vec![post]));
        let session = fx.manager.open(DisplayMode::Posts, Some("staff"));
        let item = item_of(&fx.remote, "staff", 1);
        let detail_gate = fx.remote.gate(Endpoint::PostDetail);
        let avatar_gate = fx.remote.gate(Endpoint::Avatar);

        let first = fx.coordinator.refresh(RefreshSubject::Item {
            session: session.clone(),
            item: item.clone(),
        });
        let second = fx.coordinator.refresh(RefreshSubject::Item {
            session,
            item: item.clone(),
        });
        assert!(second > first);
        drop(detail_gate);
        drop(avatar_gate);

        let updates = collect(&fx.events, Field::ITEM.len());
        assert!(updates.iter().all(|update| update.cycle == second));
        assert!(fx.events.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(item.derived().cycle, second);
    }

    #[test]
    fn completed_item_cycles_are_pruned() {
        let post = mock_photo_post("staff", 4, &[500]);
        let fx = fixture(MockRemote::new("me").with_posts("staff", vec![post]));
        let session = fx.manager.open(DisplayMode::Posts, Some("staff"));
        let item = item_of(&fx.remote, "staff", 4);
        let item_id = SubjectId::Item {
            session: session.id(),
            key: item.key().clone(),
        };
        let session_id = SubjectId::Session(session.id());

        fx.coordinator.refresh(RefreshSubject::Item {
            session: session.clone(),
            item,
        });
        collect(&fx.events, Field::ITEM.len());
        assert_eq!(fx.coordinator.current_cycle(&item_id), None);

        let cycle = fx.coordinator.refresh(RefreshSubject::Session(session));
        collect(&fx.events, Field::SESSION.len());
        assert_eq!(fx.coordinator.current_cycle(&session_id), Some(cycle));
    }

    struct StallingSink {
        stalled: AtomicBool,
        entered: Sender<()>,
        release: Receiver<()>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ViewSink for StallingSink {
        fn on_item_loaded(&self, _session: SessionId, _item: ContentItem) {}

        fn on_refresh_field(&self, update: FieldUpdate) {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                let _ = self.entered.send(());
                let _ = self.release.recv();
            }
            self.log.lock().push(format!("cycle {}", update.cycle));
        }
    }

    #[test]
    fn restart_waits_for_field_in_delivery() {
        let remote = Arc::new(MockRemote::new("me").with_following(&["staff"]));
        let pool = TaskPool::new(4).unwrap();
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = StallingSink {
            stalled: AtomicBool::new(false),
            entered: entered_tx,
            release: release_rx,
            log: log.clone(),
        };
        let context = RefreshContext {
            remote: remote.clone(),
            graph: Arc::new(FollowGraph::new(remote, "me", 20)),
            user: "me".into(),
            max_links: 30,
        };
        let coordinator = RefreshCoordinator::new(pool.spawner(), context, Arc::new(sink));
        let session = Manager::new("me").open(DisplayMode::Posts, Some("staff"));

        let first = coordinator.refresh(RefreshSubject::Session(session.clone()));
        entered_rx.recv_timeout(WAIT).unwrap();

        let restarter = {
            let coordinator = coordinator.clone();
            let log = log.clone();
            let session = session.clone();
            thread::spawn(move || {
                let cycle = coordinator.refresh(RefreshSubject::Session(session));
                log.lock().push("restart".to_string());
                cycle
            })
        };
        thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();
        let second = restarter.join().unwrap();

        let done = format!("cycle {second}");
        let deadline = Instant::now() + WAIT;
        while log.lock().iter().filter(|entry| **entry == done).count() < Field::SESSION.len() {
            assert!(Instant::now() < deadline, "cycle {second} never completed");
            thread::sleep(Duration::from_millis(5));
        }

        let log = log.lock().clone();
        let restart = log.iter().position(|entry| entry == "restart").unwrap();
        let stale = format!("cycle {first}");
        assert!(log[..restart].contains(&stale));
        assert!(!log[restart..].contains(&stale));
    }

    #[test]
    fn forget_cancels_session_cycles() {
        let fx = fixture(MockRemote::new("me"));
        let session = fx.manager.open(DisplayMode::Posts, Some("staff"));
        let gate = fx.remote.gate(Endpoint::BlogInfo);
        fx.coordinator.refresh(RefreshSubject::Session(session.clone()));
        let id = SubjectId::Session(session.id());
        assert!(fx.coordinator.current_cycle(&id).is_some());
        assert_eq!(fx.coordinator.forget(session.id()), 1);
        assert!(fx.coordinator.current_cycle(&id).is_none());
        drop(gate);
    }

    #[test]
    fn failures_are_reported_per_field() {
        let fx = fixture(MockRemote::new("me"));
        fx.remote.fail(Endpoint::Following);
        let session = fx.manager.open(DisplayMode::Posts, Some("staff"));
        fx.coordinator.refresh(RefreshSubject::Session(session));
        let updates = collect(&fx.events, Field::SESSION.len());
        let menu = updates.iter().find(|u| u.field == Field::FollowingMenu).unwrap();
        assert!(menu.result.is_failed());
        let followers = updates.iter().find(|u| u.field == Field::FollowersMenu).unwrap();
        assert!(followers.result.is_success());
    }
}
