use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::api::{
    self, AuthorRef, Comment, CommentId, EditComment, FeedMessage, NewComment, StatsPatch,
    ThreadId, ThreadStats,
};
use crate::channel::{self, ChannelGuard, ChannelSignal, ChannelState, Connector};
use crate::config::{chrono_duration, SyncConfig};
use crate::optimistic::{EditSnapshot, PendingRequest, PendingWrites, RequestId, TempId};
use crate::poll;
use crate::reconcile::{CommentEvent, Reconciler};
use crate::rest::{RequestError, ThreadApi};
use crate::tree::{CommentNode, CommentTree, NodeId};
use crate::view::{Notice, ThreadView};

/// Everything that can reach the engine funnels through this one queue, so
/// the engine only ever applies one change at a time and never needs a lock
/// around the tree.
#[derive(Debug)]
pub(crate) enum Input {
    Cmd(Command),
    Channel(ChannelSignal),
    Done(TaskDone),
}

#[derive(Debug)]
pub(crate) enum Command {
    Create {
        temp: TempId,
        content: String,
        parent: Option<CommentId>,
    },
    Edit {
        id: CommentId,
        content: String,
    },
    Delete {
        id: CommentId,
    },
    ToggleLike {
        id: CommentId,
    },
    Shutdown,
}

/// Completion of a task the engine spawned.
#[derive(Debug)]
pub(crate) enum TaskDone {
    Fetched(Result<FetchedThread, RequestError>),
    Created {
        req: RequestId,
        temp: TempId,
        result: Result<Comment, RequestError>,
    },
    Edited {
        req: RequestId,
        id: CommentId,
        result: Result<Comment, RequestError>,
    },
    Deleted {
        req: RequestId,
        id: CommentId,
        result: Result<(), RequestError>,
    },
    Liked {
        req: RequestId,
        id: CommentId,
        result: Result<Comment, RequestError>,
    },
    Reconnect,
}

#[derive(Debug)]
pub(crate) struct FetchedThread {
    comments: Vec<Comment>,
    stats: Option<ThreadStats>,
}

/// Owner's handle on one running sync engine.
///
/// Commands return immediately; their effect lands in the next published
/// [`ThreadView`]. Dropping the handle shuts the engine down along with its
/// feed connection and timers.
pub struct SyncHandle {
    thread: ThreadId,
    inputs: mpsc::UnboundedSender<Input>,
    views: watch::Receiver<ThreadView>,
    notices: mpsc::UnboundedReceiver<Notice>,
    engine: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Starts a sync engine for one discussion thread and hands back its
    /// handle. `me` is the signed-in author all writes are attributed to.
    pub fn spawn(
        config: SyncConfig,
        thread: ThreadId,
        me: AuthorRef,
        api: Arc<dyn ThreadApi>,
        connector: Arc<dyn Connector>,
    ) -> SyncHandle {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(ThreadView::empty(thread));
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let engine = Engine {
            reconciler: Reconciler::new(chrono_duration(config.match_window), config.max_orphan_retries),
            cfg: config,
            thread,
            me,
            api,
            connector,
            inputs: input_rx,
            feedback: input_tx.clone(),
            views: view_tx,
            notices: notice_tx,
            tree: CommentTree::new(),
            writes: PendingWrites::new(),
            channel_state: ChannelState::Disconnected,
            channel_guard: None,
            buffered: VecDeque::new(),
            fetch_in_flight: false,
            refetch: false,
            hydrated: false,
            server_stats: None,
            dirty: false,
        };
        let handle = tokio::spawn(engine.run());
        SyncHandle {
            thread,
            inputs: input_tx,
            views: view_rx,
            notices: notice_rx,
            engine: Some(handle),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// The latest published snapshot.
    pub fn view(&self) -> ThreadView {
        self.views.borrow().clone()
    }

    /// A subscription to snapshot updates; clone freely.
    pub fn views(&self) -> watch::Receiver<ThreadView> {
        self.views.clone()
    }

    /// Next failure notice. `None` once the engine is gone.
    pub async fn next_notice(&mut self) -> Option<Notice> {
        self.notices.recv().await
    }

    /// Posts a comment, optimistically inserted right away. The returned
    /// placeholder id identifies the comment until the server confirms it.
    pub fn create_comment(&self, content: impl Into<String>, parent: Option<CommentId>) -> TempId {
        let temp = TempId::generate(Utc::now());
        let _ = self.inputs.send(Input::Cmd(Command::Create {
            temp,
            content: content.into(),
            parent,
        }));
        temp
    }

    pub fn edit_comment(&self, id: CommentId, content: impl Into<String>) {
        let _ = self.inputs.send(Input::Cmd(Command::Edit { id, content: content.into() }));
    }

    pub fn delete_comment(&self, id: CommentId) {
        let _ = self.inputs.send(Input::Cmd(Command::Delete { id }));
    }

    pub fn toggle_like(&self, id: CommentId) {
        let _ = self.inputs.send(Input::Cmd(Command::ToggleLike { id }));
    }

    /// Stops the engine and waits for it to wind down.
    pub async fn shutdown(mut self) {
        let _ = self.inputs.send(Input::Cmd(Command::Shutdown));
        if let Some(handle) = self.engine.take() {
            if let Err(err) = handle.await {
                tracing::error!(err = %err, "sync engine task failed");
            }
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        let _ = self.inputs.send(Input::Cmd(Command::Shutdown));
    }
}

struct Engine {
    cfg: SyncConfig,
    thread: ThreadId,
    me: AuthorRef,
    api: Arc<dyn ThreadApi>,
    connector: Arc<dyn Connector>,
    inputs: mpsc::UnboundedReceiver<Input>,
    /// Cloned into every spawned task so completions come back through the
    /// same queue as everything else.
    feedback: mpsc::UnboundedSender<Input>,
    views: watch::Sender<ThreadView>,
    notices: mpsc::UnboundedSender<Notice>,
    tree: CommentTree,
    reconciler: Reconciler,
    writes: PendingWrites,
    channel_state: ChannelState,
    channel_guard: Option<ChannelGuard>,
    /// Events held while a full read is in flight, applied after its diff
    /// so the stale snapshot cannot shadow them.
    buffered: VecDeque<CommentEvent>,
    fetch_in_flight: bool,
    /// A reload was requested while a read was in flight; run another read
    /// when it completes.
    refetch: bool,
    hydrated: bool,
    server_stats: Option<ThreadStats>,
    dirty: bool,
}

impl Engine {
    async fn run(mut self) {
        tracing::debug!(thread = %self.thread.0, "comment sync engine started");
        self.start_channel();
        let mut poll = tokio::time::interval(self.cfg.poll_interval);
        let mut gc = tokio::time::interval(self.cfg.gc_interval);
        loop {
            tokio::select! {
                input = self.inputs.recv() => match input {
                    None | Some(Input::Cmd(Command::Shutdown)) => break,
                    Some(input) => self.on_input(input),
                },
                _ = poll.tick() => self.on_poll_tick(),
                _ = gc.tick() => self.on_gc_tick(),
            }
            if self.dirty {
                self.dirty = false;
                self.publish();
            }
        }
        self.channel_guard.take();
        tracing::debug!(thread = %self.thread.0, "comment sync engine stopped");
    }

    fn publish(&self) {
        let view = ThreadView::materialize(self.thread, &self.tree, self.channel_state, self.server_stats);
        let _ = self.views.send_replace(view);
    }

    fn on_input(&mut self, input: Input) {
        match input {
            Input::Cmd(cmd) => self.on_command(cmd),
            Input::Channel(signal) => self.on_channel(signal),
            Input::Done(done) => self.on_done(done),
        }
    }

    // Live feed

    fn start_channel(&mut self) {
        self.channel_state = ChannelState::Connecting;
        self.channel_guard = Some(channel::start(
            self.connector.clone(),
            self.thread,
            self.cfg.ping_interval,
            self.cfg.pong_deadline,
            self.feedback.clone(),
        ));
        self.dirty = true;
    }

    fn on_channel(&mut self, signal: ChannelSignal) {
        match signal {
            ChannelSignal::Opened => {
                self.channel_state = ChannelState::Connected;
                self.dirty = true;
            }
            ChannelSignal::Subscribed(thread) => {
                self.channel_state = ChannelState::Subscribed(thread);
                self.dirty = true;
                // Whatever happened before this instant sent no feed event
                // here; only a read begun after it covers the gap, so a
                // snapshot taken earlier must not count as the hydrate.
                self.hydrated = false;
                self.request_fetch();
            }
            ChannelSignal::Message(message) => self.on_feed_message(message),
            ChannelSignal::Down(err) => {
                tracing::warn!(thread = %self.thread.0, err = %err, "lost the comment feed, will retry");
                self.channel_state = ChannelState::Disconnected;
                self.channel_guard = None;
                self.hydrated = false;
                self.dirty = true;
                let feedback = self.feedback.clone();
                let spacing = self.cfg.reconnect_spacing;
                tokio::spawn(async move {
                    tokio::time::sleep(spacing).await;
                    let _ = feedback.send(Input::Done(TaskDone::Reconnect));
                });
            }
        }
    }

    fn on_feed_message(&mut self, message: FeedMessage) {
        match message {
            FeedMessage::StatsUpdated { stats } => {
                self.absorb_stats_patch(stats);
                self.dirty = true;
            }
            other => {
                if let Some(event) = CommentEvent::from_feed(other) {
                    self.ingest(event);
                }
            }
        }
    }

    fn absorb_stats_patch(&mut self, patch: StatsPatch) {
        let mut stats = self.server_stats.unwrap_or_default();
        stats.total_comments = patch.comments;
        stats.total_likes = patch.likes;
        self.server_stats = Some(stats);
    }

    // Authoritative events

    fn ingest(&mut self, event: CommentEvent) {
        if self.fetch_in_flight {
            self.buffered.push_back(event);
            return;
        }
        self.apply(event);
    }

    fn apply(&mut self, event: CommentEvent) {
        let applied = self.reconciler.apply(&mut self.tree, event);
        tracing::trace!(thread = %self.thread.0, ?applied, "applied comment event");
        self.dirty = true;
    }

    // Polling and hydration

    fn on_poll_tick(&mut self) {
        if self.fetch_in_flight {
            return;
        }
        if self.channel_state.is_up() && self.hydrated {
            return;
        }
        self.start_fetch();
    }

    /// Starts a full read, or queues one behind the read already in flight;
    /// that read's snapshot was taken earlier and cannot cover this request.
    fn request_fetch(&mut self) {
        if self.fetch_in_flight {
            self.refetch = true;
        } else {
            self.start_fetch();
        }
    }

    fn start_fetch(&mut self) {
        if self.fetch_in_flight {
            return;
        }
        self.fetch_in_flight = true;
        let api = self.api.clone();
        let thread = self.thread;
        let feedback = self.feedback.clone();
        // A hung read must not wedge the poll loop forever.
        let deadline = 2 * self.cfg.poll_interval;
        tokio::spawn(async move {
            let work = async {
                let comments = api.fetch_thread(thread).await?;
                let stats = api.fetch_stats(thread).await.ok();
                Ok::<FetchedThread, RequestError>(FetchedThread { comments, stats })
            };
            let fetched = match tokio::time::timeout(deadline, work).await {
                Ok(result) => result,
                Err(_) => Err(RequestError::unreachable(anyhow::anyhow!("thread fetch timed out"))),
            };
            let _ = feedback.send(Input::Done(TaskDone::Fetched(fetched)));
        });
    }

    fn on_fetched(&mut self, result: Result<FetchedThread, RequestError>) {
        self.fetch_in_flight = false;
        let followup = std::mem::take(&mut self.refetch);
        match result {
            Ok(FetchedThread { comments, stats }) => {
                // A snapshot that predates a queued reload cannot count as
                // the hydrate; the follow-up read below is the one that does.
                if !followup {
                    self.hydrated = true;
                }
                let events = poll::diff_snapshot(&self.tree, &comments);
                if !events.is_empty() {
                    tracing::debug!(thread = %self.thread.0, count = events.len(), "full read produced events");
                }
                for event in events {
                    self.apply(event);
                }
                if let Some(stats) = stats {
                    self.server_stats = Some(stats);
                }
                self.dirty = true;
            }
            Err(err) => {
                tracing::debug!(thread = %self.thread.0, err = %err, "thread fetch failed, staying on the previous snapshot");
            }
        }
        while let Some(event) = self.buffered.pop_front() {
            self.apply(event);
        }
        if followup {
            self.start_fetch();
        }
    }

    // Garbage collection

    fn on_gc_tick(&mut self) {
        let now = Utc::now();
        let max_age = chrono_duration(self.cfg.gc_max_age);
        let swept = self.tree.sweep_stale_optimistic(now, max_age);
        for id in &swept {
            tracing::warn!(
                thread = %self.thread.0,
                comment = %id,
                "dropping optimistic comment whose confirmation never came",
            );
        }
        if !swept.is_empty() {
            self.dirty = true;
        }
        let stale = self.writes.sweep_older_than(now, max_age);
        if stale > 0 {
            tracing::debug!(
                thread = %self.thread.0,
                count = stale,
                "forgot rollback records for requests that never completed",
            );
        }
    }

    // User commands

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Create { temp, content, parent } => self.on_create(temp, content, parent),
            Command::Edit { id, content } => self.on_edit(id, content),
            Command::Delete { id } => self.on_delete(id),
            Command::ToggleLike { id } => self.on_toggle_like(id),
            // run() breaks before dispatching this one
            Command::Shutdown => {}
        }
    }

    fn on_create(&mut self, temp: TempId, content: String, parent: Option<CommentId>) {
        if let Err(error) = api::validate_content(&content) {
            self.reject_create(temp, error.into());
            return;
        }
        if let Some(p) = parent {
            if !self.tree.contains(NodeId::Server(p)) {
                self.reject_create(temp, api::Error::CommentNotFound(p.0).into());
                return;
            }
        }
        let node = CommentNode::optimistic(temp, self.me.clone(), content.clone());
        let inserted = match parent {
            Some(p) => self.tree.insert_under_parent(node, NodeId::Server(p)),
            None => self.tree.insert_top_level(node),
        };
        inserted.expect("parent was just checked and placeholder ids are fresh");
        self.dirty = true;
        let req = self.writes.begin(PendingRequest::Create { temp }, Utc::now());
        let api = self.api.clone();
        let thread = self.thread;
        let feedback = self.feedback.clone();
        tokio::spawn(async move {
            let result = api.create_comment(thread, NewComment { content, parent_id: parent }).await;
            let _ = feedback.send(Input::Done(TaskDone::Created { req, temp, result }));
        });
    }

    fn reject_create(&mut self, temp: TempId, error: RequestError) {
        tracing::debug!(thread = %self.thread.0, temp = %temp, err = %error, "rejecting comment before submission");
        let _ = self.notices.send(Notice::CreationFailed { temp, error });
    }

    fn on_edit(&mut self, id: CommentId, content: String) {
        let node_id = NodeId::Server(id);
        let Some(node) = self.tree.get(node_id) else {
            let _ = self.notices.send(Notice::EditFailed {
                id,
                error: api::Error::CommentNotFound(id.0).into(),
            });
            return;
        };
        if let Err(error) = api::validate_content(&content) {
            let _ = self.notices.send(Notice::EditFailed { id, error: error.into() });
            return;
        }
        let prior = EditSnapshot {
            content: node.content.clone(),
            updated_at: node.updated_at,
            is_edited: node.is_edited,
        };
        let mut edited = node.clone();
        edited.content = content.clone();
        edited.updated_at = Utc::now();
        edited.is_edited = true;
        self.tree
            .replace_by_id(node_id, edited)
            .expect("node was just looked up");
        self.dirty = true;
        let req = self.writes.begin(PendingRequest::Edit { id, prior }, Utc::now());
        let api = self.api.clone();
        let feedback = self.feedback.clone();
        tokio::spawn(async move {
            let result = api.edit_comment(id, EditComment { content }).await;
            let _ = feedback.send(Input::Done(TaskDone::Edited { req, id, result }));
        });
    }

    fn on_delete(&mut self, id: CommentId) {
        match self.tree.remove_by_id(NodeId::Server(id)) {
            None => {
                let _ = self.notices.send(Notice::DeleteFailed {
                    id,
                    error: api::Error::CommentNotFound(id.0).into(),
                });
            }
            Some(detached) => {
                self.dirty = true;
                let req = self.writes.begin(PendingRequest::Delete { id, detached }, Utc::now());
                let api = self.api.clone();
                let feedback = self.feedback.clone();
                tokio::spawn(async move {
                    let result = api.delete_comment(id).await;
                    let _ = feedback.send(Input::Done(TaskDone::Deleted { req, id, result }));
                });
            }
        }
    }

    fn on_toggle_like(&mut self, id: CommentId) {
        let node_id = NodeId::Server(id);
        let Some(node) = self.tree.get(node_id) else {
            let _ = self.notices.send(Notice::LikeFailed {
                id,
                error: api::Error::CommentNotFound(id.0).into(),
            });
            return;
        };
        let prior = node.liked_by.clone();
        let mut next = prior.clone();
        if !next.remove(&self.me.id) {
            next.insert(self.me.id);
        }
        self.tree
            .update_likes(node_id, next)
            .expect("node was just looked up");
        self.dirty = true;
        let req = self.writes.begin(PendingRequest::Like { id, prior_liked_by: prior }, Utc::now());
        let api = self.api.clone();
        let feedback = self.feedback.clone();
        tokio::spawn(async move {
            let result = api.toggle_like(id).await;
            let _ = feedback.send(Input::Done(TaskDone::Liked { req, id, result }));
        });
    }

    // Request completions

    fn on_done(&mut self, done: TaskDone) {
        match done {
            TaskDone::Reconnect => {
                if self.channel_guard.is_none() && !self.channel_state.is_up() {
                    self.start_channel();
                }
            }
            TaskDone::Fetched(result) => self.on_fetched(result),
            TaskDone::Created { req, temp, result } => {
                self.writes.complete(req);
                match result {
                    Ok(comment) => self.ingest(CommentEvent::Created(comment)),
                    Err(error) => {
                        if self.tree.remove_by_id(NodeId::Local(temp)).is_some() {
                            self.dirty = true;
                        }
                        let _ = self.notices.send(Notice::CreationFailed { temp, error });
                    }
                }
            }
            TaskDone::Edited { req, id, result } => {
                let record = self.writes.complete(req);
                match result {
                    Ok(comment) => self.ingest(CommentEvent::Updated(comment)),
                    Err(error) => {
                        if let Some(PendingRequest::Edit { prior, .. }) = record {
                            self.roll_back_edit(id, prior);
                        }
                        let _ = self.notices.send(Notice::EditFailed { id, error });
                    }
                }
            }
            TaskDone::Deleted { req, id, result } => {
                let record = self.writes.complete(req);
                match result {
                    Ok(()) => self.ingest(CommentEvent::Deleted(id)),
                    Err(error) => {
                        if let Some(PendingRequest::Delete { detached, .. }) = record {
                            match self.tree.restore(detached) {
                                Ok(()) => self.dirty = true,
                                Err(err) => tracing::warn!(
                                    thread = %self.thread.0,
                                    comment = %id.0,
                                    err = %err,
                                    "could not restore comment after failed delete",
                                ),
                            }
                        }
                        let _ = self.notices.send(Notice::DeleteFailed { id, error });
                    }
                }
            }
            TaskDone::Liked { req, id, result } => {
                let record = self.writes.complete(req);
                match result {
                    Ok(comment) => self.ingest(CommentEvent::Liked {
                        id: comment.id,
                        liked_by: comment.liked_by,
                    }),
                    Err(error) => {
                        if let Some(PendingRequest::Like { prior_liked_by, .. }) = record {
                            if self.tree.update_likes(NodeId::Server(id), prior_liked_by).is_ok() {
                                self.dirty = true;
                            }
                        }
                        let _ = self.notices.send(Notice::LikeFailed { id, error });
                    }
                }
            }
        }
    }

    fn roll_back_edit(&mut self, id: CommentId, prior: EditSnapshot) {
        let node_id = NodeId::Server(id);
        let Some(node) = self.tree.get(node_id) else { return };
        let mut restored = node.clone();
        restored.content = prior.content;
        restored.updated_at = prior.updated_at;
        restored.is_edited = prior.is_edited;
        if self.tree.replace_by_id(node_id, restored).is_ok() {
            self.dirty = true;
        }
    }
}
