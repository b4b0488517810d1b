use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};

use komento_api::{
    AuthorRef, Comment, CommentId, EditComment, Error, FeedMessage, FeedRequest, NewComment,
    StatsPatch, ThreadId, ThreadStats, Uuid,
};
use komento_client::{Conduit, Connector, RequestError, ThreadApi};

/// An in-memory comment backend. It answers the same REST surface and
/// pushes the same feed messages as the real CMS, which lets the whole
/// sync engine run in a test without a network.
///
/// Cloning is shallow: all clones talk to the same state.
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<Mutex<Inner>>,
    socket_gate: Arc<watch::Sender<bool>>,
}

struct Inner {
    threads: BTreeMap<ThreadId, Vec<Comment>>,
    feeds: Vec<Feed>,
    // fault injection
    unreachable: bool,
    refuse_sockets: bool,
    swallow_writes: bool,
}

struct Feed {
    id: Uuid,
    subscribed: Option<ThreadId>,
    tx: mpsc::UnboundedSender<FeedMessage>,
}

impl Inner {
    fn ensure_reachable(&self) -> Result<(), RequestError> {
        if self.unreachable {
            return Err(RequestError::unreachable(anyhow::anyhow!(
                "mock backend set unreachable"
            )));
        }
        Ok(())
    }

    fn thread_mut(&mut self, thread: ThreadId) -> Result<&mut Vec<Comment>, Error> {
        self.threads
            .get_mut(&thread)
            .ok_or(Error::ThreadNotFound(thread.0))
    }

    fn stats(&self, thread: ThreadId) -> ThreadStats {
        let mut stats = ThreadStats::default();
        for comment in self.threads.get(&thread).map_or(&[][..], Vec::as_slice) {
            stats.total_comments += 1;
            stats.total_likes += comment.liked_by.len() as u64;
            tally_replies(&comment.replies, &mut stats);
        }
        stats
    }

    fn relay(&mut self, thread: ThreadId, message: FeedMessage) {
        self.feeds.retain_mut(|f| {
            if f.subscribed != Some(thread) {
                return true;
            }
            f.tx.send(message.clone()).is_ok()
        });
    }

    fn relay_stats(&mut self, thread: ThreadId) {
        let stats = self.stats(thread);
        self.relay(
            thread,
            FeedMessage::StatsUpdated {
                stats: StatsPatch {
                    comments: stats.total_comments,
                    likes: stats.total_likes,
                },
            },
        );
    }
}

fn tally_replies(replies: &[Comment], stats: &mut ThreadStats) {
    for reply in replies {
        stats.total_replies += 1;
        stats.total_likes += reply.liked_by.len() as u64;
        tally_replies(&reply.replies, stats);
    }
}

fn find_comment(comments: &[Comment], id: CommentId) -> Option<&Comment> {
    for comment in comments {
        if comment.id == id {
            return Some(comment);
        }
        if let Some(found) = find_comment(&comment.replies, id) {
            return Some(found);
        }
    }
    None
}

fn find_comment_mut(comments: &mut [Comment], id: CommentId) -> Option<&mut Comment> {
    for comment in comments {
        if comment.id == id {
            return Some(comment);
        }
        if let Some(found) = find_comment_mut(&mut comment.replies, id) {
            return Some(found);
        }
    }
    None
}

fn remove_comment(comments: &mut Vec<Comment>, id: CommentId) -> Option<Comment> {
    if let Some(ix) = comments.iter().position(|c| c.id == id) {
        return Some(comments.remove(ix));
    }
    for comment in comments {
        if let Some(removed) = remove_comment(&mut comment.replies, id) {
            return Some(removed);
        }
    }
    None
}

/// Feed events carry the comment without its subtree.
fn flat(comment: &Comment) -> Comment {
    Comment {
        replies: Vec::new(),
        ..comment.clone()
    }
}

impl MockServer {
    pub fn new() -> MockServer {
        let (socket_gate, _) = watch::channel(false);
        MockServer {
            inner: Arc::new(Mutex::new(Inner {
                threads: BTreeMap::new(),
                feeds: Vec::new(),
                unreachable: false,
                refuse_sockets: false,
                swallow_writes: false,
            })),
            socket_gate: Arc::new(socket_gate),
        }
    }

    pub async fn admin_create_thread(&self) -> ThreadId {
        let thread = ThreadId(Uuid::new_v4());
        self.inner.lock().await.threads.insert(thread, Vec::new());
        thread
    }

    /// One authenticated user's view on the server. The session is both the
    /// REST client and the feed dialer of that user.
    pub fn session(&self, author: AuthorRef) -> MockSession {
        MockSession {
            server: self.clone(),
            author,
        }
    }

    /// While set, every REST request fails without a verdict.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().await.unreachable = unreachable;
    }

    /// While set, feed dials are refused. Established feeds stay up.
    pub async fn set_refuse_sockets(&self, refuse: bool) {
        self.inner.lock().await.refuse_sockets = refuse;
    }

    /// While set, feed dials neither complete nor fail: they park in the
    /// dial and proceed once the stall is lifted. REST is unaffected.
    pub fn set_stall_sockets(&self, stall: bool) {
        let _ = self.socket_gate.send_replace(stall);
    }

    /// While set, write requests neither succeed nor fail: they hang until
    /// the caller gives up on them.
    pub async fn set_swallow_writes(&self, swallow: bool) {
        self.inner.lock().await.swallow_writes = swallow;
    }

    /// Drops every established feed. Clients notice at their next
    /// keepalive, the way a dead TCP connection is noticed.
    pub async fn kill_feeds(&self) {
        self.inner.lock().await.feeds.clear();
    }

    /// Pushes the `comment.created` event for an existing comment a second
    /// time, as a relay restart would.
    pub async fn replay_created(&self, thread: ThreadId, comment: CommentId) {
        let mut inner = self.inner.lock().await;
        let replayed = inner
            .threads
            .get(&thread)
            .and_then(|comments| find_comment(comments, comment))
            .map(flat);
        if let Some(replayed) = replayed {
            inner.relay(thread, FeedMessage::CommentCreated { comment: replayed });
        }
    }

    pub async fn test_feed_count(&self) -> usize {
        self.inner.lock().await.feeds.len()
    }

    pub async fn test_comment(&self, thread: ThreadId, comment: CommentId) -> Option<Comment> {
        self.inner
            .lock()
            .await
            .threads
            .get(&thread)
            .and_then(|comments| find_comment(comments, comment))
            .cloned()
    }
}

#[derive(Clone)]
pub struct MockSession {
    server: MockServer,
    author: AuthorRef,
}

#[async_trait]
impl ThreadApi for MockSession {
    async fn fetch_thread(&self, thread: ThreadId) -> Result<Vec<Comment>, RequestError> {
        let inner = self.server.inner.lock().await;
        inner.ensure_reachable()?;
        let comments = inner
            .threads
            .get(&thread)
            .ok_or(Error::ThreadNotFound(thread.0))?;
        Ok(comments.clone())
    }

    async fn fetch_stats(&self, thread: ThreadId) -> Result<ThreadStats, RequestError> {
        let inner = self.server.inner.lock().await;
        inner.ensure_reachable()?;
        if !inner.threads.contains_key(&thread) {
            return Err(Error::ThreadNotFound(thread.0).into());
        }
        Ok(inner.stats(thread))
    }

    async fn create_comment(
        &self,
        thread: ThreadId,
        new: NewComment,
    ) -> Result<Comment, RequestError> {
        let mut inner = self.server.inner.lock().await;
        inner.ensure_reachable()?;
        if inner.swallow_writes {
            drop(inner);
            return std::future::pending().await;
        }
        new.validate()?;
        let now = Utc::now();
        let comment = Comment {
            id: CommentId(Uuid::new_v4()),
            thread_id: thread,
            parent_id: new.parent_id,
            author: self.author.clone(),
            content: new.content,
            liked_by: Vec::new(),
            created_at: now,
            updated_at: now,
            is_edited: false,
            replies: Vec::new(),
        };
        {
            let comments = inner.thread_mut(thread)?;
            match comment.parent_id {
                Some(parent) => match find_comment_mut(comments, parent) {
                    Some(slot) => slot.replies.push(comment.clone()),
                    None => return Err(Error::CommentNotFound(parent.0).into()),
                },
                None => comments.insert(0, comment.clone()),
            }
        }
        inner.relay(
            thread,
            FeedMessage::CommentCreated {
                comment: comment.clone(),
            },
        );
        inner.relay_stats(thread);
        Ok(comment)
    }

    async fn edit_comment(
        &self,
        comment: CommentId,
        edit: EditComment,
    ) -> Result<Comment, RequestError> {
        let mut inner = self.server.inner.lock().await;
        inner.ensure_reachable()?;
        if inner.swallow_writes {
            drop(inner);
            return std::future::pending().await;
        }
        edit.validate()?;
        let mut hit = None;
        for (&thread, comments) in inner.threads.iter_mut() {
            if let Some(found) = find_comment_mut(comments, comment) {
                found.content = edit.content.clone();
                found.updated_at = Utc::now();
                found.is_edited = true;
                hit = Some((thread, flat(found)));
                break;
            }
        }
        match hit {
            None => Err(Error::CommentNotFound(comment.0).into()),
            Some((thread, edited)) => {
                inner.relay(
                    thread,
                    FeedMessage::CommentUpdated {
                        comment: edited.clone(),
                    },
                );
                Ok(edited)
            }
        }
    }

    async fn delete_comment(&self, comment: CommentId) -> Result<(), RequestError> {
        let mut inner = self.server.inner.lock().await;
        inner.ensure_reachable()?;
        if inner.swallow_writes {
            drop(inner);
            return std::future::pending().await;
        }
        let mut hit = None;
        for (&thread, comments) in inner.threads.iter_mut() {
            if remove_comment(comments, comment).is_some() {
                hit = Some(thread);
                break;
            }
        }
        match hit {
            None => Err(Error::CommentNotFound(comment.0).into()),
            Some(thread) => {
                inner.relay(thread, FeedMessage::CommentDeleted { id: comment });
                inner.relay_stats(thread);
                Ok(())
            }
        }
    }

    async fn toggle_like(&self, comment: CommentId) -> Result<Comment, RequestError> {
        let mut inner = self.server.inner.lock().await;
        inner.ensure_reachable()?;
        if inner.swallow_writes {
            drop(inner);
            return std::future::pending().await;
        }
        let me = self.author.id;
        let mut hit = None;
        for (&thread, comments) in inner.threads.iter_mut() {
            if let Some(found) = find_comment_mut(comments, comment) {
                match found.liked_by.iter().position(|&id| id == me) {
                    Some(ix) => {
                        found.liked_by.remove(ix);
                    }
                    None => found.liked_by.push(me),
                }
                hit = Some((thread, flat(found)));
                break;
            }
        }
        match hit {
            None => Err(Error::CommentNotFound(comment.0).into()),
            Some((thread, liked)) => {
                inner.relay(
                    thread,
                    FeedMessage::CommentLiked {
                        comment: liked.clone(),
                    },
                );
                inner.relay_stats(thread);
                Ok(liked)
            }
        }
    }
}

#[async_trait]
impl Connector for MockSession {
    async fn connect(&self) -> anyhow::Result<Conduit> {
        let mut gate = self.server.socket_gate.subscribe();
        while *gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                anyhow::bail!("mock server dropped the socket gate");
            }
        }
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let feed = Uuid::new_v4();
        {
            let mut inner = self.server.inner.lock().await;
            if inner.refuse_sockets {
                anyhow::bail!("mock backend refuses sockets");
            }
            inner.feeds.push(Feed {
                id: feed,
                subscribed: None,
                tx: msg_tx.clone(),
            });
        }
        tokio::spawn(pump(self.server.clone(), feed, req_rx, msg_tx));
        Ok(Conduit {
            requests: req_tx,
            messages: msg_rx,
        })
    }
}

/// Server side of one feed: applies subscriptions and answers pings until
/// the client hangs up or the feed is killed out from under it.
async fn pump(
    server: MockServer,
    feed: Uuid,
    mut requests: mpsc::UnboundedReceiver<FeedRequest>,
    pong: mpsc::UnboundedSender<FeedMessage>,
) {
    while let Some(request) = requests.recv().await {
        let mut inner = server.inner.lock().await;
        let Some(slot) = inner.feeds.iter_mut().find(|f| f.id == feed) else {
            // killed; dropping `pong` lets the client notice
            break;
        };
        match request {
            FeedRequest::Subscribe { thread_id } => slot.subscribed = Some(thread_id),
            FeedRequest::Ping => {
                if pong.send(FeedMessage::Pong).is_err() {
                    break;
                }
            }
        }
    }
    server.inner.lock().await.feeds.retain(|f| f.id != feed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use komento_api::UserId;
    use std::time::Duration;

    fn author(name: &str) -> AuthorRef {
        AuthorRef::new(UserId(Uuid::new_v4()), name)
    }

    #[tokio::test]
    async fn threads_order_like_the_real_backend() {
        let server = MockServer::new();
        let thread = server.admin_create_thread().await;
        let session = server.session(author("alice"));

        let first = session
            .create_comment(thread, NewComment::new("first", None))
            .await
            .unwrap();
        let second = session
            .create_comment(thread, NewComment::new("second", None))
            .await
            .unwrap();
        let reply = session
            .create_comment(thread, NewComment::new("under first", Some(first.id)))
            .await
            .unwrap();

        let comments = session.fetch_thread(thread).await.unwrap();
        assert_eq!(
            comments.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![second.id, first.id],
            "top level is newest first"
        );
        assert_eq!(comments[1].replies[0].id, reply.id);

        let stats = session.fetch_stats(thread).await.unwrap();
        assert_eq!(
            stats,
            ThreadStats {
                total_comments: 2,
                total_replies: 1,
                total_likes: 0,
            }
        );
    }

    #[tokio::test]
    async fn relay_reaches_only_subscribed_feeds() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let server = MockServer::new();
            let thread = server.admin_create_thread().await;
            let other_thread = server.admin_create_thread().await;
            let watcher = server.session(author("watcher"));

            let mut subscribed = watcher.connect().await.unwrap();
            subscribed
                .requests
                .send(FeedRequest::Subscribe { thread_id: thread })
                .unwrap();
            let mut elsewhere = watcher.connect().await.unwrap();
            elsewhere
                .requests
                .send(FeedRequest::Subscribe {
                    thread_id: other_thread,
                })
                .unwrap();

            // a pong answer proves the subscribe before it was applied
            subscribed.requests.send(FeedRequest::Ping).unwrap();
            assert_eq!(subscribed.messages.recv().await, Some(FeedMessage::Pong));
            elsewhere.requests.send(FeedRequest::Ping).unwrap();
            assert_eq!(elsewhere.messages.recv().await, Some(FeedMessage::Pong));

            let poster = server.session(author("poster"));
            let posted = poster
                .create_comment(thread, NewComment::new("hi", None))
                .await
                .unwrap();

            match subscribed.messages.recv().await {
                Some(FeedMessage::CommentCreated { comment }) => {
                    assert_eq!(comment.id, posted.id);
                    assert!(comment.replies.is_empty());
                }
                other => panic!("expected the created event, got {other:?}"),
            }
            match subscribed.messages.recv().await {
                Some(FeedMessage::StatsUpdated { stats }) => {
                    assert_eq!(stats.comments, 1);
                }
                other => panic!("expected the stats patch, got {other:?}"),
            }

            // the feed on the other thread saw nothing of it
            elsewhere.requests.send(FeedRequest::Ping).unwrap();
            assert_eq!(elsewhere.messages.recv().await, Some(FeedMessage::Pong));
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn unreachable_cuts_rest_but_not_feeds() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let server = MockServer::new();
            let thread = server.admin_create_thread().await;
            let session = server.session(author("alice"));

            let mut feed = session.connect().await.unwrap();
            feed.requests
                .send(FeedRequest::Subscribe { thread_id: thread })
                .unwrap();

            server.set_unreachable(true).await;
            let err = session.fetch_thread(thread).await.unwrap_err();
            assert!(err.is_unreachable());
            let err = session
                .create_comment(thread, NewComment::new("lost", None))
                .await
                .unwrap_err();
            assert!(err.is_unreachable());

            feed.requests.send(FeedRequest::Ping).unwrap();
            assert_eq!(feed.messages.recv().await, Some(FeedMessage::Pong));

            server.set_unreachable(false).await;
            assert!(session.fetch_thread(thread).await.is_ok());
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn toggle_like_flips_and_unflips() {
        let server = MockServer::new();
        let thread = server.admin_create_thread().await;
        let alice = author("alice");
        let session = server.session(alice.clone());
        let posted = session
            .create_comment(thread, NewComment::new("likeable", None))
            .await
            .unwrap();

        let liked = session.toggle_like(posted.id).await.unwrap();
        assert_eq!(liked.liked_by, vec![alice.id]);
        let unliked = session.toggle_like(posted.id).await.unwrap();
        assert!(unliked.liked_by.is_empty());
    }

    #[tokio::test]
    async fn killed_feeds_unregister_on_the_next_ping() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let server = MockServer::new();
            let session = server.session(author("alice"));
            let mut feed = session.connect().await.unwrap();
            assert_eq!(server.test_feed_count().await, 1);

            server.kill_feeds().await;
            feed.requests.send(FeedRequest::Ping).unwrap();
            assert_eq!(feed.messages.recv().await, None);
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn stalled_sockets_park_the_dial_until_released() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let server = MockServer::new();
            server.set_stall_sockets(true);
            let session = server.session(author("alice"));

            let dial = tokio::spawn({
                let session = session.clone();
                async move { session.connect().await }
            });
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(!dial.is_finished(), "dial must wait out the stall");
            assert_eq!(server.test_feed_count().await, 0);

            server.set_stall_sockets(false);
            dial.await.unwrap().unwrap();
            assert_eq!(server.test_feed_count().await, 1);
        })
        .await
        .unwrap();
    }
}
