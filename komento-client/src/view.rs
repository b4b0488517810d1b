use crate::api::{AuthorRef, CommentId, ThreadId, ThreadStats, Time, UserId};
use crate::channel::ChannelState;
use crate::optimistic::TempId;
use crate::rest::RequestError;
use crate::tree::{CommentTree, NodeId};

/// Immutable snapshot of one discussion thread, published after every
/// change. This is the only thing a rendering layer needs to look at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThreadView {
    pub thread_id: ThreadId,
    /// Top-level comments newest first, replies nested oldest first.
    pub comments: Vec<CommentView>,
    /// Counters derived from the local tree, always consistent with
    /// `comments`.
    pub stats: ThreadStats,
    /// Last headline numbers the server reported. Advisory: while events
    /// are in flight they may disagree with `stats`.
    pub server_stats: Option<ThreadStats>,
    pub channel: ChannelState,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommentView {
    pub id: NodeId,
    pub author: AuthorRef,
    pub content: String,
    /// Sorted for stable rendering.
    pub liked_by: Vec<UserId>,
    pub created_at: Time,
    pub updated_at: Time,
    pub is_edited: bool,
    pub is_optimistic: bool,
    pub replies: Vec<CommentView>,
}

impl ThreadView {
    pub(crate) fn empty(thread_id: ThreadId) -> ThreadView {
        ThreadView {
            thread_id,
            comments: Vec::new(),
            stats: ThreadStats::default(),
            server_stats: None,
            channel: ChannelState::Disconnected,
        }
    }

    pub(crate) fn materialize(
        thread_id: ThreadId,
        tree: &CommentTree,
        channel: ChannelState,
        server_stats: Option<ThreadStats>,
    ) -> ThreadView {
        ThreadView {
            thread_id,
            comments: tree.roots().iter().map(|id| CommentView::from_tree(tree, *id)).collect(),
            stats: tree.stats(),
            server_stats,
            channel,
        }
    }

    pub fn find(&self, id: NodeId) -> Option<&CommentView> {
        fn search(comments: &[CommentView], id: NodeId) -> Option<&CommentView> {
            for comment in comments {
                if comment.id == id {
                    return Some(comment);
                }
                if let Some(found) = search(&comment.replies, id) {
                    return Some(found);
                }
            }
            None
        }
        search(&self.comments, id)
    }

    /// Total nodes in the snapshot, replies included.
    pub fn comment_count(&self) -> usize {
        fn count(comments: &[CommentView]) -> usize {
            comments.iter().map(|c| 1 + count(&c.replies)).sum()
        }
        count(&self.comments)
    }
}

impl CommentView {
    fn from_tree(tree: &CommentTree, id: NodeId) -> CommentView {
        let node = tree.get(id).expect("tree link points at a missing node");
        let mut liked_by: Vec<UserId> = node.liked_by.iter().copied().collect();
        liked_by.sort();
        CommentView {
            id,
            author: node.author.clone(),
            content: node.content.clone(),
            liked_by,
            created_at: node.created_at,
            updated_at: node.updated_at,
            is_edited: node.is_edited,
            is_optimistic: node.is_optimistic,
            replies: tree
                .children_of(id)
                .unwrap_or(&[])
                .iter()
                .map(|child| CommentView::from_tree(tree, *child))
                .collect(),
        }
    }
}

/// A write that the server rejected or that never reached it. By the time
/// one of these is emitted the optimistic apply has been rolled back, so
/// the embedding application only has to tell the user.
#[derive(Debug)]
pub enum Notice {
    CreationFailed { temp: TempId, error: RequestError },
    EditFailed { id: CommentId, error: RequestError },
    DeleteFailed { id: CommentId, error: RequestError },
    LikeFailed { id: CommentId, error: RequestError },
}

impl Notice {
    pub fn error(&self) -> &RequestError {
        match self {
            Notice::CreationFailed { error, .. }
            | Notice::EditFailed { error, .. }
            | Notice::DeleteFailed { error, .. }
            | Notice::LikeFailed { error, .. } => error,
        }
    }
}
