use std::collections::{HashMap, HashSet, VecDeque};

use crate::api::{Comment, CommentId, FeedMessage, UserId};
use crate::optimistic::TempId;
use crate::tree::{CommentNode, CommentTree, NodeId};

/// Authoritative change to one comment, as reported by the server. Both the
/// live feed and the polling diff speak this vocabulary, so everything
/// downstream of here is ignorant of which path delivered a change.
#[derive(Clone, Debug)]
pub enum CommentEvent {
    Created(Comment),
    Updated(Comment),
    Deleted(CommentId),
    Liked { id: CommentId, liked_by: Vec<UserId> },
}

impl CommentEvent {
    /// Extracts the comment change from a feed message, if it carries one.
    /// Like messages are narrowed to the like set here: whatever else the
    /// payload says about the comment must not overwrite local state.
    pub fn from_feed(message: FeedMessage) -> Option<CommentEvent> {
        match message {
            FeedMessage::CommentCreated { comment } => Some(CommentEvent::Created(comment)),
            FeedMessage::CommentUpdated { comment } => Some(CommentEvent::Updated(comment)),
            FeedMessage::CommentDeleted { id } => Some(CommentEvent::Deleted(id)),
            FeedMessage::CommentLiked { comment } => Some(CommentEvent::Liked {
                id: comment.id,
                liked_by: comment.liked_by,
            }),
            FeedMessage::StatsUpdated { .. } | FeedMessage::Pong => None,
        }
    }
}

/// What applying one event did to the tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Applied {
    /// A genuinely new node was inserted.
    Created(CommentId),
    /// An optimistic placeholder was replaced by its confirmed comment.
    Confirmed(TempId, CommentId),
    /// An existing node was overwritten in place.
    Replaced(CommentId),
    Removed(CommentId),
    Liked(CommentId),
    /// Held back until the node it refers to shows up.
    Queued(CommentId),
    /// Duplicate or stale event, absorbed without touching the tree.
    Noop,
}

struct PendingCreate {
    comment: Comment,
    retries: u32,
}

enum Settled {
    Inserted(NodeId),
    Confirmed(TempId),
    ParentMissing(NodeId),
}

/// Applies authoritative comment events to a [`CommentTree`].
///
/// Every event is keyed by server id, so applying the same event twice is
/// harmless. Creates that arrive before their parent are parked and retried
/// whenever a later insert succeeds; after too many fruitless retries they
/// are dropped with a warning. Creates are also matched against optimistic
/// placeholders (same parent, same content, creation instants within the
/// match window) so a comment the local user just posted settles into its
/// placeholder instead of appearing twice.
pub struct Reconciler {
    window: chrono::Duration,
    max_orphan_retries: u32,
    pending_parents: VecDeque<PendingCreate>,
    pending_likes: HashMap<CommentId, HashSet<UserId>>,
}

impl Reconciler {
    pub fn new(window: chrono::Duration, max_orphan_retries: u32) -> Reconciler {
        Reconciler {
            window,
            max_orphan_retries,
            pending_parents: VecDeque::new(),
            pending_likes: HashMap::new(),
        }
    }

    /// Number of creates currently waiting for their parent.
    pub fn pending(&self) -> usize {
        self.pending_parents.len()
    }

    pub fn apply(&mut self, tree: &mut CommentTree, event: CommentEvent) -> Applied {
        match event {
            CommentEvent::Created(comment) => self.on_created(tree, comment),
            CommentEvent::Updated(comment) => self.on_updated(tree, comment),
            CommentEvent::Deleted(id) => self.on_deleted(tree, id),
            CommentEvent::Liked { id, liked_by } => self.on_liked(tree, id, liked_by),
        }
    }

    fn on_created(&mut self, tree: &mut CommentTree, comment: Comment) -> Applied {
        let id = comment.id;
        if tree.contains(NodeId::Server(id)) {
            return Applied::Noop;
        }
        match self.settle(tree, &comment) {
            Settled::Inserted(node) => {
                self.drain_pending(tree);
                match node {
                    NodeId::Server(id) => Applied::Created(id),
                    NodeId::Local(_) => Applied::Noop,
                }
            }
            Settled::Confirmed(temp) => {
                self.drain_pending(tree);
                Applied::Confirmed(temp, id)
            }
            Settled::ParentMissing(parent) => {
                tracing::debug!(comment = %id.0, parent = %parent, "holding comment until its parent arrives");
                self.pending_parents.push_back(PendingCreate { comment, retries: 0 });
                Applied::Queued(id)
            }
        }
    }

    fn on_updated(&mut self, tree: &mut CommentTree, comment: Comment) -> Applied {
        let id = NodeId::Server(comment.id);
        match tree.get(id) {
            Some(current) => {
                // Likes travel on their own events; an edit must not roll
                // the like set back to what it was when the edit was made.
                let mut node = CommentNode::confirmed(&comment);
                node.liked_by = current.liked_by.clone();
                tree.replace_by_id(id, node)
                    .expect("replacing a node that was just looked up");
                Applied::Replaced(comment.id)
            }
            // An update for a comment we never saw created is a missed
            // create with newer content.
            None => self.on_created(tree, comment),
        }
    }

    fn on_deleted(&mut self, tree: &mut CommentTree, id: CommentId) -> Applied {
        self.pending_parents.retain(|p| p.comment.id != id);
        self.pending_likes.remove(&id);
        match tree.remove_by_id(NodeId::Server(id)) {
            Some(_) => Applied::Removed(id),
            None => Applied::Noop,
        }
    }

    fn on_liked(&mut self, tree: &mut CommentTree, id: CommentId, liked_by: Vec<UserId>) -> Applied {
        let likes: HashSet<UserId> = liked_by.into_iter().collect();
        match tree.update_likes(NodeId::Server(id), likes.clone()) {
            Ok(()) => Applied::Liked(id),
            Err(_) => {
                // Arrived before the create. Keep the latest set aside and
                // lay it over the node once it exists.
                self.pending_likes.insert(id, likes);
                Applied::Queued(id)
            }
        }
    }

    fn settle(&mut self, tree: &mut CommentTree, comment: &Comment) -> Settled {
        let parent = comment.parent_id.map(NodeId::Server);
        if let Some(p) = parent {
            if !tree.contains(p) {
                return Settled::ParentMissing(p);
            }
        }
        let mut node = CommentNode::confirmed(comment);
        if let Some(likes) = self.pending_likes.remove(&comment.id) {
            node.liked_by = likes;
        }
        if let Some(temp) = self.optimistic_match(tree, parent, comment) {
            tree.replace_by_id(NodeId::Local(temp), node)
                .expect("replacing a placeholder that was just matched");
            Settled::Confirmed(temp)
        } else {
            let id = node.id;
            let inserted = match parent {
                Some(p) => tree.insert_under_parent(node, p),
                None => tree.insert_top_level(node),
            };
            inserted.expect("parent and id were checked before inserting");
            Settled::Inserted(id)
        }
    }

    /// Finds the optimistic sibling this confirmed comment most plausibly
    /// is: same parent, identical content, creation instants within the
    /// match window. The closest creation instant wins when several
    /// placeholders qualify.
    fn optimistic_match(
        &self,
        tree: &CommentTree,
        parent: Option<NodeId>,
        comment: &Comment,
    ) -> Option<TempId> {
        let siblings = match parent {
            Some(p) => tree.children_of(p)?,
            None => tree.roots(),
        };
        let mut best: Option<(chrono::Duration, TempId)> = None;
        for &sibling in siblings {
            let NodeId::Local(temp) = sibling else { continue };
            let Some(node) = tree.get(sibling) else { continue };
            if !node.is_optimistic || node.content != comment.content {
                continue;
            }
            let delta = if comment.created_at >= node.created_at {
                comment.created_at - node.created_at
            } else {
                node.created_at - comment.created_at
            };
            if delta > self.window {
                continue;
            }
            if best.map_or(true, |(d, _)| delta < d) {
                best = Some((delta, temp));
            }
        }
        best.map(|(_, temp)| temp)
    }

    /// Retries parked creates until a full pass makes no progress. Entries
    /// that are still stuck afterwards burn one retry; past the limit they
    /// are dropped, leaving the next full read to repair the gap.
    fn drain_pending(&mut self, tree: &mut CommentTree) {
        loop {
            let mut progress = false;
            let mut waiting = VecDeque::new();
            while let Some(pending) = self.pending_parents.pop_front() {
                if tree.contains(NodeId::Server(pending.comment.id)) {
                    progress = true;
                    continue;
                }
                match self.settle(tree, &pending.comment) {
                    Settled::ParentMissing(_) => waiting.push_back(pending),
                    Settled::Inserted(node) => {
                        tracing::debug!(comment = %node, "attached held comment to its parent");
                        progress = true;
                    }
                    Settled::Confirmed(_) => progress = true,
                }
            }
            self.pending_parents = waiting;
            if !progress {
                break;
            }
        }
        let max = self.max_orphan_retries;
        let likes = &mut self.pending_likes;
        self.pending_parents.retain_mut(|pending| {
            pending.retries += 1;
            if pending.retries > max {
                tracing::warn!(
                    comment = %pending.comment.id.0,
                    parent = ?pending.comment.parent_id.map(|p| p.0),
                    "dropping comment whose parent never arrived",
                );
                // likes stashed for it have nothing left to land on
                likes.remove(&pending.comment.id);
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AuthorRef, ThreadId, Time, Uuid};
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn at(secs: i64) -> Time {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn cid(n: u128) -> CommentId {
        CommentId(Uuid::from_u128(n))
    }

    fn uid(n: u128) -> UserId {
        UserId(Uuid::from_u128(0x1000 + n))
    }

    fn wire(id: u128, parent: Option<u128>, content: &str, likes: &[u128], secs: i64) -> Comment {
        Comment {
            id: cid(id),
            thread_id: ThreadId::stub(),
            parent_id: parent.map(cid),
            author: AuthorRef::stub(),
            content: content.to_string(),
            liked_by: likes.iter().map(|n| uid(*n)).collect(),
            created_at: at(secs),
            updated_at: at(secs),
            is_edited: false,
            replies: Vec::new(),
        }
    }

    fn edited(mut comment: Comment, content: &str, secs: i64) -> Comment {
        comment.content = content.to_string();
        comment.updated_at = at(secs);
        comment.is_edited = true;
        comment
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(chrono::Duration::seconds(15), 3)
    }

    #[test]
    fn creating_twice_inserts_once() {
        let mut r = reconciler();
        let mut tree = CommentTree::new();
        let comment = wire(1, None, "hello", &[], 0);
        assert_eq!(r.apply(&mut tree, CommentEvent::Created(comment.clone())), Applied::Created(cid(1)));
        assert_eq!(r.apply(&mut tree, CommentEvent::Created(comment)), Applied::Noop);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn confirmation_settles_into_the_placeholder() {
        let mut r = reconciler();
        let mut tree = CommentTree::new();
        let temp = TempId::generate(at(0));
        tree.insert_top_level(CommentNode::optimistic(temp, AuthorRef::stub(), "mine".into()))
            .unwrap();
        tree.insert_top_level(CommentNode::confirmed(&wire(9, None, "newer", &[], 1)))
            .unwrap();

        let applied = r.apply(&mut tree, CommentEvent::Created(wire(1, None, "mine", &[], 3)));
        assert_eq!(applied, Applied::Confirmed(temp, cid(1)));
        assert_eq!(tree.len(), 2, "no second copy of the same comment");
        assert_eq!(
            tree.roots()[1],
            NodeId::Server(cid(1)),
            "the confirmed comment keeps the placeholder position"
        );
        assert_eq!(tree.stats(), tree.recount());
    }

    #[test]
    fn confirmation_outside_the_window_is_a_new_comment() {
        let mut r = reconciler();
        let mut tree = CommentTree::new();
        let temp = TempId::generate(at(0));
        tree.insert_top_level(CommentNode::optimistic(temp, AuthorRef::stub(), "mine".into()))
            .unwrap();
        r.apply(&mut tree, CommentEvent::Created(wire(1, None, "mine", &[], 60)));
        assert_eq!(tree.len(), 2);
        assert!(tree.contains(NodeId::Local(temp)), "placeholder is left alone");
    }

    #[test]
    fn closest_placeholder_wins() {
        let mut r = reconciler();
        let mut tree = CommentTree::new();
        let far = TempId::generate(at(0));
        let near = TempId::generate(at(9));
        tree.insert_top_level(CommentNode::optimistic(far, AuthorRef::stub(), "same".into()))
            .unwrap();
        tree.insert_top_level(CommentNode::optimistic(near, AuthorRef::stub(), "same".into()))
            .unwrap();
        let applied = r.apply(&mut tree, CommentEvent::Created(wire(1, None, "same", &[], 10)));
        assert_eq!(applied, Applied::Confirmed(near, cid(1)));
        assert!(tree.contains(NodeId::Local(far)));
    }

    #[test]
    fn edits_keep_the_current_like_set() {
        let mut r = reconciler();
        let mut tree = CommentTree::new();
        r.apply(&mut tree, CommentEvent::Created(wire(1, None, "v1", &[], 0)));
        r.apply(&mut tree, CommentEvent::Liked { id: cid(1), liked_by: vec![uid(1)] });
        r.apply(&mut tree, CommentEvent::Updated(edited(wire(1, None, "v1", &[], 0), "v2", 5)));
        let node = tree.get(NodeId::Server(cid(1))).unwrap();
        assert_eq!(node.content, "v2");
        assert!(node.is_edited);
        assert_eq!(node.liked_by, HashSet::from([uid(1)]), "the edit must not erase the like");
    }

    #[test]
    fn likes_keep_the_current_content() {
        let mut r = reconciler();
        let mut tree = CommentTree::new();
        r.apply(&mut tree, CommentEvent::Created(wire(1, None, "v1", &[], 0)));
        r.apply(&mut tree, CommentEvent::Updated(edited(wire(1, None, "v1", &[], 0), "v2", 5)));
        r.apply(&mut tree, CommentEvent::Liked { id: cid(1), liked_by: vec![uid(1)] });
        let node = tree.get(NodeId::Server(cid(1))).unwrap();
        assert_eq!(node.content, "v2");
        assert_eq!(node.liked_by, HashSet::from([uid(1)]));
    }

    #[test]
    fn update_for_an_unknown_comment_becomes_a_create() {
        let mut r = reconciler();
        let mut tree = CommentTree::new();
        let applied = r.apply(
            &mut tree,
            CommentEvent::Updated(edited(wire(1, None, "v1", &[], 0), "v2", 5)),
        );
        assert_eq!(applied, Applied::Created(cid(1)));
        assert_eq!(tree.get(NodeId::Server(cid(1))).unwrap().content, "v2");
    }

    #[test]
    fn delete_for_an_unknown_comment_is_a_noop() {
        let mut r = reconciler();
        let mut tree = CommentTree::new();
        assert_eq!(r.apply(&mut tree, CommentEvent::Deleted(cid(7))), Applied::Noop);
    }

    #[test]
    fn like_before_create_is_stashed_then_applied() {
        let mut r = reconciler();
        let mut tree = CommentTree::new();
        let applied = r.apply(&mut tree, CommentEvent::Liked { id: cid(1), liked_by: vec![uid(2)] });
        assert_eq!(applied, Applied::Queued(cid(1)));
        r.apply(&mut tree, CommentEvent::Created(wire(1, None, "hello", &[], 0)));
        let node = tree.get(NodeId::Server(cid(1))).unwrap();
        assert_eq!(node.liked_by, HashSet::from([uid(2)]));
    }

    #[test]
    fn reply_before_parent_is_held_then_attached() {
        let mut r = reconciler();
        let mut tree = CommentTree::new();
        let applied = r.apply(&mut tree, CommentEvent::Created(wire(2, Some(1), "reply", &[], 1)));
        assert_eq!(applied, Applied::Queued(cid(2)));
        assert_eq!(r.pending(), 1);
        assert!(tree.is_empty());

        r.apply(&mut tree, CommentEvent::Created(wire(1, None, "root", &[], 0)));
        assert_eq!(r.pending(), 0);
        assert_eq!(
            tree.children_of(NodeId::Server(cid(1))).unwrap(),
            [NodeId::Server(cid(2))]
        );
    }

    #[test]
    fn a_whole_held_chain_attaches_at_once() {
        let mut r = reconciler();
        let mut tree = CommentTree::new();
        r.apply(&mut tree, CommentEvent::Created(wire(3, Some(2), "grandchild", &[], 2)));
        r.apply(&mut tree, CommentEvent::Created(wire(2, Some(1), "child", &[], 1)));
        assert_eq!(r.pending(), 2);
        r.apply(&mut tree, CommentEvent::Created(wire(1, None, "root", &[], 0)));
        assert_eq!(r.pending(), 0);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.parent_of(NodeId::Server(cid(3))), Some(NodeId::Server(cid(2))));
    }

    #[test]
    fn held_comments_are_dropped_after_bounded_retries() {
        let mut r = reconciler();
        let mut tree = CommentTree::new();
        r.apply(&mut tree, CommentEvent::Created(wire(9, Some(999), "orphan", &[], 0)));
        assert_eq!(r.pending(), 1);
        // each unrelated insert burns one retry
        for n in 1..=4 {
            r.apply(&mut tree, CommentEvent::Created(wire(n, None, "filler", &[], n as i64)));
        }
        assert_eq!(r.pending(), 0, "orphan is dropped once retries run out");
        assert!(!tree.contains(NodeId::Server(cid(9))));
    }

    #[test]
    fn dropping_a_held_comment_discards_its_stashed_likes() {
        let mut r = reconciler();
        let mut tree = CommentTree::new();
        let applied = r.apply(&mut tree, CommentEvent::Liked { id: cid(9), liked_by: vec![uid(1)] });
        assert_eq!(applied, Applied::Queued(cid(9)));
        r.apply(&mut tree, CommentEvent::Created(wire(9, Some(999), "orphan", &[], 0)));
        for n in 1..=4 {
            r.apply(&mut tree, CommentEvent::Created(wire(n, None, "filler", &[], n as i64)));
        }
        assert_eq!(r.pending(), 0);

        // the id comes back as a fresh comment; the stash died with the
        // held one and must not bleed onto it
        r.apply(&mut tree, CommentEvent::Created(wire(9, None, "fresh", &[], 10)));
        let node = tree.get(NodeId::Server(cid(9))).unwrap();
        assert!(node.liked_by.is_empty());
    }

    #[test]
    fn any_arrival_order_converges() {
        let created = CommentEvent::Created(wire(1, None, "v1", &[], 0));
        let updated = CommentEvent::Updated(edited(wire(1, None, "v1", &[], 0), "v2", 5));
        let liked = CommentEvent::Liked { id: cid(1), liked_by: vec![uid(1)] };
        let events = [created, updated, liked];
        let orders = [
            [0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0],
        ];
        for order in orders {
            let mut r = reconciler();
            let mut tree = CommentTree::new();
            for ix in order {
                r.apply(&mut tree, events[ix].clone());
            }
            let node = tree.get(NodeId::Server(cid(1))).unwrap();
            assert_eq!(
                (node.content.as_str(), node.is_edited, node.liked_by.clone()),
                ("v2", true, HashSet::from([uid(1)])),
                "order {order:?} must converge to the same node"
            );
        }
    }

    // Canonical form of a tree for equality checks across reconcilers.
    fn flatten(tree: &CommentTree) -> Vec<String> {
        let mut out = Vec::new();
        fn walk(tree: &CommentTree, id: NodeId, depth: usize, out: &mut Vec<String>) {
            let node = tree.get(id).unwrap();
            let mut likes: Vec<String> = node.liked_by.iter().map(|u| u.0.to_string()).collect();
            likes.sort();
            out.push(format!(
                "{}{} {} {} {:?}",
                "  ".repeat(depth),
                id,
                node.content,
                node.is_edited,
                likes
            ));
            for child in tree.children_of(id).unwrap_or(&[]) {
                walk(tree, *child, depth + 1, out);
            }
        }
        for root in tree.roots() {
            walk(tree, *root, 0, &mut out);
        }
        out
    }

    fn parent_strategy() -> impl Strategy<Value = Option<u128>> {
        prop_oneof![Just(None), (1u128..5).prop_map(Some)]
    }

    fn content_strategy() -> impl Strategy<Value = String> {
        prop_oneof!["alpha", "beta", "gamma"]
    }

    fn likes_strategy() -> impl Strategy<Value = Vec<u128>> {
        prop::collection::vec(1u128..4, 0..3)
    }

    fn event_strategy() -> impl Strategy<Value = CommentEvent> {
        prop_oneof![
            (1u128..5, parent_strategy(), content_strategy(), likes_strategy(), 0i64..30).prop_map(
                |(id, parent, content, likes, secs)| {
                    CommentEvent::Created(wire(id, parent, &content, &likes, secs))
                }
            ),
            (1u128..5, parent_strategy(), content_strategy(), likes_strategy(), 0i64..30).prop_map(
                |(id, parent, content, likes, secs)| {
                    CommentEvent::Updated(edited(wire(id, parent, "stale", &likes, secs), &content, secs + 1))
                }
            ),
            (1u128..5).prop_map(|id| CommentEvent::Deleted(cid(id))),
            (1u128..5, likes_strategy()).prop_map(|(id, likes)| CommentEvent::Liked {
                id: cid(id),
                liked_by: likes.into_iter().map(uid).collect(),
            }),
        ]
    }

    proptest! {
        // Socket and poll can hand the engine the same event back to back;
        // the second copy must change nothing, and the incremental counters
        // must stay truthful throughout.
        #[test]
        fn immediate_duplicates_are_absorbed(script in prop::collection::vec(event_strategy(), 0..25)) {
            let mut once = (reconciler(), CommentTree::new());
            let mut twice = (reconciler(), CommentTree::new());
            for event in &script {
                once.0.apply(&mut once.1, event.clone());
                prop_assert_eq!(once.1.stats(), once.1.recount());

                twice.0.apply(&mut twice.1, event.clone());
                twice.0.apply(&mut twice.1, event.clone());
                prop_assert_eq!(twice.1.stats(), twice.1.recount());
            }
            prop_assert_eq!(flatten(&once.1), flatten(&twice.1));
        }
    }
}
