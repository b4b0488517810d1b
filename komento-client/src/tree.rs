use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::api::{AuthorRef, Comment, CommentId, ThreadStats, Time, UserId};
use crate::optimistic::TempId;

/// Key of a node in the tree. Confirmed comments are keyed by their server
/// id, optimistic ones by their local placeholder id, so the two can never
/// collide.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeId {
    Server(CommentId),
    Local(TempId),
}

impl NodeId {
    pub fn server(self) -> Option<CommentId> {
        match self {
            NodeId::Server(id) => Some(id),
            NodeId::Local(_) => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, NodeId::Local(_))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Server(id) => write!(f, "{}", id.0),
            NodeId::Local(temp) => write!(f, "{}", temp),
        }
    }
}

impl From<CommentId> for NodeId {
    fn from(id: CommentId) -> NodeId {
        NodeId::Server(id)
    }
}

impl From<TempId> for NodeId {
    fn from(temp: TempId) -> NodeId {
        NodeId::Local(temp)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum TreeError {
    #[error("parent comment {0} is not in the tree")]
    OrphanReference(NodeId),
    #[error("comment {0} is not in the tree")]
    NotFound(NodeId),
    #[error("comment {0} is already in the tree")]
    DuplicateId(NodeId),
}

/// Payload of one comment as held locally. Parent and reply links live in
/// the tree itself, not in the node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommentNode {
    pub id: NodeId,
    pub author: AuthorRef,
    pub content: String,
    pub liked_by: HashSet<UserId>,
    pub created_at: Time,
    pub updated_at: Time,
    pub is_edited: bool,
    pub is_optimistic: bool,
}

impl CommentNode {
    /// Node for a server-confirmed comment. Nested replies on the wire
    /// comment are ignored here, they arrive as their own inserts.
    pub fn confirmed(comment: &Comment) -> CommentNode {
        CommentNode {
            id: NodeId::Server(comment.id),
            author: comment.author.clone(),
            content: comment.content.clone(),
            liked_by: comment.liked_by.iter().copied().collect(),
            created_at: comment.created_at,
            updated_at: comment.updated_at,
            is_edited: comment.is_edited,
            is_optimistic: false,
        }
    }

    /// Placeholder node for a comment the server has not acknowledged yet.
    pub fn optimistic(temp: TempId, author: AuthorRef, content: String) -> CommentNode {
        let at = temp.created_at();
        CommentNode {
            id: NodeId::Local(temp),
            author,
            content,
            liked_by: HashSet::new(),
            created_at: at,
            updated_at: at,
            is_edited: false,
            is_optimistic: true,
        }
    }
}

#[derive(Clone, Debug)]
struct Slot {
    node: CommentNode,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Clone, Copy, Debug)]
enum Anchor {
    Root { index: usize },
    Child { parent: NodeId, index: usize },
}

/// A subtree taken out of the tree, with enough context to put it back
/// where it was. Used for delete rollback.
#[derive(Clone, Debug)]
pub struct DetachedSubtree {
    anchor: Anchor,
    root: NodeId,
    nodes: Vec<(NodeId, Slot)>,
}

impl DetachedSubtree {
    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn likes(&self) -> u64 {
        self.nodes.iter().map(|(_, s)| s.node.liked_by.len() as u64).sum()
    }
}

/// The reply forest of one discussion thread.
///
/// Nodes live in a flat arena keyed by [`NodeId`]; parent and reply links
/// are id references, so insert, replace, remove and like updates are all
/// map operations plus one sibling-list edit. Top-level comments are kept
/// newest first, replies oldest first. Headline counters are maintained
/// incrementally alongside every mutation.
pub struct CommentTree {
    slots: HashMap<NodeId, Slot>,
    roots: Vec<NodeId>,
    stats: ThreadStats,
}

impl CommentTree {
    pub fn new() -> CommentTree {
        CommentTree {
            slots: HashMap::new(),
            roots: Vec::new(),
            stats: ThreadStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&CommentNode> {
        self.slots.get(&id).map(|s| &s.node)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn children_of(&self, id: NodeId) -> Option<&[NodeId]> {
        self.slots.get(&id).map(|s| s.children.as_slice())
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.slots.get(&id).and_then(|s| s.parent)
    }

    /// Ids of all confirmed nodes, in no particular order.
    pub fn server_ids(&self) -> Vec<CommentId> {
        self.slots.keys().filter_map(|id| id.server()).collect()
    }

    /// Headline counters as maintained incrementally.
    pub fn stats(&self) -> ThreadStats {
        self.stats
    }

    /// Inserts a new top-level comment at the front of the root list.
    pub fn insert_top_level(&mut self, node: CommentNode) -> Result<(), TreeError> {
        let id = node.id;
        if self.slots.contains_key(&id) {
            return Err(TreeError::DuplicateId(id));
        }
        self.stats.total_comments += 1;
        self.stats.total_likes += node.liked_by.len() as u64;
        self.slots.insert(id, Slot { node, parent: None, children: Vec::new() });
        self.roots.insert(0, id);
        Ok(())
    }

    /// Inserts a reply at the end of the parent's reply list.
    pub fn insert_under_parent(&mut self, node: CommentNode, parent: NodeId) -> Result<(), TreeError> {
        let id = node.id;
        if self.slots.contains_key(&id) {
            return Err(TreeError::DuplicateId(id));
        }
        if !self.slots.contains_key(&parent) {
            return Err(TreeError::OrphanReference(parent));
        }
        self.stats.total_replies += 1;
        self.stats.total_likes += node.liked_by.len() as u64;
        self.slots.insert(id, Slot { node, parent: Some(parent), children: Vec::new() });
        if let Some(slot) = self.slots.get_mut(&parent) {
            slot.children.push(id);
        }
        Ok(())
    }

    /// Replaces the node stored under `id` with `new`, keeping its position
    /// among its siblings and its reply links. When `new` carries a
    /// different id the slot is re-keyed in place, which is how an
    /// optimistic placeholder becomes a confirmed comment without moving.
    pub fn replace_by_id(&mut self, id: NodeId, new: CommentNode) -> Result<NodeId, TreeError> {
        let new_id = new.id;
        if new_id != id && self.slots.contains_key(&new_id) {
            return Err(TreeError::DuplicateId(new_id));
        }
        let slot = self.slots.remove(&id).ok_or(TreeError::NotFound(id))?;
        self.stats.total_likes -= slot.node.liked_by.len() as u64;
        self.stats.total_likes += new.liked_by.len() as u64;
        let parent = slot.parent;
        let children = slot.children;
        self.slots.insert(new_id, Slot { node: new, parent, children: children.clone() });
        if new_id != id {
            match parent {
                Some(p) => {
                    if let Some(slot) = self.slots.get_mut(&p) {
                        if let Some(ix) = slot.children.iter().position(|c| *c == id) {
                            slot.children[ix] = new_id;
                        }
                    }
                }
                None => {
                    if let Some(ix) = self.roots.iter().position(|r| *r == id) {
                        self.roots[ix] = new_id;
                    }
                }
            }
            for child in children {
                if let Some(slot) = self.slots.get_mut(&child) {
                    slot.parent = Some(new_id);
                }
            }
        }
        Ok(new_id)
    }

    /// Detaches the node and its whole reply subtree. Returns `None` when
    /// the id is not present, which makes repeated deletes no-ops.
    pub fn remove_by_id(&mut self, id: NodeId) -> Option<DetachedSubtree> {
        let parent = self.slots.get(&id)?.parent;
        let anchor = match parent {
            Some(p) => {
                let slot = self.slots.get_mut(&p)?;
                let index = slot.children.iter().position(|c| *c == id)?;
                slot.children.remove(index);
                Anchor::Child { parent: p, index }
            }
            None => {
                let index = self.roots.iter().position(|r| *r == id)?;
                self.roots.remove(index);
                Anchor::Root { index }
            }
        };
        let mut nodes = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(slot) = self.slots.remove(&next) else { continue };
            stack.extend(slot.children.iter().copied());
            nodes.push((next, slot));
        }
        let detached = DetachedSubtree { anchor, root: id, nodes };
        let count = detached.nodes.len() as u64;
        match anchor {
            Anchor::Root { .. } => {
                self.stats.total_comments -= 1;
                self.stats.total_replies -= count - 1;
            }
            Anchor::Child { .. } => self.stats.total_replies -= count,
        }
        self.stats.total_likes -= detached.likes();
        Some(detached)
    }

    /// Puts a detached subtree back at (or near) its old position. Skipped
    /// silently when the subtree root reappeared in the meantime, and fails
    /// when its old parent is gone.
    pub fn restore(&mut self, detached: DetachedSubtree) -> Result<(), TreeError> {
        if self.slots.contains_key(&detached.root) {
            return Ok(());
        }
        match detached.anchor {
            Anchor::Child { parent, index } => {
                let slot = self
                    .slots
                    .get_mut(&parent)
                    .ok_or(TreeError::OrphanReference(parent))?;
                let ix = index.min(slot.children.len());
                slot.children.insert(ix, detached.root);
            }
            Anchor::Root { index } => {
                let ix = index.min(self.roots.len());
                self.roots.insert(ix, detached.root);
            }
        }
        let count = detached.nodes.len() as u64;
        match detached.anchor {
            Anchor::Root { .. } => {
                self.stats.total_comments += 1;
                self.stats.total_replies += count - 1;
            }
            Anchor::Child { .. } => self.stats.total_replies += count,
        }
        self.stats.total_likes += detached.likes();
        for (id, slot) in detached.nodes {
            self.slots.insert(id, slot);
        }
        Ok(())
    }

    /// Overwrites the like set of one node, touching nothing else.
    pub fn update_likes(&mut self, id: NodeId, liked_by: HashSet<UserId>) -> Result<(), TreeError> {
        let slot = self.slots.get_mut(&id).ok_or(TreeError::NotFound(id))?;
        self.stats.total_likes -= slot.node.liked_by.len() as u64;
        self.stats.total_likes += liked_by.len() as u64;
        slot.node.liked_by = liked_by;
        Ok(())
    }

    /// Removes optimistic nodes older than `max_age` and returns their ids.
    pub fn sweep_stale_optimistic(&mut self, now: Time, max_age: chrono::Duration) -> Vec<NodeId> {
        let stale: Vec<NodeId> = self
            .slots
            .values()
            .filter(|s| s.node.is_optimistic && now - s.node.created_at > max_age)
            .map(|s| s.node.id)
            .collect();
        let mut swept = Vec::new();
        for id in stale {
            if self.remove_by_id(id).is_some() {
                swept.push(id);
            }
        }
        swept
    }

    /// Recomputes the headline counters from scratch by walking the forest.
    /// The incremental counters must always agree with this.
    pub fn recount(&self) -> ThreadStats {
        let mut stats = ThreadStats::default();
        for root in &self.roots {
            stats.total_comments += 1;
            self.recount_subtree(*root, &mut stats, true);
        }
        stats
    }

    fn recount_subtree(&self, id: NodeId, stats: &mut ThreadStats, is_root: bool) {
        let Some(slot) = self.slots.get(&id) else { return };
        if !is_root {
            stats.total_replies += 1;
        }
        stats.total_likes += slot.node.liked_by.len() as u64;
        for child in &slot.children {
            self.recount_subtree(*child, stats, false);
        }
    }
}

impl Default for CommentTree {
    fn default() -> CommentTree {
        CommentTree::new()
    }
}
