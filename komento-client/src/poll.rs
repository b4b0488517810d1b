use std::collections::{HashMap, HashSet};

use crate::api::{Comment, CommentId};
use crate::reconcile::CommentEvent;
use crate::tree::{CommentTree, NodeId};

/// Turns a full REST read into the events that would have produced it,
/// measured against the current tree. The result feeds the same
/// reconciliation path as the live feed, so polling and push can never
/// disagree about how a change lands.
///
/// Optimistic nodes are invisible here: a placeholder the server does not
/// know about yet must not be diffed into a deletion.
pub(crate) fn diff_snapshot(tree: &CommentTree, fetched: &[Comment]) -> Vec<CommentEvent> {
    let mut by_id: HashMap<CommentId, &Comment> = HashMap::new();
    let mut in_order: Vec<&Comment> = Vec::new();
    // The wire order is newest root first; apply oldest first so prepending
    // roots reproduces the server order.
    for root in fetched.iter().rev() {
        index(root, &mut by_id, &mut in_order);
    }

    let mut events = Vec::new();
    let mut gone: Vec<CommentId> = tree
        .server_ids()
        .into_iter()
        .filter(|id| !by_id.contains_key(id))
        .collect();
    gone.sort_by_key(|id| id.0);
    events.extend(gone.into_iter().map(CommentEvent::Deleted));

    for comment in in_order {
        match tree.get(NodeId::Server(comment.id)) {
            None => events.push(CommentEvent::Created(flat(comment))),
            Some(node) => {
                if node.content != comment.content
                    || node.updated_at != comment.updated_at
                    || node.is_edited != comment.is_edited
                    || node.author != comment.author
                {
                    events.push(CommentEvent::Updated(flat(comment)));
                }
                let likes: HashSet<_> = comment.liked_by.iter().copied().collect();
                if node.liked_by != likes {
                    events.push(CommentEvent::Liked {
                        id: comment.id,
                        liked_by: comment.liked_by.clone(),
                    });
                }
            }
        }
    }
    events
}

fn index<'a>(
    comment: &'a Comment,
    by_id: &mut HashMap<CommentId, &'a Comment>,
    in_order: &mut Vec<&'a Comment>,
) {
    by_id.insert(comment.id, comment);
    in_order.push(comment);
    for reply in &comment.replies {
        index(reply, by_id, in_order);
    }
}

fn flat(comment: &Comment) -> Comment {
    Comment {
        id: comment.id,
        thread_id: comment.thread_id,
        parent_id: comment.parent_id,
        author: comment.author.clone(),
        content: comment.content.clone(),
        liked_by: comment.liked_by.clone(),
        created_at: comment.created_at,
        updated_at: comment.updated_at,
        is_edited: comment.is_edited,
        replies: Vec::new(),
    }
}
