use uuid::Uuid;

use crate::{AuthorRef, Error, ThreadId, Time, UserId, STUB_UUID};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct CommentId(pub Uuid);

impl CommentId {
    pub fn stub() -> CommentId {
        CommentId(STUB_UUID)
    }
}

/// A comment as the server serializes it. REST thread reads nest the reply
/// forest under `replies`; push events always carry an empty `replies` list
/// and leave placing the node to the client.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub thread_id: ThreadId,

    /// None for a top-level comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CommentId>,

    pub author: AuthorRef,
    pub content: String,

    /// Set semantics: the server never repeats a user id in here, and the
    /// client deduplicates on ingestion anyway.
    #[serde(default)]
    pub liked_by: Vec<UserId>,

    pub created_at: Time,
    /// Changes only through an edit.
    pub updated_at: Time,
    #[serde(default)]
    pub is_edited: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<Comment>,
}

impl Comment {
    /// Checks the whole subtree, the way the server would before storing it.
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_content(&self.content)?;
        self.author.validate()?;
        for r in &self.replies {
            r.validate()?;
        }
        Ok(())
    }

    /// Number of nodes in this comment's subtree, itself included.
    pub fn subtree_len(&self) -> usize {
        1 + self.replies.iter().map(Comment::subtree_len).sum::<usize>()
    }
}

/// Body of `POST /comments/{threadId}`.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CommentId>,
}

impl NewComment {
    pub fn new(content: impl Into<String>, parent_id: Option<CommentId>) -> NewComment {
        NewComment {
            content: content.into(),
            parent_id,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_content(&self.content)
    }
}

/// Body of `PATCH /comments/{id}`.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct EditComment {
    pub content: String,
}

impl EditComment {
    pub fn new(content: impl Into<String>) -> EditComment {
        EditComment {
            content: content.into(),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_content(&self.content)
    }
}
