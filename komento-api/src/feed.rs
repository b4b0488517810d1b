use crate::{Comment, CommentId, StatsPatch, ThreadId};

/// Client→server messages on the push channel. One subscription per
/// socket: a later `subscribe` replaces the earlier one.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FeedRequest {
    #[serde(rename_all = "camelCase")]
    Subscribe { thread_id: ThreadId },
    Ping,
}

/// Server→client messages on the push channel.
///
/// `comment.liked` carries the full comment for wire-format symmetry, but
/// consumers must only ever apply its like set: anything else in the
/// payload may predate a concurrent edit still in flight.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "type")]
pub enum FeedMessage {
    #[serde(rename = "comment.created")]
    CommentCreated { comment: Comment },
    #[serde(rename = "comment.updated")]
    CommentUpdated { comment: Comment },
    #[serde(rename = "comment.deleted")]
    CommentDeleted { id: CommentId },
    #[serde(rename = "comment.liked")]
    CommentLiked { comment: Comment },
    #[serde(rename = "stats.updated")]
    StatsUpdated { stats: StatsPatch },
    #[serde(rename = "pong")]
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuthorRef, UserId};
    use chrono::Utc;

    #[test]
    fn subscribe_wire_shape() {
        let msg = FeedRequest::Subscribe {
            thread_id: ThreadId::stub(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            serde_json::json!({ "type": "subscribe", "threadId": ThreadId::stub() })
        );
    }

    #[test]
    fn event_discriminators_use_dotted_names() {
        let deleted = FeedMessage::CommentDeleted {
            id: CommentId::stub(),
        };
        assert_eq!(
            serde_json::to_value(&deleted).unwrap(),
            serde_json::json!({ "type": "comment.deleted", "id": CommentId::stub() })
        );

        let stats = FeedMessage::StatsUpdated {
            stats: StatsPatch {
                comments: 3,
                likes: 7,
            },
        };
        assert_eq!(
            serde_json::to_value(&stats).unwrap(),
            serde_json::json!({ "type": "stats.updated", "stats": { "comments": 3, "likes": 7 } })
        );
    }

    #[test]
    fn created_event_round_trips() {
        let msg = FeedMessage::CommentCreated {
            comment: Comment {
                id: CommentId::stub(),
                thread_id: ThreadId::stub(),
                parent_id: Some(CommentId::stub()),
                author: AuthorRef::new(UserId::stub(), "grace"),
                content: String::from("nested reply"),
                liked_by: vec![UserId::stub()],
                created_at: Utc::now(),
                updated_at: Utc::now(),
                is_edited: false,
                replies: vec![],
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"comment.created""#));
        let back: FeedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
