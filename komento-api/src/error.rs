use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

use crate::MAX_CONTENT_CHARS;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Thread not found: {0}")]
    ThreadNotFound(Uuid),

    #[error("Comment not found: {0}")]
    CommentNotFound(Uuid),

    #[error("Comment content is empty")]
    EmptyContent,

    #[error("Comment content has {0} characters, over the {MAX_CONTENT_CHARS} limit")]
    ContentTooLong(usize),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),
}

impl Error {
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::PermissionDenied => StatusCode::FORBIDDEN,
            Error::ThreadNotFound(_) => StatusCode::NOT_FOUND,
            Error::CommentNotFound(_) => StatusCode::NOT_FOUND,
            Error::EmptyContent => StatusCode::BAD_REQUEST,
            Error::ContentTooLong(_) => StatusCode::BAD_REQUEST,
            Error::NullByteInString(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "message": msg,
                "type": "unknown",
            }),
            Error::PermissionDenied => json!({
                "message": "permission denied",
                "type": "permission-denied",
            }),
            Error::ThreadNotFound(t) => json!({
                "message": "thread not found",
                "type": "not-found-thread",
                "thread": t,
            }),
            Error::CommentNotFound(c) => json!({
                "message": "comment not found",
                "type": "not-found-comment",
                "comment": c,
            }),
            Error::EmptyContent => json!({
                "message": "comment content is empty",
                "type": "empty-content",
            }),
            Error::ContentTooLong(len) => json!({
                "message": "comment content is over the length limit",
                "type": "content-too-long",
                "length": len,
            }),
            Error::NullByteInString(s) => json!({
                "message": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
        })
        .expect("serializing error contents")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(String::from(
                    data.get("message")
                        .and_then(|msg| msg.as_str())
                        .unwrap_or(""),
                )),
                "permission-denied" => Error::PermissionDenied,
                "not-found-thread" => Error::ThreadNotFound(
                    data.get("thread")
                        .and_then(|t| t.as_str())
                        .and_then(|t| Uuid::from_str(t).ok())
                        .ok_or_else(|| anyhow!("thread-not-found error without a proper uuid"))?,
                ),
                "not-found-comment" => Error::CommentNotFound(
                    data.get("comment")
                        .and_then(|c| c.as_str())
                        .and_then(|c| Uuid::from_str(c).ok())
                        .ok_or_else(|| anyhow!("comment-not-found error without a proper uuid"))?,
                ),
                "empty-content" => Error::EmptyContent,
                "content-too-long" => Error::ContentTooLong(
                    data.get("length")
                        .and_then(|l| l.as_u64())
                        .ok_or_else(|| anyhow!("content-too-long error without a length"))?
                        as usize,
                ),
                "null-byte" => Error::NullByteInString(String::from(
                    data.get("string").and_then(|s| s.as_str()).ok_or_else(|| {
                        anyhow!("error is a null-byte-in-string without a string")
                    })?,
                )),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn error_strategy() -> impl Strategy<Value = Error> {
        prop_oneof![
            ".{0,40}".prop_map(Error::Unknown),
            Just(Error::PermissionDenied),
            any::<u128>().prop_map(|n| Error::ThreadNotFound(Uuid::from_u128(n))),
            any::<u128>().prop_map(|n| Error::CommentNotFound(Uuid::from_u128(n))),
            Just(Error::EmptyContent),
            any::<usize>().prop_map(Error::ContentTooLong),
            ".{0,40}".prop_map(Error::NullByteInString),
        ]
    }

    proptest! {
        #[test]
        fn any_error_round_trips_through_json(err in error_strategy()) {
            let parsed = Error::parse(&err.contents())
                .expect("parsing freshly serialized error");
            prop_assert_eq!(parsed, err);
        }
    }

    #[test]
    fn status_codes_per_class() {
        use http::StatusCode;
        assert_eq!(
            Error::Unknown(String::new()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(Error::PermissionDenied.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::CommentNotFound(crate::STUB_UUID).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(Error::EmptyContent.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!(Error::parse(b"not json at all").is_err());
        assert!(Error::parse(br#"{"type":"how-did-this-get-here"}"#).is_err());
    }
}
