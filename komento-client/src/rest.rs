use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::api::{self, AuthToken, Comment, CommentId, EditComment, NewComment, ThreadId, ThreadStats};

/// Outcome classification for write and read requests. A rejection is a
/// verdict from the server and rolls the optimistic apply back; an
/// unreachable backend got no verdict at all, so the caller may retry.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Api(#[from] api::Error),
    #[error("backend unreachable: {0}")]
    Unreachable(anyhow::Error),
}

impl RequestError {
    pub fn unreachable(err: impl Into<anyhow::Error>) -> RequestError {
        RequestError::Unreachable(err.into())
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, RequestError::Unreachable(_))
    }
}

/// The REST surface of the comment backend, as the sync engine consumes it.
/// The engine never talks HTTP directly, which is what lets the tests run
/// against an in-memory server.
#[async_trait]
pub trait ThreadApi: Send + Sync + 'static {
    /// Full read: all top-level comments of the thread, newest first, with
    /// replies nested oldest first.
    async fn fetch_thread(&self, thread: ThreadId) -> Result<Vec<Comment>, RequestError>;

    async fn fetch_stats(&self, thread: ThreadId) -> Result<ThreadStats, RequestError>;

    async fn create_comment(&self, thread: ThreadId, new: NewComment) -> Result<Comment, RequestError>;

    async fn edit_comment(&self, comment: CommentId, edit: EditComment) -> Result<Comment, RequestError>;

    async fn delete_comment(&self, comment: CommentId) -> Result<(), RequestError>;

    /// Flips the calling user's like on the comment and returns its new
    /// authoritative state.
    async fn toggle_like(&self, comment: CommentId) -> Result<Comment, RequestError>;
}

/// [`ThreadApi`] against a real backend over HTTP.
pub struct HttpThreadApi {
    client: reqwest::Client,
    base: String,
    token: AuthToken,
}

impl HttpThreadApi {
    pub fn new(base: impl Into<String>, token: AuthToken) -> HttpThreadApi {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        HttpThreadApi {
            client: reqwest::Client::new(),
            base,
            token,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, RequestError> {
        let resp = req
            .bearer_auth(self.token.0)
            .send()
            .await
            .map_err(RequestError::unreachable)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.bytes().await.map_err(RequestError::unreachable)?;
        let error = api::Error::parse(&body)
            .unwrap_or_else(|_| api::Error::Unknown(format!("unexpected status {status}")));
        Err(RequestError::Api(error))
    }

    async fn json<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, RequestError> {
        let resp = self.send(req).await?;
        resp.json().await.map_err(RequestError::unreachable)
    }
}

#[async_trait]
impl ThreadApi for HttpThreadApi {
    async fn fetch_thread(&self, thread: ThreadId) -> Result<Vec<Comment>, RequestError> {
        let url = format!("{}/comments/{}", self.base, thread.0);
        self.json(self.client.get(url)).await
    }

    async fn fetch_stats(&self, thread: ThreadId) -> Result<ThreadStats, RequestError> {
        let url = format!("{}/comments/{}/stats", self.base, thread.0);
        self.json(self.client.get(url)).await
    }

    async fn create_comment(&self, thread: ThreadId, new: NewComment) -> Result<Comment, RequestError> {
        let url = format!("{}/comments/{}", self.base, thread.0);
        self.json(self.client.post(url).json(&new)).await
    }

    async fn edit_comment(&self, comment: CommentId, edit: EditComment) -> Result<Comment, RequestError> {
        let url = format!("{}/comments/{}", self.base, comment.0);
        self.json(self.client.patch(url).json(&edit)).await
    }

    async fn delete_comment(&self, comment: CommentId) -> Result<(), RequestError> {
        let url = format!("{}/comments/{}", self.base, comment.0);
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn toggle_like(&self, comment: CommentId) -> Result<Comment, RequestError> {
        let url = format!("{}/comments/{}/like", self.base, comment.0);
        self.json(self.client.post(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_separates_verdicts_from_outages() {
        let rejected = RequestError::Api(api::Error::PermissionDenied);
        let lost = RequestError::unreachable(anyhow::anyhow!("connection refused"));
        assert!(!rejected.is_unreachable());
        assert!(lost.is_unreachable());
    }

    #[test]
    fn base_url_loses_trailing_slashes() {
        let api = HttpThreadApi::new("https://cms.example/", AuthToken::stub());
        assert_eq!(api.base, "https://cms.example");
    }
}
