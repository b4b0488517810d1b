/// Aggregate counters as `GET /comments/{threadId}/stats` reports them.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStats {
    /// Top-level comments only.
    pub total_comments: u64,
    /// Nodes below the top level, at any depth.
    pub total_replies: u64,
    pub total_likes: u64,
}

/// Partial counter refresh pushed over the feed as `stats.updated`. The
/// push channel only republishes the two headline numbers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StatsPatch {
    pub comments: u64,
    pub likes: u64,
}
