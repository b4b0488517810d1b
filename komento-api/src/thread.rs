use uuid::Uuid;

use crate::STUB_UUID;

/// Identifies one article's discussion. Every comment of one engine
/// instance shares the same thread id.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct ThreadId(pub Uuid);

impl ThreadId {
    pub fn stub() -> ThreadId {
        ThreadId(STUB_UUID)
    }
}
