use uuid::Uuid;

use crate::{Error, STUB_UUID};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn stub() -> UserId {
        UserId(STUB_UUID)
    }
}

/// Denormalized author snapshot carried by every comment. This is a copy
/// taken at publication time, not a live reference: it only ever changes
/// through an explicit `comment.updated` event.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorRef {
    pub id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl AuthorRef {
    pub fn new(id: UserId, display_name: impl Into<String>) -> AuthorRef {
        AuthorRef {
            id,
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    pub fn stub() -> AuthorRef {
        AuthorRef::new(UserId::stub(), "stub")
    }

    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.display_name)?;
        if let Some(url) = &self.avatar_url {
            crate::validate_string(url)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AuthToken(pub Uuid);

impl AuthToken {
    pub fn stub() -> AuthToken {
        AuthToken(STUB_UUID)
    }
}
