use chrono::Utc;

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

/// Upper bound on comment content, counted in unicode code points.
pub const MAX_CONTENT_CHARS: usize = 1000;

mod comment;
pub use comment::{Comment, CommentId, EditComment, NewComment};

mod error;
pub use error::Error;

mod feed;
pub use feed::{FeedMessage, FeedRequest};

mod stats;
pub use stats::{StatsPatch, ThreadStats};

mod thread;
pub use thread::ThreadId;

mod user;
pub use user::{AuthToken, AuthorRef, UserId};

// See comments on the `validate` functions of the types in this crate: all
// user-provided data gets pushed through these before it is let anywhere
// near a wire message, on both the client and the mock-server side.
pub fn validate_string(s: &str) -> Result<(), Error> {
    if s.contains('\0') {
        return Err(Error::NullByteInString(String::from(s)));
    }
    Ok(())
}

pub fn validate_content(s: &str) -> Result<(), Error> {
    validate_string(s)?;
    let chars = s.chars().count();
    if chars == 0 {
        return Err(Error::EmptyContent);
    }
    if chars > MAX_CONTENT_CHARS {
        return Err(Error::ContentTooLong(chars));
    }
    Ok(())
}
