//! Client-side synchronization for live comment threads.
//!
//! One [`SyncHandle`] runs one discussion thread: it keeps a local reply
//! tree consistent with the backend through the live feed when it is up and
//! through polling when it is not, applies the user's writes optimistically,
//! and publishes an immutable [`ThreadView`] snapshot after every change.

pub mod api {
    //! Wire types shared with the backend.
    pub use komento_api::*;
}

mod channel;
mod config;
mod engine;
mod optimistic;
mod poll;
mod reconcile;
mod rest;
mod tree;
mod view;

pub use channel::{ChannelState, Conduit, Connector, NoTransport};
pub use config::SyncConfig;
pub use engine::SyncHandle;
pub use optimistic::TempId;
pub use reconcile::{Applied, CommentEvent, Reconciler};
pub use rest::{HttpThreadApi, RequestError, ThreadApi};
pub use tree::{CommentNode, CommentTree, DetachedSubtree, NodeId, TreeError};
pub use view::{CommentView, Notice, ThreadView};
