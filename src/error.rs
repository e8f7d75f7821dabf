use std::time::Duration;

use crate::api::ApiError;
use crate::entity::EntityType;
use crate::realtime::RealtimeError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine already initialized")]
    AlreadyInitialized,
    #[error("engine not initialized, call init first")]
    NotInitialized,
    #[error("engine is already running or has stopped")]
    AlreadyRunning,
    #[error("timed out after {0:?} waiting for the workspace snapshot")]
    InitTimeout(Duration),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("no such {kind}: {name}")]
    NoSuchEntity { kind: EntityType, name: String },
    #[error("can not {action} a {kind}")]
    Unsupported { action: &'static str, kind: EntityType },
    #[error("no conversation open with {0}")]
    NoConversation(String),
    #[error("user {user} is already in {room}")]
    AlreadyMember { user: String, room: String },
    #[error("no channel or user with unread messages")]
    NothingUnread,
    #[error("event stream closed")]
    StreamClosed,
    #[error("upload aborted")]
    UploadAborted,
}
