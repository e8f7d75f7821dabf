use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::api::ApiError;
use crate::entity::{Channel, ImLink, ReadState, User, Watermark};
use crate::events::{IncomingMessage, StreamEvent};
use crate::realtime::RealtimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    Channel,
    Group,
    Im,
}

impl RoomKind {
    pub fn family(&self) -> &'static str {
        match self {
            RoomKind::Channel => "channels",
            RoomKind::Group => "groups",
            RoomKind::Im => "im",
        }
    }

    pub fn for_channel(channel: &Channel) -> Self {
        if channel.is_channel {
            RoomKind::Channel
        } else {
            RoomKind::Group
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryQuery {
    pub oldest: Watermark,
    pub latest: Watermark,
    pub count: Option<u32>,
    pub inclusive: bool,
}

impl HistoryQuery {
    pub fn since(oldest: Watermark) -> Self {
        Self {
            oldest,
            ..Self::default()
        }
    }

    pub fn last(count: u32) -> Self {
        Self {
            count: Some(count),
            inclusive: true,
            ..Self::default()
        }
    }
}

/// One page of history, newest message first as the remote returns it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    pub messages: Vec<IncomingMessage>,
    pub latest: Watermark,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnreadCounts {
    pub channels: Vec<ChannelCount>,
    pub groups: Vec<ChannelCount>,
    pub ims: Vec<ImCount>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelCount {
    pub id: String,
    pub read: ReadState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImCount {
    pub id: String,
    pub user: String,
    pub read: ReadState,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteFile {
    pub id: String,
    pub user: String,
    pub title: String,
    pub url: String,
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PinnedItem {
    Message {
        user: String,
        text: String,
        ts: Watermark,
    },
    File(RemoteFile),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    pub room: String,
    pub path: PathBuf,
    pub title: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteOutcome {
    Invited,
    AlreadyMember,
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn fetch_users(&self) -> Result<Vec<User>, ApiError>;
    async fn fetch_channels(&self) -> Result<Vec<Channel>, ApiError>;
    async fn fetch_groups(&self) -> Result<Vec<Channel>, ApiError>;
    async fn fetch_ims(&self) -> Result<Vec<ImLink>, ApiError>;
    async fn fetch_counts(&self) -> Result<UnreadCounts, ApiError>;
    async fn history(
        &self,
        kind: RoomKind,
        room: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, ApiError>;
    async fn post_message(&self, room: &str, text: &str) -> Result<(), ApiError>;
    async fn set_read_marker(
        &self,
        kind: RoomKind,
        room: &str,
        at: &Watermark,
    ) -> Result<(), ApiError>;
    async fn list_pins(&self, room: &str) -> Result<Vec<PinnedItem>, ApiError>;
    async fn list_files(&self, room: &str) -> Result<Vec<RemoteFile>, ApiError>;
    async fn upload_file(&self, upload: &FileUpload) -> Result<RemoteFile, ApiError>;
    async fn join_channel(&self, name: &str) -> Result<(), ApiError>;
    async fn leave(&self, kind: RoomKind, room: &str) -> Result<(), ApiError>;
    async fn invite(
        &self,
        kind: RoomKind,
        room: &str,
        user: &str,
    ) -> Result<InviteOutcome, ApiError>;
}

#[derive(Debug, Clone, Default)]
pub struct Bootstrap {
    pub self_name: String,
    pub users: Vec<User>,
    pub channels: Vec<Channel>,
    pub groups: Vec<Channel>,
    pub ims: Vec<ImLink>,
}

pub struct Connection {
    pub bootstrap: Bootstrap,
    pub events: mpsc::Receiver<StreamEvent>,
}

/// Opens the live event stream.
///
/// Implementations stop and close their transport when `shutdown` flips
/// to `true`, and only then drop the event sender.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self, shutdown: watch::Receiver<bool>) -> Result<Connection, RealtimeError>;
}

pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
