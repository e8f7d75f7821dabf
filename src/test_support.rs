use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::api::ApiError;
use crate::engine::{Engine, EngineSettings};
use crate::entity::{Channel, ImLink, ReadState, User, Watermark};
use crate::events::{IncomingMessage, StreamEvent};
use crate::output::{ListItem, Output};
use crate::realtime::RealtimeError;
use crate::remote::{
    Bootstrap, Connection, EventSource, FileUpload, HistoryPage, HistoryQuery, InviteOutcome,
    PinnedItem, RemoteApi, RemoteFile, RoomKind, UnreadCounts, wait_for_shutdown,
};

pub fn channel(id: &str, name: &str) -> Channel {
    Channel {
        id: id.to_string(),
        name: name.to_string(),
        creator: "U0".to_string(),
        members: Vec::new(),
        is_channel: true,
        is_member: true,
        read: ReadState::default(),
    }
}

pub fn group(id: &str, name: &str) -> Channel {
    Channel {
        is_channel: false,
        ..channel(id, name)
    }
}

pub fn user(id: &str, name: &str) -> User {
    User {
        id: id.to_string(),
        name: name.to_string(),
        real_name: name.to_string(),
        presence: "away".to_string(),
        read: ReadState::default(),
    }
}

pub fn im(id: &str, user: &str) -> ImLink {
    ImLink {
        id: id.to_string(),
        user: user.to_string(),
        read: ReadState::default(),
    }
}

pub fn message(room: &str, user: &str, text: &str, ts: &str) -> IncomingMessage {
    IncomingMessage {
        room: room.to_string(),
        user: user.to_string(),
        text: text.to_string(),
        ts: Watermark::new(ts),
        ..Default::default()
    }
}

pub fn page(messages: Vec<IncomingMessage>, latest: &str, has_more: bool) -> HistoryPage {
    HistoryPage {
        messages,
        latest: Watermark::new(latest),
        has_more,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    FetchUsers,
    FetchChannels,
    FetchGroups,
    FetchIms,
    FetchCounts,
    History {
        kind: RoomKind,
        room: String,
        query: HistoryQuery,
    },
    Post {
        room: String,
        text: String,
    },
    Mark {
        kind: RoomKind,
        room: String,
        at: Watermark,
    },
    Pins(String),
    Files(String),
    Upload(FileUpload),
    Join(String),
    Leave {
        kind: RoomKind,
        room: String,
    },
    Invite {
        kind: RoomKind,
        room: String,
        user: String,
    },
}

#[derive(Default)]
pub struct FakeRemote {
    pub users: Mutex<Vec<User>>,
    pub channels: Mutex<Vec<Channel>>,
    pub groups: Mutex<Vec<Channel>>,
    pub ims: Mutex<Vec<ImLink>>,
    pub counts: Mutex<UnreadCounts>,
    pub pins: Mutex<Vec<PinnedItem>>,
    pub files: Mutex<Vec<RemoteFile>>,
    pub invite_outcome: Mutex<Option<InviteOutcome>>,
    pages: Mutex<VecDeque<HistoryPage>>,
    failing: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<RemoteCall>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_page(&self, page: HistoryPage) {
        lock(&self.pages).push_back(page);
    }

    pub fn fail(&self, method: &'static str) {
        lock(&self.failing).insert(method);
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        lock(&self.calls).clone()
    }

    pub fn marks(&self) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, RemoteCall::Mark { .. }))
            .collect()
    }

    pub fn history_calls(&self) -> Vec<HistoryQuery> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RemoteCall::History { query, .. } => Some(query),
                _ => None,
            })
            .collect()
    }

    fn record(&self, method: &'static str, call: RemoteCall) -> Result<(), ApiError> {
        lock(&self.calls).push(call);
        if lock(&self.failing).contains(method) {
            return Err(ApiError::Api {
                error: format!("{method}_failed"),
                description: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn fetch_users(&self) -> Result<Vec<User>, ApiError> {
        self.record("users", RemoteCall::FetchUsers)?;
        Ok(lock(&self.users).clone())
    }

    async fn fetch_channels(&self) -> Result<Vec<Channel>, ApiError> {
        self.record("channels", RemoteCall::FetchChannels)?;
        Ok(lock(&self.channels).clone())
    }

    async fn fetch_groups(&self) -> Result<Vec<Channel>, ApiError> {
        self.record("groups", RemoteCall::FetchGroups)?;
        Ok(lock(&self.groups).clone())
    }

    async fn fetch_ims(&self) -> Result<Vec<ImLink>, ApiError> {
        self.record("ims", RemoteCall::FetchIms)?;
        Ok(lock(&self.ims).clone())
    }

    async fn fetch_counts(&self) -> Result<UnreadCounts, ApiError> {
        self.record("counts", RemoteCall::FetchCounts)?;
        Ok(lock(&self.counts).clone())
    }

    async fn history(
        &self,
        kind: RoomKind,
        room: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, ApiError> {
        self.record(
            "history",
            RemoteCall::History {
                kind,
                room: room.to_string(),
                query: query.clone(),
            },
        )?;
        Ok(lock(&self.pages).pop_front().unwrap_or_default())
    }

    async fn post_message(&self, room: &str, text: &str) -> Result<(), ApiError> {
        self.record(
            "post",
            RemoteCall::Post {
                room: room.to_string(),
                text: text.to_string(),
            },
        )
    }

    async fn set_read_marker(
        &self,
        kind: RoomKind,
        room: &str,
        at: &Watermark,
    ) -> Result<(), ApiError> {
        self.record(
            "mark",
            RemoteCall::Mark {
                kind,
                room: room.to_string(),
                at: at.clone(),
            },
        )
    }

    async fn list_pins(&self, room: &str) -> Result<Vec<PinnedItem>, ApiError> {
        self.record("pins", RemoteCall::Pins(room.to_string()))?;
        Ok(lock(&self.pins).clone())
    }

    async fn list_files(&self, room: &str) -> Result<Vec<RemoteFile>, ApiError> {
        self.record("files", RemoteCall::Files(room.to_string()))?;
        Ok(lock(&self.files).clone())
    }

    async fn upload_file(&self, upload: &FileUpload) -> Result<RemoteFile, ApiError> {
        self.record("upload", RemoteCall::Upload(upload.clone()))?;
        Ok(RemoteFile {
            id: "F1".to_string(),
            title: upload.title.clone().unwrap_or_default(),
            ..RemoteFile::default()
        })
    }

    async fn join_channel(&self, name: &str) -> Result<(), ApiError> {
        self.record("join", RemoteCall::Join(name.to_string()))
    }

    async fn leave(&self, kind: RoomKind, room: &str) -> Result<(), ApiError> {
        self.record(
            "leave",
            RemoteCall::Leave {
                kind,
                room: room.to_string(),
            },
        )
    }

    async fn invite(
        &self,
        kind: RoomKind,
        room: &str,
        user: &str,
    ) -> Result<InviteOutcome, ApiError> {
        self.record(
            "invite",
            RemoteCall::Invite {
                kind,
                room: room.to_string(),
                user: user.to_string(),
            },
        )?;
        Ok(lock(&self.invite_outcome).unwrap_or(InviteOutcome::Invited))
    }
}

/// `EventSource` fed from a test-held channel. Forwards until shutdown,
/// then drops its sender so the engine sees the stream close.
pub struct FakeSource {
    bootstrap: Bootstrap,
    feed: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
    connect_delay: Option<Duration>,
}

impl FakeSource {
    pub fn new(bootstrap: Bootstrap) -> (Arc<Self>, mpsc::UnboundedSender<StreamEvent>) {
        Self::with_delay(bootstrap, None)
    }

    pub fn with_delay(
        bootstrap: Bootstrap,
        connect_delay: Option<Duration>,
    ) -> (Arc<Self>, mpsc::UnboundedSender<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            bootstrap,
            feed: Mutex::new(Some(rx)),
            connect_delay,
        };
        (Arc::new(source), tx)
    }
}

#[async_trait]
impl EventSource for FakeSource {
    async fn connect(&self, mut shutdown: watch::Receiver<bool>) -> Result<Connection, RealtimeError> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        let mut feed = lock(&self.feed).take().ok_or(RealtimeError::ConnectionError)?;
        let (tx, events) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    event = feed.recv() => match event {
                        Some(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(Connection {
            bootstrap: self.bootstrap.clone(),
            events,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Notify { room: String, from: String, text: String },
    Info(String),
    Notice(String),
    Warn(String),
    Msg { room: String, from: String, text: String, at: DateTime<Utc>, new_section: bool },
    File { room: String, from: String, title: String, url: String },
    Typing { room: String, user: String, timeout: Duration },
    Debug(Vec<String>),
    List { items: Vec<ListItem>, reverse: bool },
}

#[derive(Default)]
pub struct RecordingOutput {
    records: Mutex<Vec<Recorded>>,
}

impl RecordingOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<Recorded> {
        lock(&self.records).clone()
    }

    pub fn notifies(&self) -> usize {
        self.records()
            .iter()
            .filter(|record| matches!(record, Recorded::Notify { .. }))
            .count()
    }

    pub fn messages(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Recorded::Msg { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Recorded::Warn(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    pub fn lists(&self) -> Vec<(Vec<ListItem>, bool)> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Recorded::List { items, reverse } => Some((items, reverse)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, record: Recorded) {
        lock(&self.records).push(record);
    }
}

impl Output for RecordingOutput {
    fn notify(&self, room: &str, from: &str, text: &str, _force: bool) {
        self.push(Recorded::Notify {
            room: room.to_string(),
            from: from.to_string(),
            text: text.to_string(),
        });
    }

    fn info(&self, msg: &str) {
        self.push(Recorded::Info(msg.to_string()));
    }

    fn notice(&self, msg: &str) {
        self.push(Recorded::Notice(msg.to_string()));
    }

    fn warn(&self, msg: &str) {
        self.push(Recorded::Warn(msg.to_string()));
    }

    fn msg(&self, room: &str, from: &str, text: &str, at: DateTime<Utc>, new_section: bool) {
        self.push(Recorded::Msg {
            room: room.to_string(),
            from: from.to_string(),
            text: text.to_string(),
            at,
            new_section,
        });
    }

    fn file(&self, room: &str, from: &str, title: &str, url: &str) {
        self.push(Recorded::File {
            room: room.to_string(),
            from: from.to_string(),
            title: title.to_string(),
            url: url.to_string(),
        });
    }

    fn typing(&self, room: &str, user: &str, timeout: Duration) {
        self.push(Recorded::Typing {
            room: room.to_string(),
            user: user.to_string(),
            timeout,
        });
    }

    fn debug(&self, fields: &[&str]) {
        self.push(Recorded::Debug(fields.iter().map(|field| field.to_string()).collect()));
    }

    fn list(&self, items: &[ListItem], reverse: bool) {
        self.push(Recorded::List {
            items: items.to_vec(),
            reverse,
        });
    }
}

/// Workspace used by most engine tests: `ada` is the local user, `bea`
/// has a conversation open, `#general` is joined and `#secret` is a group.
pub fn bootstrap() -> Bootstrap {
    Bootstrap {
        self_name: "ada".to_string(),
        users: vec![user("U1", "ada"), user("U2", "bea"), user("U3", "cy")],
        channels: vec![channel("C1", "general"), channel("C2", "random")],
        groups: vec![group("G1", "secret")],
        ims: vec![im("D2", "U2")],
    }
}

pub struct Harness {
    pub engine: Engine,
    pub remote: Arc<FakeRemote>,
    pub output: Arc<RecordingOutput>,
    pub feed: mpsc::UnboundedSender<StreamEvent>,
}

pub async fn harness() -> Harness {
    harness_with(bootstrap()).await
}

pub async fn harness_with(bootstrap: Bootstrap) -> Harness {
    let remote = FakeRemote::new();
    let output = RecordingOutput::new();
    let (source, feed) = FakeSource::new(bootstrap);
    let engine = Engine::new(remote.clone(), source, output.clone(), EngineSettings::default());
    engine.init().await.expect("init over fakes");
    Harness {
        engine,
        remote,
        output,
        feed,
    }
}
