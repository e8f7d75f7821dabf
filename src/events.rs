use crate::entity::Watermark;

/// One live event from the real-time stream, already decoded from the wire.
///
/// `Unhandled` keeps the remote type name so new event kinds degrade to a
/// debug line instead of an error.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connecting,
    Connected,
    Hello,
    Disconnected { intentional: bool },
    RoomLifecycle { room: String, change: RoomChange },
    Membership { room: String, joined: bool },
    TeamJoin { user: String },
    ImCreated { user: String, channel: String },
    Presence { user: String, presence: String },
    Typing { room: String, user: String },
    Message(IncomingMessage),
    Reaction(ReactionEvent),
    FileShared(SharedFile),
    FilePublic(SharedFile),
    PrefChange { name: String, value: String },
    Marked { room: String },
    LatencyReport,
    ReconnectUrl,
    Unhandled { kind: String },
}

impl StreamEvent {
    pub fn kind(&self) -> &str {
        match self {
            StreamEvent::Connecting => "connecting",
            StreamEvent::Connected => "connected",
            StreamEvent::Hello => "hello",
            StreamEvent::Disconnected { .. } => "disconnected",
            StreamEvent::RoomLifecycle { .. } => "room_lifecycle",
            StreamEvent::Membership { .. } => "membership",
            StreamEvent::TeamJoin { .. } => "team_join",
            StreamEvent::ImCreated { .. } => "im_created",
            StreamEvent::Presence { .. } => "presence_change",
            StreamEvent::Typing { .. } => "user_typing",
            StreamEvent::Message(_) => "message",
            StreamEvent::Reaction(_) => "reaction",
            StreamEvent::FileShared(_) => "file_shared",
            StreamEvent::FilePublic(_) => "file_public",
            StreamEvent::PrefChange { .. } => "pref_change",
            StreamEvent::Marked { .. } => "marked",
            StreamEvent::LatencyReport => "latency_report",
            StreamEvent::ReconnectUrl => "reconnect_url",
            StreamEvent::Unhandled { kind } => kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomChange {
    Created,
    Renamed,
    Archived,
    Unarchived,
    Deleted,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingMessage {
    pub room: String,
    pub user: String,
    pub username: String,
    pub text: String,
    pub ts: Watermark,
    pub subtype: Option<String>,
    pub hidden: bool,
    pub attachments: Vec<Attachment>,
    pub submessage: Option<Box<IncomingMessage>>,
}

impl IncomingMessage {
    pub fn unwrap_submessage(mut self) -> Self {
        if self.user.is_empty() {
            if let Some(inner) = self.submessage.take() {
                let mut inner = *inner;
                if inner.room.is_empty() {
                    inner.room = self.room;
                }
                if inner.ts.is_empty() {
                    inner.ts = self.ts;
                }
                return inner;
            }
        }
        self
    }

    pub fn membership_change(&self) -> Option<bool> {
        match self.subtype.as_deref() {
            Some("channel_join") | Some("group_join") => Some(true),
            Some("channel_leave") | Some("group_leave") => Some(false),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attachment {
    pub title: String,
    pub pretext: String,
    pub text: String,
    pub image_url: String,
    pub thumb_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReactionEvent {
    pub user: String,
    pub room: String,
    pub reaction: String,
    pub item_ts: Watermark,
    pub added: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedFile {
    pub id: String,
    pub name: String,
    pub title: String,
    pub user: String,
    pub channels: Vec<String>,
    pub url_private: String,
    pub url_private_download: String,
    pub permalink: String,
    pub permalink_public: String,
}

impl SharedFile {
    pub fn has_url(&self) -> bool {
        !(self.url_private.is_empty()
            && self.url_private_download.is_empty()
            && self.permalink.is_empty()
            && self.permalink_public.is_empty())
    }

    /// Public permalink first, then the private URL, then the other links.
    pub fn best_url(&self) -> &str {
        [
            &self.permalink_public,
            &self.url_private,
            &self.url_private_download,
            &self.permalink,
        ]
        .into_iter()
        .find(|url| !url.is_empty())
        .map(String::as_str)
        .unwrap_or("")
    }
}
