use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::entity::{Channel, ImLink, ReadState, User, Watermark};
use crate::events::{Attachment, IncomingMessage, ReactionEvent, RoomChange, SharedFile, StreamEvent};
use crate::remote::{
    Bootstrap, ChannelCount, HistoryPage, ImCount, PinnedItem, RemoteFile, UnreadCounts,
};

/// `latest` is a bare position token in counts and a whole message in
/// conversation listings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WireLatest {
    Ts(String),
    Message { ts: Option<String> },
}

impl WireLatest {
    fn into_watermark(self) -> Watermark {
        match self {
            WireLatest::Ts(ts) => Watermark::new(ts),
            WireLatest::Message { ts } => Watermark::new(ts.unwrap_or_default()),
        }
    }
}

fn read_state(
    unread: Option<u32>,
    last_read: Option<String>,
    latest: Option<WireLatest>,
) -> ReadState {
    ReadState::new(
        unread.unwrap_or(0),
        last_read.unwrap_or_default(),
        latest.map(WireLatest::into_watermark).unwrap_or_default(),
    )
}

#[derive(Debug, Deserialize)]
pub struct WireProfile {
    #[serde(default)]
    pub real_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireUser {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub real_name: Option<String>,
    #[serde(default)]
    pub presence: Option<String>,
    #[serde(default)]
    pub profile: Option<WireProfile>,
}

impl From<WireUser> for User {
    fn from(wire: WireUser) -> Self {
        let real_name = wire
            .real_name
            .or_else(|| wire.profile.and_then(|profile| profile.real_name))
            .unwrap_or_default();
        User {
            id: wire.id,
            name: wire.name,
            real_name,
            presence: wire.presence.unwrap_or_else(|| "away".to_string()),
            read: ReadState::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WireChannel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub is_channel: bool,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub is_member: Option<bool>,
    #[serde(default)]
    pub last_read: Option<String>,
    #[serde(default)]
    pub unread_count: Option<u32>,
    #[serde(default)]
    pub unread_count_display: Option<u32>,
    #[serde(default)]
    pub latest: Option<WireLatest>,
}

impl From<WireChannel> for Channel {
    fn from(wire: WireChannel) -> Self {
        let is_channel = wire.is_channel || !wire.is_group;
        Channel {
            id: wire.id,
            name: wire.name,
            creator: wire.creator,
            members: wire.members,
            is_channel,
            // Groups are only listed to their members.
            is_member: wire.is_member.unwrap_or(!is_channel),
            read: read_state(
                wire.unread_count_display.or(wire.unread_count),
                wire.last_read,
                wire.latest,
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WireIm {
    pub id: String,
    pub user: String,
    #[serde(default)]
    pub last_read: Option<String>,
    #[serde(default)]
    pub unread_count: Option<u32>,
    #[serde(default)]
    pub unread_count_display: Option<u32>,
    #[serde(default)]
    pub latest: Option<WireLatest>,
}

impl From<WireIm> for ImLink {
    fn from(wire: WireIm) -> Self {
        ImLink {
            id: wire.id,
            user: wire.user,
            read: read_state(
                wire.unread_count_display.or(wire.unread_count),
                wire.last_read,
                wire.latest,
            ),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WireAttachment {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub pretext: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub thumb_url: String,
}

impl From<WireAttachment> for Attachment {
    fn from(wire: WireAttachment) -> Self {
        Attachment {
            title: wire.title,
            pretext: wire.pretext,
            text: wire.text,
            image_url: wire.image_url,
            thumb_url: wire.thumb_url,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub ts: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub attachments: Vec<WireAttachment>,
    #[serde(default)]
    pub message: Option<Box<WireMessage>>,
}

impl From<WireMessage> for IncomingMessage {
    fn from(wire: WireMessage) -> Self {
        IncomingMessage {
            room: wire.channel,
            user: wire.user,
            username: wire.username,
            text: wire.text,
            ts: Watermark::new(wire.ts),
            subtype: wire.subtype,
            hidden: wire.hidden,
            attachments: wire.attachments.into_iter().map(Attachment::from).collect(),
            submessage: wire.message.map(|inner| Box::new(IncomingMessage::from(*inner))),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WireFile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub ims: Vec<String>,
    #[serde(default)]
    pub url_private: String,
    #[serde(default)]
    pub url_private_download: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub permalink_public: String,
    #[serde(default)]
    pub created: Option<i64>,
}

impl From<WireFile> for SharedFile {
    fn from(wire: WireFile) -> Self {
        SharedFile {
            id: wire.id,
            name: wire.name,
            title: wire.title,
            user: wire.user,
            channels: wire
                .channels
                .into_iter()
                .chain(wire.groups)
                .chain(wire.ims)
                .collect(),
            url_private: wire.url_private,
            url_private_download: wire.url_private_download,
            permalink: wire.permalink,
            permalink_public: wire.permalink_public,
        }
    }
}

impl From<WireFile> for RemoteFile {
    fn from(wire: WireFile) -> Self {
        let created = wire
            .created
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
        let shared = SharedFile::from(wire);
        RemoteFile {
            url: shared.best_url().to_string(),
            id: shared.id,
            user: shared.user,
            title: shared.title,
            created,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WireHistory {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub latest: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

impl From<WireHistory> for HistoryPage {
    fn from(wire: WireHistory) -> Self {
        HistoryPage {
            messages: wire.messages.into_iter().map(IncomingMessage::from).collect(),
            latest: Watermark::new(wire.latest.unwrap_or_default()),
            has_more: wire.has_more,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WireCount {
    pub id: String,
    #[serde(default)]
    pub last_read: Option<String>,
    #[serde(default)]
    pub latest: Option<WireLatest>,
    #[serde(default)]
    pub unread_count: Option<u32>,
    #[serde(default)]
    pub unread_count_display: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct WireImCount {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub last_read: Option<String>,
    #[serde(default)]
    pub latest: Option<WireLatest>,
    #[serde(default)]
    pub dm_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct WireCounts {
    #[serde(default)]
    pub channels: Vec<WireCount>,
    #[serde(default)]
    pub groups: Vec<WireCount>,
    #[serde(default)]
    pub ims: Vec<WireImCount>,
}

impl From<WireCount> for ChannelCount {
    fn from(wire: WireCount) -> Self {
        ChannelCount {
            id: wire.id,
            read: read_state(
                wire.unread_count_display.or(wire.unread_count),
                wire.last_read,
                wire.latest,
            ),
        }
    }
}

impl From<WireCounts> for UnreadCounts {
    fn from(wire: WireCounts) -> Self {
        UnreadCounts {
            channels: wire.channels.into_iter().map(ChannelCount::from).collect(),
            groups: wire.groups.into_iter().map(ChannelCount::from).collect(),
            ims: wire
                .ims
                .into_iter()
                .map(|im| ImCount {
                    id: im.id,
                    user: im.user_id,
                    read: read_state(im.dm_count, im.last_read, im.latest),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WirePin {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: Option<WireMessage>,
    #[serde(default)]
    pub file: Option<WireFile>,
}

impl WirePin {
    /// Pinned comments and unknown item kinds are skipped.
    pub fn into_item(self) -> Option<PinnedItem> {
        match (self.kind.as_str(), self.message, self.file) {
            ("message", Some(message), _) => Some(PinnedItem::Message {
                user: message.user,
                text: message.text,
                ts: Watermark::new(message.ts),
            }),
            ("file", _, Some(file)) => Some(PinnedItem::File(file.into())),
            _ => None,
        }
    }
}

/// Group listings do not always flag their entries as groups.
pub fn groups(wire: Vec<WireChannel>) -> Vec<Channel> {
    wire.into_iter()
        .map(|mut group| {
            group.is_group = true;
            group.is_channel = false;
            Channel::from(group)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct WireSelf {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct WireStart {
    pub url: String,
    #[serde(rename = "self")]
    pub me: WireSelf,
    #[serde(default)]
    pub users: Vec<WireUser>,
    #[serde(default)]
    pub channels: Vec<WireChannel>,
    #[serde(default)]
    pub groups: Vec<WireChannel>,
    #[serde(default)]
    pub ims: Vec<WireIm>,
}

impl WireStart {
    pub fn into_parts(self) -> (String, Bootstrap) {
        let bootstrap = Bootstrap {
            self_name: self.me.name,
            users: self.users.into_iter().map(User::from).collect(),
            channels: self.channels.into_iter().map(Channel::from).collect(),
            groups: groups(self.groups),
            ims: self.ims.into_iter().map(ImLink::from).collect(),
        };
        (self.url, bootstrap)
    }
}

#[derive(Debug, Deserialize)]
struct WireReaction {
    #[serde(default)]
    user: String,
    #[serde(default)]
    reaction: String,
    #[serde(default)]
    item: WireReactionItem,
}

#[derive(Debug, Default, Deserialize)]
struct WireReactionItem {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    ts: String,
}

/// Id of a field that is either a bare id or an object with an `id`.
fn id_field(value: &Value, field: &str) -> String {
    match value.get(field) {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Object(object)) => object
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

fn str_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn shared_file(value: &Value) -> Result<SharedFile, serde_json::Error> {
    let id = str_field(value, "file_id");
    let mut file: SharedFile = match value.get("file") {
        Some(file) if file.is_object() => WireFile::deserialize(file)?.into(),
        _ => SharedFile::default(),
    };
    if file.id.is_empty() {
        file.id = id;
    }
    Ok(file)
}

/// Decodes one text frame of the real-time stream. Frames without a
/// `type` (replies to our own pings) decode to `None`.
pub fn decode_event(frame: &str) -> Result<Option<StreamEvent>, serde_json::Error> {
    let value: Value = serde_json::from_str(frame)?;
    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
        return Ok(None);
    };

    let lifecycle = |change| StreamEvent::RoomLifecycle {
        room: id_field(&value, "channel"),
        change,
    };
    let event = match kind.as_str() {
        "hello" => StreamEvent::Hello,
        "message" => StreamEvent::Message(WireMessage::deserialize(&value)?.into()),
        "channel_created" | "group_created" => lifecycle(RoomChange::Created),
        "channel_rename" | "group_rename" => lifecycle(RoomChange::Renamed),
        "channel_archive" | "group_archive" => lifecycle(RoomChange::Archived),
        "channel_unarchive" | "group_unarchive" => lifecycle(RoomChange::Unarchived),
        "channel_deleted" | "group_deleted" => lifecycle(RoomChange::Deleted),
        "channel_joined" | "group_joined" => StreamEvent::Membership {
            room: id_field(&value, "channel"),
            joined: true,
        },
        "channel_left" | "group_left" => StreamEvent::Membership {
            room: id_field(&value, "channel"),
            joined: false,
        },
        "team_join" => StreamEvent::TeamJoin {
            user: id_field(&value, "user"),
        },
        "im_created" => StreamEvent::ImCreated {
            user: id_field(&value, "user"),
            channel: id_field(&value, "channel"),
        },
        "presence_change" => StreamEvent::Presence {
            user: str_field(&value, "user"),
            presence: str_field(&value, "presence"),
        },
        "user_typing" => StreamEvent::Typing {
            room: str_field(&value, "channel"),
            user: str_field(&value, "user"),
        },
        "reaction_added" | "reaction_removed" => {
            let wire = WireReaction::deserialize(&value)?;
            StreamEvent::Reaction(ReactionEvent {
                user: wire.user,
                room: wire.item.channel,
                reaction: wire.reaction,
                item_ts: Watermark::new(wire.item.ts),
                added: kind == "reaction_added",
            })
        }
        "file_shared" => StreamEvent::FileShared(shared_file(&value)?),
        "file_public" => StreamEvent::FilePublic(shared_file(&value)?),
        "pref_change" => StreamEvent::PrefChange {
            name: str_field(&value, "name"),
            value: match value.get("value") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            },
        },
        "channel_marked" | "group_marked" | "im_marked" => StreamEvent::Marked {
            room: str_field(&value, "channel"),
        },
        "reconnect_url" => StreamEvent::ReconnectUrl,
        "pong" => StreamEvent::LatencyReport,
        _ => StreamEvent::Unhandled { kind },
    };
    Ok(Some(event))
}
