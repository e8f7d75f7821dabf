use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const NIL_ID: &str = "-";
pub const NIL_NAME: &str = "UNKNOWN";

const PRESENCE_ACTIVE: &str = "active";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Channel,
    User,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Channel => "channel",
            EntityType::User => "user",
        }
    }

    pub fn sigil(&self) -> char {
        match self {
            EntityType::Channel => '#',
            EntityType::User => '@',
        }
    }

    pub fn from_sigil(sigil: char) -> Option<Self> {
        match sigil {
            '#' => Some(EntityType::Channel),
            '@' => Some(EntityType::User),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque `seconds.fraction` position token assigned by the remote side.
///
/// The numeric value is only ever used for ordering. Storage and
/// transmission always use the original string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Watermark(String);

impl Watermark {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn value(&self) -> f64 {
        self.0.trim().parse::<f64>().unwrap_or(0.0)
    }

    pub fn is_zero(&self) -> bool {
        self.value() == 0.0
    }

    pub fn is_after(&self, other: &Watermark) -> bool {
        self.value() > other.value()
    }

    /// Moves the watermark forward to `other` if it is later. Never moves back.
    pub fn raise_to(&mut self, other: &Watermark) -> bool {
        if other.is_empty() {
            return false;
        }
        if self.is_empty() || other.is_after(self) {
            self.0 = other.0.clone();
            return true;
        }
        false
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let (seconds, fraction) = match self.0.split_once('.') {
            Some((seconds, fraction)) => (seconds, fraction),
            None => (self.0.as_str(), ""),
        };
        let seconds = seconds.parse::<i64>().ok()?;
        let nanos = if fraction.is_empty() {
            0
        } else {
            let digits: String = fraction.chars().take(9).collect();
            let padded = format!("{digits:0<9}");
            padded.parse::<u32>().ok()?
        };
        DateTime::from_timestamp(seconds, nanos)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Watermark {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Watermark {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadState {
    pub unread: u32,
    pub last_read: Watermark,
    pub latest: Watermark,
}

impl ReadState {
    pub fn new(unread: u32, last_read: impl Into<Watermark>, latest: impl Into<Watermark>) -> Self {
        Self {
            unread,
            last_read: last_read.into(),
            latest: latest.into(),
        }
    }

    pub fn record_message(&mut self, at: &Watermark) {
        self.unread = self.unread.saturating_add(1);
        self.latest.raise_to(at);
    }

    pub fn mark_read(&mut self, at: Watermark) {
        self.unread = 0;
        self.last_read = at;
    }

    /// Refresh snapshots without a last-read position are not authoritative
    /// for read-state; keep what we already knew.
    pub fn carry_forward(&mut self, previous: &ReadState) {
        if !self.last_read.is_empty() {
            return;
        }
        self.last_read = previous.last_read.clone();
        self.latest = previous.latest.clone();
        self.unread = previous.unread;
    }

    pub fn has_backlog(&self) -> bool {
        if self.last_read.is_empty() || self.latest.is_empty() {
            return false;
        }
        if self.last_read.is_zero() || self.latest.is_zero() {
            return false;
        }
        if self.last_read == self.latest {
            return false;
        }
        self.latest.is_after(&self.last_read)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityKey {
    pub kind: EntityType,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityType, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn channel(id: impl Into<String>) -> Self {
        Self::new(EntityType::Channel, id)
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(EntityType::User, id)
    }
}

pub trait Entity {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn entity_type(&self) -> EntityType;
    fn read_state(&self) -> &ReadState;
    fn is_active(&self) -> bool;

    fn qualified_name(&self) -> String {
        format!("{}{}", self.entity_type().sigil(), self.name())
    }

    fn unread_count(&self) -> u32 {
        self.read_state().unread
    }

    fn is_nil(&self) -> bool {
        self.id() == NIL_ID
    }

    fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type(), self.id())
    }

    fn is(&self, other: &dyn Entity) -> bool {
        self.entity_type() == other.entity_type() && self.id() == other.id()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub creator: String,
    pub members: Vec<String>,
    pub is_channel: bool,
    pub is_member: bool,
    pub read: ReadState,
}

impl Channel {
    pub fn nil() -> Self {
        Self {
            id: NIL_ID.to_string(),
            name: NIL_NAME.to_string(),
            creator: NIL_NAME.to_string(),
            members: Vec::new(),
            is_channel: true,
            is_member: false,
            read: ReadState::default(),
        }
    }

    pub fn add_member(&mut self, user_id: &str) {
        if !self.members.iter().any(|member| member == user_id) {
            self.members.push(user_id.to_string());
        }
    }

    pub fn remove_member(&mut self, user_id: &str) {
        self.members.retain(|member| member != user_id);
    }
}

impl Entity for Channel {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn entity_type(&self) -> EntityType {
        EntityType::Channel
    }

    fn read_state(&self) -> &ReadState {
        &self.read
    }

    fn is_active(&self) -> bool {
        self.is_member
    }
}

/// Profile fields are copied at ingestion; read-state mirrors the user's
/// one-to-one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub real_name: String,
    pub presence: String,
    pub read: ReadState,
}

impl User {
    pub fn nil() -> Self {
        Self {
            id: NIL_ID.to_string(),
            name: NIL_NAME.to_string(),
            real_name: NIL_NAME.to_string(),
            presence: String::new(),
            read: ReadState::default(),
        }
    }
}

impl Entity for User {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn entity_type(&self) -> EntityType {
        EntityType::User
    }

    fn read_state(&self) -> &ReadState {
        &self.read
    }

    fn is_active(&self) -> bool {
        self.presence == PRESENCE_ACTIVE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImLink {
    pub id: String,
    pub user: String,
    pub read: ReadState,
}

impl ImLink {
    pub fn nil() -> Self {
        Self {
            id: NIL_ID.to_string(),
            user: NIL_ID.to_string(),
            read: ReadState::default(),
        }
    }

    pub fn is_nil(&self) -> bool {
        self.id == NIL_ID
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Target {
    Channel(Channel),
    User(User),
}

impl Target {
    pub fn nil(kind: EntityType) -> Self {
        match kind {
            EntityType::Channel => Target::Channel(Channel::nil()),
            EntityType::User => Target::User(User::nil()),
        }
    }

    pub fn as_channel(&self) -> Option<&Channel> {
        match self {
            Target::Channel(channel) => Some(channel),
            Target::User(_) => None,
        }
    }

    pub fn as_user(&self) -> Option<&User> {
        match self {
            Target::User(user) => Some(user),
            Target::Channel(_) => None,
        }
    }

    fn inner(&self) -> &dyn Entity {
        match self {
            Target::Channel(channel) => channel,
            Target::User(user) => user,
        }
    }
}

impl Entity for Target {
    fn id(&self) -> &str {
        self.inner().id()
    }

    fn name(&self) -> &str {
        self.inner().name()
    }

    fn entity_type(&self) -> EntityType {
        self.inner().entity_type()
    }

    fn read_state(&self) -> &ReadState {
        self.inner().read_state()
    }

    fn is_active(&self) -> bool {
        self.inner().is_active()
    }
}

impl From<Channel> for Target {
    fn from(value: Channel) -> Self {
        Target::Channel(value)
    }
}

impl From<User> for Target {
    fn from(value: User) -> Self {
        Target::User(value)
    }
}
