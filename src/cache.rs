use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::entity::{Channel, Entity, EntityKey, EntityType, ImLink, ReadState, Target, User};
use crate::remote::UnreadCounts;

#[derive(Default)]
struct Maps {
    channels: HashMap<String, Channel>,
    channel_names: HashMap<String, String>,
    users: HashMap<String, User>,
    user_names: HashMap<String, String>,
    ims: HashMap<String, ImLink>,
    ims_by_user: HashMap<String, String>,
}

/// Authoritative in-memory view of the workspace.
///
/// Every read takes the shared lock and hands out an owned copy; every write
/// goes through `replace_*` or `mutate_*` under the exclusive lock. The lock
/// is never held across an `.await`.
#[derive(Default)]
pub struct EntityCache {
    maps: RwLock<Maps>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Maps> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Maps> {
        self.maps.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channel(&self, id: &str) -> Channel {
        self.read().channels.get(id).cloned().unwrap_or_else(Channel::nil)
    }

    pub fn channel_by_name(&self, name: &str) -> Channel {
        let maps = self.read();
        maps.channel_names
            .get(name)
            .and_then(|id| maps.channels.get(id))
            .cloned()
            .unwrap_or_else(Channel::nil)
    }

    pub fn user(&self, id: &str) -> User {
        self.read().users.get(id).cloned().unwrap_or_else(User::nil)
    }

    pub fn user_by_name(&self, name: &str) -> User {
        let maps = self.read();
        maps.user_names
            .get(name)
            .and_then(|id| maps.users.get(id))
            .cloned()
            .unwrap_or_else(User::nil)
    }

    pub fn im(&self, id: &str) -> ImLink {
        self.read().ims.get(id).cloned().unwrap_or_else(ImLink::nil)
    }

    pub fn im_by_user(&self, user_id: &str) -> ImLink {
        let maps = self.read();
        maps.ims_by_user
            .get(user_id)
            .and_then(|id| maps.ims.get(id))
            .cloned()
            .unwrap_or_else(ImLink::nil)
    }

    pub fn lookup(&self, key: &EntityKey) -> Target {
        match key.kind {
            EntityType::Channel => Target::Channel(self.channel(&key.id)),
            EntityType::User => Target::User(self.user(&key.id)),
        }
    }

    pub fn lookup_by_name(&self, kind: EntityType, name: &str) -> Target {
        match kind {
            EntityType::Channel => Target::Channel(self.channel_by_name(name)),
            EntityType::User => Target::User(self.user_by_name(name)),
        }
    }

    /// Resolves a conversation id to its entity: rooms first, then the
    /// one-to-one links. The flag is true for one-to-one conversations.
    pub fn resolve_room(&self, room_id: &str) -> (Target, bool) {
        let maps = self.read();
        if let Some(channel) = maps.channels.get(room_id) {
            return (Target::Channel(channel.clone()), false);
        }
        let user = maps
            .ims
            .get(room_id)
            .and_then(|im| maps.users.get(&im.user))
            .cloned();
        match user {
            Some(user) => (Target::User(user), true),
            None => (Target::User(User::nil()), false),
        }
    }

    pub fn snapshot(&self, kind: EntityType) -> Vec<Target> {
        let maps = self.read();
        let mut items: Vec<Target> = match kind {
            EntityType::Channel => maps.channels.values().cloned().map(Target::Channel).collect(),
            EntityType::User => maps.users.values().cloned().map(Target::User).collect(),
        };
        items.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.id().cmp(b.id())));
        items
    }

    pub fn names(&self, kind: EntityType) -> Vec<String> {
        let maps = self.read();
        match kind {
            EntityType::Channel => maps.channel_names.keys().cloned().collect(),
            EntityType::User => maps.user_names.keys().cloned().collect(),
        }
    }

    pub fn ims(&self) -> Vec<ImLink> {
        let mut ims: Vec<ImLink> = self.read().ims.values().cloned().collect();
        ims.sort_by(|a, b| a.id.cmp(&b.id));
        ims
    }

    /// Swaps in a fresh room/group list, carrying read-state forward for
    /// rooms whose fresh snapshot has no last-read position.
    pub fn replace_channels(&self, fresh: impl IntoIterator<Item = Channel>) {
        let mut channels: HashMap<String, Channel> = HashMap::new();
        for channel in fresh {
            channels.insert(channel.id.clone(), channel);
        }
        let channel_names = channels
            .values()
            .map(|channel| (channel.name.clone(), channel.id.clone()))
            .collect();

        let mut maps = self.write();
        for channel in channels.values_mut() {
            if let Some(previous) = maps.channels.get(&channel.id) {
                channel.read.carry_forward(&previous.read);
            }
        }
        maps.channels = channels;
        maps.channel_names = channel_names;
    }

    pub fn replace_users(&self, fresh: impl IntoIterator<Item = User>) {
        let mut users: HashMap<String, User> = HashMap::new();
        for user in fresh {
            users.insert(user.id.clone(), user);
        }
        let user_names = users
            .values()
            .map(|user| (user.name.clone(), user.id.clone()))
            .collect();

        let mut maps = self.write();
        for user in users.values_mut() {
            if let Some(previous) = maps.users.get(&user.id) {
                user.read.carry_forward(&previous.read);
            }
        }
        maps.users = users;
        maps.user_names = user_names;
    }

    /// Swaps in a fresh conversation-link list and mirrors each link's
    /// remote read-state onto its user.
    pub fn replace_ims(&self, fresh: impl IntoIterator<Item = ImLink>) {
        let mut ims: HashMap<String, ImLink> = HashMap::new();
        for im in fresh {
            ims.insert(im.id.clone(), im);
        }
        let ims_by_user: HashMap<String, String> = ims
            .values()
            .map(|im| (im.user.clone(), im.id.clone()))
            .collect();

        let mut maps = self.write();
        for im in ims.values() {
            let Some(user) = maps.users.get_mut(&im.user) else {
                continue;
            };
            if !im.read.last_read.is_empty() {
                user.read.last_read = im.read.last_read.clone();
                user.read.unread = im.read.unread;
            }
            if !im.read.latest.is_empty() {
                user.read.latest = im.read.latest.clone();
            }
        }
        maps.ims = ims;
        maps.ims_by_user = ims_by_user;
    }

    pub fn mutate_channel(&self, id: &str, f: impl FnOnce(&mut Channel)) -> bool {
        match self.write().channels.get_mut(id) {
            Some(channel) => {
                f(channel);
                true
            }
            None => false,
        }
    }

    pub fn mutate_user(&self, id: &str, f: impl FnOnce(&mut User)) -> bool {
        match self.write().users.get_mut(id) {
            Some(user) => {
                f(user);
                true
            }
            None => false,
        }
    }

    pub fn mutate_read_state(
        &self,
        key: &EntityKey,
        f: impl FnOnce(&mut ReadState),
    ) -> Option<ReadState> {
        let mut maps = self.write();
        let state = match key.kind {
            EntityType::Channel => maps.channels.get_mut(&key.id).map(|channel| &mut channel.read),
            EntityType::User => maps.users.get_mut(&key.id).map(|user| &mut user.read),
        }?;
        f(state);
        Some(state.clone())
    }

    /// The counts endpoint is authoritative: overwrite without carry-forward.
    pub fn apply_counts(&self, counts: &UnreadCounts) {
        let mut maps = self.write();
        for entry in counts.channels.iter().chain(counts.groups.iter()) {
            if let Some(channel) = maps.channels.get_mut(&entry.id) {
                channel.read = entry.read.clone();
            }
        }
        for entry in &counts.ims {
            if let Some(user) = maps.users.get_mut(&entry.user) {
                user.read = entry.read.clone();
            }
        }
    }
}
