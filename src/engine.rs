use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{MissedTickBehavior, interval_at};

use crate::cache::EntityCache;
use crate::entity::{Channel, Entity, EntityKey, EntityType, Target};
use crate::error::EngineError;
use crate::events::StreamEvent;
use crate::fuzzy::{self, Resolution};
use crate::normalize::normalize;
use crate::output::{ListItem, ListItemStatus, Output, sort_items, unread_label};
use crate::read_state::flush_loop;
use crate::remote::{
    Bootstrap, Connection, EventSource, FileUpload, InviteOutcome, PinnedItem, RemoteApi,
    RoomKind, wait_for_shutdown,
};

pub const DEFAULT_TIME_FORMAT: &str = "%b %d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub init_timeout: Duration,
    pub refresh_interval: Duration,
    pub mark_interval: Duration,
    pub typing_timeout: Duration,
    pub mark_queue: usize,
    pub time_format: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(60),
            mark_interval: Duration::from_secs(5),
            typing_timeout: Duration::from_secs(4),
            mark_queue: 256,
            time_format: DEFAULT_TIME_FORMAT.to_string(),
        }
    }
}

pub(crate) struct Core {
    pub(crate) cache: EntityCache,
    pub(crate) out: Arc<dyn Output>,
    pub(crate) api: Arc<dyn RemoteApi>,
    pub(crate) settings: EngineSettings,
    pub(crate) marks: mpsc::Sender<EntityKey>,
    username: RwLock<String>,
    active: RwLock<Option<EntityKey>>,
}

impl Core {
    pub(crate) fn username(&self) -> String {
        self.username
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn active_key(&self) -> Option<EntityKey> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_active(&self, key: &EntityKey) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(key.clone());
    }

    pub(crate) fn activate_if_idle(&self, key: &EntityKey) -> bool {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            return false;
        }
        *active = Some(key.clone());
        true
    }

    pub(crate) fn is_active(&self, key: &EntityKey) -> bool {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|active| active == key)
    }

    pub(crate) fn room_of(&self, target: &Target) -> Result<(RoomKind, String), EngineError> {
        match target {
            Target::Channel(channel) if channel.is_nil() => Err(no_such(target)),
            Target::Channel(channel) => Ok((RoomKind::for_channel(channel), channel.id.clone())),
            Target::User(user) if user.is_nil() => Err(no_such(target)),
            Target::User(user) => {
                let im = self.cache.im_by_user(&user.id);
                if im.is_nil() {
                    return Err(EngineError::NoConversation(user.name.clone()));
                }
                Ok((RoomKind::Im, im.id))
            }
        }
    }

    fn ingest(&self, bootstrap: Bootstrap) {
        *self.username.write().unwrap_or_else(PoisonError::into_inner) = bootstrap.self_name;
        self.cache.replace_users(bootstrap.users);
        self.cache.replace_ims(bootstrap.ims);
        self.cache
            .replace_channels(bootstrap.channels.into_iter().chain(bootstrap.groups));
    }

    pub(crate) async fn refresh_channels(&self) -> Result<(), EngineError> {
        let (channels, groups) = tokio::try_join!(self.api.fetch_channels(), self.api.fetch_groups())?;
        tracing::debug!(channels = channels.len(), groups = groups.len(), "rooms refreshed");
        self.cache.replace_channels(channels.into_iter().chain(groups));
        Ok(())
    }

    pub(crate) async fn refresh_users(&self) -> Result<(), EngineError> {
        let users = self.api.fetch_users().await?;
        tracing::debug!(users = users.len(), "users refreshed");
        self.cache.replace_users(users);
        Ok(())
    }

    pub(crate) async fn refresh_ims(&self) -> Result<(), EngineError> {
        let ims = self.api.fetch_ims().await?;
        tracing::debug!(ims = ims.len(), "conversations refreshed");
        self.cache.replace_ims(ims);
        Ok(())
    }

    fn surface<T>(&self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(error) = &result {
            tracing::warn!(%error, "operation failed");
            self.out.warn(&error.to_string());
        }
        result
    }

    fn format_time(&self, at: Option<DateTime<Utc>>) -> String {
        match at {
            Some(at) => at
                .with_timezone(&Local)
                .format(&self.settings.time_format)
                .to_string(),
            None => "-".to_string(),
        }
    }
}

fn no_such(target: &Target) -> EngineError {
    EngineError::NoSuchEntity {
        kind: target.entity_type(),
        name: target.name().to_string(),
    }
}

fn require_channel<'a>(target: &'a Target, action: &'static str) -> Result<&'a Channel, EngineError> {
    match target {
        Target::Channel(channel) if channel.is_nil() => Err(no_such(target)),
        Target::Channel(channel) => Ok(channel),
        Target::User(_) => Err(EngineError::Unsupported {
            action,
            kind: EntityType::User,
        }),
    }
}

enum Lifecycle {
    Fresh { marks: mpsc::Receiver<EntityKey> },
    Connecting,
    Ready {
        events: mpsc::Receiver<StreamEvent>,
        marks: mpsc::Receiver<EntityKey>,
    },
    Running,
    Stopped,
}

/// The synchronization engine and its public operations.
///
/// `init` loads the workspace snapshot, `run` drains live events until the
/// stream closes, `quit` asks the transport to close it. Every other
/// operation may be called from any task while `run` is active.
pub struct Engine {
    core: Arc<Core>,
    source: Arc<dyn EventSource>,
    lifecycle: Mutex<Lifecycle>,
    shutdown: watch::Sender<bool>,
}

impl Engine {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        source: Arc<dyn EventSource>,
        out: Arc<dyn Output>,
        settings: EngineSettings,
    ) -> Self {
        let (marks, intents) = mpsc::channel(settings.mark_queue.max(1));
        let (shutdown, _) = watch::channel(false);
        let core = Core {
            cache: EntityCache::new(),
            out,
            api,
            settings,
            marks,
            username: RwLock::new(String::new()),
            active: RwLock::new(None),
        };
        Self {
            core: Arc::new(core),
            source,
            lifecycle: Mutex::new(Lifecycle::Fresh { marks: intents }),
            shutdown,
        }
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connects and loads users, conversations, rooms and groups. Fails if
    /// called twice or if the snapshot does not arrive within the timeout.
    pub async fn init(&self) -> Result<(), EngineError> {
        let marks = {
            let mut state = self.lifecycle();
            match std::mem::replace(&mut *state, Lifecycle::Connecting) {
                Lifecycle::Fresh { marks } => marks,
                previous => {
                    *state = previous;
                    return Err(EngineError::AlreadyInitialized);
                }
            }
        };

        let timeout = self.core.settings.init_timeout;
        let connected = tokio::time::timeout(timeout, self.source.connect(self.shutdown.subscribe())).await;
        let Connection { bootstrap, events } = match connected {
            Ok(Ok(connection)) => connection,
            Ok(Err(error)) => {
                *self.lifecycle() = Lifecycle::Fresh { marks };
                return Err(error.into());
            }
            Err(_) => {
                *self.lifecycle() = Lifecycle::Fresh { marks };
                return Err(EngineError::InitTimeout(timeout));
            }
        };

        tracing::info!(
            user = %bootstrap.self_name,
            users = bootstrap.users.len(),
            channels = bootstrap.channels.len(),
            groups = bootstrap.groups.len(),
            ims = bootstrap.ims.len(),
            "workspace snapshot loaded"
        );
        self.core.ingest(bootstrap);
        *self.lifecycle() = Lifecycle::Ready { events, marks };
        Ok(())
    }

    /// Processes live events in arrival order until the stream closes.
    /// Returns `Ok` when the close followed a `quit`.
    pub async fn run(&self) -> Result<(), EngineError> {
        let (mut events, marks) = {
            let mut state = self.lifecycle();
            match std::mem::replace(&mut *state, Lifecycle::Running) {
                Lifecycle::Ready { events, marks } => (events, marks),
                previous => {
                    let error = if matches!(previous, Lifecycle::Running | Lifecycle::Stopped) {
                        EngineError::AlreadyRunning
                    } else {
                        EngineError::NotInitialized
                    };
                    *state = previous;
                    return Err(error);
                }
            }
        };

        let refresh = tokio::spawn(refresh_loop(Arc::clone(&self.core), self.shutdown.subscribe()));
        let flush = tokio::spawn(flush_loop(
            Arc::clone(&self.core),
            marks,
            self.shutdown.subscribe(),
        ));

        tracing::info!("engine running");
        while let Some(event) = events.recv().await {
            tracing::trace!(kind = event.kind(), "event");
            self.core.handle_event(event).await;
        }

        let requested = *self.shutdown.borrow();
        self.shutdown.send_replace(true);
        for task in [refresh, flush] {
            if let Err(error) = task.await {
                tracing::warn!(%error, "background task failed");
            }
        }
        *self.lifecycle() = Lifecycle::Stopped;
        tracing::info!(requested, "engine stopped");

        if requested {
            Ok(())
        } else {
            Err(EngineError::StreamClosed)
        }
    }

    /// Stops the periodic tasks and closes the transport. `run` returns
    /// once the transport has closed the event stream.
    pub fn quit(&self) {
        tracing::info!("shutdown requested");
        self.shutdown.send_replace(true);
    }

    pub fn username(&self) -> String {
        self.core.username()
    }

    pub fn lookup_by_name(&self, kind: EntityType, name: &str) -> Target {
        self.core.cache.lookup_by_name(kind, name)
    }

    pub fn active(&self) -> Option<Target> {
        self.core.active_key().map(|key| self.core.cache.lookup(&key))
    }

    pub async fn post(&self, target: &Target, text: &str) -> Result<(), EngineError> {
        let result = async {
            let room = match target {
                Target::Channel(_) => self.core.room_of(target)?.1,
                Target::User(user) if user.is_nil() => return Err(no_such(target)),
                // Direct messages may address the user id before a
                // conversation exists.
                Target::User(user) => match self.core.room_of(target) {
                    Ok((_, room)) => room,
                    Err(_) => user.id.clone(),
                },
            };
            self.core.api.post_message(&room, text).await?;
            Ok(())
        }
        .await;
        self.core.surface(result)
    }

    pub async fn join(&self, target: &Target) -> Result<(), EngineError> {
        let result = async {
            let channel = require_channel(target, "join")?;
            self.core.api.join_channel(&channel.name).await?;
            Ok(channel.qualified_name())
        }
        .await;
        let name = self.core.surface(result)?;
        self.core.out.info(&format!("Joined {name}"));
        Ok(())
    }

    pub async fn leave(&self, target: &Target) -> Result<(), EngineError> {
        let result = async {
            let channel = require_channel(target, "leave")?;
            self.core
                .api
                .leave(RoomKind::for_channel(channel), &channel.id)
                .await?;
            Ok(channel.qualified_name())
        }
        .await;
        let name = self.core.surface(result)?;
        self.core.out.info(&format!("Left {name}"));
        Ok(())
    }

    pub async fn invite(&self, room: &Target, user: &Target) -> Result<(), EngineError> {
        let result = async {
            let channel = require_channel(room, "invite someone to")?;
            let invitee = match user {
                Target::User(invitee) if invitee.is_nil() => return Err(no_such(user)),
                Target::User(invitee) => invitee,
                Target::Channel(_) => {
                    return Err(EngineError::Unsupported {
                        action: "invite",
                        kind: EntityType::Channel,
                    });
                }
            };
            let outcome = self
                .core
                .api
                .invite(RoomKind::for_channel(channel), &channel.id, &invitee.id)
                .await?;
            if outcome == InviteOutcome::AlreadyMember {
                return Err(EngineError::AlreadyMember {
                    user: invitee.name.clone(),
                    room: channel.name.clone(),
                });
            }
            Ok(format!("Invited {} to {}", invitee.name, channel.qualified_name()))
        }
        .await;
        let message = self.core.surface(result)?;
        self.core.out.info(&message);
        Ok(())
    }

    pub fn joined(&self) -> Vec<Target> {
        self.core
            .cache
            .snapshot(EntityType::Channel)
            .into_iter()
            .filter(|target| target.is_active())
            .collect()
    }

    pub fn ims(&self) -> Vec<Target> {
        self.core
            .cache
            .snapshot(EntityType::User)
            .into_iter()
            .filter(|target| !self.core.cache.im_by_user(target.id()).is_nil())
            .collect()
    }

    pub async fn switch(&self, target: &Target) -> Result<(), EngineError> {
        if target.is_nil() {
            return self.core.surface(Err(no_such(target)));
        }
        let key = target.key();
        if self.core.is_active(&key) {
            return Ok(());
        }
        self.core.set_active(&key);
        self.core.backfill_unread(target).await.map(|_| ())
    }

    pub async fn unread(&self, target: &Target) -> Result<bool, EngineError> {
        self.core.backfill_unread(target).await
    }

    pub async fn history(&self, target: &Target, count: u32) -> Result<bool, EngineError> {
        self.core.recent_history(target, count).await
    }

    pub async fn pins(&self, target: &Target) -> Result<(), EngineError> {
        let result = async {
            let channel = require_channel(target, "list pins of")?;
            Ok(self.core.api.list_pins(&channel.id).await?)
        }
        .await;
        let pins = self.core.surface(result)?;

        let mut items = Vec::with_capacity(pins.len() * 2 + 1);
        for pin in pins {
            let (user, body, at) = match pin {
                PinnedItem::Message { user, text, ts } => {
                    let text = normalize(&self.core.cache, &[&text]).text;
                    (user, text, ts.to_datetime())
                }
                PinnedItem::File(file) => (file.user, file.url, file.created),
            };
            let from = self.core.cache.user(&user);
            items.push(ListItem::new(ListItemStatus::None, body));
            items.push(ListItem::new(
                ListItemStatus::Normal,
                format!("{}: {}", from.qualified_name(), self.core.format_time(at)),
            ));
        }
        items.push(ListItem::title(format!("Pinned in {}", target.qualified_name())));
        self.core.out.list(&items, true);
        Ok(())
    }

    pub async fn uploads(&self, target: &Target) -> Result<(), EngineError> {
        let result = async {
            let (_, room) = self.core.room_of(target)?;
            Ok(self.core.api.list_files(&room).await?)
        }
        .await;
        let files = self.core.surface(result)?;

        let mut items = Vec::with_capacity(files.len() * 2 + 1);
        items.push(ListItem::title(format!("files of {}", target.qualified_name())));
        for file in files {
            let from = self.core.cache.user(&file.user);
            items.push(ListItem::new(
                ListItemStatus::Normal,
                format!("{}: {}", from.qualified_name(), self.core.format_time(file.created)),
            ));
            items.push(ListItem::new(ListItemStatus::None, file.url));
        }
        self.core.out.list(&items, false);
        Ok(())
    }

    /// Starts an upload in the background. The receiver yields exactly one
    /// result once the transfer finished or failed.
    pub fn upload(
        &self,
        target: &Target,
        path: impl Into<PathBuf>,
        title: Option<String>,
        comment: Option<String>,
    ) -> oneshot::Receiver<Result<(), EngineError>> {
        let (done, receiver) = oneshot::channel();
        let path = path.into();
        let room = match self.core.surface(self.core.room_of(target)) {
            Ok((_, room)) => room,
            Err(error) => {
                let _ = done.send(Err(error));
                return receiver;
            }
        };

        let name = target.qualified_name();
        self.core
            .out
            .notice(&format!("Starting upload of {} to {name}", path.display()));
        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            let upload = FileUpload {
                room,
                path,
                title,
                comment,
            };
            let result = core.api.upload_file(&upload).await.map(|_| ()).map_err(EngineError::from);
            match &result {
                Ok(()) => core
                    .out
                    .info(&format!("Uploaded {} to {name}", upload.path.display())),
                Err(error) => core.out.warn(&error.to_string()),
            }
            let _ = done.send(result);
        });
        receiver
    }

    pub fn fuzzy(&self, kind: EntityType, query: &str) -> Vec<Target> {
        let names = self.core.cache.names(kind);
        fuzzy::search(query, names.iter().map(String::as_str))
            .into_iter()
            .map(|name| self.core.cache.lookup_by_name(kind, &name))
            .filter(|target| !target.is_nil())
            .collect()
    }

    pub fn resolve(&self, kind: EntityType, query: &str) -> Resolution<Target> {
        fuzzy::resolve(query, self.fuzzy(kind, query))
    }

    /// First inactive entity with unread messages, users before rooms.
    pub fn next_unread(&self) -> Result<Target, EngineError> {
        [EntityType::User, EntityType::Channel]
            .into_iter()
            .flat_map(|kind| self.core.cache.snapshot(kind))
            .find(|target| target.unread_count() > 0 && !self.core.is_active(&target.key()))
            .ok_or(EngineError::NothingUnread)
    }

    pub fn list_unread(&self) {
        let mut list = vec![ListItem::title("Users:")];
        for kind in [EntityType::User, EntityType::Channel] {
            if kind == EntityType::Channel {
                list.push(ListItem::title("Channels:"));
            }
            let mut section: Vec<ListItem> = self
                .core
                .cache
                .snapshot(kind)
                .into_iter()
                .filter(|target| target.unread_count() > 0)
                .map(|target| {
                    ListItem::new(
                        ListItemStatus::Normal,
                        unread_label(&target.qualified_name(), target.unread_count()),
                    )
                })
                .collect();
            sort_items(&mut section);
            list.extend(section);
        }
        self.core.out.list(&list, false);
    }

    pub fn list(&self, kind: EntityType, relevant_only: bool) {
        let mut items: Vec<ListItem> = self
            .core
            .cache
            .snapshot(kind)
            .into_iter()
            .filter_map(|target| {
                let status = if target.is_active() {
                    ListItemStatus::Good
                } else if relevant_only {
                    return None;
                } else {
                    ListItemStatus::Normal
                };
                let text = match target.unread_count() {
                    0 => target.name().to_string(),
                    unread => unread_label(target.name(), unread),
                };
                Some(ListItem::new(status, text))
            })
            .collect();
        sort_items(&mut items);

        let title = match kind {
            EntityType::Channel => "Channels:",
            EntityType::User => "Users:",
        };
        let mut list = Vec::with_capacity(items.len() + 1);
        list.push(ListItem::title(title));
        list.extend(items);
        self.core.out.list(&list, false);
    }

    pub fn members(&self, target: &Target, relevant_only: bool) -> Result<(), EngineError> {
        let id = self
            .core
            .surface(require_channel(target, "list members of").map(|channel| channel.id.clone()))?;
        let channel = self.core.cache.channel(&id);

        let mut items: Vec<ListItem> = channel
            .members
            .iter()
            .map(|member| self.core.cache.user(member))
            .filter_map(|user| {
                if user.is_active() {
                    Some(ListItem::new(ListItemStatus::Good, user.name))
                } else if relevant_only {
                    None
                } else {
                    Some(ListItem::new(ListItemStatus::Normal, user.name))
                }
            })
            .collect();
        sort_items(&mut items);

        let mut list = Vec::with_capacity(items.len() + 1);
        list.push(ListItem::title(format!("Users in {}", channel.qualified_name())));
        list.extend(items);
        self.core.out.list(&list, false);
        Ok(())
    }

    pub async fn refresh_counts(&self) -> Result<(), EngineError> {
        let result = self.core.api.fetch_counts().await.map_err(EngineError::from);
        let counts = self.core.surface(result)?;
        self.core.cache.apply_counts(&counts);
        Ok(())
    }
}

async fn refresh_loop(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) {
    let period = core.settings.refresh_interval;
    let mut tick = interval_at(tokio::time::Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = tick.tick() => {
                if let Err(error) = core.refresh_channels().await {
                    tracing::warn!(%error, "periodic room refresh failed");
                }
            }
        }
    }
}
