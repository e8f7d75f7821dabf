use chrono::{DateTime, Utc};

use crate::engine::Core;
use crate::entity::{Channel, Entity, Target};
use crate::events::{IncomingMessage, ReactionEvent, SharedFile, StreamEvent};
use crate::error::EngineError;
use crate::normalize::normalize_message;

const TYPING_IN_IM: &str = "IM";
const TYPING_UNKNOWN: &str = "Unknown channel / user";

impl Core {
    /// Applies one live event. Never fails: remote errors during refreshes
    /// are logged and the next event is processed.
    pub(crate) async fn handle_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Connecting => self.out.notice("Connecting..."),
            StreamEvent::Connected => self.out.notice("Connected!"),
            StreamEvent::Hello => self.out.notice("Server says hello"),
            StreamEvent::Disconnected { intentional } => {
                if intentional {
                    self.out.debug(&["disconnected"]);
                } else {
                    self.out.warn("Disconnected! Reconnecting...");
                }
            }
            StreamEvent::RoomLifecycle { room, change } => {
                tracing::debug!(%room, ?change, "room lifecycle");
                self.refresh_logged(self.refresh_channels().await, "channels");
            }
            StreamEvent::Membership { room, joined } => {
                if !self.cache.mutate_channel(&room, |channel| channel.is_member = joined) {
                    self.refresh_logged(self.refresh_channels().await, "channels");
                }
            }
            StreamEvent::TeamJoin { user } => {
                tracing::debug!(%user, "team join");
                self.refresh_logged(self.refresh_users().await, "users");
                self.refresh_logged(self.refresh_ims().await, "ims");
            }
            StreamEvent::ImCreated { user, channel } => {
                tracing::debug!(%user, %channel, "conversation created");
                self.refresh_logged(self.refresh_ims().await, "ims");
            }
            StreamEvent::Presence { user, presence } => {
                self.cache.mutate_user(&user, |entry| entry.presence = presence);
            }
            StreamEvent::Typing { room, user } => self.typing(&room, &user),
            StreamEvent::Message(message) => {
                self.apply_membership(&message);
                self.handle_message(message, false, true, true).await
            }
            StreamEvent::Reaction(reaction) => self.reaction(reaction).await,
            StreamEvent::FileShared(file) | StreamEvent::FilePublic(file) => self.file(&file),
            StreamEvent::PrefChange { name, value } => {
                if name != "emoji_use" {
                    self.out.debug(&["pref_change", &name, &value]);
                }
            }
            StreamEvent::Marked { .. } | StreamEvent::LatencyReport | StreamEvent::ReconnectUrl => {}
            StreamEvent::Unhandled { kind } => {
                tracing::debug!(%kind, "unhandled event");
                self.out.debug(&["unhandled", &kind]);
            }
        }
    }

    // Only live join/leave messages edit member lists; history replays do not.
    fn apply_membership(&self, message: &IncomingMessage) {
        let Some(joined) = message.membership_change() else {
            return;
        };
        self.cache.mutate_channel(&message.room, |channel| {
            if joined {
                channel.add_member(&message.user);
            } else {
                channel.remove_member(&message.user);
            }
        });
    }

    fn refresh_logged(&self, result: Result<(), EngineError>, what: &str) {
        if let Err(error) = result {
            tracing::warn!(%error, what, "refresh failed");
        }
    }

    fn typing(&self, room: &str, user: &str) {
        let (target, is_im) = self.cache.resolve_room(room);
        let label = match target {
            Target::Channel(channel) => channel.name,
            _ if is_im => TYPING_IN_IM.to_string(),
            _ => TYPING_UNKNOWN.to_string(),
        };
        let who = self.cache.user(user);
        self.out.typing(&label, who.name(), self.settings.typing_timeout);
    }

    fn file(&self, file: &SharedFile) {
        self.out.debug(&["file", &file.id, &file.name]);
        if !file.has_url() {
            return;
        }
        let room = file
            .channels
            .first()
            .map(|room| self.cache.resolve_room(room).0)
            .unwrap_or_else(|| Target::Channel(Channel::nil()));
        let from = self.cache.user(&file.user);
        let title = format!("{} {}", file.title, file.name);
        self.out
            .file(&room.qualified_name(), from.name(), title.trim(), file.best_url());
    }

    /// Reactions render as pseudo-messages from the reacting user at the
    /// reacted item's position. They never count as new.
    async fn reaction(&self, reaction: ReactionEvent) {
        let channel = self.cache.channel(&reaction.room);
        let target = if !channel.is_nil() && channel.is_member {
            Target::Channel(channel)
        } else {
            Target::User(self.cache.user(&self.cache.im(&reaction.room).user))
        };
        if target.is_nil() {
            return;
        }

        let sign = if reaction.added { "[+]" } else { "[-]" };
        let message = IncomingMessage {
            room: reaction.room,
            user: reaction.user,
            text: format!("{sign} {}", reaction.reaction),
            ts: reaction.item_ts,
            ..IncomingMessage::default()
        };
        let notify = matches!(target, Target::User(_));
        self.handle_message(message, false, notify, false).await;
    }

    pub(crate) async fn handle_message(
        &self,
        message: IncomingMessage,
        new_section: bool,
        notify: bool,
        is_new: bool,
    ) {
        if message.hidden {
            return;
        }
        let message = message.unwrap_submessage();

        let (target, is_im) = self.cache.resolve_room(&message.room);
        if target.is_nil() {
            self.out.debug(&["message for unknown room", &message.room]);
            return;
        }
        let key = target.key();
        self.activate_if_idle(&key);
        let active = self.is_active(&key);

        if is_new {
            self.cache
                .mutate_read_state(&key, |state| state.record_message(&message.ts));
            if active {
                self.enqueue_mark(key.clone()).await;
            }
        }

        let from = self.sender_name(&message);
        let normalized = normalize_message(&self.cache, &message.text, &message.attachments);
        let room = target.qualified_name();

        if notify {
            let me = self.username();
            let addressed = if is_im { true } else { normalized.mentions_user(&me) };
            if from != me && addressed {
                self.out.notify(&room, &from, &normalized.text, false);
            }
        }

        if !active {
            return;
        }
        let at: DateTime<Utc> = message.ts.to_datetime().unwrap_or_default();
        self.out.msg(&room, &from, &normalized.text, at, new_section);
    }

    fn sender_name(&self, message: &IncomingMessage) -> String {
        let user = self.cache.user(&message.user);
        if user.is_nil() && !message.username.is_empty() {
            return message.username.clone();
        }
        user.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityKey, Watermark};
    use crate::events::{Attachment, RoomChange};
    use crate::test_support::{Recorded, RemoteCall, harness, im, message, user};

    #[tokio::test]
    async fn new_messages_count_for_inactive_targets_without_rendering() {
        let h = harness().await;
        let core = h.engine.core();
        core.set_active(&EntityKey::channel("C2"));

        for (i, ts) in ["10.0", "11.0", "12.0"].iter().enumerate() {
            let text = format!("msg {i}");
            core.handle_event(StreamEvent::Message(message("C1", "U2", &text, ts)))
                .await;
        }

        let general = core.cache.channel("C1");
        assert_eq!(general.read.unread, 3);
        assert_eq!(general.read.latest, Watermark::new("12.0"));
        assert!(h.output.messages().is_empty());
    }

    #[tokio::test]
    async fn first_message_activates_its_target() {
        let h = harness().await;
        let core = h.engine.core();
        core.handle_event(StreamEvent::Message(message("C1", "U2", "hello", "10.0")))
            .await;
        assert_eq!(core.active_key(), Some(EntityKey::channel("C1")));
        assert_eq!(h.output.messages(), vec!["hello"]);
    }

    #[tokio::test]
    async fn room_mentions_gate_notifications() {
        let h = harness().await;
        let core = h.engine.core();
        core.set_active(&EntityKey::channel("C2"));

        core.handle_event(StreamEvent::Message(message("C1", "U2", "hi <@U1> and <@U1>", "1.0")))
            .await;
        assert_eq!(h.output.notifies(), 1);

        core.handle_event(StreamEvent::Message(message("C1", "U2", "hi all", "2.0")))
            .await;
        assert_eq!(h.output.notifies(), 1);
    }

    #[tokio::test]
    async fn direct_messages_notify_unless_sent_by_me() {
        let h = harness().await;
        let core = h.engine.core();
        core.set_active(&EntityKey::channel("C2"));

        core.handle_event(StreamEvent::Message(message("D2", "U2", "psst", "1.0")))
            .await;
        assert_eq!(h.output.notifies(), 1);

        core.handle_event(StreamEvent::Message(message("D2", "U1", "reply", "2.0")))
            .await;
        assert_eq!(h.output.notifies(), 1);
        assert_eq!(core.cache.user("U2").read.unread, 2);
    }

    #[tokio::test]
    async fn hidden_messages_are_skipped_and_submessages_unwrapped() {
        let h = harness().await;
        let core = h.engine.core();
        core.set_active(&EntityKey::channel("C1"));

        let mut hidden = message("C1", "U2", "secret", "1.0");
        hidden.hidden = true;
        core.handle_message(hidden, false, true, true).await;

        let mut edited = message("C1", "", "", "2.0");
        edited.submessage = Some(Box::new(message("", "U3", "edited text", "")));
        core.handle_message(edited, false, true, true).await;

        assert_eq!(h.output.messages(), vec!["edited text"]);
        assert_eq!(core.cache.channel("C1").read.unread, 1);
    }

    #[tokio::test]
    async fn bot_messages_use_their_username() {
        let h = harness().await;
        let core = h.engine.core();
        core.set_active(&EntityKey::channel("C1"));
        let mut bot = message("C1", "", "deployed", "3.0");
        bot.username = "ci-bot".to_string();
        bot.attachments = vec![Attachment {
            title: "build".to_string(),
            text: "green".to_string(),
            ..Default::default()
        }];
        core.handle_message(bot, false, true, true).await;

        let rendered = h.output.records().into_iter().find_map(|record| match record {
            Recorded::Msg { from, text, .. } => Some((from, text)),
            _ => None,
        });
        assert_eq!(
            rendered,
            Some(("ci-bot".to_string(), "deployed\nbuild: green".to_string()))
        );
    }

    #[tokio::test]
    async fn live_membership_subtypes_update_member_lists() {
        let h = harness().await;
        let core = h.engine.core();
        let mut joined = message("C2", "U3", "<@U3> has joined", "1.0");
        joined.subtype = Some("channel_join".to_string());
        core.handle_event(StreamEvent::Message(joined)).await;
        assert_eq!(core.cache.channel("C2").members, vec!["U3".to_string()]);

        let mut left = message("C2", "U3", "<@U3> has left", "2.0");
        left.subtype = Some("channel_leave".to_string());
        core.handle_event(StreamEvent::Message(left)).await;
        assert!(core.cache.channel("C2").members.is_empty());
    }

    #[tokio::test]
    async fn replayed_membership_messages_leave_members_alone() {
        let h = harness().await;
        let core = h.engine.core();
        let mut joined = message("C2", "U3", "<@U3> has joined", "1.0");
        joined.subtype = Some("channel_join".to_string());
        core.handle_message(joined, false, false, false).await;
        assert!(core.cache.channel("C2").members.is_empty());
    }

    #[tokio::test]
    async fn reactions_render_as_pseudo_messages() {
        let h = harness().await;
        let core = h.engine.core();
        core.set_active(&EntityKey::channel("C1"));

        core.handle_event(StreamEvent::Reaction(ReactionEvent {
            user: "U2".to_string(),
            room: "C1".to_string(),
            reaction: "thumbsup".to_string(),
            item_ts: Watermark::new("5.0"),
            added: true,
        }))
        .await;
        core.handle_event(StreamEvent::Reaction(ReactionEvent {
            user: "U2".to_string(),
            room: "C1".to_string(),
            reaction: "thumbsup".to_string(),
            item_ts: Watermark::new("5.0"),
            added: false,
        }))
        .await;

        assert_eq!(h.output.messages(), vec!["[+] thumbsup", "[-] thumbsup"]);
        assert_eq!(core.cache.channel("C1").read.unread, 0);
        assert_eq!(h.output.notifies(), 0);
    }

    #[tokio::test]
    async fn presence_and_membership_mutate_in_place() {
        let h = harness().await;
        let core = h.engine.core();
        core.handle_event(StreamEvent::Presence {
            user: "U2".to_string(),
            presence: "active".to_string(),
        })
        .await;
        assert!(core.cache.user("U2").is_active());

        core.handle_event(StreamEvent::Membership {
            room: "C2".to_string(),
            joined: false,
        })
        .await;
        assert!(!core.cache.channel("C2").is_member);
    }

    #[tokio::test]
    async fn team_join_refreshes_users_and_conversations() {
        let h = harness().await;
        let core = h.engine.core();
        *h.remote.users.lock().expect("lock") = vec![user("U1", "ada"), user("U4", "dee")];
        *h.remote.ims.lock().expect("lock") = vec![im("D4", "U4")];

        core.handle_event(StreamEvent::TeamJoin {
            user: "U4".to_string(),
        })
        .await;

        assert_eq!(core.cache.user_by_name("dee").id, "U4");
        assert!(core.cache.user_by_name("bea").is_nil());
        assert_eq!(core.cache.im_by_user("U4").id, "D4");
        assert!(core.cache.im_by_user("U2").is_nil());
        assert_eq!(
            h.remote.calls(),
            vec![RemoteCall::FetchUsers, RemoteCall::FetchIms]
        );
    }

    #[tokio::test]
    async fn new_conversation_refreshes_links_only() {
        let h = harness().await;
        let core = h.engine.core();
        *h.remote.ims.lock().expect("lock") = vec![im("D2", "U2"), im("D3", "U3")];

        core.handle_event(StreamEvent::ImCreated {
            user: "U3".to_string(),
            channel: "D3".to_string(),
        })
        .await;

        assert_eq!(core.cache.im_by_user("U3").id, "D3");
        assert_eq!(core.cache.user_by_name("cy").id, "U3");
        assert_eq!(h.remote.calls(), vec![RemoteCall::FetchIms]);
    }

    #[tokio::test]
    async fn connection_status_reaches_output() {
        let h = harness().await;
        let core = h.engine.core();
        core.handle_event(StreamEvent::Connecting).await;
        core.handle_event(StreamEvent::Disconnected { intentional: true }).await;
        core.handle_event(StreamEvent::Disconnected { intentional: false }).await;

        assert_eq!(h.output.warnings(), vec!["Disconnected! Reconnecting..."]);
        assert_eq!(
            h.output.records().first(),
            Some(&Recorded::Notice("Connecting...".to_string()))
        );
    }

    #[tokio::test]
    async fn lifecycle_events_refresh_rooms() {
        let h = harness().await;
        *h.remote.channels.lock().expect("lock") = vec![crate::test_support::channel("C9", "new-room")];
        h.engine
            .core()
            .handle_event(StreamEvent::RoomLifecycle {
                room: "C9".to_string(),
                change: RoomChange::Created,
            })
            .await;
        assert_eq!(h.engine.core().cache.channel_by_name("new-room").id, "C9");
    }

    #[tokio::test]
    async fn typing_labels_rooms_and_conversations() {
        let h = harness().await;
        let core = h.engine.core();
        for room in ["C1", "D2", "X9"] {
            core.handle_event(StreamEvent::Typing {
                room: room.to_string(),
                user: "U2".to_string(),
            })
            .await;
        }
        let labels: Vec<String> = h
            .output
            .records()
            .into_iter()
            .filter_map(|record| match record {
                Recorded::Typing { room, .. } => Some(room),
                _ => None,
            })
            .collect();
        assert_eq!(labels, vec!["general", "IM", "Unknown channel / user"]);
    }

    #[tokio::test]
    async fn files_without_urls_are_dropped() {
        let h = harness().await;
        let core = h.engine.core();
        let mut file = SharedFile {
            id: "F1".to_string(),
            name: "report.pdf".to_string(),
            title: "Report".to_string(),
            user: "U2".to_string(),
            channels: vec!["C1".to_string()],
            ..Default::default()
        };
        core.handle_event(StreamEvent::FileShared(file.clone())).await;
        file.url_private = "https://files/report.pdf".to_string();
        core.handle_event(StreamEvent::FileShared(file)).await;

        let files: Vec<Recorded> = h
            .output
            .records()
            .into_iter()
            .filter(|record| matches!(record, Recorded::File { .. }))
            .collect();
        assert_eq!(
            files,
            vec![Recorded::File {
                room: "#general".to_string(),
                from: "bea".to_string(),
                title: "Report report.pdf".to_string(),
                url: "https://files/report.pdf".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn unknown_events_only_debug() {
        let h = harness().await;
        h.engine
            .core()
            .handle_event(StreamEvent::Unhandled {
                kind: "dnd_updated".to_string(),
            })
            .await;
        assert_eq!(
            h.output.records(),
            vec![Recorded::Debug(vec!["unhandled".to_string(), "dnd_updated".to_string()])]
        );
    }
}
