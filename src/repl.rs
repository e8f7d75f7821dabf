use std::io::BufRead;
use std::sync::Arc;

use tokio::sync::mpsc;

use huddle::engine::Engine;
use huddle::entity::{Entity, EntityType, Target};
use huddle::error::EngineError;
use huddle::fuzzy::Resolution;
use huddle::output::{Output, StdoutOutput};

const DEFAULT_HISTORY: u32 = 10;
const MAX_HISTORY: u32 = 100;

const HELP: &str = "\
@user text | #room text   post to a user or room
@user | #room             switch the active conversation
text                      post to the active conversation
/h [n]                    last n messages (default 10, max 100)
/join [#room]  /leave [#room]  /members [#room]  /pins [#room]
/files [@user|#room]      shared files
/invite @user [#room]     invite a user
/upload <path> [title]    upload a file to the active conversation
users | u, all-users | au, channels | c, all-channels | ac
unread, next, help, quit | exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TargetRef {
    kind: EntityType,
    name: String,
}

impl TargetRef {
    fn parse(token: &str) -> Option<Self> {
        let mut chars = token.chars();
        let kind = EntityType::from_sigil(chars.next()?)?;
        let name = chars.as_str();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            kind,
            name: name.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Empty,
    Say(String),
    Post { target: TargetRef, text: String },
    Switch(TargetRef),
    History(u32),
    Join(Option<TargetRef>),
    Leave(Option<TargetRef>),
    Pins(Option<TargetRef>),
    Files(Option<TargetRef>),
    Members(Option<TargetRef>),
    Invite { user: TargetRef, room: Option<TargetRef> },
    Upload { path: String, title: Option<String> },
    List { kind: EntityType, relevant_only: bool },
    Unread,
    Next,
    Help,
    Quit,
    Invalid(String),
}

pub(crate) fn parse(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }

    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };
    let optional_target = |usage: &str| -> Result<Option<TargetRef>, Command> {
        if rest.is_empty() {
            return Ok(None);
        }
        TargetRef::parse(rest)
            .map(Some)
            .ok_or_else(|| Command::Invalid(format!("usage: {usage}")))
    };

    match head {
        "quit" | "exit" | "/quit" | "/exit" => Command::Quit,
        "help" | "/help" => Command::Help,
        "users" | "u" => Command::List {
            kind: EntityType::User,
            relevant_only: true,
        },
        "all-users" | "au" => Command::List {
            kind: EntityType::User,
            relevant_only: false,
        },
        "channels" | "c" => Command::List {
            kind: EntityType::Channel,
            relevant_only: true,
        },
        "all-channels" | "ac" => Command::List {
            kind: EntityType::Channel,
            relevant_only: false,
        },
        "unread" => Command::Unread,
        "next" => Command::Next,
        "/h" => {
            if rest.is_empty() {
                return Command::History(DEFAULT_HISTORY);
            }
            match rest.parse::<u32>() {
                Ok(count) if count > 0 => Command::History(count.min(MAX_HISTORY)),
                _ => Command::Invalid("usage: /h [n]".to_string()),
            }
        }
        "/join" => optional_target("/join [#room]").map_or_else(|error| error, Command::Join),
        "/leave" => optional_target("/leave [#room]").map_or_else(|error| error, Command::Leave),
        "/pins" => optional_target("/pins [#room]").map_or_else(|error| error, Command::Pins),
        "/files" => optional_target("/files [@user|#room]").map_or_else(|error| error, Command::Files),
        "/members" => optional_target("/members [#room]").map_or_else(|error| error, Command::Members),
        "/invite" => {
            let mut args = rest.split_whitespace();
            let user = args.next().and_then(TargetRef::parse);
            let room = args.next().map(TargetRef::parse);
            match (user, room) {
                (Some(user), None) => Command::Invite { user, room: None },
                (Some(user), Some(Some(room))) => Command::Invite {
                    user,
                    room: Some(room),
                },
                _ => Command::Invalid("usage: /invite @user [#room]".to_string()),
            }
        }
        "/upload" => {
            let (path, title) = match rest.split_once(char::is_whitespace) {
                Some((path, title)) => (path, Some(title.trim().to_string())),
                None => (rest, None),
            };
            if path.is_empty() {
                return Command::Invalid("usage: /upload <path> [title]".to_string());
            }
            Command::Upload {
                path: path.to_string(),
                title,
            }
        }
        _ if head.starts_with('/') => Command::Invalid(format!("unknown command {head}")),
        _ => match TargetRef::parse(head) {
            Some(target) if rest.is_empty() => Command::Switch(target),
            Some(target) => Command::Post {
                target,
                text: rest.to_string(),
            },
            None => Command::Say(line.to_string()),
        },
    }
}

/// Reads stdin on its own thread: a blocked read must not hold up runtime
/// shutdown.
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

pub async fn run(engine: Arc<Engine>, output: Arc<StdoutOutput>) -> Result<(), Box<dyn std::error::Error>> {
    let mut runner = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });

    let session = Session { engine: Arc::clone(&engine), output };
    if engine.refresh_counts().await.is_ok() {
        engine.list_unread();
    }
    session.output.notice("Type `help` for commands.");

    let mut lines = stdin_lines();
    loop {
        tokio::select! {
            finished = &mut runner => {
                finished??;
                return Ok(());
            }
            line = lines.recv() => {
                let Some(line) = line else { break };
                if !session.execute(parse(&line)).await {
                    break;
                }
            }
        }
    }

    engine.quit();
    runner.await??;
    Ok(())
}

struct Session {
    engine: Arc<Engine>,
    output: Arc<StdoutOutput>,
}

impl Session {
    async fn execute(&self, command: Command) -> bool {
        let engine = &self.engine;
        // Engine operations report their own failures.
        match command {
            Command::Empty => {}
            Command::Quit => return false,
            Command::Help => self.output.info(HELP),
            Command::Invalid(message) => self.output.warn(&message),
            Command::List { kind, relevant_only } => engine.list(kind, relevant_only),
            Command::Unread => engine.list_unread(),
            Command::Next => match engine.next_unread() {
                Ok(target) => {
                    let _ = engine.switch(&target).await;
                }
                Err(error) => self.output.notice(&error.to_string()),
            },
            Command::Switch(target) => {
                if let Some(target) = self.resolve(&target) {
                    let _ = engine.switch(&target).await;
                }
            }
            Command::Post { target, text } => {
                if let Some(target) = self.resolve(&target) {
                    let _ = engine.post(&target, &text).await;
                }
            }
            Command::Say(text) => {
                if let Some(target) = self.active() {
                    let _ = engine.post(&target, &text).await;
                }
            }
            Command::History(count) => {
                if let Some(target) = self.active() {
                    let _ = engine.history(&target, count).await;
                }
            }
            Command::Join(target) => {
                if let Some(target) = self.target_or_active(target) {
                    let _ = engine.join(&target).await;
                }
            }
            Command::Leave(target) => {
                if let Some(target) = self.target_or_active(target) {
                    let _ = engine.leave(&target).await;
                }
            }
            Command::Pins(target) => {
                if let Some(target) = self.target_or_active(target) {
                    let _ = engine.pins(&target).await;
                }
            }
            Command::Files(target) => {
                if let Some(target) = self.target_or_active(target) {
                    let _ = engine.uploads(&target).await;
                }
            }
            Command::Members(target) => {
                if let Some(target) = self.target_or_active(target) {
                    let _ = engine.members(&target, false);
                }
            }
            Command::Invite { user, room } => {
                let user = self.resolve(&user);
                let room = self.target_or_active(room);
                if let (Some(user), Some(room)) = (user, room) {
                    let _ = engine.invite(&room, &user).await;
                }
            }
            Command::Upload { path, title } => {
                if let Some(target) = self.active() {
                    let done = engine.upload(&target, path, title, None);
                    tokio::spawn(async move {
                        if done.await.is_err() {
                            tracing::warn!(error = %EngineError::UploadAborted, "upload finished without result");
                        }
                    });
                }
            }
        }
        true
    }

    fn active(&self) -> Option<Target> {
        let active = self.engine.active();
        if active.is_none() {
            self.output
                .warn("No active conversation, switch with #room or @user");
        }
        active
    }

    fn target_or_active(&self, target: Option<TargetRef>) -> Option<Target> {
        match target {
            Some(target) => self.resolve(&target),
            None => self.active(),
        }
    }

    fn resolve(&self, target: &TargetRef) -> Option<Target> {
        match self.engine.resolve(target.kind, &target.name) {
            Resolution::Resolved(found) => Some(found),
            Resolution::NotFound => {
                self.output
                    .warn(&format!("No such {}: {}", target.kind, target.name));
                None
            }
            Resolution::Ambiguous {
                completion,
                candidates,
            } => {
                let names: Vec<String> = candidates.iter().map(Entity::qualified_name).collect();
                self.output.notice(&format!(
                    "Did you mean any of: {}? (completes to {}{completion})",
                    names.join(", "),
                    target.kind.sigil(),
                ));
                None
            }
        }
    }
}
