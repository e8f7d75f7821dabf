use std::cmp::Ordering;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

const NAME_COLUMN: usize = 18;
const ROOM_COLUMN: usize = 34;
const MESSAGE_GROUP_GAP_SECS: i64 = 5 * 60;

/// Sink for every user-visible effect of the engine.
pub trait Output: Send + Sync {
    fn notify(&self, room: &str, from: &str, text: &str, force: bool);
    fn info(&self, msg: &str);
    fn notice(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn msg(&self, room: &str, from: &str, text: &str, at: DateTime<Utc>, new_section: bool);
    fn file(&self, room: &str, from: &str, title: &str, url: &str);
    fn typing(&self, room: &str, user: &str, timeout: Duration);
    fn debug(&self, fields: &[&str]);
    fn list(&self, items: &[ListItem], reverse: bool);
}

/// Sort order of list rows: untagged rows first, titles last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListItemStatus {
    None,
    Good,
    Bad,
    Normal,
    Title,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListItem {
    pub status: ListItemStatus,
    pub value: String,
}

impl ListItem {
    pub fn new(status: ListItemStatus, value: impl Into<String>) -> Self {
        Self {
            status,
            value: value.into(),
        }
    }

    pub fn title(value: impl Into<String>) -> Self {
        Self::new(ListItemStatus::Title, value)
    }
}

pub fn sort_items(items: &mut [ListItem]) {
    items.sort_by(|a, b| match a.status.cmp(&b.status) {
        Ordering::Equal => a.value.to_lowercase().cmp(&b.value.to_lowercase()),
        other => other,
    });
}

pub fn unread_label(name: &str, unread: u32) -> String {
    format!("{} [{unread}]", pad_right(name, NAME_COLUMN))
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Line<'a> {
    Notify {
        room: &'a str,
        from: &'a str,
        text: &'a str,
        force: bool,
    },
    Info {
        msg: &'a str,
    },
    Notice {
        msg: &'a str,
    },
    Warn {
        msg: &'a str,
    },
    Msg {
        room: &'a str,
        from: &'a str,
        text: &'a str,
        at: DateTime<Utc>,
        new_section: bool,
    },
    File {
        room: &'a str,
        from: &'a str,
        title: &'a str,
        url: &'a str,
    },
    Typing {
        room: &'a str,
        user: &'a str,
    },
    List {
        items: &'a [ListItem],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

struct MessageHeader {
    room: String,
    from: String,
    at: DateTime<Utc>,
}

/// Plain stdout rendering. Debug fields go to the log, never to stdout.
pub struct StdoutOutput {
    format: OutputFormat,
    time_format: String,
    username: Mutex<String>,
    last_header: Mutex<Option<MessageHeader>>,
}

impl StdoutOutput {
    pub fn new(format: OutputFormat, time_format: impl Into<String>) -> Self {
        Self {
            format,
            time_format: time_format.into(),
            username: Mutex::new(String::new()),
            last_header: Mutex::new(None),
        }
    }

    pub fn set_username(&self, username: &str) {
        *self.username.lock().unwrap_or_else(PoisonError::into_inner) = username.to_string();
    }

    fn emit(&self, line: Line<'_>, text: impl FnOnce() -> String) {
        match self.format {
            OutputFormat::Json => match serde_json::to_string(&line) {
                Ok(payload) => println!("{payload}"),
                Err(error) => tracing::warn!(%error, "failed to encode output line"),
            },
            OutputFormat::Text => println!("{}", text()),
        }
    }

    fn reset_header(&self) {
        *self.last_header.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn format_time(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&Local).format(&self.time_format).to_string()
    }

    fn render_msg(&self, room: &str, from: &str, text: &str, at: DateTime<Utc>, new_section: bool) -> String {
        let mut last = self.last_header.lock().unwrap_or_else(PoisonError::into_inner);
        let own = *self.username.lock().unwrap_or_else(PoisonError::into_inner) == from;

        let room_changed = last.as_ref().is_none_or(|header| header.room != room);
        let needs_header = new_section
            || room_changed
            || last.as_ref().is_none_or(|header| {
                header.from != from || (at - header.at).num_seconds().abs() > MESSAGE_GROUP_GAP_SECS
            });

        let mut rendered = String::new();
        if needs_header {
            if new_section || room_changed {
                rendered.push('\n');
                rendered.push_str(&pad_right(room, ROOM_COLUMN));
            }
            let label = if own { format!("{from} (you):") } else { format!("{from}:") };
            rendered.push('\n');
            rendered.push_str(&pad_right(&label, NAME_COLUMN));
            rendered.push(' ');
            rendered.push_str(&self.format_time(at));
            rendered.push('\n');
            *last = Some(MessageHeader {
                room: room.to_string(),
                from: from.to_string(),
                at,
            });
        }
        rendered.push_str(text.trim_matches('\n'));
        rendered
    }
}

impl Output for StdoutOutput {
    fn notify(&self, _room: &str, _from: &str, _text: &str, _force: bool) {
        // Desktop notifications are delivered elsewhere; the message itself
        // is rendered by `msg` when its room is active.
    }

    fn info(&self, msg: &str) {
        self.reset_header();
        self.emit(Line::Info { msg }, || format!("[+] {msg}"));
    }

    fn notice(&self, msg: &str) {
        self.reset_header();
        self.emit(Line::Notice { msg }, || format!("[*] {msg}"));
    }

    fn warn(&self, msg: &str) {
        self.reset_header();
        self.emit(Line::Warn { msg }, || format!("[!] {msg}"));
    }

    fn msg(&self, room: &str, from: &str, text: &str, at: DateTime<Utc>, new_section: bool) {
        let line = Line::Msg {
            room,
            from,
            text,
            at,
            new_section,
        };
        self.emit(line, || self.render_msg(room, from, text, at, new_section));
    }

    fn file(&self, room: &str, from: &str, title: &str, url: &str) {
        self.reset_header();
        self.emit(Line::File { room, from, title, url }, || {
            format!(
                "{} {}'s file: {title} {url}",
                pad_right(&format!("[{room}]"), NAME_COLUMN),
                from
            )
        });
    }

    fn typing(&self, room: &str, user: &str, _timeout: Duration) {
        self.emit(Line::Typing { room, user }, || format!("[{room}] {user} is typing..."));
    }

    fn debug(&self, fields: &[&str]) {
        tracing::debug!(fields = %fields.join(" "), "engine debug");
    }

    fn list(&self, items: &[ListItem], reverse: bool) {
        self.reset_header();
        self.emit(Line::List { items }, || render_list(items, reverse));
    }
}

fn render_list(items: &[ListItem], reverse: bool) -> String {
    let rows: Vec<String> = items
        .iter()
        .map(|item| {
            let marker = match item.status {
                ListItemStatus::Good => "● ",
                ListItemStatus::Bad => "✗ ",
                ListItemStatus::Normal => "○ ",
                ListItemStatus::None => "  ",
                ListItemStatus::Title => "",
            };
            let value = truncate_display(&item.value, 96);
            if item.status == ListItemStatus::Title {
                format!("\n{value}")
            } else {
                format!("{marker}{value}")
            }
        })
        .collect();
    if reverse {
        rows.into_iter().rev().collect::<Vec<_>>().join("\n")
    } else {
        rows.join("\n")
    }
}

fn display_width(value: &str) -> usize {
    UnicodeWidthStr::width(value)
}

fn truncate_display(value: &str, max_width: usize) -> String {
    if display_width(value) <= max_width {
        return value.to_string();
    }
    let ellipsis = "...";
    let mut width = 0usize;
    let mut output = String::new();
    for ch in value.chars() {
        let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
        if width + ch_width + ellipsis.len() > max_width {
            break;
        }
        output.push(ch);
        width += ch_width;
    }
    output.push_str(ellipsis);
    output
}

fn pad_right(value: &str, width: usize) -> String {
    let mut output = value.to_string();
    let current = display_width(value);
    if current < width {
        output.push_str(&" ".repeat(width - current));
    }
    output
}
