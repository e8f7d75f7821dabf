use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::cache::EntityCache;
use crate::entity::{Entity, EntityKey, EntityType};
use crate::events::Attachment;

// `<@U123>`, `<#C123>` and `<#C123|general>`.
static REFERENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([@#])([^>|]+)(?:\|([^>]*))?>").expect("valid reference regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalized {
    pub text: String,
    pub mentions: Vec<String>,
}

impl Normalized {
    pub fn mentions_user(&self, name: &str) -> bool {
        self.mentions.iter().any(|mention| mention == name)
    }
}

pub fn normalize_message(cache: &EntityCache, text: &str, attachments: &[Attachment]) -> Normalized {
    let flattened = flatten_attachments(attachments);
    let mut parts: Vec<&str> = Vec::with_capacity(flattened.len() + 1);
    parts.push(text);
    parts.extend(flattened.iter().map(String::as_str));
    normalize(cache, &parts)
}

pub fn normalize(cache: &EntityCache, texts: &[&str]) -> Normalized {
    let mut mentions = Vec::new();
    let mut clean = Vec::with_capacity(texts.len());
    for text in texts {
        let resolved = resolve_references(cache, text, &mut mentions);
        let resolved = unescape(&resolved);
        if resolved.is_empty() {
            continue;
        }
        clean.push(resolved);
    }
    Normalized {
        text: clean.join("\n"),
        mentions,
    }
}

fn resolve_references(cache: &EntityCache, text: &str, mentions: &mut Vec<String>) -> String {
    REFERENCE_RE
        .replace_all(text, |caps: &Captures<'_>| {
            let raw = caps[0].to_string();
            let Some(kind) = caps[1].chars().next().and_then(EntityType::from_sigil) else {
                return raw;
            };
            let target = cache.lookup(&EntityKey::new(kind, &caps[2]));
            if target.is_nil() {
                return raw;
            }
            if kind == EntityType::User {
                mentions.push(target.name().to_string());
            }
            target.qualified_name()
        })
        .into_owned()
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Turns attachments into plain text blocks. Attachments that only carry an
/// image preview are dropped.
pub fn flatten_attachments(attachments: &[Attachment]) -> Vec<String> {
    let mut texts = Vec::with_capacity(attachments.len());
    for attachment in attachments {
        let image = if attachment.image_url.is_empty() {
            attachment.thumb_url.as_str()
        } else {
            attachment.image_url.as_str()
        };
        let has_content = !(attachment.title.is_empty()
            && attachment.pretext.is_empty()
            && attachment.text.is_empty());
        if !image.is_empty() && !has_content {
            continue;
        }

        let mut text = if attachment.title.is_empty() {
            String::from("-")
        } else {
            format!("{}: ", attachment.title)
        };
        if !attachment.pretext.is_empty() {
            text.push_str(&attachment.pretext);
            text.push('\n');
        }
        if !image.is_empty() {
            text.push_str(image);
            text.push('\n');
        }
        text.push_str(&attachment.text);
        texts.push(text.trim_end().to_string());
    }
    texts
}
