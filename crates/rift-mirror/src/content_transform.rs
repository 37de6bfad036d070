//! Pure payload shaping: display names, emoji rewriting, embed suppression
//! and reply-preview quoting.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::model::{Author, OutboundAttachment, OutboundPayload, SourceMessage};

/// Characters of quoted text a reply preview keeps before markup extensions.
pub const REPLY_PREVIEW_BASE_CHARS: usize = 100;
pub const REPLY_PREVIEW_ELLIPSIS: &str = "...";
const EMPTY_PREVIEW_PLACEHOLDER: &str = "*attachment*";

/// Hosts whose links the platform expands into rich embeds on its own.
const AUTO_EMBED_PATTERNS: &[&str] = &[
    r"(?:www\.|m\.)?youtube\.com/(?:watch\?\S+|shorts/\S+)",
    r"youtu\.be/\S+",
    r"(?:www\.)?tenor\.com/\S+",
    r"(?:media\.)?giphy\.com/\S+",
    r"(?:www\.)?gfycat\.com/\S+",
    r"(?:i\.)?imgur\.com/\S+",
    r"(?:www\.)?streamable\.com/\S+",
    r"(?:www\.)?vimeo\.com/\S+",
    r"clips\.twitch\.tv/\S+",
    r"(?:www\.)?twitch\.tv/\S+/clip/\S+",
];

fn auto_embed_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let hosts = AUTO_EMBED_PATTERNS.join("|");
        Regex::new(&format!(r"^<?https?://(?:{hosts})>?$")).expect("auto-embed pattern is valid")
    })
}

fn resolved_emoji_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"<a?:[A-Za-z0-9_]+:\d+>").expect("resolved emoji pattern is valid")
    })
}

fn emoji_token_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r":([A-Za-z0-9_]+):").expect("emoji token pattern is valid"))
}

fn markup_token_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"<(?:@[!&]?\d+|#\d+|a?:[A-Za-z0-9_]+:\d+)>").expect("markup pattern is valid")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildEmoji {
    pub id: u64,
    pub name: String,
    pub animated: bool,
}

impl GuildEmoji {
    pub fn markup(&self) -> String {
        if self.animated {
            format!("<a:{}:{}>", self.name, self.id)
        } else {
            format!("<:{}:{}>", self.name, self.id)
        }
    }
}

/// Custom emoji visible to the relay, keyed by name. First registration wins
/// when several guilds share a name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmojiTable {
    by_name: HashMap<String, GuildEmoji>,
}

impl EmojiTable {
    pub fn new(emojis: impl IntoIterator<Item = GuildEmoji>) -> Self {
        let mut table = Self::default();
        for emoji in emojis {
            table.insert(emoji);
        }
        table
    }

    pub fn insert(&mut self, emoji: GuildEmoji) {
        self.by_name.entry(emoji.name.clone()).or_insert(emoji);
    }

    pub fn get(&self, name: &str) -> Option<&GuildEmoji> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// `"nick (username)"` when a guild nickname exists, otherwise the username
/// with its legacy discriminator when that is not the migrated default.
pub fn render_display_name(author: &Author) -> String {
    let username = match author.discriminator {
        Some(discriminator) if discriminator != 0 => {
            format!("{}#{discriminator:04}", author.username)
        }
        _ => author.username.clone(),
    };
    match author
        .nickname
        .as_deref()
        .map(str::trim)
        .filter(|nick| !nick.is_empty())
    {
        Some(nick) => format!("{nick} ({username})"),
        None => username,
    }
}

/// True when the whole body is a single link the destination will embed by itself.
pub fn should_suppress_embeds(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.is_empty() && auto_embed_regex().is_match(trimmed)
}

/// Replaces `:name:` with the emoji markup from `table`, leaving already
/// resolved `<:name:id>` / `<a:name:id>` spans untouched.
pub fn rewrite_emoji_tokens(text: &str, table: &EmojiTable) -> String {
    if table.is_empty() || !text.contains(':') {
        return text.to_string();
    }

    let mut rewritten = String::with_capacity(text.len());
    let mut cursor = 0;
    for resolved in resolved_emoji_regex().find_iter(text) {
        rewritten.push_str(&substitute_emoji_tokens(&text[cursor..resolved.start()], table));
        rewritten.push_str(resolved.as_str());
        cursor = resolved.end();
    }
    rewritten.push_str(&substitute_emoji_tokens(&text[cursor..], table));
    rewritten
}

fn substitute_emoji_tokens(segment: &str, table: &EmojiTable) -> String {
    emoji_token_regex()
        .replace_all(segment, |captures: &regex::Captures<'_>| {
            match table.get(&captures[1]) {
                Some(emoji) => emoji.markup(),
                None => captures[0].to_string(),
            }
        })
        .into_owned()
}

/// Flattens newlines and truncates to the preview budget. The budget grows by
/// the length of every mention, channel or emoji token so markup is not cut
/// short by its own verbosity.
pub fn shorten_for_reply_preview(text: &str) -> String {
    let flattened = text.replace("\r\n", " ").replace(['\n', '\r'], " ");
    let extension: usize = markup_token_regex()
        .find_iter(&flattened)
        .map(|token| token.as_str().chars().count())
        .sum();
    let budget = REPLY_PREVIEW_BASE_CHARS.saturating_add(extension);

    if flattened.chars().count() <= budget {
        return flattened;
    }
    let mut truncated: String = flattened.chars().take(budget).collect();
    truncated.push_str(REPLY_PREVIEW_ELLIPSIS);
    truncated
}

/// Quoted one-line preview posted ahead of a reply's primary mirror.
pub fn render_reply_preview(quoted_author: &str, quoted_text: &str) -> String {
    let shortened = shorten_for_reply_preview(quoted_text.trim());
    let body = if shortened.trim().is_empty() {
        EMPTY_PREVIEW_PLACEHOLDER.to_string()
    } else {
        shortened
    };
    format!("> **{quoted_author}**: {body}")
}

/// Content and embeds as they should appear on a primary mirror.
pub fn render_mirror_body(
    message: &SourceMessage,
    emoji_table: &EmojiTable,
) -> (String, Vec<crate::model::Embed>) {
    let content = rewrite_emoji_tokens(&message.content, emoji_table);
    let embeds = if should_suppress_embeds(&message.content) {
        Vec::new()
    } else {
        message.embeds.clone()
    };
    (content, embeds)
}

pub fn render_primary_payload(
    message: &SourceMessage,
    emoji_table: &EmojiTable,
    attachments: &[OutboundAttachment],
) -> OutboundPayload {
    let (content, embeds) = render_mirror_body(message, emoji_table);
    OutboundPayload {
        content,
        display_name: render_display_name(&message.author),
        avatar_url: message.author.avatar_url.clone(),
        embeds,
        attachments: attachments.to_vec(),
        suppress_mentions: false,
    }
}

pub fn render_preview_payload(
    replier: &Author,
    quoted_author: &str,
    quoted_text: &str,
) -> OutboundPayload {
    OutboundPayload {
        content: render_reply_preview(quoted_author, quoted_text),
        display_name: render_display_name(replier),
        avatar_url: replier.avatar_url.clone(),
        embeds: Vec::new(),
        attachments: Vec::new(),
        suppress_mentions: true,
    }
}

/// Bytes for one attachment, shared between destinations.
pub fn shared_attachment(filename: &str, bytes: Vec<u8>) -> OutboundAttachment {
    OutboundAttachment {
        filename: filename.to_string(),
        bytes: Arc::new(bytes),
    }
}
