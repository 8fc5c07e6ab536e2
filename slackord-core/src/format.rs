// ABOUTME: Renders a source message into destination-platform markup
// ABOUTME: Attribution header, mention replacement, sticker placeholders, length-bounded segments

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use crate::traits::Platform;

/// Per-message character limit on both platforms
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 2000;

/// Rendered in place of each sticker
pub const STICKER_PLACEHOLDER: &str = "🖼️";

/// Fallback thread name when the parent has no usable words
pub const DEFAULT_THREAD_NAME: &str = "Discussion";

const THREAD_NAME_WORDS: usize = 5;
const THREAD_NAME_MAX_CHARS: usize = 100;
const HEADER_NAME_MAX_CHARS: usize = 80;

// Slack: <@U123> or <@U123|name>; Discord: <@123> or <@!123>
static MENTION_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"<@!?([A-Za-z0-9]+)(?:\|[^>]*)?>").ok());

/// User ids referenced by mention tokens in `text`, in first-seen order
pub fn mention_ids(text: &str) -> Vec<String> {
    let Some(re) = MENTION_RE.as_ref() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    re.captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Replace each resolvable mention token with `@<name>`; others stay verbatim
pub fn replace_mentions(text: &str, names: &HashMap<String, String>) -> String {
    let Some(re) = MENTION_RE.as_ref() else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &regex::Captures<'_>| {
        let id = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        match names.get(id) {
            Some(name) => format!("@{}", name),
            None => caps[0].to_string(),
        }
    })
    .into_owned()
}

/// Where the destination channel came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelContext {
    /// Explicitly mapped channel
    Mapped,
    /// Overflow channel; the source channel name is shown when it could be looked up
    Unmapped { channel_name: Option<String> },
}

/// Everything the formatter needs about one source message
#[derive(Debug, Clone)]
pub struct RenderInput<'a> {
    pub author: &'a str,
    pub text: &'a str,
    /// Resolved display names keyed by user id
    pub mentions: &'a HashMap<String, String>,
    pub stickers: &'a [String],
    pub context: ChannelContext,
    pub suppress_header: bool,
}

/// Destination-specific renderer
#[derive(Debug, Clone)]
pub struct MessageFormatter {
    destination: Platform,
    max_len: usize,
}

impl MessageFormatter {
    pub fn new(destination: Platform, max_len: usize) -> Self {
        Self {
            destination,
            max_len: max_len.max(1),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Attribution line, without the trailing newline
    pub fn header(&self, author: &str, channel_name: Option<&str>) -> String {
        let author: String = author.chars().take(HEADER_NAME_MAX_CHARS).collect();
        let mut header = match self.destination {
            Platform::Discord => format!("**💂_{}_**", author),
            Platform::Slack => format!("💂*_{}_*", author),
        };
        if let Some(channel) = channel_name {
            let channel: String = channel.chars().take(HEADER_NAME_MAX_CHARS).collect();
            match self.destination {
                Platform::Discord => header.push_str(&format!(" 🔉**_#{}_**", channel)),
                Platform::Slack => header.push_str(&format!(" 🔉*_#{}_*", channel)),
            }
        }
        header
    }

    /// Render a message into its ordered segments.
    ///
    /// Overflow-channel messages always carry a header so the annotation has
    /// somewhere to live.
    pub fn render(&self, input: &RenderInput<'_>) -> Segments {
        let mut body = replace_mentions(input.text, input.mentions);
        if !input.stickers.is_empty() {
            let placeholders = vec![STICKER_PLACEHOLDER; input.stickers.len()].join(" ");
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(&placeholders);
        }

        let header = match &input.context {
            ChannelContext::Unmapped { channel_name } => {
                Some(self.header(input.author, channel_name.as_deref()))
            }
            ChannelContext::Mapped if input.suppress_header => None,
            ChannelContext::Mapped => Some(self.header(input.author, None)),
        };

        Segments::new(header, body, self.max_len)
    }

    /// Name for a destination thread, taken from the parent message text
    pub fn thread_name(parent_text: &str) -> String {
        thread_name(parent_text)
    }
}

// =============================================================================
// Segments
// =============================================================================

/// Lazy sequence of length-bounded message segments.
///
/// Cloning restarts the sequence from the current position; a fresh clone
/// taken before iteration replays every segment.
#[derive(Debug, Clone)]
pub struct Segments {
    header: Option<String>,
    body: String,
    limit: usize,
    /// Byte offset into `body` of the next segment
    offset: usize,
    emitted: usize,
}

impl Segments {
    fn new(header: Option<String>, body: String, limit: usize) -> Self {
        Self {
            header,
            body,
            limit,
            offset: 0,
            emitted: 0,
        }
    }

    /// The full body text the segments are cut from
    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }
}

/// Byte length of the next cut of `rest` within `budget` characters
fn next_cut(rest: &str, budget: usize) -> usize {
    let Some((hard, _)) = rest.char_indices().nth(budget) else {
        return rest.len();
    };
    match rest[..hard].rfind('.') {
        Some(period) => period + 1,
        None => hard,
    }
}

impl Iterator for Segments {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let first = self.emitted == 0;
        if !first && self.offset >= self.body.len() {
            return None;
        }

        let rest = &self.body[self.offset..];
        let segment = match (&self.header, first) {
            (Some(header), true) => {
                if rest.is_empty() {
                    header.clone()
                } else {
                    let budget = self
                        .limit
                        .saturating_sub(header.chars().count() + 1)
                        .max(1);
                    let cut = next_cut(rest, budget);
                    let seg = format!("{}\n{}", header, &rest[..cut]);
                    self.offset += cut;
                    seg
                }
            }
            _ => {
                let cut = next_cut(rest, self.limit);
                self.offset += cut;
                rest[..cut].to_string()
            }
        };

        self.emitted += 1;
        Some(segment)
    }
}

// =============================================================================
// Thread names
// =============================================================================

static HEADER_LINE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(?:\*\*💂_.*?_\*\*|💂\*_.*?_\*)[^\n]*\n?").ok());

/// First few words of `parent_text` with any relay header removed
pub fn thread_name(parent_text: &str) -> String {
    let trimmed = parent_text.trim_start();
    let cleaned = match HEADER_LINE_RE.as_ref() {
        Some(re) => re.replace(trimmed, ""),
        None => trimmed.into(),
    };
    let cleaned = cleaned.trim().trim_start_matches('*').trim();

    let name = cleaned
        .split_whitespace()
        .take(THREAD_NAME_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    let name: String = name.chars().take(THREAD_NAME_MAX_CHARS).collect();

    if name.trim().is_empty() {
        DEFAULT_THREAD_NAME.to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(
        author: &'a str,
        text: &'a str,
        mentions: &'a HashMap<String, String>,
    ) -> RenderInput<'a> {
        RenderInput {
            author,
            text,
            mentions,
            stickers: &[],
            context: ChannelContext::Mapped,
            suppress_header: false,
        }
    }

    fn strip_header(segments: &[String], header: Option<&str>) -> String {
        let mut out = String::new();
        for (i, seg) in segments.iter().enumerate() {
            match (i, header) {
                (0, Some(h)) => {
                    let rest = seg.strip_prefix(h).unwrap();
                    out.push_str(rest.strip_prefix('\n').unwrap_or(rest));
                }
                _ => out.push_str(seg),
            }
        }
        out
    }

    #[test]
    fn test_hello_from_ann_to_discord() {
        let names = HashMap::new();
        let f = MessageFormatter::new(Platform::Discord, DEFAULT_MAX_MESSAGE_LEN);
        let segments: Vec<String> = f.render(&input("Ann", "Hello", &names)).collect();
        assert_eq!(segments, vec!["**💂_Ann_**\nHello".to_string()]);
    }

    #[test]
    fn test_slack_header_and_annotation() {
        let f = MessageFormatter::new(Platform::Slack, DEFAULT_MAX_MESSAGE_LEN);
        assert_eq!(f.header("Bob", None), "💂*_Bob_*");
        assert_eq!(f.header("Bob", Some("memes")), "💂*_Bob_* 🔉*_#memes_*");

        let d = MessageFormatter::new(Platform::Discord, DEFAULT_MAX_MESSAGE_LEN);
        assert_eq!(d.header("Bob", Some("memes")), "**💂_Bob_** 🔉**_#memes_**");
    }

    #[test]
    fn test_unmapped_annotation_forces_header() {
        let names = HashMap::new();
        let f = MessageFormatter::new(Platform::Slack, DEFAULT_MAX_MESSAGE_LEN);
        let mut req = input("Bob", "hi", &names);
        req.suppress_header = true;
        req.context = ChannelContext::Unmapped {
            channel_name: Some("offtopic".to_string()),
        };
        let segments: Vec<String> = f.render(&req).collect();
        assert_eq!(segments, vec!["💂*_Bob_* 🔉*_#offtopic_*\nhi".to_string()]);

        // Name lookup failed: annotation omitted, message still relayed
        req.context = ChannelContext::Unmapped { channel_name: None };
        let segments: Vec<String> = f.render(&req).collect();
        assert_eq!(segments, vec!["💂*_Bob_*\nhi".to_string()]);
    }

    #[test]
    fn test_suppressed_header() {
        let names = HashMap::new();
        let f = MessageFormatter::new(Platform::Discord, DEFAULT_MAX_MESSAGE_LEN);
        let mut req = input("Ann", "again", &names);
        req.suppress_header = true;
        assert_eq!(f.render(&req).collect::<Vec<_>>(), vec!["again".to_string()]);
    }

    #[test]
    fn test_mentions_replaced_and_unresolved_kept() {
        let mut names = HashMap::new();
        names.insert("U111".to_string(), "Ann".to_string());
        names.insert("80351110224678912".to_string(), "Nelly".to_string());

        let text = "hey <@U111> and <@U222|bob>, ping <@!80351110224678912>";
        assert_eq!(
            replace_mentions(text, &names),
            "hey @Ann and <@U222|bob>, ping @Nelly"
        );
        assert_eq!(
            mention_ids(text),
            vec!["U111", "U222", "80351110224678912"]
        );
    }

    #[test]
    fn test_mention_ids_deduplicated() {
        assert_eq!(mention_ids("<@U1> <@U1> <@U2>"), vec!["U1", "U2"]);
        assert!(mention_ids("no mentions here").is_empty());
    }

    #[test]
    fn test_stickers_render_as_placeholders() {
        let names = HashMap::new();
        let stickers = vec!["wave".to_string(), "cat".to_string()];
        let f = MessageFormatter::new(Platform::Slack, DEFAULT_MAX_MESSAGE_LEN);
        let mut req = input("Ann", "look", &names);
        req.stickers = &stickers;
        req.suppress_header = true;
        let segments: Vec<String> = f.render(&req).collect();
        assert_eq!(segments, vec![format!("look\n{} {}", STICKER_PLACEHOLDER, STICKER_PLACEHOLDER)]);
    }

    #[test]
    fn test_split_prefers_last_period() {
        let names = HashMap::new();
        let f = MessageFormatter::new(Platform::Discord, 20);
        let mut req = input("A", "One two. Three four five six seven.", &names);
        req.suppress_header = true;
        let segments: Vec<String> = f.render(&req).collect();
        assert_eq!(segments[0], "One two.");
        assert!(segments.iter().all(|s| s.chars().count() <= 20));
        assert_eq!(segments.concat(), "One two. Three four five six seven.");
    }

    #[test]
    fn test_split_hard_cut_without_period() {
        let names = HashMap::new();
        let text = "x".repeat(45);
        let f = MessageFormatter::new(Platform::Discord, 20);
        let mut req = input("A", &text, &names);
        req.suppress_header = true;
        let segments: Vec<String> = f.render(&req).collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].len(), 20);
        assert_eq!(segments[2].len(), 5);
    }

    #[test]
    fn test_splitting_law_with_header() {
        let names = HashMap::new();
        let sentence = "Sentences end here. ";
        let text = sentence.repeat(300); // 6000 chars
        let f = MessageFormatter::new(Platform::Discord, DEFAULT_MAX_MESSAGE_LEN);
        let segments: Vec<String> = f.render(&input("Ann", &text, &names)).collect();

        assert!(segments.len() >= 4);
        for seg in &segments {
            assert!(seg.chars().count() <= DEFAULT_MAX_MESSAGE_LEN);
        }
        assert!(segments[0].starts_with("**💂_Ann_**\n"));
        assert!(!segments[1].contains("💂"));
        // Every cut but the last lands right after a period
        for seg in &segments[..segments.len() - 1] {
            assert!(seg.ends_with('.'), "segment ends with {:?}", seg.chars().last());
        }
        assert_eq!(strip_header(&segments, Some("**💂_Ann_**")), text);
    }

    #[test]
    fn test_multibyte_text_never_split_inside_char() {
        let names = HashMap::new();
        let text = "ж".repeat(4500);
        let f = MessageFormatter::new(Platform::Slack, DEFAULT_MAX_MESSAGE_LEN);
        let mut req = input("Ann", &text, &names);
        req.suppress_header = true;
        let segments: Vec<String> = f.render(&req).collect();
        assert_eq!(segments.len(), 3);
        assert!(segments.iter().all(|s| s.chars().count() <= 2000));
        assert_eq!(segments.concat(), text);
    }

    #[test]
    fn test_empty_body_yields_one_segment() {
        let names = HashMap::new();
        let f = MessageFormatter::new(Platform::Discord, DEFAULT_MAX_MESSAGE_LEN);
        let segments: Vec<String> = f.render(&input("Ann", "", &names)).collect();
        assert_eq!(segments, vec!["**💂_Ann_**".to_string()]);

        let mut req = input("Ann", "", &names);
        req.suppress_header = true;
        let segments: Vec<String> = f.render(&req).collect();
        assert_eq!(segments, vec![String::new()]);
    }

    #[test]
    fn test_segments_restartable_via_clone() {
        let names = HashMap::new();
        let text = "a".repeat(50);
        let f = MessageFormatter::new(Platform::Discord, 20);
        let segments = f.render(&input("A", &text, &names));
        let first: Vec<String> = segments.clone().collect();
        let second: Vec<String> = segments.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_thread_name_strips_header() {
        assert_eq!(
            thread_name("**💂_Ann_**\nHow do we deploy the new build tonight?"),
            "How do we deploy the"
        );
        assert_eq!(
            thread_name("💂*_Bob_* 🔉*_#memes_*\nshort one"),
            "short one"
        );
        assert_eq!(thread_name("plain parent text"), "plain parent text");
    }

    #[test]
    fn test_thread_name_fallback_and_cap() {
        assert_eq!(thread_name("**💂_Ann_**\n"), DEFAULT_THREAD_NAME);
        assert_eq!(thread_name("   "), DEFAULT_THREAD_NAME);

        let long_word = "w".repeat(300);
        assert_eq!(thread_name(&long_word).chars().count(), 100);
    }
}
