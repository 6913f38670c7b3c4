use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use regex::Regex;

use crate::chan::PostId;

pub const PLACEHOLDER: &str = "No comment";

static BR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid regex"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
static REPLY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r">>(\d+)").expect("valid regex"));
static NUMERIC_ENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&#(\d+);").expect("valid regex"));

/// Reduce the API's HTML comment markup to plain text with real newlines.
pub fn sanitize(raw: &str) -> String {
    let broken = BR_RE.replace_all(raw, "\n");
    let stripped = TAG_RE.replace_all(&broken, "");
    decode_entities(&stripped)
}

fn decode_entities(text: &str) -> String {
    let named = text
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&quot;", "\"")
        .replace("&#039;", "'");
    let numeric = NUMERIC_ENTITY_RE.replace_all(&named, |caps: &regex::Captures| {
        caps[1]
            .parse::<u32>()
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    // Ampersand last so double-encoded payloads come out single-decoded.
    numeric.replace("&amp;", "&")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Normal,
    /// Greentext: the line opens with a single `>` rather than a `>>N` link.
    Quote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Text(String),
    Reply(PostId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyLine {
    pub kind: LineKind,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentBody {
    pub lines: Vec<BodyLine>,
}

/// Parse a raw API comment into lines of text and `>>N` reply chunks.
/// Every marker occurrence becomes exactly one `Chunk::Reply`.
pub fn parse_body(raw: &str) -> CommentBody {
    let clean = sanitize(raw);
    let lines = clean
        .lines()
        .map(|line| BodyLine {
            kind: line_kind(line),
            chunks: split_chunks(line),
        })
        .collect();
    CommentBody { lines }
}

fn line_kind(line: &str) -> LineKind {
    if line.starts_with('>') && !line.starts_with(">>") {
        LineKind::Quote
    } else {
        LineKind::Normal
    }
}

fn split_chunks(line: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut cursor = 0;
    for found in REPLY_RE.find_iter(line) {
        // Digits past u64 stay plain text rather than mangling the line.
        let Ok(id) = found.as_str()[2..].parse::<PostId>() else {
            continue;
        };
        if found.start() > cursor {
            chunks.push(Chunk::Text(line[cursor..found.start()].to_string()));
        }
        chunks.push(Chunk::Reply(id));
        cursor = found.end();
    }
    if cursor < line.len() {
        chunks.push(Chunk::Text(line[cursor..].to_string()));
    }
    chunks
}

impl CommentBody {
    pub fn reply_targets(&self) -> Vec<PostId> {
        let mut targets = Vec::new();
        for line in &self.lines {
            for chunk in &line.chunks {
                if let Chunk::Reply(id) = chunk {
                    targets.push(*id);
                }
            }
        }
        targets
    }

    /// Display classification: the first non-whitespace content is a reply
    /// marker (covers marker-only bodies too). A marker buried mid-text does
    /// not reclassify the post. Replies still render inline in time order;
    /// this only tweaks the card styling.
    pub fn is_reply(&self) -> bool {
        for line in &self.lines {
            for chunk in &line.chunks {
                match chunk {
                    Chunk::Reply(_) => return true,
                    Chunk::Text(text) if text.trim().is_empty() => continue,
                    Chunk::Text(_) => return false,
                }
            }
        }
        false
    }

    /// Body text with reply markers dropped, one space between lines.
    pub fn preview_source(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            for chunk in &line.chunks {
                if let Chunk::Text(text) = chunk {
                    out.push_str(text);
                }
            }
            out.push(' ');
        }
        out.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Excerpt for catalog cards and reply popups. Always non-empty: bodies
    /// that boil down to nothing show the placeholder instead.
    pub fn preview(&self, budget: usize) -> String {
        let source = self.preview_source();
        if source.is_empty() {
            return PLACEHOLDER.to_string();
        }
        truncate_chars(&source, budget)
    }
}

/// Character-count truncation; the ellipsis only appears when text was cut.
pub fn truncate_chars(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }
    let mut out: String = text.chars().take(budget).collect();
    out.push('…');
    out
}

/// `HH:MM` for today, `HH:MM - D Mon` for anything older.
pub fn format_timestamp(at: DateTime<Local>, now: DateTime<Local>) -> String {
    if at.date_naive() == now.date_naive() {
        at.format("%H:%M").to_string()
    } else {
        at.format("%H:%M - %-d %b").to_string()
    }
}

const QUOTE_STYLE: Style = Style::new().fg(Color::Green);
const REPLY_STYLE: Style = Style::new()
    .fg(Color::Cyan)
    .add_modifier(Modifier::UNDERLINED);

/// Styled body for the thread pane. Greentext renders green, reply links
/// underlined; a body with no visible content renders the placeholder dimmed.
pub fn render_body(body: &CommentBody) -> Text<'static> {
    let blank = body.lines.iter().all(|line| {
        line.chunks.iter().all(|chunk| match chunk {
            Chunk::Text(text) => text.trim().is_empty(),
            Chunk::Reply(_) => false,
        })
    });
    if blank {
        return Text::from(Line::from(Span::styled(
            PLACEHOLDER,
            Style::new().fg(Color::DarkGray),
        )));
    }
    let mut lines = Vec::with_capacity(body.lines.len());
    for line in &body.lines {
        let mut spans = Vec::with_capacity(line.chunks.len().max(1));
        for chunk in &line.chunks {
            match chunk {
                Chunk::Text(text) => {
                    let style = match line.kind {
                        LineKind::Quote => QUOTE_STYLE,
                        LineKind::Normal => Style::new(),
                    };
                    spans.push(Span::styled(text.clone(), style));
                }
                Chunk::Reply(id) => {
                    spans.push(Span::styled(format!(">>{id}"), REPLY_STYLE));
                }
            }
        }
        lines.push(Line::from(spans));
    }
    Text::from(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sanitize_breaks_strips_and_decodes() {
        let raw = "a<br>b<br/><span class=\"x\">c</span> &lt;tag&gt; &quot;q&quot; &#039;s&#039; &#8217;u&#8217; &amp;amp;";
        assert_eq!(sanitize(raw), "a\nb\nc <tag> \"q\" 's' \u{2019}u\u{2019} &amp;");
    }

    #[test]
    fn each_marker_becomes_one_reply_chunk() {
        let body = parse_body("see >>100 and >>200<br>>>100 again");
        assert_eq!(
            body.lines[0].chunks,
            vec![
                Chunk::Text("see ".into()),
                Chunk::Reply(100),
                Chunk::Text(" and ".into()),
                Chunk::Reply(200),
            ]
        );
        assert_eq!(body.lines[1].chunks[0], Chunk::Reply(100));
        assert_eq!(body.reply_targets(), vec![100, 200, 100]);
    }

    #[test]
    fn greentext_is_single_arrow_only() {
        let body = parse_body("&gt;implying<br>&gt;&gt;300<br>plain");
        assert_eq!(body.lines[0].kind, LineKind::Quote);
        assert_eq!(body.lines[1].kind, LineKind::Normal);
        assert_eq!(body.lines[1].chunks, vec![Chunk::Reply(300)]);
        assert_eq!(body.lines[2].kind, LineKind::Normal);
    }

    #[test]
    fn marker_only_body_is_a_reply_with_placeholder_preview() {
        let body = parse_body("&gt;&gt;4200");
        assert!(body.is_reply());
        assert_eq!(body.preview(50), PLACEHOLDER);

        let mixed = parse_body("&gt;&gt;4200 this");
        assert!(mixed.is_reply());
        assert_eq!(mixed.preview(50), "this");
    }

    #[test]
    fn classification_hinges_on_leading_marker() {
        assert!(parse_body("&gt;&gt;1 agreed").is_reply());
        assert!(parse_body("  <br> &gt;&gt;1").is_reply());
        assert!(!parse_body("see &gt;&gt;1 for context").is_reply());
        assert!(!parse_body("plain text").is_reply());
        assert!(!parse_body("").is_reply());
    }

    #[test]
    fn empty_body_previews_placeholder() {
        assert_eq!(parse_body("").preview(50), PLACEHOLDER);
        assert_eq!(parse_body("   <br>  ").preview(50), PLACEHOLDER);
    }

    #[test]
    fn preview_truncates_by_chars_not_bytes() {
        let body = parse_body("ééééé");
        assert_eq!(body.preview(5), "ééééé");
        assert_eq!(body.preview(4), "éééé…");
    }

    #[test]
    fn preview_ellipsis_only_when_cut() {
        let body = parse_body("exactly ten");
        assert_eq!(body.preview(11), "exactly ten");
        assert_eq!(body.preview(7), "exactly…");
    }

    #[test]
    fn timestamps_shorten_same_day() {
        let now = Local.with_ymd_and_hms(2024, 5, 20, 18, 0, 0).unwrap();
        let today = Local.with_ymd_and_hms(2024, 5, 20, 9, 5, 0).unwrap();
        let older = Local.with_ymd_and_hms(2024, 5, 3, 9, 5, 0).unwrap();
        assert_eq!(format_timestamp(today, now), "09:05");
        assert_eq!(format_timestamp(older, now), "09:05 - 3 May");
    }

    #[test]
    fn render_marks_quotes_and_links() {
        let body = parse_body("&gt;green<br>see >>7");
        let text = render_body(&body);
        assert_eq!(text.lines.len(), 2);
        assert_eq!(text.lines[0].spans[0].style.fg, Some(Color::Green));
        let link = &text.lines[1].spans[1];
        assert_eq!(link.content.as_ref(), ">>7");
        assert!(link.style.add_modifier.contains(Modifier::UNDERLINED));
    }

    #[test]
    fn render_placeholder_for_empty_and_whitespace() {
        let text = render_body(&parse_body(""));
        assert_eq!(text.lines[0].spans[0].content.as_ref(), PLACEHOLDER);

        let text = render_body(&parse_body("  <br>   "));
        assert_eq!(text.lines.len(), 1);
        assert_eq!(text.lines[0].spans[0].content.as_ref(), PLACEHOLDER);

        let text = render_body(&parse_body("&gt;&gt;9"));
        assert_eq!(text.lines[0].spans[0].content.as_ref(), ">>9");
    }
}
