//! Source ingestion: normalize raw feed text and insert deduplicated sources.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use serde::Serialize;

use super::feed::FeedEntry;
use crate::domain::NewSource;
use crate::store::Store;

/// Normalized texts shorter than this are not worth a video
pub const MIN_TEXT_CHARS: usize = 20;

struct Patterns {
    tags: Regex,
    urls: Regex,
    entities: Regex,
    whitespace: Regex,
    prefix: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            tags: Regex::new(r"<[^>]+>")?,
            urls: Regex::new(r"https?://\S+|www\.\S+")?,
            entities: Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|[a-zA-Z]+);")?,
            whitespace: Regex::new(r"\s+")?,
            prefix: Regex::new(r"^unbfacts:\s*")?,
        })
    }
}

static PATTERNS: OnceLock<Result<Patterns, regex::Error>> = OnceLock::new();

fn patterns() -> Result<&'static Patterns, regex::Error> {
    PATTERNS
        .get_or_init(Patterns::compile)
        .as_ref()
        .map_err(Clone::clone)
}

fn unescape_entity(caps: &Captures<'_>) -> String {
    let body = &caps[1];
    let decoded = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
        u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
    } else if let Some(dec) = body.strip_prefix('#') {
        dec.parse().ok().and_then(char::from_u32)
    } else {
        match body {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            "ndash" => Some('-'),
            "mdash" => Some('-'),
            "hellip" => Some('…'),
            "rsquo" | "lsquo" => Some('\''),
            "rdquo" | "ldquo" => Some('"'),
            _ => None,
        }
    };
    decoded
        .map(String::from)
        .unwrap_or_else(|| caps[0].to_string())
}

/// Normalize raw feed text.
///
/// Strips markup and links, decodes entities, collapses whitespace and drops
/// the feed's `unbfacts:` prefix. Returns `None` if too little text is left.
pub fn normalize_text(raw: &str) -> Result<Option<String>, regex::Error> {
    let p = patterns()?;
    let text = p.tags.replace_all(raw, "");
    let text = p.urls.replace_all(&text, "");
    let text = p.entities.replace_all(&text, unescape_entity);
    let text = p.whitespace.replace_all(&text, " ");
    let text = p.prefix.replace(text.trim_start(), "");
    let text = text.trim();

    if text.chars().count() < MIN_TEXT_CHARS {
        return Ok(None);
    }
    Ok(Some(text.to_string()))
}

/// Outcome of one ingest call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub inserted: usize,
    /// Texts already present in the store
    pub duplicates: usize,
    /// Malformed lines and texts too short after normalization
    pub rejected: usize,
}

pub struct Ingestor {
    store: Store,
}

impl Ingestor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Normalize and insert sources; duplicates are no-ops
    pub fn ingest<I>(&self, sources: I) -> Result<IngestSummary>
    where
        I: IntoIterator<Item = NewSource>,
    {
        let mut summary = IngestSummary::default();

        for source in sources {
            let Some(text) = normalize_text(&source.text)? else {
                tracing::debug!(group = %source.group, "Rejected short source");
                summary.rejected += 1;
                continue;
            };

            let normalized = NewSource { text, ..source };
            match self
                .store
                .insert_source(&normalized)
                .context("Failed to insert source")?
            {
                Some(id) => {
                    tracing::info!(source_id = id, group = %normalized.group, "Ingested source");
                    summary.inserted += 1;
                }
                None => summary.duplicates += 1,
            }
        }

        Ok(summary)
    }

    /// Ingest newline-separated input.
    ///
    /// A line starting with `{` is a JSON object with `group`, `text` and an
    /// optional `published_at`; any other non-blank line is plain text
    /// tagged with `default_group`.
    pub fn ingest_lines(&self, input: &str, default_group: &str) -> Result<IngestSummary> {
        let mut malformed = 0;
        let mut sources = Vec::new();

        for (number, line) in input.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('{') {
                match serde_json::from_str::<NewSource>(line) {
                    Ok(source) => sources.push(source),
                    Err(e) => {
                        tracing::warn!(line = number + 1, error = %e, "Skipping malformed source line");
                        malformed += 1;
                    }
                }
            } else {
                sources.push(NewSource {
                    group: default_group.to_string(),
                    text: line.to_string(),
                    published_at: None,
                });
            }
        }

        let mut summary = self.ingest(sources)?;
        summary.rejected += malformed;
        Ok(summary)
    }

    /// Ingest feed entries, tagged with the feed's group
    pub fn ingest_feed(&self, group: &str, entries: Vec<FeedEntry>) -> Result<IngestSummary> {
        self.ingest(entries.into_iter().map(|entry| NewSource {
            group: group.to_string(),
            text: entry.raw_text(),
            published_at: entry.published_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_markup_and_links() {
        let raw = "<p>unbfacts: Honey   never <b>spoils</b>.&nbsp;See https://example.com/honey for more &amp; more.</p>";
        assert_eq!(
            normalize_text(raw).unwrap().as_deref(),
            Some("Honey never spoils. See for more & more.")
        );
    }

    #[test]
    fn test_normalize_decodes_numeric_entities() {
        let raw = "Octopuses have three hearts &#8212; and blue blood &#x263A;";
        let text = normalize_text(raw).unwrap().unwrap();
        assert!(text.contains('\u{2014}'));
        assert!(text.ends_with('\u{263A}'));
    }

    #[test]
    fn test_short_text_is_rejected() {
        assert_eq!(normalize_text("<a href='x'>Click</a> www.x.io").unwrap(), None);
    }

    #[test]
    fn test_same_text_ingested_twice_is_one_source() {
        let store = Store::open_in_memory().unwrap();
        let ingestor = Ingestor::new(store.clone());
        let text = "A day on Venus is longer than its year.";

        let first = ingestor.ingest_lines(text, "facts").unwrap();
        assert_eq!(first.inserted, 1);

        let second = ingestor
            .ingest_lines(&format!("  <i>{text}</i>  "), "facts")
            .unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(store.count_sources().unwrap(), 1);
    }

    #[test]
    fn test_feed_entries_are_normalized_and_grouped() {
        let store = Store::open_in_memory().unwrap();
        let ingestor = Ingestor::new(store.clone());
        let feed = r#"<rss version="2.0"><channel>
            <item>
              <title>Octopuses</title>
              <description><![CDATA[<p>They have three hearts &amp; blue blood. https://example.com</p>]]></description>
              <pubDate>Tue, 02 Jan 2024 10:30:00 +0000</pubDate>
            </item>
            <item><title>Short</title></item>
            <item>
              <title>Octopuses</title>
              <description>They have three hearts &amp;amp; blue blood.</description>
            </item>
        </channel></rss>"#;

        let entries = crate::core::feed::parse_feed(feed).unwrap();
        let summary = ingestor.ingest_feed("snopes", entries).unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.duplicates, 1);

        let source = store.get_source(1).unwrap();
        assert_eq!(source.group, "snopes");
        assert_eq!(source.text, "Octopuses They have three hearts & blue blood.");
    }

    #[test]
    fn test_json_lines_keep_their_group() {
        let store = Store::open_in_memory().unwrap();
        let ingestor = Ingestor::new(store.clone());
        let input = r#"{"group":"snopes","text":"Wombats produce cube-shaped droppings."}
not json but long enough to be a source
{"group":"broken""#;

        let summary = ingestor.ingest_lines(input, "misc").unwrap();
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.rejected, 1);

        let first = store.get_source(1).unwrap();
        assert_eq!(first.group, "snopes");
        let second = store.get_source(2).unwrap();
        assert_eq!(second.group, "misc");
    }
}
