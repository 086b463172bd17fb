//! RSS and Atom feeds as a source of raw texts.
//!
//! Entries are parsed from the feed body; the ingestor normalizes and
//! deduplicates them like any other source. With `follow_links` the linked
//! article is fetched and its `<article>` body replaces the feed summary.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

/// Feed errors
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("Malformed feed: {0}")]
    Malformed(String),
}

/// One entry of a feed, before normalization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedEntry {
    pub title: String,
    pub link: Option<String>,
    pub summary: String,
    pub published_at: Option<DateTime<Utc>>,
}

impl FeedEntry {
    /// Raw text handed to the ingestor: title followed by the body
    pub fn raw_text(&self) -> String {
        format!("{} {}", self.title.trim(), self.summary.trim())
            .trim()
            .to_string()
    }
}

fn child_text(node: &roxmltree::Node, name: &str) -> Option<String> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .map(|n| {
            n.descendants()
                .filter(|d| d.is_text())
                .filter_map(|d| d.text())
                .collect::<String>()
        })
        .filter(|t| !t.trim().is_empty())
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn rss_item(item: &roxmltree::Node) -> FeedEntry {
    FeedEntry {
        title: child_text(item, "title").unwrap_or_default(),
        link: child_text(item, "link").map(|l| l.trim().to_string()),
        summary: child_text(item, "encoded")
            .or_else(|| child_text(item, "description"))
            .unwrap_or_default(),
        published_at: child_text(item, "pubDate").and_then(|d| parse_date(&d)),
    }
}

fn atom_entry(entry: &roxmltree::Node) -> FeedEntry {
    let link = entry
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == "link")
        .find(|n| matches!(n.attribute("rel"), None | Some("alternate")))
        .and_then(|n| n.attribute("href"))
        .map(str::to_string);

    FeedEntry {
        title: child_text(entry, "title").unwrap_or_default(),
        link,
        summary: child_text(entry, "content")
            .or_else(|| child_text(entry, "summary"))
            .unwrap_or_default(),
        published_at: child_text(entry, "published")
            .or_else(|| child_text(entry, "updated"))
            .and_then(|d| parse_date(&d)),
    }
}

/// Parse an RSS 2.0 or Atom document into entries, in document order
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>, FeedError> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| FeedError::Malformed(format!("XML parse error: {}", e)))?;

    let root = doc.root_element();
    let entries: Vec<FeedEntry> = match root.tag_name().name() {
        "rss" | "RDF" => root
            .descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == "item")
            .map(|n| rss_item(&n))
            .collect(),
        "feed" => root
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "entry")
            .map(|n| atom_entry(&n))
            .collect(),
        other => {
            return Err(FeedError::Malformed(format!(
                "unsupported root element <{other}>"
            )))
        }
    };

    Ok(entries)
}

struct ArticlePatterns {
    article: Regex,
    noise: Regex,
}

static ARTICLE_PATTERNS: OnceLock<Result<ArticlePatterns, regex::Error>> = OnceLock::new();

fn article_patterns() -> Result<&'static ArticlePatterns, regex::Error> {
    ARTICLE_PATTERNS
        .get_or_init(|| {
            Ok(ArticlePatterns {
                article: Regex::new(r"(?is)<article\b[^>]*>(.*?)</article>")?,
                noise: Regex::new(r"(?is)<(script|style|figure|aside|nav)\b[^>]*>.*?</(script|style|figure|aside|nav)>")?,
            })
        })
        .as_ref()
        .map_err(Clone::clone)
}

/// Body of the first `<article>` element of a page, without scripts and
/// asides. Markup is left for the normalizer.
pub fn article_body(html: &str) -> Result<Option<String>, regex::Error> {
    let p = article_patterns()?;
    let Some(caps) = p.article.captures(html) else {
        return Ok(None);
    };
    let body = p.noise.replace_all(&caps[1], " ");
    if body.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(body.into_owned()))
}

/// Fetches feeds over HTTP
pub struct FeedFetcher {
    client: reqwest::Client,
    follow_links: bool,
}

impl FeedFetcher {
    pub fn new(follow_links: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("storyreel/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            follow_links,
        }
    }

    async fn get(&self, url: &str) -> Result<String, FeedError> {
        let fetch_err = |message: String| FeedError::Fetch {
            url: url.to_string(),
            message,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        if !response.status().is_success() {
            return Err(fetch_err(format!("status {}", response.status())));
        }
        response.text().await.map_err(|e| fetch_err(e.to_string()))
    }

    /// First `limit` entries of a feed.
    ///
    /// An article that cannot be fetched keeps the feed's own summary.
    pub async fn fetch(&self, url: &str, limit: usize) -> Result<Vec<FeedEntry>, FeedError> {
        let body = self.get(url).await?;
        let mut entries = parse_feed(&body)?;
        entries.truncate(limit);
        tracing::info!(url = %url, entries = entries.len(), "Fetched feed");

        if !self.follow_links {
            return Ok(entries);
        }

        for entry in &mut entries {
            let Some(link) = entry.link.clone() else {
                continue;
            };
            match self.get(&link).await {
                Ok(html) => match article_body(&html) {
                    Ok(Some(body)) => entry.summary = body,
                    Ok(None) => tracing::debug!(link = %link, "No article body, using feed summary"),
                    Err(e) => tracing::warn!(link = %link, error = %e, "Article extraction failed"),
                },
                Err(e) => tracing::warn!(error = %e, "Using feed summary"),
            }
        }

        Ok(entries)
    }
}
