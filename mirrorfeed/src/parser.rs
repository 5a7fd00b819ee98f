//! Extracts post records from a gateway response body, trying a
//! syndication parse first and falling back to a regex scrape of raw
//! HTML when the feed format is unavailable.

use regex::Regex;

/// One extracted record, prior to being turned into a stored [`crate::storage::NewPost`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub link: String,
    pub published: String,
    pub raw: serde_json::Value,
}

/// Parses a syndication feed (RSS/Atom) body. Entries missing both an id
/// and a guid are skipped; a malformed feed yields an empty list rather
/// than an error, matching the upstream's tolerant behaviour.
pub fn parse_feed(body: &[u8]) -> Vec<ParsedEntry> {
    let feed = match feed_rs::parser::parse(body) {
        Ok(feed) => feed,
        Err(_) => return Vec::new(),
    };

    feed.entries
        .into_iter()
        .filter_map(|entry| {
            let id = if !entry.id.is_empty() {
                entry.id.clone()
            } else {
                return None;
            };

            let title = entry
                .title
                .as_ref()
                .map(|t| t.content.clone())
                .unwrap_or_default();
            let summary = entry
                .summary
                .as_ref()
                .map(|s| s.content.clone())
                .unwrap_or_default();
            let link = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_default();
            let published = entry
                .published
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_default();

            let raw = serde_json::json!({
                "id": id,
                "title": title,
                "summary": summary,
                "link": link,
                "published": published,
            });

            Some(ParsedEntry {
                id,
                title,
                summary,
                link,
                published,
                raw,
            })
        })
        .collect()
}

/// Scans raw HTML for `pattern` (expected to carry exactly one capture
/// group yielding the post id) and synthesizes one entry per match, with
/// `summary` built from a whitespace-normalized window of 200 characters
/// on either side of the match.
pub fn parse_html_fallback(html: &str, pattern: &Regex) -> Vec<ParsedEntry> {
    let bytes = html.as_bytes();
    pattern
        .find_iter(html)
        .filter_map(|m| {
            let captures = pattern.captures(&html[m.start()..m.end()])?;
            let id = captures.get(1)?.as_str().to_string();

            let start = m.start().saturating_sub(200);
            let end = (start + 400).min(bytes.len());
            let excerpt = normalize_whitespace(&html[start..end]);

            Some(ParsedEntry {
                id: id.clone(),
                title: "Tweet".to_string(),
                summary: excerpt.clone(),
                link: id,
                published: String::new(),
                raw: serde_json::json!({ "excerpt": excerpt }),
            })
        })
        .collect()
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Runs the two-stage strategy from a raw response: syndication parse,
/// then HTML fallback only if the first yielded nothing and the
/// response's `Content-Type` does not look like XML.
pub fn parse_response(body: &[u8], content_type: &str, html_fallback_pattern: &Regex) -> Vec<ParsedEntry> {
    let entries = parse_feed(body);
    if !entries.is_empty() || content_type.contains("xml") {
        return entries;
    }
    let text = String::from_utf8_lossy(body);
    parse_html_fallback(&text, html_fallback_pattern)
}
