//! Field extraction over feed entries.
//!
//! feed-rs folds `<enclosure>` and `<media:content>` into one media list, so
//! RSS items are additionally scanned as raw XML to recover which element each
//! image URL came from. Atom entries (and any item the scan cannot match by
//! link) fall back to the feed-rs media model.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use feed_rs::model::Entry;

/// A feed entry reduced to the fields extraction patterns can refer to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    /// Raw HTML of the entry description (or content body)
    pub description: String,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub media: MediaFields,
}

/// Image-carrying elements of one entry, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaFields {
    pub content: Vec<String>,
    pub thumbnails: Vec<String>,
    pub enclosures: Vec<Enclosure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enclosure {
    pub url: String,
    pub mime_type: String,
}

impl FeedEntry {
    /// Build from a parsed entry, taking media from `raw_index` when the
    /// entry's link was found by the raw XML scan.
    pub fn from_parsed(entry: &Entry, raw_index: &HashMap<String, MediaFields>) -> Self {
        let title = entry
            .title
            .as_ref()
            .map(|t| t.content.clone())
            .unwrap_or_default();

        let link = entry
            .links
            .iter()
            .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
            .or_else(|| entry.links.first())
            .map(|l| l.href.trim().to_string())
            .unwrap_or_default();

        let description = entry
            .summary
            .as_ref()
            .map(|s| s.content.clone())
            .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
            .unwrap_or_default();

        let media = match raw_index.get(&link) {
            Some(media) => media.clone(),
            None => MediaFields::from_entry(entry),
        };

        Self {
            title,
            link,
            description,
            published: entry.published,
            updated: entry.updated,
            media,
        }
    }
}

impl MediaFields {
    fn from_entry(entry: &Entry) -> Self {
        let content = entry
            .media
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|c| c.url.as_ref())
            .map(|url| url.to_string())
            .collect();

        let thumbnails = entry
            .media
            .iter()
            .flat_map(|m| m.thumbnails.iter())
            .map(|t| t.image.uri.clone())
            .collect();

        let enclosures = entry
            .links
            .iter()
            .filter(|l| l.rel.as_deref() == Some("enclosure"))
            .map(|l| Enclosure {
                url: l.href.clone(),
                mime_type: l.media_type.clone().unwrap_or_default(),
            })
            .collect();

        Self {
            content,
            thumbnails,
            enclosures,
        }
    }
}

/// Resolve a field spec such as `"enclosure|media:content"` against an entry.
///
/// Alternatives are tried left to right and the first non-empty value wins.
/// Unknown field names resolve to an empty string.
pub fn extract(entry: &FeedEntry, field_spec: &str) -> String {
    field_spec
        .split('|')
        .map(|field| extract_field(entry, field.trim()))
        .find(|value| !value.is_empty())
        .unwrap_or_default()
}

fn extract_field(entry: &FeedEntry, field: &str) -> String {
    match field {
        "title" => entry.title.clone(),
        "media:content" => entry.media.content.first().cloned().unwrap_or_default(),
        "media:thumbnail" => entry.media.thumbnails.first().cloned().unwrap_or_default(),
        "enclosure" => entry
            .media
            .enclosures
            .iter()
            .find(|e| e.mime_type.starts_with("image/"))
            .map(|e| e.url.clone())
            .unwrap_or_default(),
        "description_img" => first_img_src(&entry.description).to_string(),
        "link" => entry.link.clone(),
        "pubDate" => entry
            .published
            .or(entry.updated)
            .map(|date| date.to_rfc3339())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

/// First `<img src=...>` in an HTML fragment, found by plain scanning.
///
/// The character right after `src=` is taken as the quote and the value runs
/// to its next occurrence. No entity decoding is done. Anything malformed
/// yields `""`.
pub fn first_img_src(html: &str) -> &str {
    let Some(start) = html.find("<img ") else {
        return "";
    };
    let tag = &html[start..];
    let Some(end) = tag.find('>') else {
        return "";
    };
    let tag = &tag[..end];
    let Some(src) = tag.find("src=") else {
        return "";
    };
    let after = &tag[src + 4..];
    let Some(quote) = after.chars().next() else {
        return "";
    };
    let rest = &after[quote.len_utf8()..];
    match rest.find(quote) {
        Some(end_quote) => &rest[..end_quote],
        None => "",
    }
}

/// Scan raw RSS XML for the media elements of each `<item>`, keyed by link.
pub fn index_raw_media(xml_bytes: &[u8]) -> HashMap<String, MediaFields> {
    let mut index = HashMap::new();
    let xml_str = match std::str::from_utf8(xml_bytes) {
        Ok(s) => s,
        Err(_) => return index,
    };

    for item in item_blocks(xml_str) {
        let Some(link) = extract_xml_element(item, "link") else {
            continue;
        };
        // Keyed the way feed-rs reports the link: entities decoded, CDATA verbatim
        let raw = link.trim();
        let link = match raw
            .strip_prefix("<![CDATA[")
            .and_then(|s| s.strip_suffix("]]>"))
        {
            Some(inner) => inner.trim().to_string(),
            None => decode_xml_entities(raw),
        };
        if link.is_empty() {
            continue;
        }

        let media = MediaFields {
            content: tag_bodies(item, "media:content")
                .into_iter()
                .filter_map(|tag| attr_value(tag, "url"))
                .collect(),
            thumbnails: tag_bodies(item, "media:thumbnail")
                .into_iter()
                .filter_map(|tag| attr_value(tag, "url"))
                .collect(),
            enclosures: tag_bodies(item, "enclosure")
                .into_iter()
                .filter_map(|tag| {
                    Some(Enclosure {
                        url: attr_value(tag, "url")?,
                        mime_type: attr_value(tag, "type").unwrap_or_default(),
                    })
                })
                .collect(),
        };

        index.entry(link).or_insert(media);
    }

    index
}

pub fn extract_xml_element(xml: &str, tag: &str) -> Option<String> {
    let start_tag = format!("<{}>", tag);
    let end_tag = format!("</{}>", tag);

    let start = xml.find(&start_tag)? + start_tag.len();
    let end = xml[start..].find(&end_tag)? + start;

    Some(xml[start..end].trim().to_string())
}

pub(crate) fn strip_cdata(s: &str) -> &str {
    let s = s.trim();
    let s = s.strip_prefix("<![CDATA[").unwrap_or(s);
    let s = s.strip_suffix("]]>").unwrap_or(s);
    s.trim()
}

fn item_blocks(xml: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = xml;

    while let Some(start) = rest.find("<item") {
        let after = &rest[start + "<item".len()..];
        if !after.starts_with(|c: char| c == '>' || c.is_whitespace()) {
            rest = after;
            continue;
        }
        let end = after.find("</item>").unwrap_or(after.len());
        blocks.push(&after[..end]);
        rest = &after[end..];
    }

    blocks
}

/// Attribute text of every `<name ...>` tag in `xml`.
fn tag_bodies<'a>(xml: &'a str, name: &str) -> Vec<&'a str> {
    let open = format!("<{}", name);
    let mut bodies = Vec::new();
    let mut rest = xml;

    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find('>') else {
            break;
        };
        if after.starts_with(|c: char| c == '/' || c == '>' || c.is_whitespace()) {
            bodies.push(&after[..end]);
        }
        rest = &after[end..];
    }

    bodies
}

fn attr_value(tag: &str, attr: &str) -> Option<String> {
    let needle = format!("{}=", attr);
    let mut search = tag;

    loop {
        let idx = search.find(&needle)?;
        let standalone = search[..idx]
            .chars()
            .last()
            .map_or(true, char::is_whitespace);
        let value_start = &search[idx + needle.len()..];

        if standalone {
            let quote = value_start
                .chars()
                .next()
                .filter(|c| *c == '"' || *c == '\'')?;
            let value = &value_start[1..];
            let end = value.find(quote)?;
            return Some(decode_xml_entities(value[..end].trim()));
        }

        search = value_start;
    }
}

fn decode_xml_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry_with_media(media: MediaFields) -> FeedEntry {
        FeedEntry {
            title: "A headline".to_string(),
            link: "http://x/1".to_string(),
            media,
            ..Default::default()
        }
    }

    mod extract_tests {
        use super::*;

        #[test]
        fn test_single_field() {
            let entry = entry_with_media(MediaFields::default());
            assert_eq!(extract(&entry, "title"), "A headline");
            assert_eq!(extract(&entry, "link"), "http://x/1");
        }

        #[test]
        fn test_first_non_empty_alternative_wins() {
            let entry = entry_with_media(MediaFields {
                content: vec![],
                thumbnails: vec!["http://x/thumb.jpg".to_string()],
                enclosures: vec![],
            });

            assert_eq!(
                extract(&entry, "media:content|media:thumbnail"),
                "http://x/thumb.jpg"
            );
        }

        #[test]
        fn test_alternatives_tried_left_to_right() {
            let entry = entry_with_media(MediaFields {
                content: vec!["http://x/content.jpg".to_string()],
                thumbnails: vec!["http://x/thumb.jpg".to_string()],
                enclosures: vec![Enclosure {
                    url: "http://x/enc.jpg".to_string(),
                    mime_type: "image/jpeg".to_string(),
                }],
            });

            assert_eq!(
                extract(&entry, "media:thumbnail|media:content"),
                "http://x/thumb.jpg"
            );
            assert_eq!(extract(&entry, "enclosure|media:content"), "http://x/enc.jpg");
            assert_eq!(
                extract(&entry, " media:content | enclosure "),
                "http://x/content.jpg"
            );
        }

        #[test]
        fn test_unknown_field_is_empty() {
            let entry = entry_with_media(MediaFields::default());
            assert_eq!(extract(&entry, "dc:creator"), "");
            assert_eq!(extract(&entry, "dc:creator|title"), "A headline");
            assert_eq!(extract(&entry, ""), "");
        }

        #[test]
        fn test_enclosure_requires_image_type() {
            let entry = entry_with_media(MediaFields {
                enclosures: vec![
                    Enclosure {
                        url: "http://x/episode.mp3".to_string(),
                        mime_type: "audio/mpeg".to_string(),
                    },
                    Enclosure {
                        url: "http://x/cover.png".to_string(),
                        mime_type: "image/png".to_string(),
                    },
                ],
                ..Default::default()
            });

            assert_eq!(extract(&entry, "enclosure"), "http://x/cover.png");
        }

        #[test]
        fn test_enclosure_without_image_is_empty() {
            let entry = entry_with_media(MediaFields {
                enclosures: vec![Enclosure {
                    url: "http://x/episode.mp3".to_string(),
                    mime_type: "audio/mpeg".to_string(),
                }],
                ..Default::default()
            });

            assert_eq!(extract(&entry, "enclosure"), "");
        }

        #[test]
        fn test_pub_date_prefers_published() {
            let published = Utc.with_ymd_and_hms(2024, 12, 9, 12, 0, 0).unwrap();
            let updated = Utc.with_ymd_and_hms(2024, 12, 10, 8, 30, 0).unwrap();
            let mut entry = entry_with_media(MediaFields::default());
            entry.published = Some(published);
            entry.updated = Some(updated);

            assert_eq!(extract(&entry, "pubDate"), "2024-12-09T12:00:00+00:00");

            entry.published = None;
            assert_eq!(extract(&entry, "pubDate"), "2024-12-10T08:30:00+00:00");

            entry.updated = None;
            assert_eq!(extract(&entry, "pubDate"), "");
        }

        #[test]
        fn test_description_img_field() {
            let mut entry = entry_with_media(MediaFields::default());
            entry.description =
                r#"<p>Intro</p><img class="lead" src="http://x/lead.jpg" alt="">"#.to_string();

            assert_eq!(extract(&entry, "description_img"), "http://x/lead.jpg");
        }
    }

    mod first_img_src_tests {
        use super::*;

        #[test]
        fn test_double_quotes() {
            assert_eq!(first_img_src(r#"<img src="http://x/a.jpg">"#), "http://x/a.jpg");
        }

        #[test]
        fn test_single_quotes() {
            assert_eq!(first_img_src("<img src='http://x/a.jpg' />"), "http://x/a.jpg");
        }

        #[test]
        fn test_first_image_only() {
            let html = r#"<img src="http://x/1.jpg"><img src="http://x/2.jpg">"#;
            assert_eq!(first_img_src(html), "http://x/1.jpg");
        }

        #[test]
        fn test_no_img_tag() {
            assert_eq!(first_img_src("<p>No pictures</p>"), "");
        }

        #[test]
        fn test_img_without_space_is_not_matched() {
            assert_eq!(first_img_src(r#"<img/src="http://x/a.jpg">"#), "");
        }

        #[test]
        fn test_missing_src() {
            assert_eq!(first_img_src(r#"<img alt="nothing">"#), "");
        }

        #[test]
        fn test_unclosed_tag() {
            assert_eq!(first_img_src(r#"<img src="http://x/a.jpg""#), "");
        }

        #[test]
        fn test_unbalanced_quote() {
            assert_eq!(first_img_src(r#"<img src="http://x/a.jpg>"#), "");
        }

        #[test]
        fn test_src_at_end_of_tag() {
            assert_eq!(first_img_src("<img src=>"), "");
        }

        #[test]
        fn test_entities_left_untouched() {
            assert_eq!(
                first_img_src(r#"<img src="http://x/a.jpg?w=1&amp;h=2">"#),
                "http://x/a.jpg?w=1&amp;h=2"
            );
        }
    }

    mod raw_media_tests {
        use super::*;

        #[test]
        fn test_index_media_content_and_thumbnail() {
            let xml = r#"
                <rss xmlns:media="http://search.yahoo.com/mrss/">
                    <channel>
                        <item>
                            <title>One</title>
                            <link>http://x/1</link>
                            <media:content url="http://x/a.jpg" type="image/jpeg"/>
                            <media:thumbnail url='http://x/a-thumb.jpg' />
                        </item>
                    </channel>
                </rss>
            "#;

            let index = index_raw_media(xml.as_bytes());
            let media = index.get("http://x/1").unwrap();
            assert_eq!(media.content, vec!["http://x/a.jpg".to_string()]);
            assert_eq!(media.thumbnails, vec!["http://x/a-thumb.jpg".to_string()]);
            assert!(media.enclosures.is_empty());
        }

        #[test]
        fn test_index_enclosures_with_type() {
            let xml = r#"
                <rss><channel>
                    <item>
                        <link><![CDATA[http://x/2]]></link>
                        <enclosure url="http://x/b.png?a=1&amp;b=2" length="100" type="image/png"/>
                    </item>
                </channel></rss>
            "#;

            let index = index_raw_media(xml.as_bytes());
            let media = index.get("http://x/2").unwrap();
            assert_eq!(
                media.enclosures,
                vec![Enclosure {
                    url: "http://x/b.png?a=1&b=2".to_string(),
                    mime_type: "image/png".to_string(),
                }]
            );
        }

        #[test]
        fn test_index_skips_items_without_link() {
            let xml = "<rss><channel><item><title>No link</title></item></channel></rss>";
            assert!(index_raw_media(xml.as_bytes()).is_empty());
        }

        #[test]
        fn test_index_item_with_attributes() {
            let xml = r#"<rdf:RDF><item rdf:about="http://x/3"><link>http://x/3</link>
                <media:content url="http://x/c.jpg"/></item></rdf:RDF>"#;

            let index = index_raw_media(xml.as_bytes());
            assert_eq!(index.get("http://x/3").unwrap().content.len(), 1);
        }

        #[test]
        fn test_index_invalid_utf8() {
            let invalid_bytes = vec![0xFF, 0xFE, 0x00, 0x01];
            assert!(index_raw_media(&invalid_bytes).is_empty());
        }

        #[test]
        fn test_prefixed_attribute_not_confused() {
            assert_eq!(
                attr_value(r#" xurl="http://wrong" url="http://right""#, "url"),
                Some("http://right".to_string())
            );
        }

        #[test]
        fn test_extract_xml_element() {
            assert_eq!(
                extract_xml_element("<link>  https://example.com  </link>", "link"),
                Some("https://example.com".to_string())
            );
            assert_eq!(extract_xml_element("<title>Hello", "title"), None);
        }

        #[test]
        fn test_strip_cdata() {
            assert_eq!(strip_cdata("  <![CDATA[ Hello ]]>  "), "Hello");
            assert_eq!(strip_cdata("Plain"), "Plain");
        }
    }

    mod from_parsed_tests {
        use super::*;

        #[test]
        fn test_rss_entry_with_side_index() {
            let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
                <rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/">
                    <channel>
                        <title>Feed</title>
                        <link>http://x</link>
                        <description>d</description>
                        <item>
                            <title>Example Headline Today</title>
                            <link>http://x/1</link>
                            <description>&lt;img src="http://x/desc.jpg"&gt;</description>
                            <enclosure url="http://x/enc.jpg" type="image/jpeg" length="1"/>
                            <media:content url="http://x/a.jpg" type="image/jpeg"/>
                            <pubDate>Mon, 09 Dec 2024 12:00:00 GMT</pubDate>
                        </item>
                    </channel>
                </rss>"#;

            let feed = feed_rs::parser::parse(xml.as_bytes()).unwrap();
            let index = index_raw_media(xml.as_bytes());
            let entry = &feed.entries[0];
            let parsed = FeedEntry::from_parsed(entry, &index);

            assert_eq!(parsed.title, "Example Headline Today");
            assert_eq!(parsed.link, "http://x/1");
            assert_eq!(extract(&parsed, "media:content"), "http://x/a.jpg");
            assert_eq!(extract(&parsed, "enclosure"), "http://x/enc.jpg");
            assert_eq!(extract(&parsed, "description_img"), "http://x/desc.jpg");
            assert_eq!(
                parsed.published,
                Some(Utc.with_ymd_and_hms(2024, 12, 9, 12, 0, 0).unwrap())
            );
        }

        #[test]
        fn test_escaped_link_keeps_media_sources_apart() {
            let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
                <rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/">
                    <channel>
                        <title>Feed</title>
                        <link>http://x</link>
                        <description>d</description>
                        <item>
                            <title>Story behind a query string link</title>
                            <link>http://x/a?id=1&amp;s=2</link>
                            <enclosure url="http://x/pod.mp3" type="audio/mpeg" length="1"/>
                            <media:content url="http://x/img.jpg" type="image/jpeg"/>
                        </item>
                    </channel>
                </rss>"#;

            let feed = feed_rs::parser::parse(xml.as_bytes()).unwrap();
            let index = index_raw_media(xml.as_bytes());
            assert!(index.contains_key("http://x/a?id=1&s=2"));

            let parsed = FeedEntry::from_parsed(&feed.entries[0], &index);
            assert_eq!(parsed.link, "http://x/a?id=1&s=2");
            assert_eq!(extract(&parsed, "media:content"), "http://x/img.jpg");
            assert_eq!(extract(&parsed, "enclosure"), "");
        }

        #[test]
        fn test_atom_entry_enclosure_link() {
            let xml = r#"<?xml version="1.0" encoding="utf-8"?>
                <feed xmlns="http://www.w3.org/2005/Atom">
                    <title>Atom</title>
                    <id>urn:feed</id>
                    <updated>2024-12-09T12:00:00Z</updated>
                    <entry>
                        <title>Atom entry headline</title>
                        <id>urn:entry:1</id>
                        <updated>2024-12-09T12:00:00Z</updated>
                        <link rel="alternate" href="http://x/atom/1"/>
                        <link rel="enclosure" type="image/jpeg" href="http://x/atom.jpg"/>
                    </entry>
                </feed>"#;

            let feed = feed_rs::parser::parse(xml.as_bytes()).unwrap();
            let parsed = FeedEntry::from_parsed(&feed.entries[0], &HashMap::new());

            assert_eq!(parsed.link, "http://x/atom/1");
            assert_eq!(extract(&parsed, "enclosure"), "http://x/atom.jpg");
            assert_eq!(extract(&parsed, "pubDate"), "2024-12-09T12:00:00+00:00");
        }
    }
}
