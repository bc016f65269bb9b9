use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::urls;

/// A link found on a page, with the metadata backlink records need.
#[derive(Debug, Clone)]
pub struct PageLink {
    /// Normalized absolute URL.
    pub url: String,
    pub anchor_text: String,
    /// Up to 250 characters of the parent element's text.
    pub context: String,
    pub is_nofollow: bool,
    pub is_internal: bool,
}

/// Extracted representation of one HTML document.
#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    pub title: Option<String>,
    pub meta_description: Option<String>,
    pub meta_keywords: Vec<String>,
    pub canonical_url: Option<String>,
    pub robots_meta: Option<String>,
    pub language: Option<String>,
    pub h1_tags: Vec<String>,
    pub h2_tags: Vec<String>,
    pub content_text: String,
    pub word_count: u32,
    pub links: Vec<PageLink>,
    pub internal_links_count: u32,
    pub external_links_count: u32,
    pub images_count: u32,
}

impl ParsedPage {
    /// True when the page asks not to be indexed; the caller drops it.
    pub fn noindex(&self) -> bool {
        self.robots_meta
            .as_deref()
            .map(|m| m.to_lowercase().contains("noindex"))
            .unwrap_or(false)
    }
}

const CONTEXT_WINDOW_CHARS: usize = 250;

pub struct Parser;

impl Parser {
    /// Parse an HTML document. Malformed input never panics; anything
    /// that cannot be extracted degrades to an empty field.
    pub fn parse(html_content: &str, base_url: &str) -> ParsedPage {
        let document = Html::parse_document(html_content);
        let base = Url::parse(base_url).ok();
        let base_authority = urls::authority_of(base_url);

        let title = Self::select_text(&document, "title");
        let meta_description = Self::select_attr(&document, r#"meta[name="description"]"#, "content");
        let meta_keywords = Self::select_attr(&document, r#"meta[name="keywords"]"#, "content")
            .map(|raw| {
                raw.split(',')
                    .map(|kw| kw.trim().to_string())
                    .filter(|kw| !kw.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let canonical_url = Self::select_attr(&document, r#"link[rel="canonical"]"#, "href")
            .and_then(|href| match &base {
                Some(base) => base.join(&href).ok().map(|u| u.to_string()),
                None => Some(href),
            });
        let robots_meta = Self::select_attr(&document, r#"meta[name="robots"]"#, "content");
        let language = Self::select_attr(&document, "html", "lang")
            .map(|lang| lang.chars().take(10).collect());

        let h1_tags = Self::select_all_text(&document, "h1");
        let h2_tags = Self::select_all_text(&document, "h2");

        let content_text = Self::extract_text(&document);
        let word_count = content_text.split_whitespace().count() as u32;

        let links = Self::extract_links(&document, &base, base_authority.as_deref());
        let internal_links_count = links.iter().filter(|l| l.is_internal).count() as u32;
        let external_links_count = links.len() as u32 - internal_links_count;

        let images_count = match Selector::parse("img") {
            Ok(selector) => document.select(&selector).count() as u32,
            Err(_) => 0,
        };

        ParsedPage {
            title,
            meta_description,
            meta_keywords,
            canonical_url,
            robots_meta,
            language,
            h1_tags,
            h2_tags,
            content_text,
            word_count,
            links,
            internal_links_count,
            external_links_count,
            images_count,
        }
    }

    fn select_text(document: &Html, selector_str: &str) -> Option<String> {
        let selector = Selector::parse(selector_str).ok()?;
        document
            .select(&selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn select_all_text(document: &Html, selector_str: &str) -> Vec<String> {
        let Ok(selector) = Selector::parse(selector_str) else {
            return Vec::new();
        };
        document
            .select(&selector)
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn select_attr(document: &Html, selector_str: &str, attr: &str) -> Option<String> {
        let selector = Selector::parse(selector_str).ok()?;
        document
            .select(&selector)
            .next()
            .and_then(|el| el.value().attr(attr).map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty())
    }

    /// Visible text with script, style and head-metadata elements
    /// stripped, collapsed to single spaces.
    fn extract_text(document: &Html) -> String {
        let mut text = String::new();
        collect_text_excluding(&document.root_element(), &mut text);
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn extract_links(
        document: &Html,
        base: &Option<Url>,
        base_authority: Option<&str>,
    ) -> Vec<PageLink> {
        let Ok(selector) = Selector::parse("a[href]") else {
            return Vec::new();
        };

        let mut links = Vec::new();
        for element in document.select(&selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let href = href.trim();
            if href.is_empty()
                || href.starts_with('#')
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
            {
                continue;
            }

            let resolved = match base {
                Some(base) => base.join(href).ok().map(|u| u.to_string()),
                None => Some(href.to_string()),
            };
            let Some(normalized) = resolved.as_deref().and_then(urls::normalize) else {
                continue;
            };

            let anchor_text = element.text().collect::<String>().trim().to_string();
            let is_nofollow = element
                .value()
                .attr("rel")
                .map(|rel| rel.split_whitespace().any(|token| token.eq_ignore_ascii_case("nofollow")))
                .unwrap_or(false);
            let context = Self::extract_context(&element);
            let is_internal = urls::authority_of(&normalized).as_deref() == base_authority;

            links.push(PageLink {
                url: normalized,
                anchor_text,
                context,
                is_nofollow,
                is_internal,
            });
        }
        links
    }

    /// Text of the anchor's parent element, clipped to the context
    /// window.
    fn extract_context(element: &ElementRef<'_>) -> String {
        let Some(parent) = element.parent().and_then(ElementRef::wrap) else {
            return String::new();
        };
        let text = parent
            .text()
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        text.chars().take(CONTEXT_WINDOW_CHARS).collect()
    }
}

/// Recursively collect text, skipping script, style, noscript, and the
/// head metadata elements.
fn collect_text_excluding(node: &ElementRef<'_>, out: &mut String) {
    for child in node.children() {
        if let Some(text) = child.value().as_text() {
            out.push(' ');
            out.push_str(text);
        } else if let Some(el) = ElementRef::wrap(child) {
            let tag = el.value().name();
            if !matches!(tag, "script" | "style" | "noscript" | "meta" | "link") {
                collect_text_excluding(&el, out);
            }
        }
    }
}
