use url::Url;

use crate::models::ContentKind;

/// Normalize a URL: lowercase scheme and host (the url crate does this on
/// parse), strip the fragment, and sort query parameters by name. Returns
/// None for anything that is not an absolute http(s) URL.
pub fn normalize(raw: &str) -> Option<String> {
    let mut parsed = Url::parse(raw.trim()).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    parsed.host_str()?;
    parsed.set_fragment(None);

    if parsed.query().is_some() {
        let mut pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        if pairs.is_empty() {
            parsed.set_query(None);
        } else {
            parsed.query_pairs_mut().clear().extend_pairs(pairs);
        }
    }

    Some(parsed.to_string())
}

/// Basic validity gate for URLs drawn from the backlink store.
pub fn is_valid(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => {
            (parsed.scheme() == "http" || parsed.scheme() == "https")
                && parsed.host_str().is_some()
        }
        Err(_) => false,
    }
}

/// The authority (host, plus port when explicit) of a URL, lowercased.
/// This is what internal/external classification and target matching key on.
pub fn authority_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

/// File extensions that are never worth enqueueing during discovery.
const SKIP_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".css", ".js", ".xml", ".zip", ".doc", ".docx",
    ".xls", ".xlsx", ".mp4", ".mp3", ".avi", ".mov", ".ico", ".svg", ".woff", ".ttf",
];

pub fn has_skipped_extension(url: &str) -> bool {
    let path = match Url::parse(url) {
        Ok(p) => p.path().to_lowercase(),
        Err(_) => return false,
    };
    SKIP_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

const PDF_EXTENSIONS: &[&str] = &[".pdf"];
const IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".svg", ".ico", ".webp", ".tiff",
];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".txt", ".rtf",
];
const ARCHIVE_EXTENSIONS: &[&str] = &[".zip", ".rar", ".7z", ".tar", ".gz", ".bz2"];
const MEDIA_EXTENSIONS: &[&str] = &[
    ".mp4", ".mp3", ".avi", ".mov", ".wmv", ".flv", ".webm", ".m4v",
];
const STYLESHEET_EXTENSIONS: &[&str] = &[".css", ".scss", ".less"];
const SCRIPT_EXTENSIONS: &[&str] = &[".js", ".ts", ".coffee"];
const DATA_EXTENSIONS: &[&str] = &[".json", ".xml", ".rss", ".csv", ".yaml", ".yml"];
const FONT_EXTENSIONS: &[&str] = &[".woff", ".woff2", ".ttf", ".eot", ".otf"];

/// Classify a URL by path extension and report the extension itself.
/// Extension-less paths and paths ending in "/" are treated as HTML.
pub fn classify(url: &str) -> (ContentKind, Option<String>) {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_lowercase(),
        Err(_) => return (ContentKind::Other, None),
    };

    let last_segment = path.rsplit('/').next().unwrap_or("");
    let extension = last_segment
        .rfind('.')
        .map(|idx| last_segment[idx..].to_string());

    let kind = match &extension {
        None => ContentKind::Html,
        Some(ext) => {
            let ext = ext.as_str();
            if PDF_EXTENSIONS.contains(&ext) {
                ContentKind::Pdf
            } else if IMAGE_EXTENSIONS.contains(&ext) {
                ContentKind::Image
            } else if DOCUMENT_EXTENSIONS.contains(&ext) {
                ContentKind::Document
            } else if ARCHIVE_EXTENSIONS.contains(&ext) {
                ContentKind::Archive
            } else if MEDIA_EXTENSIONS.contains(&ext) {
                ContentKind::Media
            } else if STYLESHEET_EXTENSIONS.contains(&ext) {
                ContentKind::Stylesheet
            } else if SCRIPT_EXTENSIONS.contains(&ext) {
                ContentKind::Script
            } else if DATA_EXTENSIONS.contains(&ext) {
                ContentKind::Data
            } else if FONT_EXTENSIONS.contains(&ext) {
                ContentKind::Font
            } else if ext == ".html" || ext == ".htm" || ext == ".xhtml" || ext == ".php"
                || ext == ".asp" || ext == ".aspx" || ext == ".jsp"
            {
                ContentKind::Html
            } else {
                ContentKind::Other
            }
        }
    };

    (kind, extension)
}
