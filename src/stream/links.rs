use std::sync::OnceLock;

use regex::Regex;

fn url_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"https?://[^\s<>()\[\]"']+"#).ok())
        .as_ref()
}

fn markdown_link_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\[[^\]]*\]\([^)]*\)").ok())
        .as_ref()
}

fn link_title(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    let host = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    host.strip_prefix("www.").unwrap_or(host)
}

/// Rewrite bare URLs as `[host](url)` markdown links. Existing markdown links are untouched.
pub fn linkify_bare_urls(text: &str) -> String {
    let (Some(urls), Some(links)) = (url_pattern(), markdown_link_pattern()) else {
        return text.to_string();
    };

    let protected: Vec<(usize, usize)> = links.find_iter(text).map(|m| (m.start(), m.end())).collect();
    let inside_link = |pos: usize| protected.iter().any(|&(s, e)| pos >= s && pos < e);

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for m in urls.find_iter(text) {
        if inside_link(m.start()) {
            continue;
        }
        let url = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']);
        let end = m.start() + url.len();
        out.push_str(&text[cursor..m.start()]);
        out.push_str(&format!("[{}]({})", link_title(url), url));
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out
}
