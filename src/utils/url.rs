//! URL normalization for duplicate detection
//!
//! Two saved tabs are "the same page" when their URLs normalize to the same
//! string. Normalization lowercases scheme and host, drops default ports,
//! fragments and `utm_*` tracking parameters, sorts the remaining query
//! parameters and strips a trailing slash from the path.

use reqwest::Url;

/// Normalize a URL; unparseable input is only trimmed and lowercased
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut url = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(_) => return trimmed.to_lowercase(),
    };

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.to_ascii_lowercase().starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    if url.cannot_be_a_base() {
        return url.to_string();
    }

    // Url already lowercases scheme and host and drops default ports
    let mut normalized = format!("{}://{}", url.scheme(), url.host_str().unwrap_or(""));
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{}", port));
    }
    normalized.push_str(url.path().trim_end_matches('/'));
    if let Some(query) = url.query() {
        normalized.push('?');
        normalized.push_str(query);
    }
    normalized
}
