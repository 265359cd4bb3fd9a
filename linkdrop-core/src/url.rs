//! URL canonicalization, validation and display helpers.

use ::url::Url;

fn has_http_scheme(input: &str) -> bool {
    let lower = input.get(..8).unwrap_or(input).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Trim `url` and prefix `https://` unless it already has an http(s) scheme.
pub fn ensure_protocol(url: &str) -> String {
    let trimmed = url.trim();
    if has_http_scheme(trimmed) {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Deduplication key for a URL.
///
/// Scheme and host are lower-cased, default ports dropped, a single trailing
/// slash removed from the path (the root `/` stays), query pairs sorted and
/// the fragment stripped. Path case is significant. Input that cannot be
/// parsed falls back to its trimmed, lower-cased form.
pub fn canonicalize(raw: &str) -> String {
    let mut url = match Url::parse(&ensure_protocol(raw)) {
        Ok(url) => url,
        Err(_) => return raw.trim().to_lowercase(),
    };

    let path = url.path();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path[..path.len() - 1].to_string();
        url.set_path(&trimmed);
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(&pairs);
    }

    url.set_fragment(None);
    url.to_string()
}

/// True when `input` parses as an http or https URL once a scheme is ensured.
pub fn is_valid_url(input: &str) -> bool {
    Url::parse(&ensure_protocol(input))
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false)
}

/// Display hostname without a leading `www.`. Returns the input unchanged
/// when it cannot be parsed.
pub fn extract_hostname(url: &str) -> String {
    match Url::parse(&ensure_protocol(url)) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or_default();
            host.strip_prefix("www.").unwrap_or(host).to_string()
        }
        Err(_) => url.to_string(),
    }
}
