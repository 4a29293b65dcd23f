//! URL utilities for consistent URL handling
//!
//! Normalizes API base URLs and resolves the message endpoint that SSE tool
//! servers announce relative to their event-stream URL.

use reqwest::Url;

/// Normalize a base URL by removing trailing slashes
///
/// # Examples
///
/// ```
/// use toolrelay::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://api.example.com/v1/"), "https://api.example.com/v1");
/// assert_eq!(normalize_base_url("https://api.example.com/v1///"), "https://api.example.com/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Construct a complete API endpoint URL from a base URL and endpoint path
///
/// # Examples
///
/// ```
/// use toolrelay::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://api.example.com/v1/", "/chat/completions"),
///     "https://api.example.com/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

/// Resolves an announced endpoint against the stream URL's scheme, host and
/// port. Absolute http(s) endpoints are used as-is; anything else is treated
/// as a path from the origin, with a leading `/` ensured.
pub fn resolve_endpoint_url(stream_url: &Url, endpoint: &str) -> Result<Url, String> {
    let endpoint = endpoint.trim();
    let resolved = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Url::parse(endpoint)
    } else if endpoint.starts_with('/') {
        stream_url.join(endpoint)
    } else {
        stream_url.join(&format!("/{endpoint}"))
    };
    resolved.map_err(|err| format!("invalid endpoint {endpoint:?}: {err}"))
}

/// Sets `key` to `value` in the query string, replacing any earlier values
/// while keeping unrelated parameters in order.
pub fn with_query_param(mut url: Url, key: &str, value: &str) -> Url {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| name != key)
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (name, existing) in &retained {
            pairs.append_pair(name, existing);
        }
        pairs.append_pair(key, value);
    }
    url
}

/// Reads the first present query parameter among `keys`.
pub fn query_param(url: &Url, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        url.query_pairs()
            .find(|(name, value)| name == key && !value.is_empty())
            .map(|(_, value)| value.into_owned())
    })
}
