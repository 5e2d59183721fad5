//! URI normalization shared by every parser
//!
//! Request URIs are reduced to their path unless query strings are kept.
//! When query values are ignored every value is replaced by a fixed
//! placeholder so that `/search?q=a` and `/search?q=b` group together.

use percent_encoding::percent_decode_str;
use std::collections::BTreeSet;
use url::form_urlencoded;

/// Placeholder substituted for every query value
pub const QUERY_VALUE_PLACEHOLDER: &str = "xxx";

/// URI handling options
#[derive(Debug, Clone, Default)]
pub struct UriOptions {
    /// Keep the query string
    pub query_string: bool,

    /// Replace every query value with a placeholder (requires `query_string`)
    pub qs_ignore_values: bool,

    /// Percent-decode the path
    pub decode_uri: bool,
}

/// Normalize a raw request URI. Returns `None` for unusable input.
pub fn normalize_uri(raw: &str, options: &UriOptions) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let request_target = strip_origin(raw)?;
    let (path, query) = match request_target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (request_target, None),
    };
    // Fragments never reach the server but appear in hand-written logs
    let path = path.split('#').next().unwrap_or_default();
    let query = query.map(|q| q.split('#').next().unwrap_or_default());

    let path = if options.decode_uri {
        percent_decode_str(path).decode_utf8().ok()?.into_owned()
    } else {
        path.to_string()
    };

    if !options.query_string {
        return Some(path);
    }

    match query {
        Some(q) if !q.is_empty() => {
            if options.qs_ignore_values {
                Some(format!("{}?{}", path, redact_query(q)))
            } else {
                Some(format!("{}?{}", path, q))
            }
        }
        _ => Some(path),
    }
}

/// Reduce absolute-form request targets (`http://host/path`) to origin form
fn strip_origin(raw: &str) -> Option<&str> {
    let rest = raw
        .strip_prefix("http://")
        .or_else(|| raw.strip_prefix("https://"));
    match rest {
        Some(rest) => match rest.find(['/', '?']) {
            Some(idx) if rest[idx..].starts_with('/') => Some(&rest[idx..]),
            Some(_) | None => Some("/"),
        },
        None => Some(raw),
    }
}

/// Replace every query value with the placeholder, keys sorted and deduplicated
fn redact_query(query: &str) -> String {
    let keys: BTreeSet<String> = form_urlencoded::parse(query.as_bytes())
        .map(|(k, _)| k.into_owned())
        .collect();

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for key in &keys {
        serializer.append_pair(key, QUERY_VALUE_PLACEHOLDER);
    }
    serializer.finish()
}
