//! URL normalization for `url_data`-based result matching.
//!
//! Events whose URL could not be stored canonically carry a
//! provisional `url` search key plus `url_data = {orig_b64,
//! norm_brief}` in `custom`. At query time the original URL bytes are
//! decoded and normalized under the brief; request-side `url.b64`
//! values are normalized the same way and matched application-level.
//!
//! A *norm brief* is a compact string of flag characters:
//! `u` decode as UTF-8 (lossily), `m` merge surrogate pairs,
//! `e` empty path becomes `/`, `r` strip the IPv6 zone identifier.
//! Normalization is deterministic and idempotent.

use base64::Engine;

/// Prefix marking a stored `url` value as a provisional search key.
pub const PROVISIONAL_URL_SEARCH_KEY_PREFIX: &str = "#provisional-url-search-key#";

/// Errors raised for unusable `url_data`.
#[derive(Debug, thiserror::Error)]
pub enum UrlNormError {
    #[error("invalid base64 in URL data: {0}")]
    Base64(String),

    #[error("unsupported legacy URL normalization options: {0}")]
    LegacyOptions(String),
}

/// Build a norm brief out of explicit options (canonical flag order).
pub fn prepare_norm_brief(
    unicode_str: bool,
    merge_surrogate_pairs: bool,
    empty_path_slash: bool,
    remove_ipv6_zone: bool,
) -> String {
    let mut brief = String::new();
    if unicode_str {
        brief.push('u');
    }
    if merge_surrogate_pairs {
        brief.push('m');
    }
    if empty_path_slash {
        brief.push('e');
    }
    if remove_ipv6_zone {
        brief.push('r');
    }
    brief
}

/// The one legacy `url_norm_opts` form that is still accepted
/// (`{transcode1st: true, epslash: true, rmzone: true}`); anything
/// else is a hard error. Maps onto the full modern brief.
pub fn norm_brief_from_legacy_opts(opts: &serde_json::Value) -> Result<String, UrlNormError> {
    let expected = serde_json::json!({
        "transcode1st": true,
        "epslash": true,
        "rmzone": true,
    });
    if opts == &expected {
        Ok(prepare_norm_brief(true, true, true, true))
    } else {
        Err(UrlNormError::LegacyOptions(opts.to_string()))
    }
}

/// Decode a URL-safe base64 string (with or without padding).
pub fn decode_url_b64(raw: &str) -> Result<Vec<u8>, UrlNormError> {
    base64::engine::general_purpose::URL_SAFE
        .decode(raw)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(raw))
        .map_err(|e| UrlNormError::Base64(e.to_string()))
}

/// Normalize raw URL bytes under the given brief.
pub fn normalize_url(url_bytes: &[u8], norm_brief: &str) -> String {
    // `u`/`m`: decode as UTF-8, replacing anything unpaired/invalid.
    let text = if norm_brief.contains('u') || norm_brief.contains('m') {
        String::from_utf8_lossy(url_bytes).into_owned()
    } else {
        url_bytes.iter().map(|&b| b as char).collect()
    };
    let text = if norm_brief.contains('r') {
        strip_ipv6_zone(&text)
    } else {
        text
    };

    match url::Url::parse(&text) {
        Ok(mut parsed) => {
            // the url crate already lowercases scheme and host
            if norm_brief.contains('e') && parsed.path().is_empty() {
                parsed.set_path("/");
            }
            parsed.to_string()
        }
        // Unparseable URLs get a minimal scheme-lowercasing pass so
        // repeated normalization stays a no-op.
        Err(_) => lowercase_scheme(&text),
    }
}

/// Remove a `%zone` suffix inside a bracketed IPv6 host, both raw
/// (`%eth0`) and percent-encoded (`%25eth0`).
fn strip_ipv6_zone(text: &str) -> String {
    let Some(open) = text.find('[') else {
        return text.to_string();
    };
    let Some(close_rel) = text[open..].find(']') else {
        return text.to_string();
    };
    let close = open + close_rel;
    let host = &text[open + 1..close];
    let stripped = match host.find('%') {
        Some(cut) => &host[..cut],
        None => host,
    };
    format!("{}[{}]{}", &text[..open], stripped, &text[close..])
}

fn lowercase_scheme(text: &str) -> String {
    match text.find("://") {
        Some(cut) if text[..cut].chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)) => {
            format!("{}{}", text[..cut].to_ascii_lowercase(), &text[cut..])
        }
        _ => text.to_string(),
    }
}
