// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// Asset URL rewriting.
//
// Upstream image and video URLs are never handed to clients directly;
// they are rewritten to gateway-proxied paths under `/images/`. The
// encoded segment is self-describing: `u_<base64url>` for absolute
// URLs (query and fragment included), `p_<base64url>` for bare paths.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use url::Url;

/// Map any upstream URL or path to a single proxied path segment.
pub fn encode_asset_path(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) => format!("u_{}", URL_SAFE_NO_PAD.encode(url.as_str())),
        Err(_) => {
            let path = if raw.starts_with('/') {
                raw.to_string()
            } else {
                format!("/{raw}")
            };
            format!("p_{}", URL_SAFE_NO_PAD.encode(path))
        }
    }
}

/// Decoded form of an encoded asset path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetRef {
    /// Absolute upstream URL.
    Url(String),
    /// Path to resolve against the upstream origin.
    Path(String),
}

/// Invert [`encode_asset_path`]. Returns `None` for segments that do
/// not carry a recognized prefix or valid base64url payload.
pub fn decode_asset_path(encoded: &str) -> Option<AssetRef> {
    let kind = encoded.get(..2)?;
    let payload = encoded.get(2..)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    match kind {
        "u_" => Some(AssetRef::Url(text)),
        "p_" => Some(AssetRef::Path(text)),
        _ => None,
    }
}

/// Public URL for a proxied asset: `{base_url || origin}/images/{path}`.
pub fn img_proxy_url(base_url: &str, origin: &str, encoded_path: &str) -> String {
    let base = if base_url.is_empty() { origin } else { base_url };
    format!("{}/images/{}", base.trim_end_matches('/'), encoded_path)
}

/// Keep only upstream URLs worth showing: non-empty strings, not a bare
/// `/`, and not an absolute URL whose path is `/` with no query or
/// fragment (the upstream emits those as placeholders).
pub fn normalize_generated_asset_urls(urls: &[String]) -> Vec<String> {
    urls.iter()
        .filter(|u| !u.is_empty() && u.as_str() != "/")
        .filter(|u| match Url::parse(u) {
            Ok(parsed) => {
                parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some()
            }
            Err(_) => true,
        })
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Video HTML
// ---------------------------------------------------------------------------

/// Render the snippet emitted when a video generation completes.
///
/// Two shapes: a bare `<video>` element, or (when the poster preview is
/// enabled and a thumbnail exists) a clickable poster block with an
/// overlay play triangle.
pub fn video_html(video_url: &str, poster_url: Option<&str>, poster_preview: bool) -> String {
    match poster_url {
        Some(poster) if poster_preview => {
            let video = escape_attr(video_url);
            let poster = escape_attr(poster);
            format!(
                concat!(
                    "<a href=\"{video}\" target=\"_blank\" ",
                    "style=\"position:relative;display:inline-block;width:500px;height:300px\">",
                    "<img src=\"{poster}\" width=\"500\" height=\"300\" ",
                    "style=\"display:block;object-fit:cover\"/>",
                    "<span style=\"position:absolute;top:50%;left:50%;",
                    "transform:translate(-50%,-50%);width:0;height:0;",
                    "border-left:28px solid rgba(255,255,255,0.9);",
                    "border-top:17px solid transparent;",
                    "border-bottom:17px solid transparent\"></span>",
                    "</a>\n"
                ),
                video = video,
                poster = poster,
            )
        }
        _ => format!(
            "<video src=\"{}\" controls=\"controls\" width=\"500\" height=\"300\"></video>\n",
            escape_attr(video_url)
        ),
    }
}

/// Minimal HTML attribute escaping for URLs placed inside quotes.
fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ---------------------------------------------------------------
    // 1. Absolute URLs encode as u_, paths as p_
    // ---------------------------------------------------------------

    #[test]
    fn absolute_url_uses_u_prefix() {
        let encoded = encode_asset_path("https://assets.grok.com/img/1.jpg?sig=abc#frag");
        assert!(encoded.starts_with("u_"));
        assert_eq!(
            decode_asset_path(&encoded),
            Some(AssetRef::Url(
                "https://assets.grok.com/img/1.jpg?sig=abc#frag".to_string()
            ))
        );
    }

    #[test]
    fn relative_path_uses_p_prefix_and_leading_slash() {
        let encoded = encode_asset_path("users/abc/img.jpg");
        assert!(encoded.starts_with("p_"));
        assert_eq!(
            decode_asset_path(&encoded),
            Some(AssetRef::Path("/users/abc/img.jpg".to_string()))
        );

        let already_rooted = encode_asset_path("/users/abc/img.jpg");
        assert_eq!(
            decode_asset_path(&already_rooted),
            Some(AssetRef::Path("/users/abc/img.jpg".to_string()))
        );
    }

    #[test]
    fn prefixes_are_disjoint() {
        let u = encode_asset_path("https://x.test/a");
        let p = encode_asset_path("/a");
        assert!(u.starts_with("u_") && p.starts_with("p_"));
        assert_ne!(u, p);
    }

    #[test]
    fn encoding_has_no_padding() {
        // 1-char path forces base64 padding in padded alphabets.
        let encoded = encode_asset_path("a");
        assert!(!encoded.contains('='));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(decode_asset_path("x_abc"), None);
        assert_eq!(decode_asset_path("u_!!!"), None);
        assert_eq!(decode_asset_path("u"), None);
    }

    // ---------------------------------------------------------------
    // 2. Proxy URL base selection
    // ---------------------------------------------------------------

    #[test]
    fn proxy_url_prefers_configured_base() {
        assert_eq!(
            img_proxy_url("https://gw.example.com/", "http://localhost:9360", "u_abc"),
            "https://gw.example.com/images/u_abc"
        );
        assert_eq!(
            img_proxy_url("", "http://localhost:9360", "p_xyz"),
            "http://localhost:9360/images/p_xyz"
        );
    }

    // ---------------------------------------------------------------
    // 3. Generated URL normalization
    // ---------------------------------------------------------------

    #[test]
    fn normalization_drops_placeholders() {
        let urls = vec![
            "https://assets.grok.com/img/1.jpg".to_string(),
            String::new(),
            "/".to_string(),
            "https://assets.grok.com/".to_string(),
            "https://assets.grok.com/?v=1".to_string(),
            "users/rel/2.jpg".to_string(),
        ];
        assert_eq!(
            normalize_generated_asset_urls(&urls),
            vec![
                "https://assets.grok.com/img/1.jpg".to_string(),
                "https://assets.grok.com/?v=1".to_string(),
                "users/rel/2.jpg".to_string(),
            ]
        );
    }

    // ---------------------------------------------------------------
    // 4. Video HTML shapes
    // ---------------------------------------------------------------

    #[test]
    fn bare_video_element_when_preview_disabled() {
        let html = video_html("https://gw/images/u_v", Some("https://gw/images/u_p"), false);
        assert!(html.starts_with("<video src=\"https://gw/images/u_v\""));
        assert!(html.contains("controls"));
        assert!(html.contains("width=\"500\""));
        assert!(html.contains("height=\"300\""));
    }

    #[test]
    fn poster_block_when_preview_enabled() {
        let html = video_html("https://gw/v?a=1&b=2", Some("https://gw/p"), true);
        assert!(html.contains("<img src=\"https://gw/p\""));
        // URLs inside attributes are escaped.
        assert!(html.contains("a=1&amp;b=2"));
        assert!(html.contains("border-left"));
    }

    #[test]
    fn missing_poster_falls_back_to_bare_video() {
        let html = video_html("https://gw/v", None, true);
        assert!(html.starts_with("<video "));
    }
}
