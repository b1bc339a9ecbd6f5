// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// Runtime settings.
//
// Six named sections, each stored as a JSON blob in the settings
// key/value table. The read path merges stored values over defaults
// per section (a missing or unparsable section is all defaults);
// writes upsert all six sections in one transaction.

mod store;

pub use store::{SettingsStore, StoreError};

use serde::{Deserialize, Serialize};

/// The six section keys, in storage order.
pub const SECTION_KEYS: [&str; 6] = [
    "global",
    "grok",
    "token",
    "cache",
    "performance",
    "register",
];

/// Prefix stripped from `cf_clearance` before storage and re-applied
/// when building the upstream cookie header.
const CF_CLEARANCE_PREFIX: &str = "cf_clearance=";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// Public base URL for proxied asset links; empty means derive
    /// from the request origin.
    pub base_url: String,
    /// Surface chain-of-thought to clients in `<think>` brackets.
    pub show_thinking: bool,
    /// Render video completions as a clickable poster block.
    pub video_poster_preview: bool,
    /// Tag names suppressed from streamed content.
    pub filter_tags: Vec<String>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            show_thinking: true,
            video_poster_preview: false,
            filter_tags: vec![
                "xaiartifact".to_string(),
                "xai:tool_usage_card".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrokSettings {
    /// Cloudflare clearance cookie value, stored without the
    /// `cf_clearance=` prefix.
    pub cf_clearance: String,
    /// Canonicalized through [`ImageGenMethod::from_alias`] on save.
    pub image_generation_method: String,
}

impl Default for GrokSettings {
    fn default() -> Self {
        Self {
            cf_clearance: String::new(),
            image_generation_method: ImageGenMethod::Legacy.as_str().to_string(),
        }
    }
}

impl GrokSettings {
    /// The cookie fragment for upstream requests, re-prefixed. Empty
    /// when no clearance is configured.
    pub fn cf_clearance_cookie(&self) -> String {
        if self.cf_clearance.is_empty() {
            String::new()
        } else {
            format!("{CF_CLEARANCE_PREFIX}{}", self.cf_clearance)
        }
    }

    pub fn image_method(&self) -> ImageGenMethod {
        ImageGenMethod::from_alias(&self.image_generation_method)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    /// Models restricted to the super-tier credential pool.
    pub super_models: Vec<String>,
    /// Whether basic-tier requests may fall back to the super pool.
    pub basic_falls_back_to_super: bool,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            super_models: vec!["grok-4-heavy".to_string()],
            basic_falls_back_to_super: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Cache proxied asset bytes.
    pub enabled: bool,
    /// Client-facing max-age for proxied assets, in seconds.
    pub asset_max_age_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            asset_max_age_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    pub first_response_timeout_secs: u64,
    pub chunk_timeout_secs: u64,
    pub total_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub video_idle_timeout_secs: u64,
    /// Worker count for batch admin jobs.
    pub batch_concurrency: usize,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            first_response_timeout_secs: 30,
            chunk_timeout_secs: 90,
            total_timeout_secs: 600,
            idle_timeout_secs: 120,
            video_idle_timeout_secs: 600,
            batch_concurrency: crate::batch::DEFAULT_CONCURRENCY,
        }
    }
}

impl PerformanceSettings {
    pub fn timeout_budgets(&self) -> crate::transcode::TimeoutBudgets {
        use std::time::Duration;
        crate::transcode::TimeoutBudgets {
            first_response: Duration::from_secs(self.first_response_timeout_secs),
            chunk: Duration::from_secs(self.chunk_timeout_secs),
            total: Duration::from_secs(self.total_timeout_secs),
            idle: Duration::from_secs(self.idle_timeout_secs),
            video_idle: Duration::from_secs(self.video_idle_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RegisterSettings {
    /// Allow self-service account registration against the upstream.
    pub enabled: bool,
    /// Invite code attached to registration attempts.
    pub invite_code: String,
}

/// All six sections together. Reads and writes always move the whole
/// bundle; partial writes do not exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SettingsBundle {
    pub global: GlobalSettings,
    pub grok: GrokSettings,
    pub token: TokenSettings,
    pub cache: CacheSettings,
    pub performance: PerformanceSettings,
    pub register: RegisterSettings,
}

impl SettingsBundle {
    /// Canonical form as persisted: clearance prefix stripped, image
    /// method resolved to its canonical name.
    pub fn normalized(mut self) -> Self {
        if let Some(stripped) = self.grok.cf_clearance.strip_prefix(CF_CLEARANCE_PREFIX) {
            self.grok.cf_clearance = stripped.to_string();
        }
        self.grok.image_generation_method = ImageGenMethod::from_alias(
            &self.grok.image_generation_method,
        )
        .as_str()
        .to_string();
        self
    }
}

// ---------------------------------------------------------------------------
// Image generation method aliases
// ---------------------------------------------------------------------------

/// The closed set of image generation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageGenMethod {
    Legacy,
    ImagineWsExperimental,
}

impl ImageGenMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageGenMethod::Legacy => "legacy",
            ImageGenMethod::ImagineWsExperimental => "imagine_ws_experimental",
        }
    }

    /// Resolve a stored or user-supplied name, case-insensitively.
    /// Unknown values fall back to `legacy`.
    pub fn from_alias(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "imagine_ws_experimental" | "imagine_ws" | "imagine-ws" | "imagine" | "ws" => {
                ImageGenMethod::ImagineWsExperimental
            }
            _ => ImageGenMethod::Legacy,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let bundle = SettingsBundle::default();
        assert!(bundle.global.show_thinking);
        assert_eq!(bundle.grok.image_generation_method, "legacy");
        assert_eq!(bundle.performance.batch_concurrency, 5);
        assert!(bundle.global.filter_tags.contains(&"xaiartifact".to_string()));
    }

    #[test]
    fn missing_fields_merge_over_defaults() {
        // A stored blob from an older version with only one field.
        let global: GlobalSettings = serde_json::from_str(r#"{"base_url":"https://gw"}"#).unwrap();
        assert_eq!(global.base_url, "https://gw");
        assert!(global.show_thinking, "unset fields take defaults");
        assert!(!global.filter_tags.is_empty());
    }

    #[test]
    fn cf_clearance_round_trips_stripped() {
        let bundle = SettingsBundle {
            grok: GrokSettings {
                cf_clearance: "cf_clearance=abc123".to_string(),
                ..GrokSettings::default()
            },
            ..SettingsBundle::default()
        }
        .normalized();

        assert_eq!(bundle.grok.cf_clearance, "abc123");
        assert_eq!(bundle.grok.cf_clearance_cookie(), "cf_clearance=abc123");

        // Already-stripped values are left alone.
        let again = bundle.clone().normalized();
        assert_eq!(again.grok.cf_clearance, "abc123");
    }

    #[test]
    fn empty_cf_clearance_yields_empty_cookie() {
        assert_eq!(GrokSettings::default().cf_clearance_cookie(), "");
    }

    #[test]
    fn image_method_aliases_resolve_case_insensitively() {
        assert_eq!(ImageGenMethod::from_alias("legacy"), ImageGenMethod::Legacy);
        assert_eq!(
            ImageGenMethod::from_alias("IMAGINE_WS"),
            ImageGenMethod::ImagineWsExperimental
        );
        assert_eq!(
            ImageGenMethod::from_alias("Imagine"),
            ImageGenMethod::ImagineWsExperimental
        );
        assert_eq!(
            ImageGenMethod::from_alias("something else"),
            ImageGenMethod::Legacy
        );
        assert_eq!(ImageGenMethod::from_alias(""), ImageGenMethod::Legacy);
    }

    #[test]
    fn normalization_canonicalizes_method() {
        let bundle = SettingsBundle {
            grok: GrokSettings {
                image_generation_method: "Imagine".to_string(),
                ..GrokSettings::default()
            },
            ..SettingsBundle::default()
        }
        .normalized();
        assert_eq!(bundle.grok.image_generation_method, "imagine_ws_experimental");
        assert_eq!(bundle.grok.image_method(), ImageGenMethod::ImagineWsExperimental);
    }
}
