// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// Upstream frame decoding.
//
// The Grok upstream speaks NDJSON: one JSON object per line, with a
// heterogeneous set of optional shapes. Every recognized shape maps to
// an optional field here; anything else deserializes to defaults and
// is dropped by the transcoder. Lines that fail to parse are skipped
// without aborting the stream.

use serde::Deserialize;

/// One upstream NDJSON frame.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GrokFrame {
    pub error: Option<FrameError>,
    pub result: Option<FrameResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FrameError {
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FrameResult {
    pub response: Option<ResponseEnvelope>,
}

/// The nested envelope carrying zero or more of the recognized shapes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResponseEnvelope {
    #[serde(rename = "userResponse")]
    pub user_response: Option<UserResponse>,
    /// Text delta. The upstream sometimes sends arrays here; their
    /// semantics are undocumented and they are never emitted.
    pub token: Option<serde_json::Value>,
    #[serde(rename = "isThinking")]
    pub is_thinking: Option<bool>,
    #[serde(rename = "messageTag")]
    pub message_tag: Option<String>,
    #[serde(rename = "imageAttachmentInfo")]
    pub image_attachment_info: Option<serde_json::Value>,
    #[serde(rename = "modelResponse")]
    pub model_response: Option<ModelResponse>,
    #[serde(rename = "streamingVideoGenerationResponse")]
    pub video: Option<VideoGeneration>,
    #[serde(rename = "toolUsageCardId")]
    pub tool_usage_card_id: Option<serde_json::Value>,
    #[serde(rename = "webSearchResults")]
    pub web_search_results: Option<WebSearchResults>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserResponse {
    pub model: Option<String>,
}

/// Non-stream completion fields plus the image-mode terminal.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelResponse {
    #[serde(rename = "generatedImageUrls")]
    pub generated_image_urls: Option<Vec<String>>,
    pub model: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VideoGeneration {
    pub progress: Option<i64>,
    #[serde(rename = "videoUrl")]
    pub video_url: Option<String>,
    #[serde(rename = "thumbnailImageUrl")]
    pub thumbnail_image_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebSearchResults {
    pub results: Option<Vec<SearchResult>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchResult {
    pub title: Option<String>,
    pub url: Option<String>,
    pub preview: Option<String>,
}

impl GrokFrame {
    /// Parse one NDJSON line. `None` means the line was empty or not
    /// valid JSON; the caller skips it.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    /// Upstream error message, if this is a terminal error frame.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref()?.message.as_deref()
    }

    /// The response envelope, if present.
    pub fn response(&self) -> Option<&ResponseEnvelope> {
        self.result.as_ref()?.response.as_ref()
    }
}

impl ResponseEnvelope {
    /// The text delta, only when it is a non-empty string. Array-valued
    /// tokens are ignored.
    pub fn token_str(&self) -> Option<&str> {
        match self.token.as_ref()? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    /// Authoritative display model, only when non-empty.
    pub fn display_model(&self) -> Option<&str> {
        let model = self.user_response.as_ref()?.model.as_deref()?;
        if model.is_empty() {
            None
        } else {
            Some(model)
        }
    }

    /// Search citations, only when `toolUsageCardId` is paired with an
    /// actual results array.
    pub fn search_results(&self) -> Option<&[SearchResult]> {
        self.web_search_results
            .as_ref()?
            .results
            .as_deref()
    }
}
