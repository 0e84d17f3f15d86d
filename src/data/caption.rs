//! Caption handling for a single training item
//!
//! Captions live next to the image as `<stem>.<caption_ext>`. Plain text
//! files hold the caption verbatim; JSON files may also carry a short form.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

const TRIGGER_PLACEHOLDER: &str = "[trigger]";

#[derive(Debug, Deserialize)]
struct JsonCaption {
    caption: String,
    caption_short: Option<String>,
}

/// Caption capability of a file item
#[derive(Debug, Clone, Default)]
pub struct CaptionState {
    pub raw_caption: Option<String>,
    pub caption: String,
    pub caption_short: String,
}

impl CaptionState {
    pub fn from_raw(raw_caption: Option<String>) -> Self {
        let caption = raw_caption.clone().unwrap_or_default();
        Self {
            raw_caption,
            caption_short: caption.clone(),
            caption,
        }
    }

    /// Read the caption file beside `image_path`. A missing file gives an empty caption.
    pub fn load(image_path: &Path, caption_ext: &str) -> Result<Self> {
        let caption_path = image_path.with_extension(caption_ext);
        if !caption_path.exists() {
            return Ok(Self::default());
        }

        let text = fs::read_to_string(&caption_path)
            .with_context(|| format!("Failed to load caption: {}", caption_path.display()))?;

        if caption_ext.eq_ignore_ascii_case("json") {
            let parsed: JsonCaption = serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse caption: {}", caption_path.display()))?;
            let caption = parsed.caption.trim().to_string();
            let caption_short = parsed
                .caption_short
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| caption.clone());
            return Ok(Self {
                raw_caption: Some(text),
                caption,
                caption_short,
            });
        }

        let mut state = Self::from_raw(Some(text.trim().to_string()));
        state.raw_caption = Some(text);
        Ok(state)
    }

    pub fn get_caption(
        &self,
        trigger: Option<&str>,
        to_replace_list: &[String],
        add_if_not_present: bool,
    ) -> String {
        inject_trigger(&self.caption, trigger, to_replace_list, add_if_not_present)
    }

    pub fn get_caption_short(
        &self,
        trigger: Option<&str>,
        to_replace_list: &[String],
        add_if_not_present: bool,
    ) -> String {
        inject_trigger(&self.caption_short, trigger, to_replace_list, add_if_not_present)
    }
}

/// Substitute the trigger word into a caption.
///
/// `[trigger]` and every entry of `to_replace_list` become the trigger. With
/// no trigger the placeholder is removed and the caption is otherwise kept.
pub fn inject_trigger(
    caption: &str,
    trigger: Option<&str>,
    to_replace_list: &[String],
    add_if_not_present: bool,
) -> String {
    let Some(trigger) = trigger else {
        return strip_placeholder(caption);
    };

    let mut out = caption.replace(TRIGGER_PLACEHOLDER, trigger);
    for word in to_replace_list {
        if !word.is_empty() {
            out = out.replace(word.as_str(), trigger);
        }
    }

    if add_if_not_present && !out.contains(trigger) {
        out = if out.is_empty() {
            trigger.to_string()
        } else {
            format!("{}, {}", trigger, out)
        };
    }

    out
}

/// Drop the placeholder along with the separator it leaves behind
fn strip_placeholder(caption: &str) -> String {
    let words = caption
        .replace(TRIGGER_PLACEHOLDER, "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    words
        .replace(" ,", ",")
        .trim_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string()
}
