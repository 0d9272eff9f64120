//! Supported upload containers.

use serde::{Deserialize, Serialize};

use crate::utils::filename::extension_of;
use crate::{Error, Result};

/// Audio-only containers accepted for upload.
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "wav", "mp3", "flac", "ogg", "m4a", "aac", "opus", "wma", "aiff", "aif",
];

/// Video containers accepted for upload. The original file is kept for remuxing.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "ts", "mpg",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Classify an upload by its extension.
///
/// Returns the kind together with the lowercased extension, or
/// `UnsupportedFormat` when the extension is missing or not in either set.
pub fn classify(file_name: &str) -> Result<(MediaKind, String)> {
    let Some(ext) = extension_of(file_name) else {
        return Err(Error::UnsupportedFormat(format!(
            "'{}' has no file extension",
            file_name
        )));
    };

    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Ok((MediaKind::Video, ext))
    } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        Ok((MediaKind::Audio, ext))
    } else {
        Err(Error::UnsupportedFormat(format!(
            "'.{}' is not a supported audio or video container",
            ext
        )))
    }
}
