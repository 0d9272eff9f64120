//! File name handling for uploads and job artifacts.
//!
//! Uploaded names come from clients and may carry directory components
//! (`C:\fakepath\clip.mp4`), control characters or names reserved on Windows.
//! Artifact names requested by callers must never escape the job directory.

/// Characters that are invalid in Windows filenames
const WINDOWS_INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved filenames (case-insensitive)
const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Name used when an upload arrives without a usable file name.
pub const FALLBACK_UPLOAD_NAME: &str = "input";

/// Sanitize a string for use as a filename on all platforms.
///
/// Invalid and control characters become a single `_`, leading/trailing spaces
/// and dots are trimmed and reserved names get a `_` prefix. Returns `fallback`
/// when nothing usable remains.
pub fn sanitize_filename_or(input: &str, fallback: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_replacement = false;

    for c in input.chars() {
        if c.is_control() || WINDOWS_INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '_') {
        return fallback.to_string();
    }

    let upper = trimmed.to_uppercase();
    for reserved in WINDOWS_RESERVED_NAMES {
        if upper == *reserved || upper.starts_with(&format!("{}.", reserved)) {
            return format!("_{}", trimmed);
        }
    }

    trimmed.to_string()
}

/// Derive the stored file name for an upload from the client-declared name.
///
/// Only the last path component is kept (either separator style).
pub fn upload_file_name(declared: &str) -> String {
    let base = declared
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(declared);
    sanitize_filename_or(base, FALLBACK_UPLOAD_NAME)
}

/// Lowercased extension of a file name, without the dot.
pub fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Whether `name` is a plain file name that stays inside its directory.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains("..")
        && !name.chars().any(|c| c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_name_strips_directories() {
        assert_eq!(upload_file_name("C:\\fakepath\\clip.mp4"), "clip.mp4");
        assert_eq!(upload_file_name("/home/user/song.wav"), "song.wav");
        assert_eq!(upload_file_name("../../etc/passwd"), "passwd");
    }

    #[test]
    fn test_upload_name_fallback() {
        assert_eq!(upload_file_name(""), "input");
        assert_eq!(upload_file_name("..."), "input");
        assert_eq!(upload_file_name("dir/"), "input");
        assert_eq!(upload_file_name("???"), "input");
    }

    #[test]
    fn test_reserved_names() {
        assert_eq!(upload_file_name("CON.wav"), "_CON.wav");
        assert_eq!(upload_file_name("nul"), "_nul");
    }

    #[test]
    fn test_unicode_preserved() {
        assert_eq!(upload_file_name("观看一只青蛙?.mp4"), "观看一只青蛙_.mp4");
        assert_eq!(upload_file_name("こんにちは.flac"), "こんにちは.flac");
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("Clip.MP4").as_deref(), Some("mp4"));
        assert_eq!(extension_of("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(extension_of(".hidden"), None);
        assert_eq!(extension_of("trailing."), None);
    }

    #[test]
    fn test_plain_file_name() {
        assert!(is_plain_file_name("vocals.wav"));
        assert!(is_plain_file_name("preview-abc.wav"));
        assert!(!is_plain_file_name("../secret"));
        assert!(!is_plain_file_name("a/b.wav"));
        assert!(!is_plain_file_name("a\\b.wav"));
        assert!(!is_plain_file_name(""));
        assert!(!is_plain_file_name(".."));
    }

    #[test]
    fn test_idempotency() {
        for input in ["hello?world.wav", "CON", "  test  ", "...dots..."] {
            let once = upload_file_name(input);
            let twice = upload_file_name(&once);
            assert_eq!(once, twice, "Idempotency failed for input: {}", input);
        }
    }
}
