//! Display helpers for file listings.

use serde::Serialize;

const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

/// Human-readable size using 1024-based units. Values under 10 keep two
/// decimals, larger ones are rounded.
pub fn format_bytes(n: u64) -> String {
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if value < 10.0 {
        format!("{:.2} {}", value, UNITS[unit])
    } else {
        format!("{:.0} {}", value, UNITS[unit])
    }
}

/// Lowercased extension after the last dot, or empty.
pub fn extension(filename: &str) -> String {
    match filename.rfind('.') {
        Some(i) => filename[i + 1..].to_lowercase(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Document,
    Audio,
    Video,
    Archive,
    Binary,
    Unknown,
}

const KIND_TABLE: &[(FileKind, &[&str])] = &[
    (FileKind::Image, &["png", "jpg", "jpeg", "gif", "bmp", "webp", "tiff"]),
    (
        FileKind::Document,
        &["pdf", "doc", "docx", "xls", "xlsx", "csv", "ppt", "pptx", "txt", "md"],
    ),
    (FileKind::Audio, &["mp3", "wav", "ogg", "aac", "flac"]),
    (FileKind::Video, &["mp4", "mkv", "avi", "mov", "webm"]),
    (FileKind::Archive, &["zip", "rar", "tar", "gz", "7z"]),
    (FileKind::Binary, &["exe", "bin", "iso", "dmg", "apk", "wasm"]),
];

impl FileKind {
    pub fn from_extension(ext: &str) -> Self {
        KIND_TABLE
            .iter()
            .find(|(_, exts)| exts.contains(&ext))
            .map(|(kind, _)| *kind)
            .unwrap_or(FileKind::Unknown)
    }

    pub fn from_filename(filename: &str) -> Self {
        Self::from_extension(&extension(filename))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Image => "image",
            FileKind::Document => "document",
            FileKind::Audio => "audio",
            FileKind::Video => "video",
            FileKind::Archive => "archive",
            FileKind::Binary => "binary",
            FileKind::Unknown => "unknown",
        }
    }
}
