#![forbid(unsafe_code)]

//! Builds the UI-facing format catalog out of raw extractor metadata.
//!
//! yt-dlp reports every stream variant it knows about: storyboard image
//! tracks, duplicate encodes of the same quality, and containers the bundled
//! player cannot use. The catalog keeps one entry per distinct quality,
//! split into a video bucket and an audio bucket, with display strings
//! precomputed so the front-end renders them verbatim.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::extractor::{ExtractorInfo, RawFormat};

/// Container advertised for every audio entry. The download path always
/// extracts audio to mp3, whatever the source stream used.
const AUDIO_EXTENSION: &str = "mp3";

const DEFAULT_SAMPLE_RATE: u64 = 44100;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// One selectable download variant, display-ready. The download request
/// echoes the chosen entry back to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub format_id: String,
    pub quality: String,
    pub quality_label: String,
    pub extension: String,
    pub size_display: String,
    /// Byte count behind `size_display`; 0 when the extractor reported no
    /// size. The download endpoint uses it as the expected transfer total
    /// because the streamed response carries no content length.
    pub size_bytes: u64,
    pub bitrate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,
    pub has_video: bool,
    pub has_audio: bool,
    pub audio_bitrate: f64,
    pub sample_rate: u64,
}

/// Source metadata rendered for display. All formatting happens here so the
/// front-end can show these fields verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    pub thumbnail_url: String,
    pub duration_display: String,
    pub author: String,
    pub views_display: String,
    pub upload_date: String,
    pub description: String,
    pub source_url: String,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pub video_info: VideoInfo,
    pub video_formats: Vec<CatalogEntry>,
    pub audio_formats: Vec<CatalogEntry>,
}

/// Normalizes one metadata response into the catalog served to the UI.
///
/// webm descriptors are dropped, the survivors are mapped to entries and
/// deduplicated by (quality label, extension, frame rate) with the first
/// occurrence winning, then partitioned into buckets. Order follows the
/// extractor's format list throughout; there is no re-sorting by quality.
pub fn build_catalog(info: &ExtractorInfo, source_url: &str) -> Catalog {
    let video_info = build_video_info(info, source_url);

    let mut seen = HashSet::new();
    let mut deduped: Vec<CatalogEntry> = Vec::new();
    for format in &info.formats {
        if is_webm(format) {
            continue;
        }
        let entry = map_format(format);
        if seen.insert(dedup_key(&entry)) {
            deduped.push(entry);
        }
    }

    let mut video_formats = Vec::new();
    let mut audio_formats = Vec::new();
    for entry in deduped {
        if entry.has_video {
            video_formats.push(entry);
        } else if entry.has_audio {
            audio_formats.push(entry);
        }
    }
    // Display-only override; bitrate and sample rate keep the source values.
    for entry in &mut audio_formats {
        entry.extension = AUDIO_EXTENSION.to_string();
    }

    Catalog {
        video_info,
        video_formats,
        audio_formats,
    }
}

fn build_video_info(info: &ExtractorInfo, source_url: &str) -> VideoInfo {
    let thumbnail_url = info
        .thumbnails
        .last()
        .and_then(|thumbnail| thumbnail.url.clone())
        .unwrap_or_default();

    let duration_display = match info.duration {
        Some(seconds) if seconds > 0 => format_duration(seconds),
        _ => String::new(),
    };

    let views_display = match info.view_count {
        Some(views) if views > 0 => format_views(views),
        _ => String::new(),
    };

    VideoInfo {
        id: info.id.clone(),
        title: info.title.clone(),
        thumbnail_url,
        duration_display,
        author: info.uploader.clone().unwrap_or_default(),
        views_display,
        upload_date: info.upload_date.clone().unwrap_or_default(),
        description: info.description.clone().unwrap_or_default(),
        source_url: source_url.to_string(),
    }
}

fn map_format(format: &RawFormat) -> CatalogEntry {
    let has_video = codec_present(format.vcodec.as_deref());
    let has_audio = codec_present(format.acodec.as_deref());

    let quality = if has_video {
        format.resolution.clone().unwrap_or_default()
    } else if has_audio {
        format
            .abr
            .map(|abr| format!("{abr} kbps"))
            .unwrap_or_default()
    } else {
        String::new()
    };

    let size_bytes = resolve_size_bytes(format);

    CatalogEntry {
        format_id: format.format_id.clone().unwrap_or_default(),
        quality: quality.clone(),
        quality_label: quality,
        extension: format.ext.clone().unwrap_or_default(),
        size_display: format_size(size_bytes),
        size_bytes,
        bitrate: format.tbr.or(format.abr).unwrap_or(0.0),
        frame_rate: format.fps,
        has_video,
        has_audio,
        audio_bitrate: format.abr.unwrap_or(0.0),
        sample_rate: format.asr.unwrap_or(DEFAULT_SAMPLE_RATE),
    }
}

/// A codec field counts as present when it is set and not the extractor's
/// "none" sentinel.
fn codec_present(codec: Option<&str>) -> bool {
    codec.is_some_and(|value| !value.is_empty() && value != "none")
}

fn is_webm(format: &RawFormat) -> bool {
    format
        .ext
        .as_deref()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("webm"))
}

fn dedup_key(entry: &CatalogEntry) -> String {
    let frame_rate = entry
        .frame_rate
        .map(|fps| fps.to_string())
        .unwrap_or_default();
    format!("{}|{}|{}", entry.quality_label, entry.extension, frame_rate)
}

/// Byte-count fallback chain: exact size, else the extractor's estimate,
/// else 0 (rendered as an empty size display).
fn resolve_size_bytes(format: &RawFormat) -> u64 {
    format.filesize.or(format.filesize_approx).unwrap_or(0)
}

fn format_size(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.2} GB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MB", bytes as f64 / MIB as f64)
    } else if bytes > 0 {
        format!("{:.2} KB", bytes as f64 / KIB as f64)
    } else {
        String::new()
    }
}

/// Zero-padded `HH:MM:SS`; hours keep counting past 24 instead of wrapping.
fn format_duration(total_seconds: i64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Thousands-separated count, e.g. `1,234,567`.
fn format_views(views: i64) -> String {
    let digits = views.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    grouped
}
