#![forbid(unsafe_code)]

//! Thin wrapper around the yt-dlp binary.
//!
//! Metadata comes from `--dump-single-json`; media bytes come from a spawned
//! process writing to its stdout, which the download endpoint forwards
//! without staging anything on disk. The binary path is injected so tests
//! can point the wrapper at a stub script.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tokio::process::{Child, Command};

/// Full `--dump-single-json` payload. Only the fields the catalog reads are
/// declared; everything except the id and title is optional because sparse
/// or older videos may lack metadata.
#[derive(Debug, Deserialize)]
pub struct ExtractorInfo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub thumbnails: Vec<ThumbnailInfo>,
    pub duration: Option<i64>,
    pub uploader: Option<String>,
    pub view_count: Option<i64>,
    pub upload_date: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
pub struct ThumbnailInfo {
    pub url: Option<String>,
}

/// One stream descriptor from the extractor's format list.
#[derive(Debug, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub resolution: Option<String>,
    pub tbr: Option<f64>,
    pub abr: Option<f64>,
    pub fps: Option<f64>,
    pub asr: Option<u64>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
}

/// Which download pipeline a variant runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Extract and re-encode to mp3.
    Audio,
    /// Selected video stream with the best m4a audio muxed in.
    VideoWithAudio,
    /// The selected format untouched.
    Passthrough,
}

impl StreamKind {
    /// Picks the pipeline for a chosen catalog entry. The mp3 check comes
    /// first so audio entries extract even when the source stream carried a
    /// video track.
    pub fn for_entry(extension: &str, has_video: bool) -> Self {
        if extension == "mp3" {
            StreamKind::Audio
        } else if has_video {
            StreamKind::VideoWithAudio
        } else {
            StreamKind::Passthrough
        }
    }
}

#[derive(Debug, Clone)]
pub struct Extractor {
    binary: PathBuf,
}

impl Extractor {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Runs `yt-dlp --dump-single-json` for one URL and returns the raw JSON
    /// payload. Running and parsing are separate steps because callers report
    /// the two failures differently.
    pub async fn fetch_info_json(&self, url: &str) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg(url)
            .output()
            .await
            .with_context(|| format!("fetching metadata for {url}"))?;

        if !output.status.success() {
            bail!(
                "metadata command failed for {} (status {})",
                url,
                output.status
            );
        }

        let raw_json = String::from_utf8(output.stdout)
            .context("parsing metadata JSON response as UTF-8")?;
        if raw_json.trim().is_empty() {
            bail!("metadata command returned no output for {url}");
        }
        Ok(raw_json)
    }

    /// Fetches and parses in one go.
    pub async fn fetch_info(&self, url: &str) -> Result<ExtractorInfo> {
        let raw_json = self.fetch_info_json(url).await?;
        parse_info(&raw_json)
    }

    /// Spawns a streaming download writing media to stdout. The caller owns
    /// the child and must drain stderr alongside stdout or a chatty run can
    /// fill the pipe and stall the transfer.
    pub fn spawn_stream(&self, format_id: &str, kind: StreamKind, url: &str) -> Result<Child> {
        Command::new(&self.binary)
            .args(stream_args(format_id, kind, url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {} for {}", self.binary.display(), url))
    }
}

/// Parses a raw `--dump-single-json` payload.
pub fn parse_info(raw_json: &str) -> Result<ExtractorInfo> {
    serde_json::from_str(raw_json).context("deserializing metadata JSON")
}

fn stream_args(format_id: &str, kind: StreamKind, url: &str) -> Vec<String> {
    match kind {
        StreamKind::Audio => vec![
            "-f".into(),
            format_id.into(),
            "-x".into(),
            "--audio-format".into(),
            "mp3".into(),
            "-o".into(),
            "-".into(),
            url.into(),
        ],
        StreamKind::VideoWithAudio => vec![
            "-f".into(),
            format!("{format_id}+bestaudio[ext=m4a]"),
            "-o".into(),
            "-".into(),
            url.into(),
        ],
        StreamKind::Passthrough => vec![
            "-f".into(),
            format_id.into(),
            "-o".into(),
            "-".into(),
            url.into(),
        ],
    }
}
