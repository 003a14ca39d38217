//! Transcript retrieval.
//!
//! Transcripts are just another artifact the extraction tool can produce:
//! subtitles are fetched into a scratch directory under a fixed basename,
//! converted to VTT, then parsed into timed entries. Scraping the site
//! directly would mean chasing its markup forever; the tool already does.

use std::path::{Path, PathBuf};

use serde::Serialize;
use url::Url;

use crate::assemble::identifier_from_url;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::session::SessionProfile;
use crate::ytdlp::{self, TRANSCRIPT_BASENAME};

/// One timed caption line, seconds-based.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub text: String,
    pub start: f64,
    pub duration: f64,
}

/// Parses `HH:MM:SS.mmm` or `MM:SS.mmm` into seconds.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let mut parts: Vec<&str> = value.trim().split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }
    let seconds: f64 = parts.pop()?.parse().ok()?;
    let minutes: f64 = parts.pop()?.parse().ok()?;
    let hours: f64 = match parts.pop() {
        Some(part) => part.parse().ok()?,
        None => 0.0,
    };
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Drops inline markup such as `<c>`/`<00:00:01.000>` styling tags.
fn strip_tags(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_tag = false;
    for c in line.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// Parses a VTT document into timed entries. Header, NOTE blocks and cue
/// settings are skipped; multi-line cues are joined with spaces.
pub fn parse_vtt(vtt: &str) -> Vec<TranscriptEntry> {
    let mut entries = Vec::new();
    let mut lines = vtt.lines().peekable();

    while let Some(line) = lines.next() {
        let Some((start_raw, end_raw)) = line.split_once("-->") else {
            continue;
        };
        let Some(start) = parse_timestamp(start_raw) else {
            continue;
        };
        // Cue settings (alignment, position) follow the end timestamp.
        let end_value = end_raw.trim().split_whitespace().next().unwrap_or("");
        let Some(end) = parse_timestamp(end_value) else {
            continue;
        };

        let mut text_lines = Vec::new();
        while let Some(next) = lines.peek() {
            if next.trim().is_empty() {
                break;
            }
            let cleaned = strip_tags(lines.next().unwrap_or_default());
            let cleaned = cleaned.trim();
            if !cleaned.is_empty() {
                text_lines.push(cleaned.to_string());
            }
        }

        if text_lines.is_empty() {
            continue;
        }
        entries.push(TranscriptEntry {
            text: text_lines.join(" "),
            start,
            duration: (end - start).max(0.0),
        });
    }

    entries
}

/// Finds the VTT the tool wrote: the exact language first, then any
/// language variant (e.g. `en-US` when `en` was requested).
fn locate_vtt(scratch: &Path, lang: &str) -> Option<PathBuf> {
    let exact = scratch.join(format!("{TRANSCRIPT_BASENAME}.{lang}.vtt"));
    if exact.is_file() {
        return Some(exact);
    }
    let entries = std::fs::read_dir(scratch).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&format!("{TRANSCRIPT_BASENAME}.")) && name.ends_with(".vtt") {
            return Some(entry.path());
        }
    }
    None
}

/// Fetches and parses the transcript for `url` in `lang`.
pub async fn fetch_transcript(
    config: &GatewayConfig,
    session: &SessionProfile,
    url: &Url,
    lang: &str,
) -> GatewayResult<Vec<TranscriptEntry>> {
    identifier_from_url(url).ok_or(GatewayError::TranscriptSourceInvalid)?;

    let scratch = tempfile::Builder::new()
        .prefix("transcript-")
        .tempdir_in(&config.download_dir)
        .map_err(|err| GatewayError::Configuration(format!("creating scratch dir: {err}")))?;

    let args = ytdlp::transcript_args(
        url,
        lang,
        scratch.path(),
        session,
        config.proxy_url.as_deref(),
    );
    let output =
        ytdlp::run_capture(&config.ytdlp_bin, &args, config.subprocess_timeout).await?;

    if !output.success() {
        if ytdlp::is_soft_subtitle_failure(&output.stderr) {
            return Err(GatewayError::TranscriptUnavailable(lang.to_string()));
        }
        return Err(ytdlp::classify_failure(
            &config.ytdlp_bin,
            output.status,
            output.stderr,
        ));
    }

    let Some(vtt_path) = locate_vtt(scratch.path(), lang) else {
        return Err(GatewayError::TranscriptUnavailable(lang.to_string()));
    };
    let vtt = std::fs::read_to_string(&vtt_path)
        .map_err(|err| GatewayError::Configuration(format!("reading transcript: {err}")))?;

    let entries = parse_vtt(&vtt);
    if entries.is_empty() {
        return Err(GatewayError::TranscriptUnavailable(lang.to_string()));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "WEBVTT\n\
        \n\
        00:00:01.000 --> 00:00:03.500 align:start position:0%\n\
        Hello <c>world</c>\n\
        \n\
        00:01:00.000 --> 00:01:02.000\n\
        second cue\n\
        still second cue\n";

    #[test]
    fn parses_timestamps_with_and_without_hours() {
        assert_eq!(parse_timestamp("00:00:01.000"), Some(1.0));
        assert_eq!(parse_timestamp("01:02:03.500"), Some(3723.5));
        assert_eq!(parse_timestamp("02:30.000"), Some(150.0));
        assert_eq!(parse_timestamp("garbage"), None);
    }

    #[test]
    fn parses_cues_with_settings_and_tags() {
        let entries = parse_vtt(SAMPLE);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "Hello world");
        assert_eq!(entries[0].start, 1.0);
        assert_eq!(entries[0].duration, 2.5);
        assert_eq!(entries[1].text, "second cue still second cue");
        assert_eq!(entries[1].start, 60.0);
    }

    #[test]
    fn empty_document_yields_no_entries() {
        assert!(parse_vtt("WEBVTT\n\n").is_empty());
    }

    #[test]
    fn locate_vtt_accepts_language_variants() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("transcript.en-US.vtt"), "WEBVTT").unwrap();
        let found = locate_vtt(temp.path(), "en").unwrap();
        assert!(found.ends_with("transcript.en-US.vtt"));
    }

    #[test]
    fn locate_vtt_prefers_exact_language() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("transcript.en-US.vtt"), "WEBVTT").unwrap();
        std::fs::write(temp.path().join("transcript.en.vtt"), "WEBVTT").unwrap();
        let found = locate_vtt(temp.path(), "en").unwrap();
        assert!(found.ends_with("transcript.en.vtt"));
    }
}
