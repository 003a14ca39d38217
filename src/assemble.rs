//! Artifact recovery after a file-mode run.
//!
//! The tool is asked to print one JSON object describing what it produced;
//! exit code zero proves nothing, so the assembler always probes the disk
//! before promising an artifact to the client. Identifier recovery falls
//! back from the printed contract line to the request URL to a literal
//! placeholder, in that order.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use url::Url;

/// Identifier of last resort when neither the tool nor the URL yields one.
pub const FALLBACK_ID: &str = "media";

/// The single machine-parseable line the tool prints in file mode.
#[derive(Debug, Clone, Deserialize)]
pub struct PrintedMedia {
    pub id: String,
    #[serde(default)]
    pub ext: Option<String>,
}

/// Scans stdout from the bottom for the contract line. Later lines win
/// because the tool prints them after its own progress noise.
pub fn printed_media(stdout: &str) -> Option<PrintedMedia> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<PrintedMedia>(line).ok())
        .filter(|media| !media.id.is_empty())
}

/// Pulls something identifier-shaped out of the request URL: a `v` query
/// parameter if present, otherwise the last non-empty path segment.
pub fn identifier_from_url(url: &Url) -> Option<String> {
    if let Some((_, value)) = url.query_pairs().find(|(key, _)| key == "v")
        && !value.is_empty()
    {
        return Some(value.into_owned());
    }
    url.path_segments()?
        .filter(|segment| !segment.is_empty())
        .next_back()
        .map(str::to_owned)
}

/// Replaces anything that should not appear in a filename.
pub fn sanitize_identifier(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Full fallback chain: printed contract line, then URL, then placeholder.
pub fn recover_identifier(stdout: &str, url: &Url) -> String {
    let raw = printed_media(stdout)
        .map(|media| media.id)
        .or_else(|| identifier_from_url(url))
        .unwrap_or_else(|| FALLBACK_ID.to_string());
    sanitize_identifier(&raw)
}

/// One file the tool left behind, paired with the name the client sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub name: String,
}

/// Expected audio location: the same template substitution the tool was
/// given, applied to the recovered identifier.
pub fn audio_path(dir: &Path, id: &str, audio_format: &str) -> PathBuf {
    dir.join(format!("{id}.{audio_format}"))
}

/// Expected subtitle location for the requested language.
pub fn subtitle_path(dir: &Path, id: &str, lang: &str) -> PathBuf {
    dir.join(format!("{id}.{lang}.vtt"))
}

/// Probes the expected locations and keeps only what actually exists.
/// Returning an empty set on a zero exit is the caller's cue to fail with
/// the artifact-missing class.
pub fn probe_artifacts(dir: &Path, id: &str, audio_format: &str, lang: &str) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    let audio = audio_path(dir, id, audio_format);
    if audio.is_file() {
        artifacts.push(Artifact {
            name: format!("{id}.{audio_format}"),
            path: audio,
        });
    }
    let subtitle = subtitle_path(dir, id, lang);
    if subtitle.is_file() {
        artifacts.push(Artifact {
            name: format!("{id}.{lang}.vtt"),
            path: subtitle,
        });
    }
    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn printed_media_takes_last_json_line() {
        let stdout = "[download] 100%\n{\"id\": \"early\", \"ext\": \"mp3\"}\nnoise\n{\"id\": \"late\", \"ext\": \"mp3\"}\n";
        let media = printed_media(stdout).unwrap();
        assert_eq!(media.id, "late");
        assert_eq!(media.ext.as_deref(), Some("mp3"));
    }

    #[test]
    fn printed_media_ignores_non_json_noise() {
        assert!(printed_media("[download] Destination: x.mp3\n").is_none());
        assert!(printed_media("{\"id\": \"\"}\n").is_none());
    }

    #[test]
    fn identifier_prefers_query_parameter() {
        let url = Url::parse("https://www.youtube.com/watch?v=abc123DEF90&t=10").unwrap();
        assert_eq!(identifier_from_url(&url).as_deref(), Some("abc123DEF90"));
    }

    #[test]
    fn identifier_falls_back_to_path_segment() {
        let url = Url::parse("https://youtu.be/xyz789/").unwrap();
        assert_eq!(identifier_from_url(&url).as_deref(), Some("xyz789"));
    }

    #[test]
    fn recover_identifier_uses_placeholder_last() {
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(recover_identifier("no json here", &url), FALLBACK_ID);
    }

    #[test]
    fn recover_identifier_sanitizes_printed_id() {
        let url = Url::parse("https://example.com/watch").unwrap();
        let id = recover_identifier("{\"id\": \"a/b:c\"}", &url);
        assert_eq!(id, "a_b_c");
    }

    #[test]
    fn audio_path_is_byte_identical_substitution() {
        let path = audio_path(Path::new("/var/lib/mediagate/downloads"), "abc123DEF90", "mp3");
        assert_eq!(
            path,
            PathBuf::from("/var/lib/mediagate/downloads/abc123DEF90.mp3")
        );
    }

    #[test]
    fn subtitle_path_includes_language() {
        let path = subtitle_path(Path::new("/d"), "abc", "en");
        assert_eq!(path, PathBuf::from("/d/abc.en.vtt"));
    }

    #[test]
    fn probe_finds_only_existing_artifacts() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("vid1.mp3"), "audio").unwrap();

        let artifacts = probe_artifacts(temp.path(), "vid1", "mp3", "en");
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "vid1.mp3");

        std::fs::write(temp.path().join("vid1.en.vtt"), "WEBVTT").unwrap();
        let artifacts = probe_artifacts(temp.path(), "vid1", "mp3", "en");
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[1].name, "vid1.en.vtt");
    }

    #[test]
    fn probe_returns_empty_when_nothing_matches() {
        let temp = tempdir().unwrap();
        assert!(probe_artifacts(temp.path(), "vid1", "mp3", "en").is_empty());
    }
}
