//! Fixed transcoding presets.
//!
//! The transcoder never sees caller-supplied arguments: a request selects a
//! preset by name and only the validated input URL is spliced into the
//! frozen argument vector. Output always goes to stdout so the existing
//! pipe-mode streaming handles delivery.

use url::Url;

/// A named, frozen transcoder invocation.
#[derive(Debug, Clone, Copy)]
pub struct TranscodePreset {
    pub name: &'static str,
    pub content_type: &'static str,
    pub filename: &'static str,
    args: &'static [&'static str],
}

/// Everything the gateway is willing to run. Fragmented mp4 because the
/// output pipe is not seekable.
pub const PRESETS: &[TranscodePreset] = &[
    TranscodePreset {
        name: "mp4-h264",
        content_type: "video/mp4",
        filename: "transcoded.mp4",
        args: &[
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-c:a",
            "aac",
            "-movflags",
            "frag_keyframe+empty_moov",
            "-f",
            "mp4",
        ],
    },
    TranscodePreset {
        name: "webm-vp9",
        content_type: "video/webm",
        filename: "transcoded.webm",
        args: &["-c:v", "libvpx-vp9", "-b:v", "0", "-crf", "34", "-c:a", "libopus", "-f", "webm"],
    },
    TranscodePreset {
        name: "mp3-audio",
        content_type: "audio/mpeg",
        filename: "transcoded.mp3",
        args: &["-vn", "-c:a", "libmp3lame", "-q:a", "2", "-f", "mp3"],
    },
];

pub fn preset(name: &str) -> Option<&'static TranscodePreset> {
    PRESETS.iter().find(|preset| preset.name == name)
}

/// Builds the full transcoder argv for a preset and input URL.
pub fn ffmpeg_args(input_url: &Url, preset: &TranscodePreset) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        input_url.to_string(),
    ];
    args.extend(preset.args.iter().map(|arg| arg.to_string()));
    args.push("pipe:1".to_string());
    args
}
