//! Encoder invocation profile.
//!
//! The relay never negotiates encoder arguments at runtime: the profile is
//! built once from [`EncoderSettings`] and every (re)start of the encoder uses
//! the same program and argument list.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// RTMP origin the encoder publishes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtmpTarget {
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream_key: String,
}

impl Default for RtmpTarget {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1935,
            app: "live".to_string(),
            stream_key: "stream".to_string(),
        }
    }
}

impl RtmpTarget {
    pub fn url(&self) -> String {
        format!(
            "rtmp://{}:{}/{}/{}",
            self.host, self.port, self.app, self.stream_key
        )
    }
}

/// Codec and destination settings for the ffmpeg encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// ffmpeg binary, resolved through `PATH` when relative.
    pub program: PathBuf,
    pub target: RtmpTarget,
    pub video_codec: String,
    pub preset: String,
    pub tune: String,
    pub video_bitrate_kbps: u32,
    /// GOP length in frames.
    pub keyframe_interval: u32,
    pub audio_codec: String,
    pub audio_bitrate_kbps: u32,
    pub audio_sample_rate: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            target: RtmpTarget::default(),
            video_codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            tune: "zerolatency".to_string(),
            video_bitrate_kbps: 2500,
            keyframe_interval: 60,
            audio_codec: "aac".to_string(),
            audio_bitrate_kbps: 128,
            audio_sample_rate: 44100,
        }
    }
}

/// Program and fixed argument list used to launch the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderProfile {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl EncoderProfile {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// ffmpeg reading the container from stdin and publishing FLV over RTMP.
    pub fn ffmpeg(settings: &EncoderSettings) -> Self {
        let video_bitrate = format!("{}k", settings.video_bitrate_kbps);
        let buffer_size = format!("{}k", settings.video_bitrate_kbps.saturating_mul(2));
        let gop = settings.keyframe_interval.to_string();
        let audio_bitrate = format!("{}k", settings.audio_bitrate_kbps);
        let sample_rate = settings.audio_sample_rate.to_string();
        let url = settings.target.url();

        let args = [
            "-hide_banner",
            "-loglevel",
            "info",
            "-fflags",
            "nobuffer",
            "-i",
            "pipe:0",
            "-c:v",
            settings.video_codec.as_str(),
            "-preset",
            settings.preset.as_str(),
            "-tune",
            settings.tune.as_str(),
            "-b:v",
            video_bitrate.as_str(),
            "-maxrate",
            video_bitrate.as_str(),
            "-bufsize",
            buffer_size.as_str(),
            "-g",
            gop.as_str(),
            "-keyint_min",
            gop.as_str(),
            "-pix_fmt",
            "yuv420p",
            "-c:a",
            settings.audio_codec.as_str(),
            "-b:a",
            audio_bitrate.as_str(),
            "-ar",
            sample_rate.as_str(),
            "-f",
            "flv",
            url.as_str(),
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();

        Self::new(settings.program.clone(), args)
    }
}

impl From<&EncoderSettings> for EncoderProfile {
    fn from(settings: &EncoderSettings) -> Self {
        Self::ffmpeg(settings)
    }
}

#[cfg(test)]
#[path = "profile_test.rs"]
mod profile_test;
