use std::path::PathBuf;

use super::{EncoderProfile, EncoderSettings, RtmpTarget};

fn arg_after<'a>(profile: &'a EncoderProfile, flag: &str) -> Option<&'a str> {
    profile
        .args
        .iter()
        .position(|a| a == flag)
        .and_then(|i| profile.args.get(i + 1))
        .map(String::as_str)
}

#[test]
fn test_rtmp_target_url() {
    let target = RtmpTarget {
        host: "origin.example.com".to_string(),
        port: 1936,
        app: "ingest".to_string(),
        stream_key: "abc123".to_string(),
    };
    assert_eq!(target.url(), "rtmp://origin.example.com:1936/ingest/abc123");
    assert_eq!(RtmpTarget::default().url(), "rtmp://localhost:1935/live/stream");
}

#[test]
fn test_ffmpeg_profile_reads_from_pipe() {
    let profile = EncoderProfile::ffmpeg(&EncoderSettings::default());

    assert_eq!(profile.program, PathBuf::from("ffmpeg"));
    assert_eq!(arg_after(&profile, "-i"), Some("pipe:0"));
    assert_eq!(arg_after(&profile, "-f"), Some("flv"));
    assert_eq!(
        profile.args.last().map(String::as_str),
        Some("rtmp://localhost:1935/live/stream")
    );
}

#[test]
fn test_ffmpeg_profile_codec_settings() {
    let settings = EncoderSettings {
        video_bitrate_kbps: 4000,
        keyframe_interval: 48,
        preset: "ultrafast".to_string(),
        audio_bitrate_kbps: 96,
        audio_sample_rate: 48000,
        ..EncoderSettings::default()
    };
    let profile = EncoderProfile::from(&settings);

    assert_eq!(arg_after(&profile, "-c:v"), Some("libx264"));
    assert_eq!(arg_after(&profile, "-preset"), Some("ultrafast"));
    assert_eq!(arg_after(&profile, "-tune"), Some("zerolatency"));
    assert_eq!(arg_after(&profile, "-b:v"), Some("4000k"));
    assert_eq!(arg_after(&profile, "-maxrate"), Some("4000k"));
    assert_eq!(arg_after(&profile, "-bufsize"), Some("8000k"));
    assert_eq!(arg_after(&profile, "-g"), Some("48"));
    assert_eq!(arg_after(&profile, "-keyint_min"), Some("48"));
    assert_eq!(arg_after(&profile, "-b:a"), Some("96k"));
    assert_eq!(arg_after(&profile, "-ar"), Some("48000"));
}

#[test]
fn test_settings_deserialize_partial() {
    let settings: EncoderSettings = serde_json::from_str(
        r#"{ "program": "/usr/local/bin/ffmpeg", "target": { "host": "10.0.0.5", "stream_key": "cam1" } }"#,
    )
    .unwrap();

    assert_eq!(settings.program, PathBuf::from("/usr/local/bin/ffmpeg"));
    assert_eq!(settings.target.url(), "rtmp://10.0.0.5:1935/live/cam1");
    assert_eq!(settings.video_bitrate_kbps, 2500);
}

#[test]
fn test_ffmpeg_profile_huge_bitrate_saturates() {
    let settings = EncoderSettings {
        video_bitrate_kbps: u32::MAX,
        ..EncoderSettings::default()
    };

    let profile = EncoderProfile::from(&settings);

    assert_eq!(arg_after(&profile, "-b:v"), Some("4294967295k"));
    assert_eq!(arg_after(&profile, "-bufsize"), Some("4294967295k"));
}
