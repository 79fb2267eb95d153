use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the closed quality presets a channel can be streamed at.
///
/// Each quality carries the encode parameters consumed only by
/// `encoder::args` — nothing else in the core inspects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quality {
    #[serde(rename = "1080p-60fps")]
    P1080p60,
    #[serde(rename = "1080p-60fps-hevc")]
    P1080p60Hevc,
    #[serde(rename = "1080p")]
    P1080p,
    #[serde(rename = "1080p-hevc")]
    P1080pHevc,
    #[serde(rename = "720p")]
    P720p,
    #[serde(rename = "720p-hevc")]
    P720pHevc,
    #[serde(rename = "540p")]
    P540p,
    #[serde(rename = "540p-hevc")]
    P540pHevc,
    #[serde(rename = "480p")]
    P480p,
    #[serde(rename = "480p-hevc")]
    P480pHevc,
    #[serde(rename = "360p")]
    P360p,
    #[serde(rename = "360p-hevc")]
    P360pHevc,
    #[serde(rename = "240p")]
    P240p,
    #[serde(rename = "240p-hevc")]
    P240pHevc,
}

impl Quality {
    pub const ALL: [Quality; 14] = [
        Quality::P1080p60,
        Quality::P1080p60Hevc,
        Quality::P1080p,
        Quality::P1080pHevc,
        Quality::P720p,
        Quality::P720pHevc,
        Quality::P540p,
        Quality::P540pHevc,
        Quality::P480p,
        Quality::P480pHevc,
        Quality::P360p,
        Quality::P360pHevc,
        Quality::P240p,
        Quality::P240pHevc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::P1080p60 => "1080p-60fps",
            Quality::P1080p60Hevc => "1080p-60fps-hevc",
            Quality::P1080p => "1080p",
            Quality::P1080pHevc => "1080p-hevc",
            Quality::P720p => "720p",
            Quality::P720pHevc => "720p-hevc",
            Quality::P540p => "540p",
            Quality::P540pHevc => "540p-hevc",
            Quality::P480p => "480p",
            Quality::P480pHevc => "480p-hevc",
            Quality::P360p => "360p",
            Quality::P360pHevc => "360p-hevc",
            Quality::P240p => "240p",
            Quality::P240pHevc => "240p-hevc",
        }
    }

    /// HEVC encodes the same picture at roughly half the bitrate of AVC;
    /// the `*Hevc` variants keep their counterpart's resolution and audio
    /// bitrate and scale only the video bitrate down, mirroring the ratio
    /// between paired entries in the original `constants.py` QUALITY table.
    pub fn params(&self) -> QualityParams {
        match self {
            Quality::P1080p60 => QualityParams::new(1920, 1080, 6000, 9000, 192),
            Quality::P1080p60Hevc => QualityParams::new(1920, 1080, 2700, 4000, 192),
            Quality::P1080p => QualityParams::new(1920, 1080, 4500, 6500, 192),
            Quality::P1080pHevc => QualityParams::new(1920, 1080, 2000, 3000, 192),
            Quality::P720p => QualityParams::new(1280, 720, 3000, 4500, 128),
            Quality::P720pHevc => QualityParams::new(1280, 720, 1350, 2000, 128),
            Quality::P540p => QualityParams::new(960, 540, 2000, 3000, 128),
            Quality::P540pHevc => QualityParams::new(960, 540, 900, 1350, 128),
            Quality::P480p => QualityParams::new(720, 480, 1200, 1800, 128),
            Quality::P480pHevc => QualityParams::new(720, 480, 550, 800, 128),
            Quality::P360p => QualityParams::new(640, 360, 800, 1200, 96),
            Quality::P360pHevc => QualityParams::new(640, 360, 350, 550, 96),
            Quality::P240p => QualityParams::new(426, 240, 450, 675, 96),
            Quality::P240pHevc => QualityParams::new(426, 240, 200, 300, 96),
        }
    }

    pub fn is_hevc(&self) -> bool {
        matches!(
            self,
            Quality::P1080p60Hevc
                | Quality::P1080pHevc
                | Quality::P720pHevc
                | Quality::P540pHevc
                | Quality::P480pHevc
                | Quality::P360pHevc
                | Quality::P240pHevc
        )
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Encode parameters for one quality preset, in the units `ffmpeg`/HWEncC expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityParams {
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub video_bitrate_max_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

impl QualityParams {
    const fn new(
        width: u32,
        height: u32,
        video_bitrate_kbps: u32,
        video_bitrate_max_kbps: u32,
        audio_bitrate_kbps: u32,
    ) -> Self {
        Self {
            width,
            height,
            video_bitrate_kbps,
            video_bitrate_max_kbps,
            audio_bitrate_kbps,
        }
    }
}

/// Opaque per-channel key, e.g. a broadcaster's short channel code ("gr011").
pub type ChannelId = String;

/// Identifies exactly one LiveStream: a (channel, quality) pair.
///
/// Serializes as its `Display` string (`"{channel_id}-{quality}"`) rather
/// than as a struct, so it can be used directly as a JSON object key in
/// `Registry::list_streams`'s `{state: {live_stream_id: status}}` response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LiveStreamId {
    pub channel_id: ChannelId,
    pub quality: Quality,
}

impl LiveStreamId {
    pub fn new(channel_id: impl Into<ChannelId>, quality: Quality) -> Self {
        Self {
            channel_id: channel_id.into(),
            quality,
        }
    }
}

impl Serialize for LiveStreamId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl fmt::Display for LiveStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.channel_id, self.quality)
    }
}

/// The broadcast coordinates a tuner is reserved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelCoordinates {
    pub network_id: u16,
    pub transport_stream_id: u16,
    pub service_id: u16,
}

impl ChannelCoordinates {
    /// `networkId * 100000 + serviceId`, the id the HTTP backend addresses a
    /// service by.
    pub fn mirakurun_service_id(&self) -> u64 {
        self.network_id as u64 * 100_000 + self.service_id as u64
    }
}

/// Which encoder binary to spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderKind {
    FFmpeg,
    QSVEncC,
    NVEncC,
    VCEEncC,
    #[serde(rename = "rkmppenc")]
    RkmppEnc,
}

/// Per-stream options that affect how the encoder is invoked, carried
/// alongside the quality preset (e.g. dual-mono sub-audio handling).
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub quality: Quality,
    pub dual_mono: bool,
}

/// Resolves a channel id to the broadcast coordinates a tuner is opened
/// against. The channel metadata database itself is out of scope (spec.md
/// §1); this is the narrow interface the core consumes it through.
pub trait ChannelDirectory: Send + Sync {
    fn coordinates_for(&self, channel_id: &ChannelId) -> Option<ChannelCoordinates>;
    fn is_dual_mono(&self, channel_id: &ChannelId) -> bool {
        let _ = channel_id;
        false
    }
}

/// A directory backed by a fixed in-memory map, useful for tests and for
/// deployments that pass channel coordinates via configuration rather than
/// a live EPG database.
pub struct StaticChannelDirectory {
    channels: std::collections::HashMap<ChannelId, (ChannelCoordinates, bool)>,
}

impl StaticChannelDirectory {
    pub fn new(channels: std::collections::HashMap<ChannelId, ChannelCoordinates>) -> Self {
        Self {
            channels: channels
                .into_iter()
                .map(|(id, coordinates)| (id, (coordinates, false)))
                .collect(),
        }
    }

    pub fn with_dual_mono(
        channels: std::collections::HashMap<ChannelId, (ChannelCoordinates, bool)>,
    ) -> Self {
        Self { channels }
    }
}

impl ChannelDirectory for StaticChannelDirectory {
    fn coordinates_for(&self, channel_id: &ChannelId) -> Option<ChannelCoordinates> {
        self.channels.get(channel_id).map(|(c, _)| *c)
    }

    fn is_dual_mono(&self, channel_id: &ChannelId) -> bool {
        self.channels
            .get(channel_id)
            .map(|(_, dual_mono)| *dual_mono)
            .unwrap_or(false)
    }
}
