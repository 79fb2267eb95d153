//! Encoder argument construction, pluggable per `EncoderKind`.
//!
//! Grounded on `LiveEncodingTask.py`'s `buildFFmpegOptions`/
//! `buildHWEncCOptions`: flat argv lists, stdin/stdout piping, and a
//! dual-mono audio split via `channelsplit` when `StreamOptions.dual_mono`
//! is set.

use crate::model::{EncoderKind, QualityParams, StreamOptions};

/// The external binary name and the argv to pass it, given stdin=raw TS and
/// stdout=encoded TS.
pub struct EncoderInvocation {
    pub program: &'static str,
    pub args: Vec<String>,
}

pub fn build(kind: EncoderKind, options: StreamOptions) -> EncoderInvocation {
    match kind {
        EncoderKind::FFmpeg => build_ffmpeg(options),
        EncoderKind::QSVEncC => build_hwencc("QSVEncC", options, HwEncCFlavor::Qsv),
        EncoderKind::NVEncC => build_hwencc("NVEncC", options, HwEncCFlavor::Nvenc),
        EncoderKind::VCEEncC => build_hwencc("VCEEncC", options, HwEncCFlavor::Vce),
        EncoderKind::RkmppEnc => build_hwencc("rkmppenc", options, HwEncCFlavor::Rkmpp),
    }
}

fn build_ffmpeg(options: StreamOptions) -> EncoderInvocation {
    let p: QualityParams = options.quality.params();
    let mut args: Vec<String> = vec![
        "-f".into(),
        "mpegts".into(),
        "-analyzeduration".into(),
        "500000".into(),
        "-i".into(),
        "pipe:0".into(),
        "-fflags".into(),
        "nobuffer".into(),
        "-flags".into(),
        "low_delay".into(),
        "-max_delay".into(),
        "250000".into(),
        "-max_interleave_delta".into(),
        "1".into(),
        "-threads".into(),
        "auto".into(),
    ];

    if options.dual_mono {
        args.extend(
            [
                "-filter_complex".into(),
                format!(
                    "yadif=0:-1:1,scale={}:{};volume=2.0,channelsplit[FL][FR]",
                    p.width, p.height
                ),
                "-map".into(),
                "0:v:0".into(),
                "-map".into(),
                "[FL]".into(),
                "-map".into(),
                "[FR]".into(),
            ]
            .into_iter(),
        );
    } else {
        args.extend(
            [
                "-vf".into(),
                format!("yadif=0:-1:1,scale={}:{}", p.width, p.height),
                "-af".into(),
                "volume=2.0".into(),
            ]
            .into_iter(),
        );
    }

    let vcodec = if options.quality.is_hevc() { "libx265" } else { "libx264" };
    args.extend(
        [
            "-vcodec".into(),
            vcodec.to_string(),
            "-flags".into(),
            "+cgop".into(),
            "-vb".into(),
            format!("{}k", p.video_bitrate_kbps),
            "-maxrate".into(),
            format!("{}k", p.video_bitrate_max_kbps),
            "-aspect".into(),
            "16:9".into(),
            "-r".into(),
            "30000/1001".into(),
            "-g".into(),
            "15".into(),
            "-preset".into(),
            "veryfast".into(),
            "-profile:v".into(),
            "main".into(),
            "-acodec".into(),
            "aac".into(),
            "-ac".into(),
            "2".into(),
            "-ab".into(),
            format!("{}k", p.audio_bitrate_kbps),
            "-ar".into(),
            "48000".into(),
            "-y".into(),
            "-f".into(),
            "mpegts".into(),
            "pipe:1".into(),
        ]
        .into_iter(),
    );

    EncoderInvocation {
        program: "ffmpeg",
        args,
    }
}

enum HwEncCFlavor {
    Qsv,
    Nvenc,
    Vce,
    Rkmpp,
}

fn build_hwencc(program: &'static str, options: StreamOptions, flavor: HwEncCFlavor) -> EncoderInvocation {
    let p = options.quality.params();
    let mut args: Vec<String> = vec![
        "--input-format".into(),
        "mpegts".into(),
        "--fps".into(),
        "30000/1001".into(),
        "--input-probesize".into(),
        "1000K".into(),
        "--input-analyze".into(),
        "0.7".into(),
        "--input".into(),
        "-".into(),
        "--avhw".into(),
        "--codec".into(),
        if options.quality.is_hevc() { "hevc".into() } else { "h264".into() },
    ];

    match flavor {
        HwEncCFlavor::Qsv | HwEncCFlavor::Nvenc => {
            args.push("--vpp-deinterlace".into());
            args.push("normal".into());
        }
        HwEncCFlavor::Vce => {
            args.push("--vpp-afs".into());
            args.push("preset=default".into());
        }
        HwEncCFlavor::Rkmpp => {}
    }

    args.extend(
        [
            "--output-res".into(),
            format!("{}x{}", p.width, p.height),
            "--fixed-qp".into(),
            "23".into(),
            "--bitrate".into(),
            p.video_bitrate_kbps.to_string(),
            "--max-bitrate".into(),
            p.video_bitrate_max_kbps.to_string(),
        ]
        .into_iter(),
    );

    match flavor {
        HwEncCFlavor::Qsv => {
            args.push("--quality".into());
            args.push("balanced".into());
        }
        HwEncCFlavor::Nvenc => {
            args.push("--preset".into());
            args.push("default".into());
        }
        HwEncCFlavor::Vce => {
            args.push("--preset".into());
            args.push("balanced".into());
        }
        HwEncCFlavor::Rkmpp => {
            args.push("--preset".into());
            args.push("default".into());
        }
    }

    if options.dual_mono {
        args.extend(
            [
                "--audio-stream".into(),
                "1?:FL".into(),
                "--audio-stream".into(),
                "2?:FR".into(),
            ]
            .into_iter(),
        );
    } else {
        args.extend(
            [
                "--audio-stream".into(),
                "1?:stereo".into(),
                "--audio-stream".into(),
                "2?:stereo".into(),
            ]
            .into_iter(),
        );
    }

    args.extend(
        [
            "--audio-bitrate".into(),
            format!("1?:{}", p.audio_bitrate_kbps),
            "--data-copy".into(),
            "timed_id3".into(),
            "--output-format".into(),
            "mpegts".into(),
            "--output".into(),
            "-".into(),
        ]
        .into_iter(),
    );

    EncoderInvocation { program, args }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Quality;

    #[test]
    fn ffmpeg_args_contain_pipes() {
        let inv = build(
            EncoderKind::FFmpeg,
            StreamOptions {
                quality: Quality::P720p,
                dual_mono: false,
            },
        );
        assert_eq!(inv.program, "ffmpeg");
        assert!(inv.args.iter().any(|a| a == "pipe:0"));
        assert!(inv.args.iter().any(|a| a == "pipe:1"));
    }

    #[test]
    fn dual_mono_splits_channels() {
        let inv = build(
            EncoderKind::FFmpeg,
            StreamOptions {
                quality: Quality::P480p,
                dual_mono: true,
            },
        );
        assert!(inv.args.iter().any(|a| a.contains("channelsplit")));
    }

    #[test]
    fn hevc_quality_selects_libx265() {
        let inv = build(
            EncoderKind::FFmpeg,
            StreamOptions {
                quality: Quality::P720pHevc,
                dual_mono: false,
            },
        );
        assert!(inv.args.iter().any(|a| a == "libx265"));
        assert!(!inv.args.iter().any(|a| a == "libx264"));
    }

    #[test]
    fn hevc_quality_selects_hwencc_codec_flag() {
        let inv = build(
            EncoderKind::NVEncC,
            StreamOptions {
                quality: Quality::P1080pHevc,
                dual_mono: false,
            },
        );
        let codec_idx = inv.args.iter().position(|a| a == "--codec").unwrap();
        assert_eq!(inv.args[codec_idx + 1], "hevc");
    }

    #[test]
    fn hwencc_uses_dash_dash_flags() {
        let inv = build(
            EncoderKind::NVEncC,
            StreamOptions {
                quality: Quality::P1080p,
                dual_mono: false,
            },
        );
        assert_eq!(inv.program, "NVEncC");
        assert!(inv.args.iter().any(|a| a == "--avhw"));
    }
}
