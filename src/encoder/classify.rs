//! Stderr line classification, pluggable per encoder (spec.md §4.2, §9).
//!
//! This is a deliberate carry-over of `LiveEncodingTask.py`'s substring
//! matching: fragile across encoder versions, but formalised here as one
//! function per encoder family rather than fixed. Do not "clean up" the
//! substring list into something smarter — it has to match what the actual
//! binaries print.
//!
//! `registry::Registry::classify_offline_detail` pattern-matches on the
//! detail strings produced here (and on the plain-English ones
//! `encoder::run_attempt` sets directly) to turn a stream's Offline detail
//! back into a `CoreError`. Changing a message here can silently break that
//! mapping.

use crate::model::EncoderKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSignal {
    /// Advance the human-readable detail text while still in Standby.
    StandbyDetail(&'static str),
    /// First frames produced: Standby → ONAir.
    OnAirTransition,
    /// Fatal, no retry: e.g. tuner unavailable, hardware unsupported.
    FatalNoRetry(String),
    /// Recoverable: request a restart, dump recent stderr.
    RecoverableRestart(String),
    /// Nothing recognised in this line.
    Ignored,
}

pub fn classify_line(kind: EncoderKind, line: &str) -> LogSignal {
    match kind {
        EncoderKind::FFmpeg => classify_ffmpeg(line),
        _ => classify_hwencc(kind, line),
    }
}

fn classify_ffmpeg(line: &str) -> LogSignal {
    if line.contains("Stream map '0:v:0' matches no streams.") {
        return LogSignal::FatalNoRetry("チューナー不足のため、このチャンネルは視聴できません。".into());
    }
    if line.contains("Conversion failed!") {
        return LogSignal::RecoverableRestart("エンコーダーの実行中にエラーが発生しました。".into());
    }
    if line.contains("libpostproc") {
        return LogSignal::StandbyDetail("チューナーを開いています…");
    }
    if line.contains("arib parser was created") || line.contains("Invalid frame dimensions 0x0.") {
        return LogSignal::StandbyDetail("エンコードを開始しています…");
    }
    if line.contains("frame=    1 fps=0.0 q=0.0") {
        return LogSignal::StandbyDetail("バッファリングしています…");
    }
    if line.contains("frame=") {
        return LogSignal::OnAirTransition;
    }
    LogSignal::Ignored
}

fn classify_hwencc(kind: EncoderKind, line: &str) -> LogSignal {
    if line.contains("error finding stream information.") {
        return LogSignal::FatalNoRetry("チューナー不足のため、このチャンネルは視聴できません。".into());
    }
    if kind == EncoderKind::NVEncC && line.contains("due to the NVIDIA's driver limitation.") {
        return LogSignal::FatalNoRetry("NVENC のセッション上限に達しているため、エンコードを開始できません。".into());
    }
    if kind == EncoderKind::QSVEncC && line.contains("avqsv: codec h264(yuv420p) unable to decode by qsv.") {
        return LogSignal::FatalNoRetry("この PC の GPU は QSVEncC によるエンコードに対応していません。".into());
    }
    if kind == EncoderKind::NVEncC && line.contains("CUDA not available.") {
        return LogSignal::FatalNoRetry("この PC の GPU は NVEncC によるエンコードに対応していません。".into());
    }
    if kind == EncoderKind::VCEEncC && line.contains("Failed to initalize VCE factory:") {
        return LogSignal::FatalNoRetry("この PC の GPU は VCEEncC によるエンコードに対応していません。".into());
    }
    if line.contains("Consider increasing the value for the --input-analyze and/or --input-probesize!") {
        return LogSignal::RecoverableRestart("入力ストリームの解析に失敗しました。".into());
    }
    if line.contains("finished with error!") {
        return LogSignal::RecoverableRestart("エンコーダーの実行中にエラーが発生しました。".into());
    }
    if line.contains("input source set to stdin.") || line.contains("opened file \"pipe:0\"") {
        return LogSignal::StandbyDetail("チューナーを開いています…");
    }
    if line.contains("starting output thread...") || line.contains("Encode Thread:") {
        return LogSignal::StandbyDetail("エンコードを開始しています…");
    }
    if line.contains(" frames: ") {
        return LogSignal::OnAirTransition;
    }
    LogSignal::Ignored
}

/// `true` for the verbose per-stream-mapping lines ffmpeg prints at startup;
/// these are logged at `debug!` rather than matched against.
pub fn is_stream_mapping_noise(line: &str) -> bool {
    line.starts_with("Stream #0:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffmpeg_onair_marker() {
        assert_eq!(
            classify_ffmpeg("frame=  120 fps=30 q=23.0 size=..."),
            LogSignal::OnAirTransition
        );
    }

    #[test]
    fn ffmpeg_fatal_marker() {
        assert!(matches!(
            classify_ffmpeg("Stream map '0:v:0' matches no streams."),
            LogSignal::FatalNoRetry(_)
        ));
    }

    #[test]
    fn nvenc_session_exhaustion_is_fatal() {
        assert!(matches!(
            classify_hwencc(EncoderKind::NVEncC, "Error: due to the NVIDIA's driver limitation."),
            LogSignal::FatalNoRetry(_)
        ));
    }

    #[test]
    fn qsv_session_exhaustion_does_not_match_other_encoders() {
        assert_eq!(
            classify_hwencc(EncoderKind::NVEncC, "avqsv: codec h264(yuv420p) unable to decode by qsv."),
            LogSignal::Ignored
        );
    }

    #[test]
    fn unrecognised_line_is_ignored() {
        assert_eq!(classify_ffmpeg("some unrelated diagnostic"), LogSignal::Ignored);
    }
}
