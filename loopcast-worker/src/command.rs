//! Encoder command lines for each way the engine runs ffmpeg.

use crate::crossfade::normalize_chain;
use crate::encoder::EncoderSpec;
use crate::error::EngineError;
use crate::slots::BoundHandle;
use loopcast_core::models::{Broadcast, EncoderSettings};
use std::path::Path;

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Logging flags shared by every encoder. Progress goes to stderr so a healthy process keeps
/// talking even when nothing is wrong.
fn preamble(interactive: bool) -> Vec<String> {
    let mut out = args(&["-hide_banner", "-loglevel", "level+warning", "-nostats"]);
    if !interactive {
        out.push("-nostdin".to_string());
    }
    out.extend(args(&["-progress", "pipe:2"]));
    out
}

fn looped_input(loop_path: &Path) -> Vec<String> {
    let mut out = args(&["-re", "-stream_loop", "-1", "-i"]);
    out.push(loop_path.to_string_lossy().into_owned());
    out
}

fn audio_input(audio_url: &str) -> Vec<String> {
    let mut out = args(&["-thread_queue_size", "1024", "-i"]);
    out.push(audio_url.to_string());
    out
}

fn video_encode(encoder: &EncoderSettings) -> Vec<String> {
    let gop = encoder.gop().to_string();
    vec![
        "-c:v".to_string(),
        encoder.video_codec.clone(),
        "-preset".to_string(),
        encoder.preset.clone(),
        "-b:v".to_string(),
        encoder.video_bitrate.clone(),
        "-maxrate".to_string(),
        encoder.video_bitrate.clone(),
        "-bufsize".to_string(),
        encoder.video_bufsize.clone(),
        "-pix_fmt".to_string(),
        encoder.pixel_format.clone(),
        "-g".to_string(),
        gop.clone(),
        "-keyint_min".to_string(),
        gop,
        "-sc_threshold".to_string(),
        "0".to_string(),
    ]
}

fn broadcast_output(broadcast: &Broadcast) -> Vec<String> {
    let encoder = &broadcast.encoder;
    let mut out = video_encode(encoder);
    out.extend(vec![
        "-c:a".to_string(),
        encoder.audio_codec.clone(),
        "-b:a".to_string(),
        encoder.audio_bitrate.clone(),
        "-ar".to_string(),
        encoder.audio_sample_rate.to_string(),
        "-ac".to_string(),
        "2".to_string(),
    ]);
    out.extend(encoder.extra_output_args.iter().cloned());
    out.extend(vec![
        "-f".to_string(),
        encoder.output_format.clone(),
        broadcast.output_url.clone(),
    ]);
    out
}

/// One looped video plus the live audio, straight to the broadcast output.
pub fn hard_cut(broadcast: &Broadcast, loop_path: &Path) -> Result<EncoderSpec, EngineError> {
    let mut out = preamble(false);
    out.extend(looped_input(loop_path));
    out.extend(audio_input(&broadcast.audio_url));
    out.extend(args(&["-map", "0:v:0", "-map", "1:a:0", "-vf"]));
    out.push(normalize_chain(&broadcast.encoder)?);
    out.extend(broadcast_output(broadcast));

    Ok(EncoderSpec {
        label: "hard-cut encoder".to_string(),
        program: broadcast.encoder.ffmpeg_path.clone(),
        args: out,
        interactive: false,
    })
}

/// Both slots plus the live audio, blended by `graph`. Stdin stays open for crossfade commands.
pub fn persistent(broadcast: &Broadcast, slots: &[BoundHandle; 2], graph: &str) -> EncoderSpec {
    let mut out = preamble(true);
    // Input N of the graph is slot-N.
    let mut ordered: Vec<&BoundHandle> = slots.iter().collect();
    ordered.sort_by_key(|handle| handle.slot.index());
    for handle in ordered {
        out.extend(handle.input_args.iter().cloned());
    }
    out.extend(audio_input(&broadcast.audio_url));
    out.push("-filter_complex".to_string());
    out.push(graph.to_string());
    out.extend(args(&["-map", "[vout]", "-map", "2:a:0"]));
    out.extend(broadcast_output(broadcast));

    EncoderSpec {
        label: "persistent encoder".to_string(),
        program: broadcast.encoder.ffmpeg_path.clone(),
        args: out,
        interactive: true,
    }
}

/// First stage of a staged slot: the loop, normalized and cut into a live HLS playlist.
pub fn hls_feeder(
    encoder: &EncoderSettings,
    label: &str,
    loop_path: &Path,
    playlist: &Path,
    segment_secs: u32,
) -> Result<EncoderSpec, EngineError> {
    let segments = playlist.with_file_name("seg-%06d.ts");
    let mut out = preamble(false);
    out.extend(looped_input(loop_path));
    out.extend(args(&["-an", "-vf"]));
    out.push(normalize_chain(encoder)?);
    out.extend(video_encode(encoder));
    out.extend(vec![
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        segment_secs.max(1).to_string(),
        "-hls_list_size".to_string(),
        "6".to_string(),
        "-hls_flags".to_string(),
        "delete_segments+append_list+omit_endlist+discont_start".to_string(),
        "-hls_segment_filename".to_string(),
        segments.to_string_lossy().into_owned(),
        playlist.to_string_lossy().into_owned(),
    ]);

    Ok(EncoderSpec {
        label: label.to_string(),
        program: encoder.ffmpeg_path.clone(),
        args: out,
        interactive: false,
    })
}

/// A slot fed over local UDP by its own encoder.
pub fn relay_feeder(
    encoder: &EncoderSettings,
    label: &str,
    loop_path: &Path,
    port: u16,
) -> Result<EncoderSpec, EngineError> {
    let mut out = preamble(false);
    out.extend(looped_input(loop_path));
    out.extend(args(&["-an", "-vf"]));
    out.push(normalize_chain(encoder)?);
    out.extend(video_encode(encoder));
    out.extend(vec![
        "-f".to_string(),
        "mpegts".to_string(),
        format!("udp://127.0.0.1:{}?pkt_size=1316", port),
    ]);

    Ok(EncoderSpec {
        label: label.to_string(),
        program: encoder.ffmpeg_path.clone(),
        args: out,
        interactive: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::SlotId;
    use pretty_assertions::assert_eq;
    use std::fs::File;

    fn broadcast() -> Broadcast {
        let fixture = File::open("../loopcast-core/fixtures/broadcast.json")
            .expect("Fixture was not found!");
        serde_json::from_reader(fixture).unwrap()
    }

    fn position(args: &[String], flag: &str) -> usize {
        args.iter()
            .position(|arg| arg == flag)
            .unwrap_or_else(|| panic!("{} missing from {:?}", flag, args))
    }

    #[test]
    fn hard_cut_reads_loop_and_live_audio() {
        let spec = hard_cut(&broadcast(), Path::new("/srv/loops/roygbiv.mp4")).unwrap();

        assert!(!spec.interactive);
        assert!(spec.args.contains(&"-nostdin".to_string()));
        let inputs: Vec<&String> = spec
            .args
            .iter()
            .enumerate()
            .filter(|(i, _)| *i > 0 && spec.args[i - 1] == "-i")
            .map(|(_, arg)| arg)
            .collect();
        assert_eq!(
            inputs,
            vec!["/srv/loops/roygbiv.mp4", "http://radio.local:8000/live.mp3"]
        );
        assert_eq!(
            spec.args[position(&spec.args, "-vf") + 1],
            "scale=1920:1080:force_original_aspect_ratio=decrease,pad=1920:1080:(ow-iw)/2:(oh-ih)/2,setsar=1,fps=30,format=yuv420p"
        );
        assert_eq!(
            &spec.args[spec.args.len() - 3..],
            &["-f", "flv", "rtmp://relay.local/live/stream"]
        );
    }

    #[test]
    fn keyframes_every_two_seconds() {
        let spec = hard_cut(&broadcast(), Path::new("/l.mp4")).unwrap();
        assert_eq!(spec.args[position(&spec.args, "-g") + 1], "60");
    }

    #[test]
    fn extra_output_args_precede_the_output() {
        let mut b = broadcast();
        b.encoder.extra_output_args = vec!["-flvflags".to_string(), "no_duration_filesize".to_string()];
        let spec = hard_cut(&b, Path::new("/l.mp4")).unwrap();
        assert_eq!(position(&spec.args, "-flvflags") + 2, spec.args.len() - 3);
    }

    #[test]
    fn persistent_keeps_stdin_and_maps_blended_video() {
        let handles = [
            BoundHandle {
                slot: SlotId::Zero,
                input_args: vec!["-i".to_string(), "slot-0".to_string()],
            },
            BoundHandle {
                slot: SlotId::One,
                input_args: vec!["-i".to_string(), "slot-1".to_string()],
            },
        ];
        let spec = persistent(&broadcast(), &handles, "[0:v][1:v]blend@xfade=all_expr=A[vout]");

        assert!(spec.interactive);
        assert!(!spec.args.contains(&"-nostdin".to_string()));
        assert_eq!(
            spec.args[position(&spec.args, "-filter_complex") + 1],
            "[0:v][1:v]blend@xfade=all_expr=A[vout]"
        );
        assert_eq!(spec.args[position(&spec.args, "[vout]") + 2], "2:a:0");
    }

    #[test]
    fn hls_feeder_writes_segments_next_to_playlist() {
        let spec = hls_feeder(
            &EncoderSettings::default(),
            "slot-0 feeder",
            Path::new("/l.mp4"),
            Path::new("/work/slot-0/index.m3u8"),
            2,
        )
        .unwrap();
        assert_eq!(
            spec.args[position(&spec.args, "-hls_segment_filename") + 1],
            "/work/slot-0/seg-%06d.ts"
        );
        assert_eq!(spec.args.last().unwrap(), "/work/slot-0/index.m3u8");
        assert!(spec.args.contains(&"-an".to_string()));
    }

    #[test]
    fn relay_feeder_targets_loopback_port() {
        let spec = relay_feeder(&EncoderSettings::default(), "slot-1 relay", Path::new("/l.mp4"), 23001)
            .unwrap();
        assert_eq!(
            spec.args.last().unwrap(),
            "udp://127.0.0.1:23001?pkt_size=1316"
        );
    }
}
