//! Crossfade timing and the filter descriptions a persistent encoder blends with.
//!
//! Both slots are scaled, padded and resampled to the output geometry before they meet in a
//! single named `blend` instance. A crossfade never rebuilds the graph: it swaps the blend
//! expression of the running encoder for one that moves from the source slot to the destination
//! slot over the plan's duration.

use crate::error::EngineError;
use crate::slots::SlotId;
use loopcast_core::models::{CrossfadeSettings, EncoderSettings, TransitionKind};
use std::str::FromStr;
use std::time::Duration;

/// Instance name of the blend filter that crossfades are applied to.
pub const BLEND_TARGET: &str = "blend@xfade";

/// ffmpeg reads at most this many bytes of an interactive command argument.
const COMMAND_ARG_LIMIT: usize = 255;

const PIXEL_FORMATS: [&str; 4] = ["yuv420p", "yuv422p", "yuv444p", "nv12"];

/// The chain every video input goes through before it is encoded or blended.
pub fn normalize_chain(encoder: &EncoderSettings) -> Result<String, EngineError> {
    if encoder.width == 0 || encoder.height == 0 || encoder.fps == 0 {
        return Err(EngineError::FilterGraph(format!(
            "cannot normalize to {}x{}@{}",
            encoder.width, encoder.height, encoder.fps
        )));
    }
    if !PIXEL_FORMATS.contains(&encoder.pixel_format.as_str()) {
        return Err(EngineError::FilterGraph(format!(
            "pixel format {} cannot be blended",
            encoder.pixel_format
        )));
    }
    Ok(format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps},format={pf}",
        w = encoder.width,
        h = encoder.height,
        fps = encoder.fps,
        pf = encoder.pixel_format
    ))
}

/// Where the crossfade should start: the estimated remaining time of the outgoing track minus
/// the crossfade itself, never negative and never later than `cap`. Unknown means now.
pub fn start_offset(remaining: Option<Duration>, duration: Duration, cap: Duration) -> Duration {
    remaining
        .map(|remaining| remaining.saturating_sub(duration).min(cap))
        .unwrap_or(Duration::ZERO)
}

fn input_letter(slot: SlotId) -> &'static str {
    match slot {
        SlotId::Zero => "A",
        SlotId::One => "B",
    }
}

/// Per-pixel choice between `{s}` and `{d}` as `{p}` goes from 0 to 1.
fn mix_template(kind: TransitionKind) -> &'static str {
    match kind {
        TransitionKind::Fade => "{s}*(1-{p})+{d}*{p}",
        TransitionKind::Dissolve => "if(lt(random(1),{p}),{d},{s})",
        TransitionKind::WipeLeft => "if(gte(X,W*(1-{p})),{d},{s})",
        TransitionKind::WipeRight => "if(lt(X,W*{p}),{d},{s})",
        TransitionKind::WipeUp => "if(gte(Y,H*(1-{p})),{d},{s})",
        TransitionKind::WipeDown => "if(lt(Y,H*{p}),{d},{s})",
        TransitionKind::WipeTl => "if(lt(X,W*{p})*lt(Y,H*{p}),{d},{s})",
        TransitionKind::WipeTr => "if(gte(X,W*(1-{p}))*lt(Y,H*{p}),{d},{s})",
        TransitionKind::WipeBl => "if(lt(X,W*{p})*gte(Y,H*(1-{p})),{d},{s})",
        TransitionKind::WipeBr => "if(gte(X,W*(1-{p}))*gte(Y,H*(1-{p})),{d},{s})",
        TransitionKind::CircleOpen => "if(lt(hypot(X-W/2,Y-H/2),{p}*hypot(W/2,H/2)),{d},{s})",
        TransitionKind::CircleClose => {
            "if(gt(hypot(X-W/2,Y-H/2),(1-{p})*hypot(W/2,H/2)),{d},{s})"
        }
        TransitionKind::HorzOpen => "if(lt(abs(Y-H/2),{p}*H/2),{d},{s})",
        TransitionKind::HorzClose => "if(gt(abs(Y-H/2),(1-{p})*H/2),{d},{s})",
        TransitionKind::VertOpen => "if(lt(abs(X-W/2),{p}*W/2),{d},{s})",
        TransitionKind::VertClose => "if(gt(abs(X-W/2),(1-{p})*W/2),{d},{s})",
        TransitionKind::DiagTl => "if(lt(X/W+Y/H,2*{p}),{d},{s})",
        TransitionKind::DiagTr => "if(lt((W-X)/W+Y/H,2*{p}),{d},{s})",
        TransitionKind::DiagBl => "if(lt(X/W+(H-Y)/H,2*{p}),{d},{s})",
        TransitionKind::DiagBr => "if(lt((W-X)/W+(H-Y)/H,2*{p}),{d},{s})",
        TransitionKind::Radial => "if(lt(atan2(Y-H/2,X-W/2)+PI,2*PI*{p}),{d},{s})",
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CrossfadePlan {
    pub kind: TransitionKind,
    pub duration: Duration,
    pub offset: Duration,
    pub source: SlotId,
    pub destination: SlotId,
}

impl CrossfadePlan {
    /// Blend expression for a transition that starts at `start` seconds of stream time.
    pub fn blend_expression(&self, start: Duration) -> String {
        let progress = format!(
            "st(0,clip((T-{:.3})/{:.3},0,1))",
            start.as_secs_f64(),
            self.duration.as_secs_f64()
        );
        let mix = mix_template(self.kind)
            .replace("{p}", "ld(0)")
            .replace("{s}", input_letter(self.source))
            .replace("{d}", input_letter(self.destination));
        format!("{};{}", progress, mix)
    }

    /// The interactive command that starts this plan, given how far the stream has got.
    pub fn filter_command(&self, stream_now: Duration) -> Result<String, EngineError> {
        let expression = self.blend_expression(stream_now + self.offset);
        if expression.len() > COMMAND_ARG_LIMIT {
            return Err(EngineError::FilterGraph(format!(
                "{} expression is {} bytes long",
                self.kind,
                expression.len()
            )));
        }
        Ok(format!("{} -1 all_expr {}", BLEND_TARGET, expression))
    }

    /// The command that pins the blend to the destination once the transition is over.
    pub fn settled_command(&self) -> String {
        format!(
            "{} -1 all_expr {}",
            BLEND_TARGET,
            input_letter(self.destination)
        )
    }

    /// How long the plan keeps both slots busy.
    pub fn total(&self) -> Duration {
        self.offset + self.duration
    }
}

pub struct CrossfadePlanner {
    kind: TransitionKind,
    duration: Duration,
    max_offset: Duration,
    normalize: String,
}

impl CrossfadePlanner {
    pub fn new(
        settings: &CrossfadeSettings,
        encoder: &EncoderSettings,
    ) -> Result<Self, EngineError> {
        let kind = TransitionKind::from_str(&settings.transition)
            .map_err(|err| EngineError::Unsupported(err.to_string()))?;
        let duration = settings.duration().ok_or_else(|| {
            EngineError::Unsupported(format!("crossfade duration {}", settings.duration_secs))
        })?;
        let max_offset = settings.max_offset().ok_or_else(|| {
            EngineError::Unsupported(format!(
                "crossfade max offset {}",
                settings.max_offset_secs
            ))
        })?;

        Ok(Self {
            kind,
            duration,
            max_offset,
            normalize: normalize_chain(encoder)?,
        })
    }

    pub fn kind(&self) -> TransitionKind {
        self.kind
    }

    pub fn plan(
        &self,
        remaining: Option<Duration>,
        source: SlotId,
        destination: SlotId,
    ) -> CrossfadePlan {
        CrossfadePlan {
            kind: self.kind,
            duration: self.duration,
            offset: start_offset(remaining, self.duration, self.max_offset),
            source,
            destination,
        }
    }

    /// The graph a persistent encoder starts with, showing only `active`.
    pub fn base_graph(&self, active: SlotId) -> String {
        format!(
            "[0:v]{norm}[s0];[1:v]{norm}[s1];[s0][s1]{target}=all_expr={letter}[vout]",
            norm = self.normalize,
            target = BLEND_TARGET,
            letter = input_letter(active)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn planner(transition: &str) -> CrossfadePlanner {
        let settings = CrossfadeSettings {
            transition: transition.to_string(),
            duration_secs: 2.0,
            max_offset_secs: 10.0,
        };
        CrossfadePlanner::new(&settings, &EncoderSettings::default()).unwrap()
    }

    #[test]
    fn offset_is_remaining_minus_crossfade() {
        assert_eq!(
            start_offset(
                Some(Duration::from_secs(7)),
                Duration::from_secs(2),
                Duration::from_secs(10)
            ),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn offset_never_goes_negative() {
        assert_eq!(
            start_offset(
                Some(Duration::from_millis(800)),
                Duration::from_secs(2),
                Duration::from_secs(10)
            ),
            Duration::ZERO
        );
    }

    #[test]
    fn unknown_duration_starts_now() {
        assert_eq!(
            start_offset(None, Duration::from_secs(2), Duration::from_secs(10)),
            Duration::ZERO
        );
    }

    #[test]
    fn offset_is_capped() {
        let plan = planner("fade").plan(Some(Duration::from_secs(240)), SlotId::Zero, SlotId::One);
        assert_eq!(plan.offset, Duration::from_secs(10));
        assert_eq!(plan.total(), Duration::from_secs(12));
    }

    #[test]
    fn normalize_chain_matches_output_geometry() {
        assert_eq!(
            normalize_chain(&EncoderSettings::default()).unwrap(),
            "scale=1280:720:force_original_aspect_ratio=decrease,pad=1280:720:(ow-iw)/2:(oh-ih)/2,setsar=1,fps=30,format=yuv420p"
        );
    }

    #[test]
    fn unblendable_pixel_format_is_rejected() {
        let encoder = EncoderSettings {
            pixel_format: "rgb48be".to_string(),
            ..EncoderSettings::default()
        };
        assert!(normalize_chain(&encoder).unwrap_err().is_filter_graph());
    }

    #[test]
    fn unknown_transition_is_rejected() {
        let settings = CrossfadeSettings {
            transition: "pixelize".to_string(),
            ..CrossfadeSettings::default()
        };
        let err = CrossfadePlanner::new(&settings, &EncoderSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    #[test]
    fn unrepresentable_timings_are_rejected() {
        for (duration_secs, max_offset_secs) in [(1e20, 10.0), (1.5, 1e20), (1.5, -1.0)].iter() {
            let settings = CrossfadeSettings {
                duration_secs: *duration_secs,
                max_offset_secs: *max_offset_secs,
                ..CrossfadeSettings::default()
            };
            let err = CrossfadePlanner::new(&settings, &EncoderSettings::default())
                .err()
                .unwrap();
            assert!(matches!(err, EngineError::Unsupported(_)));
        }
    }

    #[test]
    fn base_graph_normalizes_both_slots_before_blending() {
        let graph = planner("fade").base_graph(SlotId::One);
        let norm = normalize_chain(&EncoderSettings::default()).unwrap();
        assert_eq!(
            graph,
            format!(
                "[0:v]{}[s0];[1:v]{}[s1];[s0][s1]blend@xfade=all_expr=B[vout]",
                norm, norm
            )
        );
    }

    #[test]
    fn fade_command_moves_from_source_to_destination() {
        let plan = planner("fade").plan(None, SlotId::One, SlotId::Zero);
        assert_eq!(
            plan.filter_command(Duration::from_millis(61_500)).unwrap(),
            "blend@xfade -1 all_expr st(0,clip((T-61.500)/2.000,0,1));B*(1-ld(0))+A*ld(0)"
        );
        assert_eq!(plan.settled_command(), "blend@xfade -1 all_expr A");
    }

    #[test]
    fn offset_delays_the_transition_start() {
        let plan = planner("wipeleft").plan(Some(Duration::from_secs(5)), SlotId::Zero, SlotId::One);
        let command = plan.filter_command(Duration::from_secs(100)).unwrap();
        assert!(command.contains("(T-103.000)"));
    }

    #[test]
    fn every_transition_fits_an_interactive_command() {
        for kind in TransitionKind::ALL.iter() {
            let plan = planner(kind.as_str()).plan(None, SlotId::Zero, SlotId::One);
            let expression = plan.blend_expression(Duration::from_secs(86_400 * 30));
            assert!(expression.len() <= COMMAND_ARG_LIMIT, "{} too long", kind);
            assert!(!expression.contains('{'), "{} left a placeholder", kind);
            assert!(!expression.contains(' '), "{} contains a space", kind);
            assert!(plan.filter_command(Duration::from_secs(86_400 * 30)).is_ok());
        }
    }
}
