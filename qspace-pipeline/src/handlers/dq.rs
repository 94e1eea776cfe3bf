//! |Q| and d-spacing profiles.

use qspace_algorithms::{DqProfile, ProfileKind};

use crate::message::{Message, MessageKind, Profile};
use crate::router::Handler;
use crate::Result;

/// Accumulates every mapped event into 1-D |Q| and d profiles. Weighted
/// profiles are scaled by the most recent `ScaleFactor`.
#[derive(Default)]
pub struct DqHandler {
    profile: DqProfile,
    scale: Option<f64>,
}

impl DqHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn profile(&self, kind: ProfileKind, weighted: bool) -> Profile {
        Profile {
            x: DqProfile::x_values(kind),
            y: self.profile.values(kind, weighted, self.scale),
        }
    }
}

impl Handler for DqHandler {
    fn name(&self) -> &'static str {
        "dq"
    }

    fn kinds(&self) -> &'static [MessageKind] {
        &[
            MessageKind::AddEventsToHistograms,
            MessageKind::ClearHistogram,
            MessageKind::SetNewInstrument,
            MessageKind::ScaleFactor,
            MessageKind::GetQValues,
            MessageKind::GetDValues,
        ]
    }

    fn handle(&mut self, message: &Message, out: &mut Vec<Message>) -> Result<()> {
        match message {
            Message::AddEventsToHistograms(events) => self.profile.add_events(events),
            Message::ClearHistogram | Message::SetNewInstrument { .. } => self.profile.clear(),
            Message::ScaleFactor(scale) => self.scale = Some(*scale),
            Message::GetQValues { weighted } => {
                out.push(Message::SetQValues(self.profile(ProfileKind::MagQ, *weighted)));
            }
            Message::GetDValues { weighted } => {
                out.push(Message::SetDValues(self.profile(ProfileKind::DSpacing, *weighted)));
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use qspace_core::{QEventBatch, Vec3};

    #[test]
    fn test_scaled_weighted_profile() {
        let mut handler = DqHandler::new();
        let mut events = QEventBatch::default();
        events.push_weighted(Vec3::new(3.0, 4.0, 0.0), 2.0);
        let mut out = Vec::new();
        handler
            .handle(&Message::AddEventsToHistograms(events), &mut out)
            .unwrap();
        handler.handle(&Message::ScaleFactor(0.5), &mut out).unwrap();
        handler
            .handle(&Message::GetQValues { weighted: true }, &mut out)
            .unwrap();
        handler
            .handle(&Message::GetQValues { weighted: false }, &mut out)
            .unwrap();

        let [Message::SetQValues(weighted), Message::SetQValues(counts)] = &out[..] else {
            panic!("expected two profiles, got {out:?}");
        };
        assert_relative_eq!(weighted.y[2500], 1.0);
        assert_relative_eq!(counts.y[2500], 1.0);
        assert_relative_eq!(weighted.x[2500], 5.0);

        handler.handle(&Message::ClearHistogram, &mut out).unwrap();
        assert!(handler.profile(ProfileKind::MagQ, false).y.iter().all(|&v| v == 0.0));
    }
}
