//! Orientation matrix changes and lattice-aligned quick integration.

use std::sync::Arc;

use qspace_algorithms::{QuickIntegrateConfig, QuickIntegrator};
use qspace_core::OrientationMatrix;

use crate::message::{Message, MessageKind};
use crate::router::Handler;
use crate::shared::PipelineState;
use crate::{Error, Result};

/// Owns the lattice grid; rebuilt whenever a new orientation matrix is
/// accepted. Events added before the first matrix are not kept.
pub struct QuickIntegrateHandler {
    state: Arc<PipelineState>,
    config: QuickIntegrateConfig,
    integrator: Option<QuickIntegrator>,
}

impl QuickIntegrateHandler {
    #[must_use]
    pub fn new(state: Arc<PipelineState>, config: QuickIntegrateConfig) -> Self {
        Self {
            state,
            config,
            integrator: None,
        }
    }
}

impl Handler for QuickIntegrateHandler {
    fn name(&self) -> &'static str {
        "quick-integrate"
    }

    fn kinds(&self) -> &'static [MessageKind] {
        &[
            MessageKind::SetOrientationMatrix,
            MessageKind::AddEventsToHistograms,
            MessageKind::ClearHistogram,
            MessageKind::QuickIntegrate,
        ]
    }

    fn handle(&mut self, message: &Message, out: &mut Vec<Message>) -> Result<()> {
        match message {
            Message::SetOrientationMatrix(ub) => {
                let accepted = OrientationMatrix::new(*ub)
                    .map_err(|err| err.to_string())
                    .and_then(|orientation| {
                        QuickIntegrator::new(orientation, self.config.clone())
                            .map(|integrator| (orientation, integrator))
                            .map_err(|err| err.to_string())
                    });
                match accepted {
                    Ok((orientation, integrator)) => {
                        self.state.orientation.replace(Some(orientation));
                        self.integrator = Some(integrator);
                        out.push(Message::Status("orientation matrix set".to_string()));
                    }
                    Err(err) => {
                        log::warn!("orientation matrix rejected: {err}");
                        out.push(Message::LoadFailed(format!("orientation matrix: {err}")));
                    }
                }
            }
            Message::AddEventsToHistograms(events) => {
                if let Some(integrator) = self.integrator.as_mut() {
                    integrator.add_events(events);
                }
            }
            Message::ClearHistogram => {
                if let Some(integrator) = self.integrator.as_mut() {
                    integrator.clear();
                }
            }
            Message::QuickIntegrate => {
                let integrator = self.integrator.as_ref().ok_or(Error::NoOrientation)?;
                let results = integrator.integrate();
                log::info!(
                    "quick integrate: {} lattice points, I/sigma counts {:?}",
                    results.peaks.len(),
                    results.level_counts
                );
                out.push(Message::IntegrationResults(results));
            }
            _ => {}
        }
        Ok(())
    }
}
