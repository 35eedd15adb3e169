//! Barge-in and explicit interruption

use std::sync::Arc;

use crate::audio::playback::PlaybackScheduler;
use crate::network::SessionTransport;
use crate::protocol::Envelope;

pub struct CancellationCoordinator {
    scheduler: Arc<PlaybackScheduler>,
    transport: Arc<SessionTransport>,
}

impl CancellationCoordinator {
    pub fn new(scheduler: Arc<PlaybackScheduler>, transport: Arc<SessionTransport>) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            transport,
        })
    }

    pub fn scheduler(&self) -> &Arc<PlaybackScheduler> {
        &self.scheduler
    }

    /// Stop local output and tell the service, once
    ///
    /// No notice is sent when nothing was playing, queued or decoding.
    pub fn cancel(&self) -> bool {
        if !self.scheduler.cancel() {
            return false;
        }
        tracing::info!("Output interrupted, notifying service");
        self.transport
            .send(&Envelope::cancel_audio(self.transport.session_id()));
        true
    }

    /// The service asked us to stop (it heard the user); no echo
    pub fn on_remote_cancel(&self) {
        if self.scheduler.cancel() {
            tracing::info!("Output cancelled by service");
        }
    }
}
