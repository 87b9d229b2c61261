// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Progress reporting.

use {
    crate::error::Stage,
    log::{info, warn},
    std::path::PathBuf,
    tokio::sync::mpsc::UnboundedSender,
};

/// Something that happened while re-signing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SigningEvent {
    StageStarted(Stage),
    LayerStarted { index: usize, size: usize },
    SigningStarted { path: PathBuf },
    Retrying { path: PathBuf, attempt: u32, message: String },
    Signed { path: PathBuf },
    Verified { path: PathBuf },
    /// A failure that was ignored per configuration.
    Warning(String),
    Finished { output: PathBuf },
}

/// Receives [SigningEvent]s.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &SigningEvent);
}

/// Forwards events to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogListener;

impl EventListener for LogListener {
    fn on_event(&self, event: &SigningEvent) {
        match event {
            SigningEvent::StageStarted(stage) => info!("{}", stage),
            SigningEvent::LayerStarted { index, size } => {
                info!("signing layer {} ({} files)", index, size)
            }
            SigningEvent::SigningStarted { path } => warn!("signing {}", path.display()),
            SigningEvent::Retrying {
                path,
                attempt,
                message,
            } => warn!(
                "retrying {} (attempt {}): {}",
                path.display(),
                attempt,
                message
            ),
            SigningEvent::Signed { path } => info!("signed {}", path.display()),
            SigningEvent::Verified { path } => info!("verified {}", path.display()),
            SigningEvent::Warning(message) => warn!("warning: {}", message),
            SigningEvent::Finished { output } => warn!("wrote {}", output.display()),
        }
    }
}

/// Sends events over a channel. A closed channel drops events.
impl EventListener for UnboundedSender<SigningEvent> {
    fn on_event(&self, event: &SigningEvent) {
        let _ = self.send(event.clone());
    }
}
