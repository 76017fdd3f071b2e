//! Out-of-band frame completion.
//!
//! Engines that finish frames asynchronously (for example after a DMA
//! transfer) report them through a [`CompletionSender`]. A tokio task drains
//! the channel and retires each frame on the multiplexer.

use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::frame::FrameId;
use super::multiplexer::Multiplexer;
use crate::error::{MuxError, Result};

/// Counters returned by the listener task when the channel closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionStats {
    /// Frames retired.
    pub completed: u64,
    /// Ids completed twice or unknown to the multiplexer.
    pub rejected: u64,
}

/// Cloneable handle feeding the completion task.
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: mpsc::UnboundedSender<FrameId>,
}

impl CompletionSender {
    pub fn complete(&self, id: FrameId) -> Result<()> {
        self.tx.send(id).map_err(|_| MuxError::Disconnected)
    }

    pub fn complete_all(&self, ids: impl IntoIterator<Item = FrameId>) -> Result<()> {
        ids.into_iter().try_for_each(|id| self.complete(id))
    }
}

/// Spawns the completion task on the current tokio runtime.
///
/// The task ends once every sender is dropped or the multiplexer disconnects.
pub fn spawn_completion_listener(
    mux: Arc<Multiplexer>,
) -> (CompletionSender, JoinHandle<CompletionStats>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<FrameId>();
    let handle = tokio::spawn(async move {
        let mut stats = CompletionStats::default();
        while let Some(id) = rx.recv().await {
            match mux.complete(id) {
                Ok(()) => stats.completed += 1,
                Err(MuxError::Disconnected) => {
                    debug!("multiplexer gone, stopping completion listener");
                    break;
                }
                Err(e) => {
                    warn!("completion of {} failed: {}", id, e);
                    stats.rejected += 1;
                }
            }
        }
        stats
    });
    (CompletionSender { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MuxConfig;
    use crate::format::ts::SoftwareTsEngine;

    #[test]
    fn test_listener_stops_when_multiplexer_disconnects() {
        let mux = Arc::new(
            Multiplexer::new(MuxConfig::default(), Box::new(SoftwareTsEngine::new())).unwrap(),
        );
        mux.shutdown();

        tokio_test::block_on(async {
            let (sender, task) = spawn_completion_listener(Arc::clone(&mux));
            sender.complete(FrameId(7)).unwrap();
            let stats = task.await.unwrap();
            assert_eq!(stats, CompletionStats::default());
            assert!(matches!(
                sender.complete(FrameId(8)),
                Err(MuxError::Disconnected)
            ));
        });
    }
}
