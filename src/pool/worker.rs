//! Background flush worker.
//!
//! `trigger()` must never block the caller, so flush requests are handed to a
//! dedicated thread over a bounded channel of capacity one. While a request
//! is queued further requests collapse into it: the queued flush will pick up
//! every event appended in the meantime anyway.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender, TrySendError};
use tracing::{debug, error, trace, warn};

use super::flush::PoolCore;

/// Result of posting a flush request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushRequest {
    /// The worker will run a flush.
    Queued,
    /// A flush was already queued; this request merged into it.
    Collapsed,
    /// The worker has stopped; nothing will run.
    Stopped,
}

pub(crate) struct FlushWorker {
    tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl FlushWorker {
    pub(crate) fn start(name: &str, core: Arc<PoolCore>) -> io::Result<Self> {
        let (tx, rx) = bounded::<()>(1);
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            // Exits once every sender is dropped.
            for () in rx.iter() {
                match core.trigger_source() {
                    Ok(last_action_time) => {
                        trace!(last_action_time, "background flush finished");
                    }
                    Err(err) if err.is_retryable() => {
                        warn!(error = %err, "background flush failed, events stay queued");
                    }
                    Err(err) => {
                        error!(error = %err, "background flush failed");
                    }
                }
            }
            debug!("flush worker exiting");
        })?;
        Ok(Self { tx, handle })
    }

    pub(crate) fn request(&self) -> FlushRequest {
        match self.tx.try_send(()) {
            Ok(()) => FlushRequest::Queued,
            Err(TrySendError::Full(())) => FlushRequest::Collapsed,
            Err(TrySendError::Disconnected(())) => FlushRequest::Stopped,
        }
    }

    /// Closes the channel and joins the thread. A queued request still runs first.
    pub(crate) fn shutdown(self) {
        drop(self.tx);
        if self.handle.join().is_err() {
            error!("flush worker panicked");
        }
    }
}
