use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shipsync_core::new_id;

use crate::error::QueueError;
use crate::process::ProcessStore;
use crate::runner_unit::{Runtime, RunnerUnit};

// ---------------------------------------------------------------------------
// AsyncProcessStarter — the out-of-band dispatch contract
// ---------------------------------------------------------------------------

/// Fires a runner unit in an independent execution, without blocking the
/// caller and without propagating the unit's outcome back. Implementations
/// only fail when the hand-off itself cannot happen.
pub trait AsyncProcessStarter: Send + Sync {
    fn start(&self, unit: RunnerUnit) -> Result<(), QueueError>;
}

// ---------------------------------------------------------------------------
// In-process dispatch — embedded/host-process mode
// ---------------------------------------------------------------------------

/// Hands units to an in-process dispatcher loop over an unbounded channel.
/// Each unit still runs on its own blocking thread, so callers never wait
/// on the unit's execution.
pub struct InProcessStarter {
    tx: mpsc::UnboundedSender<RunnerUnit>,
}

impl InProcessStarter {
    /// Create the starter plus the receiver half for [`start_dispatcher`].
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunnerUnit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AsyncProcessStarter for InProcessStarter {
    fn start(&self, unit: RunnerUnit) -> Result<(), QueueError> {
        self.tx
            .send(unit)
            .map_err(|_| QueueError::Internal("unit dispatcher is not running".into()))
    }
}

/// Consume dispatched units, running each on a blocking thread.
///
/// Must be called within a Tokio runtime. Returns a token that stops the
/// loop when cancelled.
pub fn start_dispatcher(
    runtime: Arc<Runtime>,
    mut rx: mpsc::UnboundedReceiver<RunnerUnit>,
) -> CancellationToken {
    let cancel = CancellationToken::new();
    let guard = cancel.clone();

    tokio::spawn(async move {
        info!("queue unit dispatcher started");
        loop {
            tokio::select! {
                _ = guard.cancelled() => {
                    info!("queue unit dispatcher stopped");
                    break;
                }
                received = rx.recv() => {
                    match received {
                        Some(unit) => {
                            debug!(?unit, "dispatching unit");
                            let runtime = Arc::clone(&runtime);
                            tokio::task::spawn_blocking(move || runtime.execute(&unit));
                        }
                        None => {
                            info!("queue unit dispatcher channel closed");
                            break;
                        }
                    }
                }
            }
        }
    });

    cancel
}

// ---------------------------------------------------------------------------
// HTTP dispatch — stateless-web mode
// ---------------------------------------------------------------------------

/// Persists the unit under a fresh guid, then fire-and-forgets an HTTP POST
/// to `{endpoint}/{guid}`. The receiving request loads the stored unit,
/// runs it and deletes the record, so the work survives the process hop.
pub struct HttpProcessStarter {
    processes: Arc<ProcessStore>,
    endpoint: String,
    client: reqwest::Client,
    handle: tokio::runtime::Handle,
}

impl HttpProcessStarter {
    /// Must be called within a Tokio runtime; requests are spawned onto it.
    pub fn new(
        processes: Arc<ProcessStore>,
        endpoint: &str,
        request_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| QueueError::Internal(format!("http dispatch client: {e}")))?;

        Ok(Self {
            processes,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            handle: tokio::runtime::Handle::current(),
        })
    }
}

impl AsyncProcessStarter for HttpProcessStarter {
    fn start(&self, unit: RunnerUnit) -> Result<(), QueueError> {
        let guid = new_id();
        self.processes.save(&guid, &unit)?;

        let url = format!("{}/{}", self.endpoint, guid);
        let client = self.client.clone();
        self.handle.spawn(async move {
            // The far side replies as soon as it accepted the unit; the
            // response body carries nothing we need.
            match client.post(&url).send().await {
                Ok(response) => debug!(%url, status = %response.status(), "async process request sent"),
                Err(err) => warn!(%url, error = %err, "async process request failed"),
            }
        });

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Dispatch doubles shared across the crate's test modules.

    use std::sync::Mutex;

    use super::*;

    /// Records every started unit instead of executing it.
    #[derive(Default)]
    pub struct CapturingStarter {
        units: Mutex<Vec<RunnerUnit>>,
    }

    impl CapturingStarter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn started(&self) -> Vec<RunnerUnit> {
            self.units.lock().unwrap().clone()
        }

        pub fn clear(&self) {
            self.units.lock().unwrap().clear();
        }
    }

    impl AsyncProcessStarter for CapturingStarter {
        fn start(&self, unit: RunnerUnit) -> Result<(), QueueError> {
            self.units.lock().unwrap().push(unit);
            Ok(())
        }
    }

    /// Refuses every dispatch; exercises the error paths.
    pub struct FailingStarter;

    impl AsyncProcessStarter for FailingStarter {
        fn start(&self, _unit: RunnerUnit) -> Result<(), QueueError> {
            Err(QueueError::Internal("dispatch mechanism offline".into()))
        }
    }
}
