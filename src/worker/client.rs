//! Request/response client over a worker's stdio.
//!
//! [`WorkerClient::start`] spawns a reader task and a writer task. Each call
//! registers a oneshot sender under a fresh request id; the reader resolves
//! it when the matching response line arrives. When the inbound stream ends
//! the `disconnected` token fires and every outstanding call fails with
//! [`RemoteError::Dead`].

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::sdk::{
    ClientDataUpdate, LoadRequest, SandboxedSdk, SurfacePackage, SurfaceParams,
};
use crate::sandbox::{BoxFuture, LoadedSdk, RemoteError, SandboxConnection, SdkLink};
use crate::worker::codec::WorkerCodec;
use crate::worker::protocol::{
    self, SurfaceRequestParams, UnloadParams, METHOD_LOAD, METHOD_SURFACE, METHOD_SYNC,
    METHOD_UNLOAD,
};
use crate::AppError;

type CallResult = std::result::Result<Value, RemoteError>;

/// Outstanding calls keyed by request id.
type PendingCalls = Arc<Mutex<HashMap<String, oneshot::Sender<CallResult>>>>;

/// Outbound queue depth.
const OUTBOUND_CAPACITY: usize = 64;

/// Correlating client for one worker connection.
pub struct WorkerClient {
    label: String,
    outbound: mpsc::Sender<String>,
    pending: PendingCalls,
    disconnected: CancellationToken,
}

impl WorkerClient {
    /// Start the reader and writer tasks over `reader` / `writer`.
    ///
    /// `disconnected` is cancelled when either direction fails or the
    /// inbound stream ends; cancelling it externally shuts both tasks down.
    pub fn start<R, W>(
        label: impl Into<String>,
        reader: R,
        writer: W,
        disconnected: CancellationToken,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label = label.into();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(run_reader(
            label.clone(),
            reader,
            Arc::clone(&pending),
            disconnected.clone(),
        ));
        tokio::spawn(run_writer(
            label.clone(),
            writer,
            outbound_rx,
            disconnected.clone(),
        ));

        Arc::new(Self {
            label,
            outbound,
            pending,
            disconnected,
        })
    }

    /// Whether the connection has dropped.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.is_cancelled()
    }

    /// Send `method` with `params` and wait for the response.
    ///
    /// # Errors
    ///
    /// - [`RemoteError::Dead`] if the connection is or becomes disconnected.
    /// - [`RemoteError::Transport`] if the request cannot be serialised.
    /// - [`RemoteError::Rejected`] if the worker answers with an error.
    pub async fn call(&self, method: &str, params: Value) -> CallResult {
        if self.is_disconnected() {
            return Err(RemoteError::Dead);
        }

        let id = Uuid::new_v4().to_string();
        let line = protocol::encode_request(&id, method, &params)
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        // The reader drains the map only after cancelling, so a call that
        // registered before the check is always drained or sees the cancel.
        if self.is_disconnected() || self.outbound.send(line).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RemoteError::Dead);
        }

        debug!(worker = %self.label, method, request_id = %id, "worker call sent");
        rx.await.unwrap_or(Err(RemoteError::Dead))
    }
}

/// [`SandboxConnection`] backed by a [`WorkerClient`].
#[derive(Clone)]
pub struct WorkerConnection {
    client: Arc<WorkerClient>,
}

impl WorkerConnection {
    /// Wrap a started client.
    #[must_use]
    pub fn new(client: Arc<WorkerClient>) -> Self {
        Self { client }
    }
}

impl SandboxConnection for WorkerConnection {
    fn load_sdk(
        &self,
        request: LoadRequest,
    ) -> BoxFuture<'_, std::result::Result<LoadedSdk, RemoteError>> {
        Box::pin(async move {
            let params = serde_json::to_value(&request)
                .map_err(|e| RemoteError::Transport(format!("failed to encode load: {e}")))?;
            let value = self.client.call(METHOD_LOAD, params).await?;
            let sdk: SandboxedSdk = serde_json::from_value(value)
                .map_err(|e| RemoteError::Transport(format!("invalid load result: {e}")))?;
            let link: Arc<dyn SdkLink> = Arc::new(WorkerSdkLink {
                client: Arc::clone(&self.client),
                sdk_name: sdk.sdk_name.clone(),
            });
            Ok(LoadedSdk { sdk, link })
        })
    }

    fn unload_sdk(&self, sdk_name: &str) -> BoxFuture<'_, std::result::Result<(), RemoteError>> {
        let request = UnloadParams {
            sdk_name: sdk_name.to_owned(),
        };
        Box::pin(async move {
            let params = serde_json::to_value(&request)
                .map_err(|e| RemoteError::Transport(format!("failed to encode unload: {e}")))?;
            self.client.call(METHOD_UNLOAD, params).await?;
            Ok(())
        })
    }

    fn sync_data(
        &self,
        update: ClientDataUpdate,
    ) -> BoxFuture<'_, std::result::Result<(), RemoteError>> {
        Box::pin(async move {
            let params = serde_json::to_value(&update)
                .map_err(|e| RemoteError::Transport(format!("failed to encode sync: {e}")))?;
            self.client.call(METHOD_SYNC, params).await?;
            Ok(())
        })
    }
}

struct WorkerSdkLink {
    client: Arc<WorkerClient>,
    sdk_name: String,
}

impl SdkLink for WorkerSdkLink {
    fn request_surface_package(
        &self,
        params: SurfaceParams,
    ) -> BoxFuture<'_, std::result::Result<SurfacePackage, RemoteError>> {
        Box::pin(async move {
            let request = SurfaceRequestParams {
                sdk_name: self.sdk_name.clone(),
                surface: params,
            };
            let params = serde_json::to_value(&request)
                .map_err(|e| RemoteError::Transport(format!("failed to encode surface: {e}")))?;
            let value = self.client.call(METHOD_SURFACE, params).await?;
            serde_json::from_value(value)
                .map_err(|e| RemoteError::Transport(format!("invalid surface result: {e}")))
        })
    }
}

// ── Tasks ────────────────────────────────────────────────────────────────────

async fn run_reader<R>(
    label: String,
    reader: R,
    pending: PendingCalls,
    disconnected: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(reader, WorkerCodec::new());

    loop {
        tokio::select! {
            biased;

            () = disconnected.cancelled() => {
                debug!(worker = %label, "worker reader: disconnected, stopping");
                break;
            }

            item = framed.next() => match item {
                None => {
                    debug!(worker = %label, "worker reader: EOF");
                    break;
                }
                Some(Err(AppError::Protocol(msg))) => {
                    warn!(worker = %label, error = %msg, "worker reader: framing error, skipping");
                }
                Some(Err(err)) => {
                    warn!(worker = %label, error = %err, "worker reader: stream error, stopping");
                    break;
                }
                Some(Ok(line)) => match protocol::parse_response_line(&line) {
                    Ok(Some(response)) => dispatch(&label, &pending, response).await,
                    Ok(None) => {}
                    Err(err) => {
                        warn!(worker = %label, error = %err, raw_line = %line, "worker reader: skipping line");
                    }
                },
            }
        }
    }

    disconnected.cancel();
    let orphaned: Vec<_> = pending.lock().await.drain().map(|(_, tx)| tx).collect();
    for tx in orphaned {
        let _ = tx.send(Err(RemoteError::Dead));
    }
}

async fn dispatch(label: &str, pending: &PendingCalls, response: protocol::ResponseEnvelope) {
    let Some(tx) = pending.lock().await.remove(&response.id) else {
        debug!(worker = %label, request_id = %response.id, "response for unknown request");
        return;
    };
    let outcome = response.into_outcome().map_err(RemoteError::Rejected);
    if tx.send(outcome).is_err() {
        debug!(worker = %label, "caller stopped waiting for response");
    }
}

async fn run_writer<W>(
    label: String,
    writer: W,
    mut outbound_rx: mpsc::Receiver<String>,
    disconnected: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut framed = FramedWrite::new(writer, WorkerCodec::new());

    loop {
        tokio::select! {
            biased;

            () = disconnected.cancelled() => {
                debug!(worker = %label, "worker writer: disconnected, stopping");
                break;
            }

            line = outbound_rx.recv() => {
                let Some(line) = line else {
                    debug!(worker = %label, "worker writer: channel closed, stopping");
                    break;
                };
                if let Err(err) = framed.send(line).await {
                    warn!(worker = %label, error = %err, "worker writer: send failed");
                    disconnected.cancel();
                    break;
                }
            }
        }
    }
}
