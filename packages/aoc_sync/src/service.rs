//! SyncService: the explicitly owned entry point.
//!
//! Owns the pool, the correlator, the store and the listener hub. `start`
//! spawns the single event loop that applies every inbound snapshot and
//! control change to the [`Aggregator`], publishes the rebuilt state to the
//! store, then notifies listeners. Nothing else mutates the aggregate.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aggregate::{AggregateState, Aggregator, PipelineStat};
use crate::config::SyncConfig;
use crate::connection::InboundEvent;
use crate::correlator::{CallOptions, Correlator};
use crate::directory::AutomationServer;
use crate::error::SyncError;
use crate::hub::{ListenerHub, Subscription};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::pool::{ConnectionInfo, ConnectionPool};
use crate::protocol::{self, CreateProcess, GitopsRequest, ProcessMutation};
use crate::store::StateStore;
use crate::token::{ConnectionKey, TokenData};
use crate::topics;
use crate::transport::{Connector, QoS};

enum Control {
    /// Logged out: forget every workspace.
    Reset,
    Directory(Vec<AutomationServer>),
    Stats(Vec<PipelineStat>),
}

type LoopChannels = (
    mpsc::UnboundedReceiver<InboundEvent>,
    mpsc::UnboundedReceiver<Control>,
);

/// A fetched attachment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub file_name: String,
    pub data: Vec<u8>,
}

struct ServiceInner {
    config: SyncConfig,
    pool: Arc<ConnectionPool>,
    correlator: Correlator,
    store: Arc<StateStore>,
    hub: ListenerHub,
    metrics: Arc<SyncMetrics>,
    control: mpsc::UnboundedSender<Control>,
    /// Taken by the first `start`.
    channels: Mutex<Option<LoopChannels>>,
    cancel: CancellationToken,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

impl SyncService {
    pub fn new(config: SyncConfig, connector: Arc<dyn Connector>) -> Self {
        let metrics = Arc::new(SyncMetrics::new());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(ConnectionPool::new(
            connector,
            config.broker.clone(),
            inbound_tx,
            metrics.clone(),
        ));
        let correlator = Correlator::new(pool.clone(), metrics.clone());

        Self {
            inner: Arc::new(ServiceInner {
                config,
                pool,
                correlator,
                store: Arc::new(StateStore::new()),
                hub: ListenerHub::new(),
                metrics,
                control: control_tx,
                channels: Mutex::new(Some((inbound_rx, control_rx))),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the event loop and start the loading grace period. Calling it
    /// again is a no-op, and a stopped service stays stopped.
    pub fn start(&self) {
        let channels = self
            .inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((inbound, control)) = channels else {
            debug!("sync service already started");
            return;
        };

        tokio::spawn(run_event_loop(
            Aggregator::new(),
            inbound,
            control,
            self.inner.store.clone(),
            self.inner.hub.clone(),
            self.inner.metrics.clone(),
            self.inner.config.loading_grace,
            self.inner.cancel.clone(),
        ));
        info!(broker = %self.inner.config.broker.url, "sync service started");
    }

    /// Close every connection and stop the event loop. A stopped service
    /// opens no further connections and fails every call with `Closed`.
    pub async fn stop(&self) {
        self.inner.pool.shutdown().await;
        self.inner.cancel.cancel();
        info!("sync service stopped");
    }

    fn ensure_running(&self, key: &ConnectionKey) -> Result<(), SyncError> {
        if self.inner.cancel.is_cancelled() {
            return Err(SyncError::Closed(key.clone()));
        }
        Ok(())
    }

    /// Bring the connection pool in line with `tokens`. An empty set logs
    /// out: every connection is closed and the aggregate is emptied.
    pub async fn reconcile(&self, tokens: &[TokenData]) -> usize {
        if self.inner.cancel.is_cancelled() {
            debug!("sync service stopped, ignoring tokens");
            return 0;
        }
        if tokens.is_empty() {
            self.inner.pool.clear().await;
            let _ = self.inner.control.send(Control::Reset);
            return 0;
        }
        self.inner.pool.reconcile(tokens).await
    }

    pub fn state(&self) -> Arc<AggregateState> {
        self.inner.store.get()
    }

    /// `listener` runs on the event loop after every rebuild.
    pub fn add_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.hub.subscribe(listener)
    }

    pub fn set_automation_servers(&self, servers: Vec<AutomationServer>) {
        let _ = self.inner.control.send(Control::Directory(servers));
    }

    pub fn update_pipeline_stats(&self, stats: Vec<PipelineStat>) {
        let _ = self.inner.control.send(Control::Stats(stats));
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.pool.connections().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    fn call_options(&self) -> CallOptions {
        CallOptions {
            timeout: self.inner.config.call_timeout,
            qos: QoS::AtLeastOnce,
        }
    }

    /// Raw correlated call; see [`Correlator::call`].
    pub async fn call(
        &self,
        key: &ConnectionKey,
        request_topic: &str,
        response_topic: &str,
        payload: Vec<u8>,
        options: CallOptions,
    ) -> Result<Vec<u8>, SyncError> {
        self.ensure_running(key)?;
        self.inner
            .correlator
            .call(key, request_topic, response_topic, payload, options)
            .await
    }

    async fn gitops(
        &self,
        key: &ConnectionKey,
        request_topic: String,
        response_topic: String,
        request: &GitopsRequest,
    ) -> Result<Vec<u8>, SyncError> {
        let payload = protocol::encode(&request_topic, request)?;
        self.call(key, &request_topic, &response_topic, payload, self.call_options())
            .await
    }

    pub async fn get_process_content(
        &self,
        key: &ConnectionKey,
        process_id: &str,
    ) -> Result<String, SyncError> {
        topics::validate_segment(process_id)?;
        let response_topic = topics::process_contents(process_id);
        let bytes = self
            .gitops(
                key,
                topics::process_request(process_id),
                response_topic.clone(),
                &GitopsRequest::Get,
            )
            .await?;
        String::from_utf8(bytes).map_err(|e| SyncError::protocol(&response_topic, e))
    }

    /// Save a process document. Completes when the workspace echoes the
    /// saved content back.
    pub async fn set_process_content(
        &self,
        key: &ConnectionKey,
        process_id: &str,
        content: &str,
    ) -> Result<(), SyncError> {
        topics::validate_segment(process_id)?;
        self.gitops(
            key,
            topics::process_request(process_id),
            topics::process_contents(process_id),
            &GitopsRequest::set_content(content),
        )
        .await
        .map(drop)
    }

    /// Fetch an attachment. The response payload is the file's raw bytes.
    pub async fn get_process_attachment(
        &self,
        key: &ConnectionKey,
        process_id: &str,
        file_name: &str,
    ) -> Result<Attachment, SyncError> {
        topics::validate_segment(process_id)?;
        topics::validate_segment(file_name)?;
        let data = self
            .gitops(
                key,
                topics::attachment_request(process_id, file_name),
                topics::attachment_contents(process_id, file_name),
                &GitopsRequest::Get,
            )
            .await?;
        Ok(Attachment {
            file_name: file_name.to_string(),
            data,
        })
    }

    /// Store an attachment. Outbound content travels base64-encoded in the
    /// request's `data` field.
    pub async fn set_process_attachment(
        &self,
        key: &ConnectionKey,
        process_id: &str,
        file_name: &str,
        data: &[u8],
    ) -> Result<(), SyncError> {
        topics::validate_segment(process_id)?;
        topics::validate_segment(file_name)?;
        self.gitops(
            key,
            topics::attachment_request(process_id, file_name),
            topics::attachment_contents(process_id, file_name),
            &GitopsRequest::set_data(STANDARD.encode(data)),
        )
        .await
        .map(drop)
    }

    /// Read `path` and store it as an attachment named after the file.
    pub async fn upload_process_attachment(
        &self,
        key: &ConnectionKey,
        process_id: &str,
        path: &Path,
    ) -> Result<String, SyncError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SyncError::InvalidSegment(path.display().to_string()))?
            .to_string();
        let data = tokio::fs::read(path).await?;
        self.set_process_attachment(key, process_id, &file_name, &data)
            .await?;
        Ok(file_name)
    }

    pub async fn delete_process_attachment(
        &self,
        key: &ConnectionKey,
        process_id: &str,
        file_name: &str,
    ) -> Result<(), SyncError> {
        topics::validate_segment(process_id)?;
        topics::validate_segment(file_name)?;
        self.gitops(
            key,
            topics::attachment_request(process_id, file_name),
            topics::attachment_contents(process_id, file_name),
            &GitopsRequest::Delete,
        )
        .await
        .map(drop)
    }

    /// Ask the workspace to create a process. Returns the generated id; the
    /// process itself shows up with the next process snapshot.
    pub async fn create_process(&self, key: &ConnectionKey, name: &str) -> Result<String, SyncError> {
        self.ensure_running(key)?;
        let process_id = uuid::Uuid::new_v4().to_string();
        let topic = topics::process_create(&process_id);
        let payload = protocol::encode(&topic, &CreateProcess { name })?;
        self.inner
            .correlator
            .fire(key, &topic, payload, QoS::AtMostOnce)
            .await?;
        info!(workspace = %key, process = %process_id, "process creation requested");
        Ok(process_id)
    }

    /// Ask the workspace to delete a process. Confirmed by the next process
    /// snapshot.
    pub async fn delete_process(&self, key: &ConnectionKey, process_id: &str) -> Result<(), SyncError> {
        self.ensure_running(key)?;
        topics::validate_segment(process_id)?;
        let topic = topics::process_set(process_id);
        let payload = protocol::encode(&topic, &ProcessMutation::Delete)?;
        self.inner
            .correlator
            .fire(key, &topic, payload, QoS::AtMostOnce)
            .await
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_event_loop(
    mut aggregator: Aggregator,
    mut inbound: mpsc::UnboundedReceiver<InboundEvent>,
    mut control: mpsc::UnboundedReceiver<Control>,
    store: Arc<StateStore>,
    hub: ListenerHub,
    metrics: Arc<SyncMetrics>,
    loading_grace: Duration,
    cancel: CancellationToken,
) {
    let grace = tokio::time::sleep(loading_grace);
    tokio::pin!(grace);
    let mut grace_pending = true;

    loop {
        // Inbound before control: a reset must not be overtaken by a snapshot
        // that was sent before it.
        let changed = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(event) = inbound.recv() => {
                aggregator.apply(event);
                true
            }
            Some(change) = control.recv() => {
                match change {
                    Control::Reset => aggregator.clear(),
                    Control::Directory(servers) => aggregator.set_directory(servers),
                    Control::Stats(stats) => aggregator.set_pipeline_stats(stats),
                }
                true
            }
            _ = &mut grace, if grace_pending => {
                grace_pending = false;
                let expired = aggregator.loading_grace_elapsed();
                if expired {
                    info!("no workspace data within the loading grace period");
                }
                expired
            }
            else => break,
        };

        if changed {
            store.replace(aggregator.state());
            metrics.state_rebuilt();
            hub.notify();
        }
    }

    debug!("sync event loop stopped");
}
