//! Call service orchestration
//!
//! [`CallService`] is the handle presentation code talks to. It forwards
//! user commands to the call manager task and exposes the current call as
//! a watchable [`CallSnapshot`] plus a stream of [`CallEvent`]s.

use crate::call::{CallConfig, CallError, CallManager, Command};
use crate::identity::CallIdentity;
use crate::media::{CaptureDevice, MediaGuard};
use crate::negotiation::PeerSessionFactory;
use crate::signaling::{CallDirectory, SignalingHandler, SignalingTransport};
use crate::types::{CallEvent, CallId, CallSnapshot, MediaConstraints, MediaType};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const COMMAND_QUEUE: usize = 32;

/// Handle to a running call manager
///
/// Cheap to clone; every clone talks to the same call slot.
#[derive(Clone)]
pub struct CallService {
    local: CallIdentity,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CallService {
    /// Create a builder for the given local identity
    #[must_use]
    pub fn builder(local: impl Into<CallIdentity>) -> CallServiceBuilder {
        CallServiceBuilder::new(local)
    }

    /// Local identity
    #[must_use]
    pub fn local(&self) -> &CallIdentity {
        &self.local
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, CallError>>) -> Command,
    ) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CallError::ServiceStopped)?;
        rx.await.map_err(|_| CallError::ServiceStopped)?
    }

    /// Call `remote` with the configured default media
    ///
    /// Calling the party whose invite is pending accepts that invite.
    ///
    /// # Errors
    ///
    /// Returns error if a call is already in progress or `remote` is the
    /// local identity
    #[tracing::instrument(skip(self), fields(peer = %remote))]
    pub async fn place_call(&self, remote: CallIdentity) -> Result<CallId, CallError> {
        self.request(|reply| Command::PlaceCall {
            remote,
            constraints: None,
            reply,
        })
        .await
    }

    /// Call `remote` with explicit media constraints
    ///
    /// # Errors
    ///
    /// Returns error if a call is already in progress or `remote` is the
    /// local identity
    #[tracing::instrument(skip(self, constraints), fields(peer = %remote))]
    pub async fn place_call_with(
        &self,
        remote: CallIdentity,
        constraints: MediaConstraints,
    ) -> Result<CallId, CallError> {
        self.request(|reply| Command::PlaceCall {
            remote,
            constraints: Some(constraints),
            reply,
        })
        .await
    }

    /// Accept the pending incoming call
    ///
    /// # Errors
    ///
    /// Returns error if no invite is pending
    pub async fn accept_incoming(&self) -> Result<CallId, CallError> {
        self.request(|reply| Command::AcceptIncoming { reply }).await
    }

    /// Decline the pending incoming call
    ///
    /// # Errors
    ///
    /// Returns error if no invite is pending
    pub async fn decline_incoming(&self) -> Result<(), CallError> {
        self.request(|reply| Command::DeclineIncoming { reply }).await
    }

    /// End the current call, whatever its state
    ///
    /// # Errors
    ///
    /// Returns error if there is no active call
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    /// Mute/unmute the microphone or turn the camera off/on
    ///
    /// Returns `true` if a track changed.
    ///
    /// # Errors
    ///
    /// Returns error if there is no active call holding local media
    pub async fn toggle_track(&self, kind: MediaType, enabled: bool) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleTrack {
            kind,
            enabled,
            reply,
        })
        .await
    }

    /// Current call snapshot
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch the call snapshot
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// End any active call and stop the call manager
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Call manager task did not finish cleanly");
            }
        }
    }
}

/// Call service builder
pub struct CallServiceBuilder {
    local: CallIdentity,
    signaling: Option<Arc<dyn SignalingTransport>>,
    directory: Option<Arc<dyn CallDirectory>>,
    capture: Option<Arc<dyn CaptureDevice>>,
    peers: Option<Arc<dyn PeerSessionFactory>>,
    config: CallConfig,
}

impl CallServiceBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(local: impl Into<CallIdentity>) -> Self {
        Self {
            local: local.into(),
            signaling: None,
            directory: None,
            capture: None,
            peers: None,
            config: CallConfig::default(),
        }
    }

    /// Set the signaling relay
    #[must_use]
    pub fn with_signaling(mut self, transport: Arc<dyn SignalingTransport>) -> Self {
        self.signaling = Some(transport);
        self
    }

    /// Set the directory backend for call intent/end notifications
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn CallDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Set the capture device
    #[must_use]
    pub fn with_capture_device(mut self, device: Arc<dyn CaptureDevice>) -> Self {
        self.capture = Some(device);
        self
    }

    /// Set the peer session factory
    #[must_use]
    pub fn with_peer_factory(mut self, factory: Arc<dyn PeerSessionFactory>) -> Self {
        self.peers = Some(factory);
        self
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribe to signaling and start the call manager
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if a component is missing or the signaling
    /// subscription fails
    #[tracing::instrument(skip(self), fields(identity = %self.local))]
    pub async fn build(self) -> Result<CallService, CallError> {
        let transport = self
            .signaling
            .ok_or_else(|| CallError::ConfigError("signaling transport not set".to_string()))?;
        let capture = self
            .capture
            .ok_or_else(|| CallError::ConfigError("capture device not set".to_string()))?;
        let peers = self
            .peers
            .ok_or_else(|| CallError::ConfigError("peer session factory not set".to_string()))?;

        let mut handler =
            SignalingHandler::new(transport).with_retry_backoff(self.config.retry_backoff);
        if let Some(directory) = self.directory {
            handler = handler.with_directory(directory);
        }
        let handler = Arc::new(handler);
        let envelopes = handler.subscribe(&self.local).await?;

        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::idle(self.local.clone()));
        let (events_tx, _) = broadcast::channel(self.config.event_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);

        let (manager, inbox) = CallManager::new(
            self.local.clone(),
            self.config,
            handler,
            MediaGuard::new(capture),
            peers,
            snapshot_tx,
            events_tx.clone(),
        );
        let task = tokio::spawn(manager.run(command_rx, envelopes, inbox));

        tracing::info!("Call service started");
        Ok(CallService {
            local: self.local,
            commands: command_tx,
            snapshot: snapshot_rx,
            events: events_tx,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}
