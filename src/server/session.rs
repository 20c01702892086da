//! Per-client session
//!
//! A [`Session`] owns the capture → encode pipeline, the input dispatcher and
//! the authenticated connection. [`Session::run`] is a single task
//! multiplexing client events, encoded updates and control commands until
//! the connection closes, the server stops or the session is handed over.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{CloseReason, ServerRuntime};
use crate::backend::clamp_geometry;
use crate::capture::{CaptureError, CaptureManager};
use crate::config::Config;
use crate::encoder::{EncodeError, EncodedUpdate, EncodingManager, EncodingMode, EncodingOptions};
use crate::handover::{self, HandoverError};
use crate::input::{InputDispatcher, InputError};
use crate::protocol::{ClientEvent, ProtocolError, RdpConnection};

/// Session setup failures
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Capture could not start
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Input injection could not start
    #[error(transparent)]
    Input(#[from] InputError),

    /// Encoder could not start
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// A blocking setup task panicked or was cancelled
    #[error("session task failed: {0}")]
    Join(String),
}

/// Geometry, encoding and sequence state of a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Capture width (0 = desktop width)
    pub width: u32,
    /// Capture height (0 = desktop height)
    pub height: u32,
    /// Bitmap encoding
    pub mode: EncodingMode,
    /// Differential updates
    pub enable_frame_diff: bool,
    /// Sequence number of the next update
    pub next_sequence: u64,
}

impl SessionSettings {
    /// Settings for a new client; a zero in `requested` falls back to the
    /// configured capture size
    pub fn from_config(config: &Config, requested: (u32, u32)) -> Self {
        let pick = |client: u32, configured: u32| if client != 0 { client } else { configured };
        Self {
            width: pick(requested.0, config.capture.width),
            height: pick(requested.1, config.capture.height),
            mode: config.encoding.mode,
            enable_frame_diff: config.encoding.frame_diff,
            next_sequence: 0,
        }
    }

    fn encoding_options(&self) -> EncodingOptions {
        EncodingOptions::new(self.width, self.height, self.mode, self.enable_frame_diff)
    }
}

/// Control messages for a running session
#[derive(Debug)]
pub enum SessionCommand {
    /// Close the connection and tear down
    Stop,
    /// Move the live connection to the handover daemon at `target`
    HandOver {
        /// Daemon socket
        target: PathBuf,
        /// Outcome; on error the session keeps serving
        reply: oneshot::Sender<Result<(), HandoverError>>,
    },
}

/// Per-session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Updates written to the client
    pub updates_sent: u64,
    /// Input events received
    pub input_events: u64,
    /// Input events the injector rejected
    pub input_failures: u64,
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnd {
    /// Why it ended
    pub reason: CloseReason,
    /// Final counters
    pub stats: SessionStats,
}

/// Capture, encode and input components of one session
struct Pipeline {
    capture: Arc<CaptureManager>,
    encoder: Arc<EncodingManager>,
    input: Arc<InputDispatcher>,
    updates: mpsc::Receiver<EncodedUpdate>,
    settings: SessionSettings,
}

impl Pipeline {
    async fn start(runtime: &Arc<ServerRuntime>, settings: SessionSettings) -> Result<Self, SessionError> {
        let runtime = Arc::clone(runtime);
        tokio::task::spawn_blocking(move || Self::start_blocking(&runtime, settings))
            .await
            .map_err(|e| SessionError::Join(e.to_string()))?
    }

    fn start_blocking(runtime: &ServerRuntime, mut settings: SessionSettings) -> Result<Self, SessionError> {
        let config = runtime.config();
        let desktop = runtime.desktop();
        let (width, height) =
            clamp_geometry((settings.width, settings.height), desktop.desktop_size());

        let capture = Arc::new(CaptureManager::new(
            Arc::clone(desktop),
            config.capture.target_fps,
        ));
        let (width, height) = capture.start(width, height)?;
        settings.width = width;
        settings.height = height;

        let input = Arc::new(InputDispatcher::new(Arc::clone(desktop)));
        if let Err(e) = input.start() {
            capture.stop();
            return Err(e.into());
        }
        input.update_desktop_size(width, height);

        let encoder = Arc::new(EncodingManager::new(settings.encoding_options()));
        encoder.set_raw_tile_size(config.encoding.tile_size);
        encoder.set_next_sequence(settings.next_sequence);

        let (sink, updates) = mpsc::channel(config.server.update_queue_depth);
        let started = match capture.queue() {
            Some(queue) => encoder.start().and_then(|()| encoder.spawn_pump(queue, sink)),
            None => Err(EncodeError::NotRunning),
        };
        if let Err(e) = started {
            encoder.stop();
            input.stop();
            capture.stop();
            return Err(e.into());
        }

        Ok(Self {
            capture,
            encoder,
            input,
            updates,
            settings,
        })
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(u32, u32), SessionError> {
        let (width, height) = self.capture.set_geometry(width, height)?;
        self.settings.width = width;
        self.settings.height = height;
        self.encoder.set_options(self.settings.encoding_options());
        self.input.update_desktop_size(width, height);
        Ok((width, height))
    }

    /// Stop production and flush every encoded update to the client
    ///
    /// On return the pipeline is fully stopped and `settings.next_sequence`
    /// is the sequence the next update must carry, even if flushing failed.
    async fn pause(&mut self, connection: &mut dyn RdpConnection) -> Result<(), ProtocolError> {
        let capture = Arc::clone(&self.capture);
        run_blocking(move || capture.stop()).await;

        let mut flushed = Ok(());
        while let Some(update) = self.updates.recv().await {
            if flushed.is_ok() {
                flushed = connection.send_update(&update).await;
            }
        }

        let encoder = Arc::clone(&self.encoder);
        let input = Arc::clone(&self.input);
        run_blocking(move || {
            encoder.stop();
            input.stop();
        })
        .await;

        self.settings.next_sequence = self.encoder.next_sequence();
        flushed
    }

    async fn shutdown(self) {
        let Pipeline {
            capture,
            encoder,
            input,
            updates,
            ..
        } = self;
        drop(updates);
        run_blocking(move || {
            capture.stop();
            encoder.stop();
            input.stop();
        })
        .await;
    }
}

async fn run_blocking<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Err(e) = tokio::task::spawn_blocking(f).await {
        error!("Blocking session task failed: {}", e);
    }
}

/// One client, its pipeline and its connection
pub struct Session {
    runtime: Arc<ServerRuntime>,
    connection: Box<dyn RdpConnection>,
    pipeline: Pipeline,
}

impl Session {
    /// Start capture, input and encoding for an authenticated connection
    ///
    /// The connection is dropped if the pipeline cannot start.
    pub async fn start(
        runtime: Arc<ServerRuntime>,
        connection: Box<dyn RdpConnection>,
        settings: SessionSettings,
    ) -> Result<Self, SessionError> {
        let pipeline = Pipeline::start(&runtime, settings).await?;
        info!(
            "Session for '{}' started at {}x{} ({}, sequence {})",
            connection.username(),
            pipeline.settings.width,
            pipeline.settings.height,
            pipeline.settings.mode,
            pipeline.settings.next_sequence
        );
        Ok(Self {
            runtime,
            connection,
            pipeline,
        })
    }

    /// Authenticated user
    pub fn username(&self) -> &str {
        self.connection.username()
    }

    /// Current settings (geometry after clamping)
    pub fn settings(&self) -> SessionSettings {
        self.pipeline.settings
    }

    /// Stop the pipeline and drop the connection without serving
    pub async fn shutdown(self) {
        self.pipeline.shutdown().await;
    }

    /// Serve until the connection closes or a command ends the session
    pub async fn run(self, mut control: mpsc::Receiver<SessionCommand>) -> SessionEnd {
        let Session {
            runtime,
            mut connection,
            mut pipeline,
        } = self;
        let mut stats = SessionStats::default();

        let reason = loop {
            let step = tokio::select! {
                event = connection.next_event() => Step::Client(event),
                update = pipeline.updates.recv() => Step::Update(update),
                command = control.recv() => Step::Command(command),
            };

            match step {
                Step::Client(Ok(Some(ClientEvent::Input(event)))) => {
                    stats.input_events += 1;
                    if let Err(e) = pipeline.input.dispatch(&event) {
                        stats.input_failures += 1;
                        warn!("Input event dropped: {}", e);
                    }
                }
                Step::Client(Ok(Some(ClientEvent::RefreshRequest))) => {
                    debug!("Client requested refresh");
                    pipeline.encoder.invalidate();
                }
                Step::Client(Ok(Some(ClientEvent::Resize { width, height }))) => {
                    match pipeline.resize(width, height) {
                        Ok((w, h)) => info!("Session resized to {}x{}", w, h),
                        Err(e) => warn!("Resize to {}x{} refused: {}", width, height, e),
                    }
                }
                Step::Client(Ok(None)) => break CloseReason::ClientDisconnected,
                Step::Client(Err(e)) => break CloseReason::from(&e),
                Step::Update(Some(update)) => {
                    if let Err(e) = connection.send_update(&update).await {
                        break CloseReason::from(&e);
                    }
                    stats.updates_sent += 1;
                }
                Step::Update(None) => {
                    break CloseReason::Internal("encoder stopped unexpectedly".into())
                }
                Step::Command(Some(SessionCommand::Stop)) | Step::Command(None) => {
                    break CloseReason::Shutdown
                }
                Step::Command(Some(SessionCommand::HandOver { target, reply })) => {
                    match hand_over(&runtime, connection, pipeline, &target).await {
                        HandoverOutcome::Transferred => {
                            let _ = reply.send(Ok(()));
                            return SessionEnd {
                                reason: CloseReason::HandedOver,
                                stats,
                            };
                        }
                        HandoverOutcome::Resumed {
                            connection: resumed,
                            pipeline: restarted,
                            error,
                        } => {
                            warn!("Handover to {:?} failed, still serving: {}", target, error);
                            connection = resumed;
                            pipeline = restarted;
                            let _ = reply.send(Err(error));
                        }
                        HandoverOutcome::Lost { error, reason } => {
                            error!("Session lost during handover: {}", error);
                            let _ = reply.send(Err(error));
                            return SessionEnd { reason, stats };
                        }
                    }
                }
            }
        };

        pipeline.shutdown().await;
        drop(connection);

        info!(
            "Session ended: {} ({} updates, {} input events)",
            reason, stats.updates_sent, stats.input_events
        );
        SessionEnd { reason, stats }
    }
}

enum Step {
    Client(Result<Option<ClientEvent>, ProtocolError>),
    Update(Option<EncodedUpdate>),
    Command(Option<SessionCommand>),
}

enum HandoverOutcome {
    Transferred,
    Resumed {
        connection: Box<dyn RdpConnection>,
        pipeline: Pipeline,
        error: HandoverError,
    },
    Lost {
        error: HandoverError,
        reason: CloseReason,
    },
}

async fn hand_over(
    runtime: &Arc<ServerRuntime>,
    mut connection: Box<dyn RdpConnection>,
    mut pipeline: Pipeline,
    target: &Path,
) -> HandoverOutcome {
    if !connection.can_detach() {
        return HandoverOutcome::Resumed {
            connection,
            pipeline,
            error: HandoverError::TransportNotDetachable,
        };
    }

    info!("Handing over session for '{}' to {:?}", connection.username(), target);
    let flushed = pipeline.pause(connection.as_mut()).await;
    let settings = pipeline.settings;
    drop(pipeline);

    if let Err(e) = flushed {
        return HandoverOutcome::Lost {
            error: HandoverError::SessionClosed,
            reason: CloseReason::from(&e),
        };
    }

    let detached = match connection.detach() {
        Ok(detached) => detached,
        Err((connection, e)) => {
            return resume(runtime, connection, settings, HandoverError::Detach(e)).await;
        }
    };

    match handover::transfer(target, detached, settings).await {
        Ok(()) => {
            info!("Session handed over (next sequence {})", settings.next_sequence);
            HandoverOutcome::Transferred
        }
        Err((detached, error)) => match runtime.protocol().adopt(detached.stream, detached.state) {
            Ok(connection) => resume(runtime, connection, settings, error).await,
            Err(e) => HandoverOutcome::Lost {
                error,
                reason: CloseReason::from(&e),
            },
        },
    }
}

async fn resume(
    runtime: &Arc<ServerRuntime>,
    connection: Box<dyn RdpConnection>,
    settings: SessionSettings,
    error: HandoverError,
) -> HandoverOutcome {
    match Pipeline::start(runtime, settings).await {
        Ok(pipeline) => HandoverOutcome::Resumed {
            connection,
            pipeline,
            error,
        },
        Err(e) => HandoverOutcome::Lost {
            error,
            reason: CloseReason::Internal(format!("pipeline restart failed: {}", e)),
        },
    }
}
