use crate::api::ApiClient;
use crate::files;
use crate::ipc::EmulatorLink;
use crate::state::ClientState;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Intermediate envelope for remote events. The realtime transport delivers
/// the event payload as a JSON-encoded *string* which itself decodes to this
/// shape; both stages are deliberate and must stay separate.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Swap {
        round_number: u32,
        game_name: String,
        swap_time: i64,
    },
    DownloadRom {
        file: String,
    },
    DownloadLua {
        filename: String,
    },
    Message {
        message: String,
    },
    Kick {
        reason: String,
    },
    StartGame {
        game_name: String,
        start_time: Option<i64>,
    },
    PauseGame {
        pause_at: Option<i64>,
    },
    ResumeGame {
        resume_at: Option<i64>,
    },
    SessionEnded,
    PrepareSwap {
        save_path: String,
    },
}

#[derive(Debug)]
pub enum DecodeError {
    /// Stage one or two failed to parse, or a known payload was malformed.
    Json(serde_json::Error),
    /// Valid envelope with an event type this client does not know.
    UnknownType(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(err) => write!(f, "event decode failed: {err}"),
            Self::UnknownType(kind) => write!(f, "unknown event type: {kind}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Two-stage decode of a raw `"command"` event payload: the wire value is a
/// JSON string, and that string is itself JSON for a [`RemoteEnvelope`].
pub fn decode_remote_event(raw: &Value) -> Result<RemoteEvent, DecodeError> {
    let inner: String = serde_json::from_value(raw.clone()).map_err(DecodeError::Json)?;
    let envelope: RemoteEnvelope = serde_json::from_str(&inner).map_err(DecodeError::Json)?;
    event_from_envelope(envelope)
}

fn event_from_envelope(envelope: RemoteEnvelope) -> Result<RemoteEvent, DecodeError> {
    fn payload<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, DecodeError> {
        serde_json::from_value(value).map_err(DecodeError::Json)
    }

    #[derive(Deserialize)]
    struct SwapPayload {
        round_number: u32,
        game_name: String,
        swap_time: i64,
    }
    #[derive(Deserialize)]
    struct FilePayload {
        file: String,
    }
    #[derive(Deserialize)]
    struct FilenamePayload {
        filename: String,
    }
    #[derive(Deserialize)]
    struct MessagePayload {
        message: String,
    }
    #[derive(Deserialize, Default)]
    struct KickPayload {
        #[serde(default)]
        reason: String,
    }
    #[derive(Deserialize)]
    struct StartPayload {
        game_name: String,
        #[serde(default)]
        start_time: Option<i64>,
    }
    #[derive(Deserialize, Default)]
    struct PausePayload {
        #[serde(default)]
        pause_at: Option<i64>,
    }
    #[derive(Deserialize, Default)]
    struct ResumePayload {
        #[serde(default)]
        resume_at: Option<i64>,
    }
    #[derive(Deserialize)]
    struct PrepareSwapPayload {
        save_path: String,
    }

    let event = match envelope.kind.as_str() {
        "swap" => {
            let p: SwapPayload = payload(envelope.payload)?;
            RemoteEvent::Swap {
                round_number: p.round_number,
                game_name: p.game_name,
                swap_time: p.swap_time,
            }
        }
        "download_rom" => {
            let p: FilePayload = payload(envelope.payload)?;
            RemoteEvent::DownloadRom { file: p.file }
        }
        "download_lua" => {
            let p: FilenamePayload = payload(envelope.payload)?;
            RemoteEvent::DownloadLua {
                filename: p.filename,
            }
        }
        "message" => {
            let p: MessagePayload = payload(envelope.payload)?;
            RemoteEvent::Message { message: p.message }
        }
        "kick" => {
            let p: KickPayload = payload(envelope.payload).unwrap_or_default();
            RemoteEvent::Kick { reason: p.reason }
        }
        "start_game" => {
            let p: StartPayload = payload(envelope.payload)?;
            RemoteEvent::StartGame {
                game_name: p.game_name,
                start_time: p.start_time,
            }
        }
        "pause_game" => {
            let p: PausePayload = payload(envelope.payload).unwrap_or_default();
            RemoteEvent::PauseGame { pause_at: p.pause_at }
        }
        "resume_game" => {
            let p: ResumePayload = payload(envelope.payload).unwrap_or_default();
            RemoteEvent::ResumeGame {
                resume_at: p.resume_at,
            }
        }
        "session_ended" => RemoteEvent::SessionEnded,
        "prepare_swap" => {
            let p: PrepareSwapPayload = payload(envelope.payload)?;
            RemoteEvent::PrepareSwap {
                save_path: p.save_path,
            }
        }
        other => return Err(DecodeError::UnknownType(other.to_string())),
    };
    Ok(event)
}

pub(crate) fn epoch_to_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn now_epoch() -> i64 {
    crate::state::epoch_secs(SystemTime::now())
}

/// Waits until the target epoch second, firing immediately when the instant
/// is already past. Returns false when the shutdown signal cut the wait short.
pub async fn wait_until_epoch(target: i64, shutdown: &mut watch::Receiver<bool>) -> bool {
    let target_time = epoch_to_system_time(target);
    let remaining = match target_time.duration_since(SystemTime::now()) {
        Ok(remaining) => remaining,
        Err(_) => return true,
    };
    // Fixed deadline: a spurious watch wake must not restart the sleep.
    let deadline = tokio::time::Instant::now() + remaining;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}

/// Maps decoded remote events to local actions: emulator commands, state
/// mutations, asset downloads, delayed server notifications, or process
/// termination. Every non-fatal failure is logged and swallowed here.
pub struct Dispatcher {
    api: ApiClient,
    state: Arc<ClientState>,
    ipc: Arc<EmulatorLink>,
    http: reqwest::Client,
    rom_dir: PathBuf,
    script_dir: PathBuf,
    save_dir: PathBuf,
    shutdown_tx: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        api: ApiClient,
        state: Arc<ClientState>,
        ipc: Arc<EmulatorLink>,
        rom_dir: impl Into<PathBuf>,
        script_dir: impl Into<PathBuf>,
        save_dir: impl Into<PathBuf>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            api,
            state,
            ipc,
            http: reqwest::Client::new(),
            rom_dir: rom_dir.into(),
            script_dir: script_dir.into(),
            save_dir: save_dir.into(),
            shutdown_tx,
        }
    }

    /// Entry point for the realtime client: decode then dispatch, treating
    /// malformed and unknown events as log-and-drop.
    pub async fn handle_raw(&self, raw: &Value) {
        match decode_remote_event(raw) {
            Ok(event) => self.dispatch(event).await,
            Err(err @ DecodeError::UnknownType(_)) => tracing::warn!(%err, "event ignored"),
            Err(err) => tracing::warn!(%err, "event dropped"),
        }
    }

    pub async fn dispatch(&self, event: RemoteEvent) {
        match event {
            RemoteEvent::Swap {
                round_number,
                game_name,
                swap_time,
            } => {
                tracing::info!(game = %game_name, at = swap_time, round = round_number, "swap scheduled");
                self.ipc.send_swap(swap_time, &game_name).await;
                self.state.set_current_game(&game_name);
                self.state
                    .set_schedule("swap", epoch_to_system_time(swap_time));

                let api = self.api.clone();
                let mut shutdown = self.shutdown_tx.subscribe();
                tokio::spawn(async move {
                    if !wait_until_epoch(swap_time, &mut shutdown).await {
                        return;
                    }
                    let notify = tokio::time::timeout(NOTIFY_TIMEOUT, api.swap_complete(round_number));
                    match notify.await {
                        Ok(Ok(())) => tracing::info!(round = round_number, "swap complete reported"),
                        Ok(Err(err)) => tracing::warn!(error = %err, "swap-complete failed"),
                        Err(_) => tracing::warn!(round = round_number, "swap-complete timed out"),
                    }
                });
            }
            RemoteEvent::DownloadRom { file } => {
                self.download(&format!("api/roms/{file}"), self.rom_dir.join(&file))
                    .await;
            }
            RemoteEvent::DownloadLua { filename } => {
                self.download("api/scripts/latest", self.script_dir.join(&filename))
                    .await;
            }
            RemoteEvent::Message { message } => {
                tracing::info!(%message, "server message");
                self.ipc.send_message(&message).await;
            }
            RemoteEvent::Kick { reason } => {
                tracing::warn!(%reason, "kicked from session");
                self.state.set_last_error(format!("kicked: {reason}"));
                self.ipc.send_pause(None).await;
                self.ipc.send_message(&format!("Kicked: {reason}")).await;
                let _ = self.shutdown_tx.send(true);
            }
            RemoteEvent::StartGame {
                game_name,
                start_time,
            } => {
                self.state.set_current_game(&game_name);
                let at = start_time.unwrap_or_else(now_epoch);
                self.state.set_schedule("start", epoch_to_system_time(at));
                self.ipc.send_start(at, &game_name).await;
                if let Err(err) = self.api.game_started(&game_name).await {
                    tracing::warn!(error = %err, "game-started failed");
                }
            }
            RemoteEvent::PauseGame { pause_at } => {
                if let Some(at) = pause_at {
                    self.state.set_schedule("pause", epoch_to_system_time(at));
                }
                self.ipc.send_pause(pause_at).await;
            }
            RemoteEvent::ResumeGame { resume_at } => {
                if let Some(at) = resume_at {
                    self.state.set_schedule("resume", epoch_to_system_time(at));
                }
                self.ipc.send_resume(resume_at).await;
            }
            RemoteEvent::SessionEnded => {
                tracing::info!("session ended");
                self.state.set_connected(false);
                self.ipc.send_pause(None).await;
                if let Err(err) = self.api.game_stopped().await {
                    tracing::warn!(error = %err, "game-stopped failed");
                }
            }
            RemoteEvent::PrepareSwap { save_path } => {
                let dest = self.save_dir.join(&save_path);
                self.ipc.send_save(&dest.to_string_lossy()).await;
            }
        }
    }

    async fn download(&self, path: &str, dest: PathBuf) {
        let url = match self.api.asset_url(path) {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(error = %err, path, "bad asset url");
                return;
            }
        };
        match files::download_file(&self.http, url, self.api.bearer(), &dest).await {
            Ok(()) => tracing::info!(dest = %dest.display(), "downloaded asset"),
            Err(err) => tracing::warn!(error = %err, dest = %dest.display(), "download failed"),
        }
    }
}
