use crate::api::{ApiClient, ReadyResponse};
use crate::config::Config;
use crate::dispatch::{self, Dispatcher};
use crate::ipc::EmulatorLink;
use crate::realtime::RealtimeClient;
use crate::state::ClientState;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Duration;

#[cfg(not(test))]
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
#[cfg(test)]
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);

#[cfg(not(test))]
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
#[cfg(test)]
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(25);

#[cfg(not(test))]
const STALE_THRESHOLD: Duration = Duration::from_secs(15);
#[cfg(test)]
const STALE_THRESHOLD: Duration = Duration::from_millis(150);

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Subcommands run before config load: config-init exists for exactly the
    // case where no valid config is present yet.
    if let Some(command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init(&crate::config::active_config_path());
        }
    }

    let config = Config::load()?;

    let state = Arc::new(ClientState::new());
    match state.load_from_file(&config.state.snapshot_path) {
        Ok(()) => tracing::info!(path = %config.state.snapshot_path, "restored state snapshot"),
        Err(err) => tracing::info!(error = %err, "starting with fresh state"),
    }

    let api = ApiClient::new(config.server_url(), &config.realtime.bearer_token)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // An occupied port means another client instance; nothing works without
    // the emulator link, so this is fatal.
    let listener = TcpListener::bind(("127.0.0.1", config.emulator.ipc_port)).await?;
    tracing::info!(port = config.emulator.ipc_port, "emulator link listening");
    let ipc = Arc::new(EmulatorLink::new(state.clone(), shutdown_rx.clone()));
    tokio::spawn(ipc.clone().listen(listener));

    let ready = api.ready().await?;
    apply_ready(&ready, &state, &ipc, shutdown_rx.clone());

    let dispatcher = Arc::new(Dispatcher::new(
        api.clone(),
        state.clone(),
        ipc.clone(),
        &config.emulator.rom_dir,
        &config.emulator.script_dir,
        &config.emulator.save_dir,
        shutdown_tx.clone(),
    ));

    tokio::spawn(run_heartbeat(
        api,
        state.clone(),
        PathBuf::from(&config.state.snapshot_path),
        shutdown_rx.clone(),
    ));
    tokio::spawn(run_watchdog(state.clone(), shutdown_rx.clone()));
    tokio::spawn(RealtimeClient::new(&config, state.clone(), dispatcher, shutdown_rx.clone()).run());

    let mut shutdown_rx = shutdown_rx;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown: ctrl-c");
                let _ = shutdown_tx.send(true);
                break;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("shutdown: requested");
                    break;
                }
            }
        }
    }

    if let Err(err) = state.save_to_file(&config.state.snapshot_path) {
        tracing::warn!(error = %err, "failed to persist state snapshot");
    }
    Ok(())
}

/// Applies the server's ready answer: assigned game, ready flag, and any
/// already-scheduled phase. A pending start in the future gets a delayed
/// START command so a client restarting mid-countdown still starts on time.
fn apply_ready(
    ready: &ReadyResponse,
    state: &Arc<ClientState>,
    ipc: &Arc<EmulatorLink>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Some(game) = &ready.game_file {
        state.set_current_game(game);
    }
    state.set_ready(true);

    let phase = ready.state.as_str();
    if phase.is_empty() || phase == "none" {
        return;
    }
    let now = crate::state::epoch_secs(SystemTime::now());
    if ready.state_at <= now {
        tracing::debug!(phase, at = ready.state_at, "scheduled phase already elapsed");
        return;
    }

    state.set_schedule(phase, dispatch::epoch_to_system_time(ready.state_at));
    if phase == "start" {
        let ipc = ipc.clone();
        let game = state.current_game();
        let at = ready.state_at;
        tokio::spawn(async move {
            if dispatch::wait_until_epoch(at, &mut shutdown).await {
                ipc.send_start(at, &game).await;
            }
        });
    }
}

async fn run_heartbeat(
    api: ApiClient,
    state: Arc<ClientState>,
    snapshot_path: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        let game = state.current_game();
        match api.heartbeat(state.ping(), &game).await {
            Ok(rtt_ms) => {
                state.set_ping(rtt_ms);
                if let Err(err) = state.save_to_file(&snapshot_path) {
                    tracing::warn!(error = %err, "snapshot save failed");
                }
            }
            Err(err) => tracing::warn!(error = %err, "heartbeat failed"),
        }
    }
}

fn heartbeat_is_fresh(last: Option<SystemTime>, now: SystemTime) -> bool {
    match last {
        // A last-heartbeat stamp in the future counts as fresh; the clock
        // moved, not the session.
        Some(at) => now
            .duration_since(at)
            .map(|age| age <= STALE_THRESHOLD)
            .unwrap_or(true),
        None => false,
    }
}

/// Flips the session's connected flag based on heartbeat freshness and logs
/// the transitions.
async fn run_watchdog(state: Arc<ClientState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        let fresh = heartbeat_is_fresh(state.last_heartbeat(), SystemTime::now());
        if fresh != state.connected() {
            if fresh {
                tracing::info!("heartbeat recovered, session connected");
            } else {
                tracing::warn!("heartbeat stale, marking session disconnected");
            }
            state.set_connected(fresh);
        }
    }
}

fn handle_config_init(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    Config::write_default(path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn freshness_requires_a_recent_stamp() {
        let now = SystemTime::now();
        assert!(!heartbeat_is_fresh(None, now));
        assert!(heartbeat_is_fresh(Some(now - STALE_THRESHOLD / 2), now));
        assert!(!heartbeat_is_fresh(Some(now - STALE_THRESHOLD * 3), now));
        // Future stamps are tolerated.
        assert!(heartbeat_is_fresh(Some(now + Duration::from_secs(5)), now));
    }

    #[test]
    fn config_init_writes_a_loadable_default_without_existing_config() {
        let path = std::env::temp_dir().join(format!(
            "shuffler-config-init-{}.toml",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        // Must succeed with no config present; Config::load would refuse the
        // unset player fields at this point.
        handle_config_init(&path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: Config = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.emulator.ipc_port, 55355);

        // A second run must not clobber the existing file.
        assert!(handle_config_init(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }

    fn temp_snapshot_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "shuffler-app-{tag}-{}.json",
            std::process::id()
        ))
    }

    #[tokio::test]
    async fn heartbeat_loop_updates_ping_and_persists_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/heartbeat"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), "tok").unwrap();
        let state = Arc::new(ClientState::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let snapshot = temp_snapshot_path("heartbeat");
        let _ = std::fs::remove_file(&snapshot);

        let task = tokio::spawn(run_heartbeat(
            api,
            state.clone(),
            snapshot.clone(),
            shutdown_rx,
        ));
        tokio::time::sleep(HEARTBEAT_INTERVAL * 4).await;

        assert!(state.last_heartbeat().is_some(), "no heartbeat recorded");
        assert!(snapshot.exists(), "snapshot not persisted");
        assert!(!server.received_requests().await.unwrap().is_empty());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        let _ = std::fs::remove_file(&snapshot);
    }

    #[tokio::test]
    async fn heartbeat_failures_leave_the_stamp_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/heartbeat"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), "tok").unwrap();
        let state = Arc::new(ClientState::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let snapshot = temp_snapshot_path("heartbeat-fail");
        let _ = std::fs::remove_file(&snapshot);

        let task = tokio::spawn(run_heartbeat(
            api,
            state.clone(),
            snapshot.clone(),
            shutdown_rx,
        ));
        tokio::time::sleep(HEARTBEAT_INTERVAL * 3).await;

        assert!(state.last_heartbeat().is_none());
        assert!(!snapshot.exists());

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }

    #[tokio::test]
    async fn watchdog_tracks_heartbeat_freshness() {
        let state = Arc::new(ClientState::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_watchdog(state.clone(), shutdown_rx));

        // No heartbeat yet: stays disconnected.
        tokio::time::sleep(WATCHDOG_INTERVAL * 3).await;
        assert!(!state.connected());

        // A heartbeat stamp flips it to connected on the next tick.
        state.set_ping(12);
        tokio::time::sleep(WATCHDOG_INTERVAL * 3).await;
        assert!(state.connected());

        // ...and going quiet past the threshold flips it back.
        tokio::time::sleep(STALE_THRESHOLD + WATCHDOG_INTERVAL * 3).await;
        assert!(!state.connected());

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }

    async fn acking_emulator(
        addr: std::net::SocketAddr,
    ) -> tokio::sync::mpsc::UnboundedReceiver<String> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (lines_tx, lines_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(rest) = line.strip_prefix("CMD|") {
                    if let Some(id) = rest.split('|').next() {
                        let _ = write.write_all(format!("ACK|{id}\n").as_bytes()).await;
                    }
                }
                let _ = lines_tx.send(line);
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        lines_rx
    }

    #[tokio::test]
    async fn ready_with_pending_start_schedules_and_sends_start() {
        let state = Arc::new(ClientState::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let ipc = Arc::new(EmulatorLink::new(state.clone(), shutdown_rx.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(ipc.clone().listen(listener));
        let mut emulator = acking_emulator(addr).await;

        let at = crate::state::epoch_secs(SystemTime::now()) + 1;
        let ready = ReadyResponse {
            game_file: Some("kirby.nes".to_string()),
            state: "start".to_string(),
            state_at: at,
        };
        apply_ready(&ready, &state, &ipc, shutdown_rx);

        assert_eq!(state.current_game(), "kirby.nes");
        assert!(state.ready());
        let (phase, _) = state.schedule().unwrap();
        assert_eq!(phase, "start");

        let line = tokio::time::timeout(Duration::from_secs(3), emulator.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(line.contains("|START|"), "got {line}");
        assert!(line.contains("kirby.nes"));
    }

    #[tokio::test]
    async fn ready_with_elapsed_phase_sets_no_schedule() {
        let state = Arc::new(ClientState::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let ipc = Arc::new(EmulatorLink::new(state.clone(), shutdown_rx.clone()));

        let ready = ReadyResponse {
            game_file: None,
            state: "swap".to_string(),
            state_at: crate::state::epoch_secs(SystemTime::now()) - 30,
        };
        apply_ready(&ready, &state, &ipc, shutdown_rx);

        assert!(state.ready());
        assert!(state.schedule().is_none());
    }
}
