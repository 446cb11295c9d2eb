use crate::state::{epoch_secs, ClientState};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, RwLock};

const RETRY_BUDGET: u8 = 3;

#[cfg(not(test))]
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
#[cfg(test)]
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_millis(50);

#[cfg(not(test))]
const RESEND_INTERVAL: Duration = Duration::from_secs(1);
#[cfg(test)]
const RESEND_INTERVAL: Duration = Duration::from_millis(50);

#[cfg(not(test))]
const RESEND_SCAN_INTERVAL: Duration = Duration::from_secs(1);
#[cfg(test)]
const RESEND_SCAN_INTERVAL: Duration = Duration::from_millis(25);

#[cfg(not(test))]
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
#[cfg(test)]
const ACK_TIMEOUT: Duration = Duration::from_millis(400);

#[derive(Debug)]
pub enum IpcError {
    /// No live emulator connection; returned synchronously, never queued.
    NotConnected,
    /// The emulator rejected the command (NACK), or the retry budget ran out.
    Rejected { id: u64, reason: String },
    /// No ACK/NACK arrived within the overall wait window.
    Timeout(u64),
    /// The connection was replaced or torn down while the command was in flight.
    Abandoned(u64),
    Io(io::Error),
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "emulator not connected"),
            Self::Rejected { id, reason } => write!(f, "command {id} rejected: {reason}"),
            Self::Timeout(id) => write!(f, "command {id} timed out"),
            Self::Abandoned(id) => write!(f, "command {id} abandoned"),
            Self::Io(err) => write!(f, "ipc write: {err}"),
        }
    }
}

impl std::error::Error for IpcError {}

enum CmdOutcome {
    Ack,
    Nack(String),
}

struct Pending {
    line: String,
    retries: u8,
    last_sent: Instant,
    done: oneshot::Sender<CmdOutcome>,
}

#[derive(Default)]
struct PendingTable {
    next_id: u64,
    entries: HashMap<u64, Pending>,
}

type SharedWriter = Arc<AsyncMutex<OwnedWriteHalf>>;

/// Reliable command link to the locally running emulator.
///
/// Accepts exactly one live loopback connection at a time and delivers
/// newline-terminated `CMD|<id>|<verb>|<args...>` lines, correlating
/// `ACK|<id>` / `NACK|<id>|<reason>` replies by id. Unacknowledged commands
/// are rescanned once per resend interval and rewritten until the retry
/// budget runs out, at which point they fail with a synthetic NACK.
pub struct EmulatorLink {
    state: Arc<ClientState>,
    writer: RwLock<Option<SharedWriter>>,
    pending: Mutex<PendingTable>,
    shutdown: watch::Receiver<bool>,
}

impl EmulatorLink {
    pub fn new(state: Arc<ClientState>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            state,
            writer: RwLock::new(None),
            pending: Mutex::new(PendingTable::default()),
            shutdown,
        }
    }

    /// Accept loop. Owns the listener; returns when the shutdown signal is
    /// raised. Uses a short accept poll so cancellation is observed promptly.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "ipc listening");
        }

        let resender = tokio::spawn(self.clone().run_resender());

        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let accepted = tokio::time::timeout(ACCEPT_POLL_TIMEOUT, listener.accept()).await;
            match accepted {
                Err(_) => continue,
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "ipc accept error");
                    continue;
                }
                Ok(Ok((stream, peer))) => {
                    tracing::info!(%peer, "emulator connected");
                    let (reader, writer) = self.install_connection(stream).await;
                    tokio::spawn(self.clone().read_connection(reader, writer));
                }
            }
        }

        resender.abort();
        *self.writer.write().await = None;
        self.abandon_pending();
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.writer.read().await.is_some()
    }

    async fn is_current(&self, writer: &SharedWriter) -> bool {
        self.writer
            .read()
            .await
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, writer))
    }

    async fn install_connection(&self, stream: TcpStream) -> (OwnedReadHalf, SharedWriter) {
        let (reader, writer) = stream.into_split();
        let writer = Arc::new(AsyncMutex::new(writer));
        let mut guard = self.writer.write().await;
        if let Some(old) = guard.take() {
            // In-flight commands belonged to the old connection; they are
            // abandoned, never migrated to the new one. The old socket is
            // closed so the stale peer observes EOF rather than half a
            // session.
            tracing::info!("replacing live emulator connection");
            self.abandon_pending();
            let _ = old.lock().await.shutdown().await;
        }
        *guard = Some(writer.clone());
        (reader, writer)
    }

    fn abandon_pending(&self) {
        let mut table = self.pending.lock().unwrap();
        let dropped = table.entries.len();
        table.entries.clear();
        if dropped > 0 {
            tracing::warn!(count = dropped, "abandoned in-flight commands");
        }
    }

    async fn read_connection(self: Arc<Self>, reader: OwnedReadHalf, writer: SharedWriter) {
        let mut lines = BufReader::new(reader).lines();
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        // Lines from a replaced connection are dead traffic.
                        if !self.is_current(&writer).await {
                            break;
                        }
                        self.handle_line(&line, &writer).await;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "ipc read error");
                        break;
                    }
                },
            }
        }

        let mut guard = self.writer.write().await;
        if let Some(current) = guard.as_ref() {
            if Arc::ptr_eq(current, &writer) {
                *guard = None;
                tracing::info!("emulator disconnected");
            }
        }
    }

    async fn handle_line(self: &Arc<Self>, line: &str, writer: &SharedWriter) {
        let mut parts = line.splitn(3, '|');
        match parts.next().unwrap_or("") {
            verb @ ("ACK" | "NACK") => {
                let Some(id) = parts.next().and_then(|s| s.parse::<u64>().ok()) else {
                    return;
                };
                let outcome = if verb == "ACK" {
                    CmdOutcome::Ack
                } else {
                    CmdOutcome::Nack(parts.next().unwrap_or("rejected").to_string())
                };
                let entry = self.pending.lock().unwrap().entries.remove(&id);
                match entry {
                    Some(pending) => {
                        let _ = pending.done.send(outcome);
                    }
                    None => tracing::debug!(id, "ack for unknown command"),
                }
            }
            "PING" => {
                if let Some(token) = parts.next() {
                    if let Err(err) = write_line(writer, &format!("PONG|{token}")).await {
                        tracing::warn!(error = %err, "pong write failed");
                    }
                }
            }
            "HELLO" => {
                // The emulator script restarted; push a state resync. Spawned
                // because the SYNC ACK arrives through this same read loop.
                let link = self.clone();
                tokio::spawn(async move {
                    match link.send_sync().await {
                        Ok(()) => tracing::info!("sent SYNC to emulator"),
                        Err(err) => tracing::warn!(error = %err, "SYNC send failed"),
                    }
                });
            }
            other => tracing::debug!(line = other, "unrecognized ipc line"),
        }
    }

    async fn run_resender(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(RESEND_SCAN_INTERVAL);
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let mut resend = Vec::new();
            {
                let mut table = self.pending.lock().unwrap();
                let mut exhausted = Vec::new();
                for (&id, pending) in table.entries.iter_mut() {
                    if now.duration_since(pending.last_sent) <= RESEND_INTERVAL {
                        continue;
                    }
                    if pending.retries > 0 {
                        pending.retries -= 1;
                        pending.last_sent = now;
                        resend.push((id, pending.line.clone()));
                    } else {
                        exhausted.push(id);
                    }
                }
                for id in exhausted {
                    if let Some(pending) = table.entries.remove(&id) {
                        tracing::warn!(id, "command failed after retries");
                        let _ = pending.done.send(CmdOutcome::Nack("timeout".to_string()));
                    }
                }
            }

            for (id, line) in resend {
                tracing::debug!(id, "resending command");
                if let Err(err) = self.send_line(&line).await {
                    tracing::debug!(id, error = %err, "resend failed");
                }
            }
        }
    }

    async fn send_line(&self, line: &str) -> Result<(), IpcError> {
        let writer = match self.writer.read().await.as_ref() {
            Some(writer) => writer.clone(),
            None => return Err(IpcError::NotConnected),
        };
        write_line(&writer, line).await.map_err(IpcError::Io)
    }

    /// Sends a correlated command and waits for its ACK/NACK. Returns an
    /// immediate error when no connection is live.
    pub async fn send_command(&self, parts: &[&str]) -> Result<(), IpcError> {
        if !self.is_connected().await {
            return Err(IpcError::NotConnected);
        }

        let (done, rx) = oneshot::channel();
        let (id, line) = {
            let mut table = self.pending.lock().unwrap();
            let id = table.next_id;
            table.next_id += 1;
            let line = format!("CMD|{}|{}", id, parts.join("|"));
            table.entries.insert(
                id,
                Pending {
                    line: line.clone(),
                    retries: RETRY_BUDGET,
                    last_sent: Instant::now(),
                    done,
                },
            );
            (id, line)
        };

        if let Err(err) = self.send_line(&line).await {
            self.pending.lock().unwrap().entries.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(ACK_TIMEOUT, rx).await {
            Ok(Ok(CmdOutcome::Ack)) => Ok(()),
            Ok(Ok(CmdOutcome::Nack(reason))) => Err(IpcError::Rejected { id, reason }),
            Ok(Err(_)) => Err(IpcError::Abandoned(id)),
            Err(_) => {
                self.pending.lock().unwrap().entries.remove(&id);
                Err(IpcError::Timeout(id))
            }
        }
    }

    /// Pushes the current session state after a peer HELLO so the emulator
    /// side can recover from its own restart.
    pub async fn send_sync(&self) -> Result<(), IpcError> {
        let snap = self.state.snapshot();
        let phase = snap.scheduled_state.unwrap_or_else(|| "none".to_string());
        let at = snap.scheduled_at.map(epoch_secs).unwrap_or(0);
        self.send_command(&["SYNC", &snap.current_game, &phase, &at.to_string()])
            .await
    }

    // Fire-and-forget helpers: the emulator side is best-effort, so callers
    // that don't need the result only get a log line on failure.

    pub async fn send_swap(&self, at: i64, game: &str) {
        if let Err(err) = self.send_command(&["SWAP", &at.to_string(), game]).await {
            tracing::warn!(error = %err, "SWAP send failed");
        }
    }

    pub async fn send_start(&self, at: i64, game: &str) {
        if let Err(err) = self.send_command(&["START", &at.to_string(), game]).await {
            tracing::warn!(error = %err, "START send failed");
        }
    }

    pub async fn send_save(&self, path: &str) {
        if let Err(err) = self.send_command(&["SAVE", path]).await {
            tracing::warn!(error = %err, "SAVE send failed");
        }
    }

    pub async fn send_pause(&self, at: Option<i64>) {
        let result = match at {
            Some(at) => self.send_command(&["PAUSE", &at.to_string()]).await,
            None => self.send_command(&["PAUSE"]).await,
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "PAUSE send failed");
        }
    }

    pub async fn send_resume(&self, at: Option<i64>) {
        let result = match at {
            Some(at) => self.send_command(&["RESUME", &at.to_string()]).await,
            None => self.send_command(&["RESUME"]).await,
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "RESUME send failed");
        }
    }

    pub async fn send_message(&self, msg: &str) {
        if let Err(err) = self.send_command(&["MSG", msg]).await {
            tracing::warn!(error = %err, "MSG send failed");
        }
    }
}

async fn write_line(writer: &SharedWriter, line: &str) -> io::Result<()> {
    let mut guard = writer.lock().await;
    guard.write_all(line.as_bytes()).await?;
    guard.write_all(b"\n").await?;
    guard.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::SystemTime;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    struct Harness {
        link: Arc<EmulatorLink>,
        state: Arc<ClientState>,
        addr: SocketAddr,
        _shutdown_tx: watch::Sender<bool>,
    }

    async fn spawn_link() -> Harness {
        let state = Arc::new(ClientState::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let link = Arc::new(EmulatorLink::new(state.clone(), shutdown_rx));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(link.clone().listen(listener));
        Harness {
            link,
            state,
            addr,
            _shutdown_tx: shutdown_tx,
        }
    }

    async fn connect_peer(h: &Harness) -> BufReader<TcpStream> {
        let stream = TcpStream::connect(h.addr).await.unwrap();
        // Wait for the accept loop to install the connection.
        let deadline = Instant::now() + Duration::from_secs(1);
        while !h.link.is_connected().await {
            assert!(Instant::now() < deadline, "connection never installed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        BufReader::new(stream)
    }

    async fn read_line(peer: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(1), peer.read_line(&mut line))
            .await
            .expect("line expected")
            .unwrap();
        line.trim_end().to_string()
    }

    fn command_id(line: &str) -> u64 {
        let mut parts = line.split('|');
        assert_eq!(parts.next(), Some("CMD"));
        parts.next().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn send_on_unconnected_link_errors_immediately() {
        let h = spawn_link().await;
        let started = Instant::now();
        let err = h.link.send_command(&["MSG", "hi"]).await.unwrap_err();
        assert!(matches!(err, IpcError::NotConnected));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn ack_completes_command() {
        let h = spawn_link().await;
        let mut peer = connect_peer(&h).await;

        let link = h.link.clone();
        let send = tokio::spawn(async move { link.send_command(&["MSG", "hello"]).await });

        let line = read_line(&mut peer).await;
        assert_eq!(line, "CMD|0|MSG|hello");
        peer.get_mut().write_all(b"ACK|0\n").await.unwrap();

        send.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn nack_surfaces_the_reason() {
        let h = spawn_link().await;
        let mut peer = connect_peer(&h).await;

        let link = h.link.clone();
        let send = tokio::spawn(async move { link.send_command(&["SAVE", "slot1"]).await });

        let line = read_line(&mut peer).await;
        let id = command_id(&line);
        peer.get_mut()
            .write_all(format!("NACK|{id}|busy\n").as_bytes())
            .await
            .unwrap();

        let err = send.await.unwrap().unwrap_err();
        match err {
            IpcError::Rejected { reason, .. } => assert_eq!(reason, "busy"),
            other => panic!("expected rejection, got {other}"),
        }
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_within_the_overall_window() {
        let h = spawn_link().await;
        let mut peer = connect_peer(&h).await;

        let started = Instant::now();
        let link = h.link.clone();
        let send = tokio::spawn(async move { link.send_command(&["SWAP", "0", "smb3"]).await });

        // Never acknowledge.
        let err = tokio::time::timeout(ACK_TIMEOUT, send)
            .await
            .expect("synthetic NACK must beat the overall wait")
            .unwrap()
            .unwrap_err();
        assert!(started.elapsed() < ACK_TIMEOUT);
        match err {
            IpcError::Rejected { reason, .. } => assert_eq!(reason, "timeout"),
            other => panic!("expected synthetic NACK, got {other}"),
        }

        // The line was rewritten while the retry budget lasted.
        let mut deliveries = 0;
        while tokio::time::timeout(RESEND_INTERVAL, async {
            read_line(&mut peer).await
        })
        .await
        .is_ok()
        {
            deliveries += 1;
        }
        assert!(deliveries >= 2, "expected at least one resend, saw {deliveries}");
    }

    #[tokio::test]
    async fn ping_is_answered_with_matching_pong() {
        let h = spawn_link().await;
        let mut peer = connect_peer(&h).await;

        peer.get_mut().write_all(b"PING|tok-9\n").await.unwrap();
        assert_eq!(read_line(&mut peer).await, "PONG|tok-9");
    }

    #[tokio::test]
    async fn hello_triggers_exactly_one_sync_from_the_snapshot() {
        let h = spawn_link().await;
        h.state.set_current_game("kirby");
        h.state
            .set_schedule("swap", SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let mut peer = connect_peer(&h).await;

        peer.get_mut().write_all(b"HELLO\n").await.unwrap();

        let line = read_line(&mut peer).await;
        let id = command_id(&line);
        assert_eq!(line, format!("CMD|{id}|SYNC|kirby|swap|1700000000"));
        peer.get_mut()
            .write_all(format!("ACK|{id}\n").as_bytes())
            .await
            .unwrap();

        // No second SYNC for a single HELLO.
        let mut extra = String::new();
        let more = tokio::time::timeout(
            RESEND_INTERVAL * 3,
            peer.read_line(&mut extra),
        )
        .await;
        assert!(more.is_err(), "unexpected extra line: {extra}");
    }

    #[tokio::test]
    async fn out_of_order_acks_resolve_by_correlation_id() {
        let h = spawn_link().await;
        let mut peer = connect_peer(&h).await;

        let link_a = h.link.clone();
        let a = tokio::spawn(async move { link_a.send_command(&["MSG", "first"]).await });
        let line_a = read_line(&mut peer).await;

        let link_b = h.link.clone();
        let b = tokio::spawn(async move { link_b.send_command(&["MSG", "second"]).await });
        let line_b = read_line(&mut peer).await;

        // Acknowledge in reverse order.
        peer.get_mut()
            .write_all(format!("ACK|{}\n", command_id(&line_b)).as_bytes())
            .await
            .unwrap();
        peer.get_mut()
            .write_all(format!("ACK|{}\n", command_id(&line_a)).as_bytes())
            .await
            .unwrap();

        b.await.unwrap().unwrap();
        a.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn replacing_the_connection_abandons_in_flight_commands() {
        let h = spawn_link().await;
        let mut peer = connect_peer(&h).await;

        let link = h.link.clone();
        let send = tokio::spawn(async move { link.send_command(&["MSG", "stuck"]).await });
        let _ = read_line(&mut peer).await;

        // A second connection takes over; the pending command must fail
        // without a false success.
        let _peer2 = TcpStream::connect(h.addr).await.unwrap();

        let err = tokio::time::timeout(ACK_TIMEOUT, send)
            .await
            .expect("abandoned command must resolve promptly")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, IpcError::Abandoned(_)), "got {err}");
    }

    #[tokio::test]
    async fn replacing_the_connection_closes_the_old_socket() {
        let h = spawn_link().await;
        let mut peer = connect_peer(&h).await;

        let _peer2 = TcpStream::connect(h.addr).await.unwrap();

        // The stale peer observes EOF once the replacement is installed.
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(1), peer.read_line(&mut line))
            .await
            .expect("stale socket never closed")
            .unwrap();
        assert_eq!(n, 0, "unexpected line on stale connection: {line:?}");

        // A late line on the stale socket gets no reply.
        let _ = peer.get_mut().write_all(b"PING|zombie\n").await;
        let mut extra = String::new();
        match peer.read_line(&mut extra).await {
            Ok(n) => assert_eq!(n, 0, "stale connection still serviced: {extra:?}"),
            // A reset proves the close just as well.
            Err(_) => {}
        }
    }
}
