//! TCP accept loop and per-connection sessions

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::snapshot::{software_version, Snapshot};
use crate::game::{AdminError, AuthError, JoinAccepted, SimulationHandle};
use crate::net::codec::{read_frame, write_frame, FrameError};
use crate::net::protocol::{ClientMsg, ServerMsg};
use crate::util::rate_limit::ConnectionRateLimiter;

/// Messages waiting for the writer task
const OUTBOUND_QUEUE: usize = 64;

/// How long a closing connection gets to flush its last frames
const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Accept clients until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, state).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept TCP connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = &mut shutdown => {
                info!("TCP server stopping");
                return Ok(());
            }
        }
    }
}

/// A queued message, and the event sequence it acknowledges once written
struct Outbound {
    msg: ServerMsg,
    delivers: Option<(String, u64)>,
}

impl From<ServerMsg> for Outbound {
    fn from(msg: ServerMsg) -> Self {
        Self {
            msg,
            delivers: None,
        }
    }
}

/// Outbound half of a connection plus what every message handler needs
struct Link {
    id: Uuid,
    out: mpsc::Sender<Outbound>,
    limiter: ConnectionRateLimiter,
    state: AppState,
}

impl Link {
    /// Queue a reply; false once the writer has gone
    async fn reply(&self, msg: ServerMsg) -> bool {
        self.out.send(msg.into()).await.is_ok()
    }
}

enum Incoming {
    Msg(ClientMsg),
    Skip,
    Closed,
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: AppState) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let id = state.connections.register(peer);
    info!(conn = %id, peer = %peer, "New TCP connection");

    let (mut reader, writer) = stream.into_split();
    let (out, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let writer_handle = tokio::spawn(write_loop(id, writer, out_rx, state.sim.clone()));

    let link = Link {
        id,
        out,
        limiter: ConnectionRateLimiter::new(),
        state,
    };
    let mut buf = BytesMut::with_capacity(4096);

    let joined = authenticate(&mut reader, &mut buf, &link).await;
    if let Some(accepted) = &joined {
        link.state.connections.identify(id, &accepted.username);
        run_session(&mut reader, &mut buf, &link, accepted).await;
    }

    let Link { out, state, .. } = link;
    drop(out);
    state.connections.remove(id);

    if let Some(accepted) = joined {
        // Another socket may have taken over the same session
        if !accepted.admin && state.connections.count_user(&accepted.username) == 0 {
            state.sim.disconnect(&accepted.username).await;
        }
    }

    if tokio::time::timeout(FLUSH_GRACE, writer_handle).await.is_err() {
        debug!(conn = %id, "Writer did not flush in time");
    }
    info!(conn = %id, "TCP connection closed");
}

/// Read and parse the next client message
async fn next_message(reader: &mut OwnedReadHalf, buf: &mut BytesMut, link: &Link) -> Incoming {
    let frame = match read_frame(reader, buf).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return Incoming::Closed,
        Err(FrameError::Io(e)) => {
            debug!(conn = %link.id, error = %e, "TCP read failed");
            return Incoming::Closed;
        }
        Err(e) => {
            // Framing is lost, nothing after this can be trusted
            warn!(conn = %link.id, error = %e, "Bad frame from client");
            link.reply(ServerMsg::error("bad-frame", e.to_string())).await;
            return Incoming::Closed;
        }
    };

    if !link.limiter.check_input() {
        warn!(conn = %link.id, "Rate limited client message");
        return Incoming::Skip;
    }

    match serde_json::from_slice::<ClientMsg>(&frame) {
        Ok(msg) => Incoming::Msg(msg),
        Err(e) => {
            warn!(conn = %link.id, error = %e, "Failed to parse client message");
            link.reply(ServerMsg::error("bad-message", e.to_string())).await;
            Incoming::Skip
        }
    }
}

/// Wait for a successful join; pings are answered meanwhile
async fn authenticate(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    link: &Link,
) -> Option<JoinAccepted> {
    loop {
        let msg = match next_message(reader, buf, link).await {
            Incoming::Msg(msg) => msg,
            Incoming::Skip => continue,
            Incoming::Closed => return None,
        };

        match msg {
            ClientMsg::Join {
                username,
                password,
                sim_password,
            } => match link
                .state
                .sim
                .join(&username, &password, sim_password.as_deref())
                .await
            {
                Ok(accepted) => {
                    let joined = ServerMsg::Joined {
                        username: accepted.username.clone(),
                        admin: accepted.admin,
                        version: software_version(),
                        map: (*accepted.map).clone(),
                        boats: (*accepted.boats).clone(),
                        gui: accepted.gui.clone(),
                    };
                    if !link.reply(joined).await {
                        return None;
                    }
                    info!(conn = %link.id, username = %accepted.username, "Client joined");
                    return Some(accepted);
                }
                Err(e) => {
                    warn!(conn = %link.id, username = %username, error = %e, "Join rejected");
                    let unavailable = matches!(e, AuthError::Unavailable);
                    link.reply(ServerMsg::error(auth_code(&e), e.to_string()))
                        .await;
                    if unavailable {
                        return None;
                    }
                }
            },
            ClientMsg::Ping { t } => {
                link.reply(ServerMsg::Pong { t }).await;
            }
            ClientMsg::Update { .. } | ClientMsg::Admin { .. } => {
                link.reply(ServerMsg::error("not-joined", "join before sending commands"))
                    .await;
            }
        }
    }
}

fn auth_code(err: &AuthError) -> &'static str {
    match err {
        AuthError::InvalidCredentials => "invalid-credentials",
        AuthError::SimPassword => "sim-password",
        AuthError::Blocked => "blocked",
        AuthError::UnknownBoat(_) => "unknown-boat",
        AuthError::Unavailable => "unavailable",
    }
}

/// Per-connection view settings
struct Viewer<'a> {
    accepted: &'a JoinAccepted,
    render_dist: Option<f64>,
    /// Event sequence already queued to this connection
    queued_events: u64,
}

impl Viewer<'_> {
    /// The update for this viewer plus the event sequence it carries up to
    fn update_for(&self, snapshot: &Snapshot) -> (Outbound, u64) {
        let username = &self.accepted.username;
        let viewer = (!self.accepted.admin).then_some(username.as_str());
        let (events, upto) = snapshot.events_since(username, self.queued_events);
        let delivers = (!events.is_empty()).then(|| (username.clone(), upto));
        let msg = ServerMsg::Update {
            global_data: snapshot.global.clone(),
            clients: snapshot.views_for(viewer, self.render_dist),
            events,
        };
        (Outbound { msg, delivers }, upto)
    }
}

async fn run_session(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    link: &Link,
    accepted: &JoinAccepted,
) {
    let mut snapshots = link.state.snapshots().subscribe();
    let mut viewer = Viewer {
        accepted,
        render_dist: None,
        queued_events: 0,
    };

    loop {
        tokio::select! {
            incoming = next_message(reader, buf, link) => match incoming {
                Incoming::Msg(msg) => {
                    if !handle_message(msg, link, &mut viewer).await {
                        break;
                    }
                }
                Incoming::Skip => {}
                Incoming::Closed => break,
            },
            received = snapshots.recv() => match received {
                Ok(snapshot) => {
                    let (update, upto) = viewer.update_for(&snapshot);
                    match link.out.try_send(update) {
                        Ok(()) => viewer.queued_events = upto,
                        // Events stay pending and go out with a later snapshot
                        Err(mpsc::error::TrySendError::Full(_)) => {}
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        conn = %link.id,
                        username = %accepted.username,
                        lagged_count = n,
                        "Client lagged, skipping {} snapshots", n
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(conn = %link.id, "Snapshot channel closed");
                    break;
                }
            }
        }
    }
}

/// Handle one message from a joined client; false ends the session
async fn handle_message(msg: ClientMsg, link: &Link, viewer: &mut Viewer<'_>) -> bool {
    let accepted = viewer.accepted;
    let sim = &link.state.sim;

    match msg {
        ClientMsg::Update { input } => {
            let spec = accepted
                .boat_type
                .as_ref()
                .and_then(|boat_type| accepted.boats.get(boat_type));
            let Some(spec) = spec else {
                return link
                    .reply(ServerMsg::error("no-session", "this user has no boat"))
                    .await;
            };
            if let Err(e) = input.validate(&accepted.username, spec) {
                debug!(conn = %link.id, username = %accepted.username, error = %e, "Invalid input");
                return link
                    .reply(ServerMsg::error("invalid-input", e.to_string()))
                    .await;
            }
            if let Some(dist) = input.render_dist {
                viewer.render_dist = Some(dist);
            }
            sim.update(&accepted.username, input).await
        }
        ClientMsg::Admin { command } => {
            if !accepted.admin {
                let e = AdminError::NotAdmin;
                return link.reply(ServerMsg::error("not-admin", e.to_string())).await;
            }
            info!(conn = %link.id, command = ?command, "Admin command");
            match sim.admin(command).await {
                Ok(report) => link.reply(ServerMsg::Status(report)).await,
                Err(AdminError::Closed) => false,
                Err(e) => link.reply(ServerMsg::error("admin", e.to_string())).await,
            }
        }
        ClientMsg::Ping { t } => {
            if !accepted.admin && !sim.heartbeat(&accepted.username).await {
                return false;
            }
            link.reply(ServerMsg::Pong { t }).await
        }
        ClientMsg::Join { .. } => {
            link.reply(ServerMsg::error("already-joined", "this connection has already joined"))
                .await
        }
    }
}

/// Drain the outbound queue onto the socket
///
/// Events are acknowledged to the simulation only after their frame is written.
async fn write_loop(
    id: Uuid,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    sim: SimulationHandle,
) {
    while let Some(Outbound { msg, delivers }) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(conn = %id, error = %e, "TCP send failed");
            return;
        }
        if let Some((username, upto)) = delivers {
            sim.events_delivered(&username, upto).await;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use glam::DVec2;

    use crate::config::Config;
    use crate::game::session::SessionEvent;
    use crate::game::{Simulation, SimulationHandle, SimulationRunner, SnapshotServer};
    use crate::net::protocol::{AdminCommand, ClientInput};
    use crate::store::{fixtures::write_data_dir, FileStore};

    struct Harness {
        _dir: tempfile::TempDir,
        addr: SocketAddr,
        handle: SimulationHandle,
        stop: Option<tokio::sync::oneshot::Sender<()>>,
    }

    async fn start() -> Harness {
        let dir = tempfile::TempDir::new().unwrap();
        write_data_dir(dir.path());
        let store = FileStore::new(dir.path());
        let setup = store.load_simulation("regatta", "1234").unwrap();

        let snapshots = Arc::new(SnapshotServer::new(16));
        let (runner, handle) = SimulationRunner::new(Simulation::new(setup, 3), store, snapshots);
        tokio::spawn(runner.run());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Config {
            server_addr: addr,
            http_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "debug".into(),
            data_dir: dir.path().to_path_buf(),
            sim_name: "regatta".into(),
            admin_code: "1234".into(),
            monitor_origin: "*".into(),
        };
        let state = AppState::new(config, handle.clone());

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(serve(listener, state, async {
            let _ = stopped.await;
        }));

        Harness {
            _dir: dir,
            addr,
            handle,
            stop: Some(stop),
        }
    }

    struct Client {
        stream: TcpStream,
        buf: BytesMut,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                buf: BytesMut::new(),
            }
        }

        async fn send(&mut self, msg: ClientMsg) {
            write_frame(&mut self.stream, &msg).await.unwrap();
        }

        /// Next message that is not a periodic update
        async fn reply(&mut self) -> ServerMsg {
            loop {
                let msg = self.recv().await;
                if !matches!(msg, ServerMsg::Update { .. }) {
                    return msg;
                }
            }
        }

        async fn recv(&mut self) -> ServerMsg {
            let read = read_frame(&mut self.stream, &mut self.buf);
            let frame = tokio::time::timeout(Duration::from_secs(5), read)
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .expect("connection closed");
            serde_json::from_slice(&frame).unwrap()
        }
    }

    fn join(username: &str, password: &str) -> ClientMsg {
        ClientMsg::Join {
            username: username.into(),
            password: password.into(),
            sim_password: None,
        }
    }

    fn error_code(msg: &ServerMsg) -> &str {
        match msg {
            ServerMsg::Error { code, .. } => code,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_joins_and_receives_updates() {
        let mut harness = start().await;
        let mut client = Client::connect(harness.addr).await;

        client.send(join("amy", "wrong")).await;
        assert_eq!(error_code(&client.recv().await), "invalid-credentials");

        client
            .send(ClientMsg::Update {
                input: ClientInput::default(),
            })
            .await;
        assert_eq!(error_code(&client.recv().await), "not-joined");

        client.send(join("amy", "sea")).await;
        match client.recv().await {
            ServerMsg::Joined {
                username,
                admin,
                boats,
                map,
                ..
            } => {
                assert_eq!(username, "amy");
                assert!(!admin);
                assert!(boats.contains_key("dinghy"));
                assert_eq!(map.start, DVec2::new(100.0, 100.0));
            }
            other => panic!("expected joined, got {other:?}"),
        }

        client
            .send(ClientMsg::Admin {
                command: AdminCommand::Status,
            })
            .await;
        assert_eq!(error_code(&client.reply().await), "not-admin");

        client
            .send(ClientMsg::Update {
                input: ClientInput {
                    rudder: Some(120.0),
                    ..Default::default()
                },
            })
            .await;
        assert_eq!(error_code(&client.reply().await), "invalid-input");

        client.send(ClientMsg::Ping { t: 42 }).await;
        assert!(matches!(client.reply().await, ServerMsg::Pong { t: 42 }));

        let mut saw_own_boat = false;
        for _ in 0..60 {
            if let ServerMsg::Update { clients, .. } = client.recv().await {
                if clients.contains_key("amy") {
                    saw_own_boat = true;
                    break;
                }
            }
        }
        assert!(saw_own_boat);

        drop(client);
        harness.handle.shutdown().await;
        let _ = harness.stop.take().map(|stop| stop.send(()));
    }

    #[tokio::test]
    async fn events_are_sent_once() {
        let mut harness = start().await;
        let mut client = Client::connect(harness.addr).await;

        client.send(join("amy", "sea")).await;
        assert!(matches!(client.recv().await, ServerMsg::Joined { .. }));
        harness
            .handle
            .admin(AdminCommand::UserReset {
                username: "amy".into(),
            })
            .await
            .unwrap();

        let mut resets = 0;
        for _ in 0..40 {
            if let ServerMsg::Update { events, .. } = client.recv().await {
                resets += events
                    .iter()
                    .filter(|e| matches!(e, SessionEvent::Reset))
                    .count();
            }
        }
        assert_eq!(resets, 1);

        drop(client);
        harness.handle.shutdown().await;
        let _ = harness.stop.take().map(|stop| stop.send(()));
    }

    #[tokio::test]
    async fn admin_commands_answer_with_status() {
        let mut harness = start().await;
        let mut admin = Client::connect(harness.addr).await;

        admin.send(join("__admin__", "1234")).await;
        assert!(matches!(
            admin.recv().await,
            ServerMsg::Joined { admin: true, .. }
        ));

        admin
            .send(ClientMsg::Admin {
                command: AdminCommand::TogglePause,
            })
            .await;
        match admin.reply().await {
            ServerMsg::Status(report) => assert!(report.paused),
            other => panic!("expected status, got {other:?}"),
        }

        admin
            .send(ClientMsg::Update {
                input: ClientInput::default(),
            })
            .await;
        assert_eq!(error_code(&admin.reply().await), "no-session");

        harness.handle.shutdown().await;
        let _ = harness.stop.take().map(|stop| stop.send(()));
    }

    #[tokio::test]
    async fn garbage_header_closes_connection() {
        let mut harness = start().await;
        let mut client = Client::connect(harness.addr).await;

        client.stream.write_all(b"hello there\n").await.unwrap();
        assert_eq!(error_code(&client.recv().await), "bad-frame");

        let mut rest = BytesMut::new();
        let closed = read_frame(&mut client.stream, &mut rest).await;
        assert!(matches!(closed, Ok(None)));

        harness.handle.shutdown().await;
        let _ = harness.stop.take().map(|stop| stop.send(()));
    }
}
