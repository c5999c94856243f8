//! Simulation state and authoritative tick loop

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::DVec2;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::{GuiSettings, SimulatorSettings};
use crate::net::protocol::{
    AdminCommand, ClientInput, ClientStatus, InputError, StatusReport, ADMIN_USERNAME,
};
use crate::store::{Contact, FileStore, LoadedSimulation, PersistenceError, SimFile};

use super::autopilot::AutopilotTuning;
use super::boat::BoatSpec;
use super::map::{LandCheck, Map, PolygonLandCheck};
use super::physics::{frame_dt, PhysicsSystem};
use super::session::{ClientSession, ConnectionState, SessionEvent, SessionTimer};
use super::snapshot::{
    software_version, ClientEntry, GlobalData, GlobalTimer, PendingEvents, Snapshot,
    SnapshotServer,
};
use super::wind::WindModel;

/// Rejected join attempts; nothing is created or changed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("simulation password rejected")]
    SimPassword,

    #[error("user is blocked")]
    Blocked,

    #[error("boat type {0:?} is not loaded")]
    UnknownBoat(String),

    #[error("simulation is not running")]
    Unavailable,
}

/// Rejected admin commands
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdminError {
    #[error("no session for user {0:?}")]
    UnknownUser(String),

    #[error("time ratio must be a finite non-negative number, got {0}")]
    InvalidRatio(f64),

    #[error("position must be finite")]
    InvalidPosition,

    #[error("only __admin__ may send admin commands")]
    NotAdmin,

    #[error("simulation is shutting down")]
    Closed,
}

/// What a successful join hands back to the connection
#[derive(Debug, Clone)]
pub struct JoinAccepted {
    pub username: String,
    pub admin: bool,
    /// Boat type of the joined session, `None` for the admin
    pub boat_type: Option<String>,
    pub map: Arc<Map>,
    pub boats: Arc<BTreeMap<String, BoatSpec>>,
    pub gui: GuiSettings,
}

/// The authoritative simulation; only the tick task touches it
pub struct Simulation {
    name: String,
    map_name: String,
    map: Arc<Map>,
    land: Box<dyn LandCheck>,
    boats: Arc<BTreeMap<String, BoatSpec>>,
    default_boat: String,
    settings: SimulatorSettings,
    overrides: Option<serde_json::Value>,
    gui: GuiSettings,
    /// Username to password
    contacts: BTreeMap<String, String>,
    password: Option<String>,
    wind: WindModel,
    sessions: BTreeMap<String, ClientSession>,
    paused: bool,
    record: Option<f64>,
    timer: SessionTimer,
    tick: u64,
    /// Real seconds since start, used for contact timeouts
    clock: f64,
}

impl Simulation {
    pub fn new(loaded: LoadedSimulation, seed: u64) -> Self {
        let LoadedSimulation {
            name,
            file,
            map,
            boats,
            settings,
            gui,
            contacts,
        } = loaded;

        let land = Box::new(PolygonLandCheck::new(&map));
        let wind = WindModel::new(settings.wind, file.wind_state, seed);

        Self {
            name,
            map_name: file.map,
            map: Arc::new(map),
            land,
            boats: Arc::new(boats),
            default_boat: file.boat,
            settings,
            overrides: file.settings,
            gui,
            contacts: contacts
                .into_iter()
                .map(|Contact { username, password }| (username, password))
                .collect(),
            password: file.password,
            wind,
            sessions: file.clients,
            paused: file.paused,
            record: file.record,
            timer: file.timer,
            tick: 0,
            clock: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &SimulatorSettings {
        &self.settings
    }

    pub fn overrides(&self) -> Option<&serde_json::Value> {
        self.overrides.as_ref()
    }

    pub fn session(&self, username: &str) -> Option<&ClientSession> {
        self.sessions.get(username)
    }

    /// Swap in freshly resolved settings
    pub fn apply_settings(&mut self, settings: SimulatorSettings) {
        self.wind.update_settings(settings.wind);
        self.settings = settings;
        info!(sim = %self.name, "Settings reloaded");
    }

    /// Authenticate a user and attach them to their session, creating it on first join
    pub fn join(
        &mut self,
        username: &str,
        password: &str,
        sim_password: Option<&str>,
    ) -> Result<JoinAccepted, AuthError> {
        if self.contacts.get(username).map(String::as_str) != Some(password) {
            return Err(AuthError::InvalidCredentials);
        }
        if let Some(expected) = &self.password {
            if sim_password != Some(expected.as_str()) {
                return Err(AuthError::SimPassword);
            }
        }

        if username == ADMIN_USERNAME {
            info!(sim = %self.name, "Admin joined");
            return Ok(self.accepted(username, None));
        }

        if self.sessions.get(username).is_some_and(|s| s.blocked) {
            return Err(AuthError::Blocked);
        }

        if !self.sessions.contains_key(username) {
            let spec = self
                .boats
                .get(&self.default_boat)
                .ok_or_else(|| AuthError::UnknownBoat(self.default_boat.clone()))?;
            let session = ClientSession::new(
                username,
                &self.default_boat,
                spec,
                &self.map,
                self.timer.ratio,
            );
            info!(sim = %self.name, username = %username, "Created session");
            self.sessions.insert(username.to_string(), session);
        }

        let clock = self.clock;
        let session = self
            .sessions
            .get_mut(username)
            .ok_or(AuthError::InvalidCredentials)?;
        session.connect(clock);
        let boat_type = session.boat.boat_type.clone();

        info!(sim = %self.name, username = %username, "User joined");
        Ok(self.accepted(username, Some(boat_type)))
    }

    fn accepted(&self, username: &str, boat_type: Option<String>) -> JoinAccepted {
        JoinAccepted {
            username: username.to_string(),
            admin: boat_type.is_none(),
            boat_type,
            map: self.map.clone(),
            boats: self.boats.clone(),
            gui: self.gui.clone(),
        }
    }

    /// Connection closed: the session goes dormant
    pub fn disconnect(&mut self, username: &str) {
        if let Some(session) = self.sessions.get_mut(username) {
            if session.is_connected() {
                session.connection = ConnectionState::Disconnected;
                session.rudder_input = Default::default();
                info!(sim = %self.name, username = %username, "User disconnected");
            }
        }
    }

    /// A connection wrote the user's events up to sequence `upto`
    pub fn acknowledge_events(&mut self, username: &str, upto: u64) {
        if let Some(session) = self.sessions.get_mut(username) {
            session.acknowledge_events(upto);
        }
    }

    /// Any message from a joined connection keeps its session alive
    pub fn heartbeat(&mut self, username: &str) {
        let clock = self.clock;
        if let Some(session) = self.sessions.get_mut(username) {
            session.touch(clock);
        }
    }

    /// Validate then apply one client update
    pub fn apply_input(&mut self, username: &str, input: ClientInput) -> Result<(), InputError> {
        let clock = self.clock;
        let session = self
            .sessions
            .get_mut(username)
            .ok_or(InputError::NoSession)?;
        let spec = self
            .boats
            .get(&session.boat.boat_type)
            .ok_or(InputError::NoSession)?;
        input.validate(username, spec)?;

        session.touch(clock);
        if session.blocked {
            return Ok(());
        }

        session.rudder_input.manual = input.rudder;
        session.rudder_input.slider = input.rudder_slider;

        for (sail, angle) in &input.sheeting_angles {
            if let Some(state) = session.boat.sails.get_mut(sail) {
                state.sheeting_angle = *angle;
            }
        }

        if session.enabled {
            if let Some(autopilot) = input.autopilot {
                if let Some(target) = autopilot.target {
                    session.autopilot.set_target(target, &session.boat);
                }
                if let Some(enabled) = autopilot.enabled {
                    session.autopilot.set_enabled(enabled);
                }
            }
        }

        if let Some(paused) = input.paused {
            session.paused = paused;
        }
        if input.reset {
            session.reset();
            info!(sim = %self.name, username = %username, "User reset");
        }
        Ok(())
    }

    /// Apply an operator command that stays inside the simulation
    ///
    /// `save` and `reload-settings` need file access and are handled by the runner.
    pub fn apply_admin(&mut self, command: &AdminCommand) -> Result<(), AdminError> {
        match command {
            AdminCommand::TogglePause => {
                self.paused = !self.paused;
                info!(sim = %self.name, paused = self.paused, "Toggled global pause");
            }
            AdminCommand::SetTimeRatio { ratio } => {
                if !ratio.is_finite() || *ratio < 0.0 {
                    return Err(AdminError::InvalidRatio(*ratio));
                }
                self.set_time_ratio(*ratio);
            }
            AdminCommand::Reset => self.reset(),
            AdminCommand::ReloadSettings | AdminCommand::Save | AdminCommand::Status => {}
            AdminCommand::UserReset { username } => self.user(username)?.reset(),
            AdminCommand::UserTogglePause { username } => {
                let session = self.user(username)?;
                session.paused = !session.paused;
            }
            AdminCommand::UserSetPos {
                username,
                pos,
                angle,
            } => {
                if !pos.is_finite() || angle.is_some_and(|a| !a.is_finite()) {
                    return Err(AdminError::InvalidPosition);
                }
                let session = self.user(username)?;
                session.boat.pos = *pos;
                if let Some(angle) = angle {
                    session.boat.angle = angle.rem_euclid(360.0);
                }
            }
            AdminCommand::UserRepair { username } => {
                let boats = self.boats.clone();
                let session = self.user(username)?;
                if let Some(spec) = boats.get(&session.boat.boat_type) {
                    session.repair(spec);
                }
            }
            AdminCommand::UserBlock { username } => {
                let session = self.user(username)?;
                session.blocked = true;
                session.rudder_input = Default::default();
            }
            AdminCommand::UserUnblock { username } => self.user(username)?.blocked = false,
            AdminCommand::UserRemove { username } => {
                self.sessions
                    .remove(username)
                    .ok_or_else(|| AdminError::UnknownUser(username.clone()))?;
            }
        }

        info!(sim = %self.name, command = ?command, "Admin command applied");
        Ok(())
    }

    fn user(&mut self, username: &str) -> Result<&mut ClientSession, AdminError> {
        self.sessions
            .get_mut(username)
            .ok_or_else(|| AdminError::UnknownUser(username.to_string()))
    }

    fn set_time_ratio(&mut self, ratio: f64) {
        self.timer.ratio = ratio;
        for session in self.sessions.values_mut() {
            session.timer.ratio = ratio;
        }
    }

    /// Reset every session, unpause, and restart the global timer at ratio 1
    pub fn reset(&mut self) {
        self.paused = false;
        for session in self.sessions.values_mut() {
            session.reset();
        }
        self.timer.reset();
        self.set_time_ratio(1.0);
        info!(sim = %self.name, "Simulation reset");
    }

    /// Advance everything by `elapsed` real seconds
    pub fn tick(&mut self, elapsed: f64) {
        self.tick += 1;
        self.clock += elapsed.max(0.0);

        let dt = if self.paused {
            0.0
        } else {
            frame_dt(elapsed, self.settings.lag_limit, self.timer.ratio)
        };

        let wind = self.wind.step(dt).vector();
        if !self.paused {
            self.timer.advance(dt);
        }

        // targets for `user` autopilots, fixed for the whole tick
        let positions: BTreeMap<String, DVec2> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_connected() && !s.blocked)
            .map(|(name, s)| (name.clone(), s.boat.pos))
            .collect();

        let tuning = AutopilotTuning {
            gain: self.settings.autopilot_gain,
            max_rudder: self.settings.autopilot_max_rudder,
            max_rudder_movement: self.settings.max_rudder_movement,
        };

        for (name, session) in self.sessions.iter_mut() {
            if !session.is_eligible(self.paused) {
                continue;
            }
            let Some(spec) = self.boats.get(&session.boat.boat_type) else {
                warn!(username = %name, boat_type = %session.boat.boat_type, "No spec for boat");
                continue;
            };

            session.rudder_input.autopilot =
                session
                    .autopilot
                    .update(&session.boat, |n| positions.get(n).copied(), dt, &tuning);
            if let Some(relative) = session.rudder_input.resolve() {
                session.boat.rudder_angle = 270.0 + relative;
            }

            let prev_pos = session.boat.pos;
            let report = PhysicsSystem::step(
                &mut session.boat,
                spec,
                wind,
                dt,
                &self.settings.sanity_limits,
            );
            session.forces = report.forces;
            if report.sanity_limited {
                debug!(username = %name, "Sanity limit reached");
                session.events.push(SessionEvent::SanityLimit);
            }

            if let Some(hit) = PhysicsSystem::resolve_land(
                &mut session.boat,
                prev_pos,
                spec,
                self.land.as_ref(),
                self.settings.collision_damage_factor,
            ) {
                debug!(username = %name, damage = hit.damage, "Ran aground");
                session.events.push(SessionEvent::Collision {
                    damage: hit.damage,
                    with: None,
                });
                if PhysicsSystem::apply_damage(&mut session.boat, spec, hit.damage) {
                    info!(username = %name, "Shipwrecked on land");
                    session.shipwreck();
                    continue;
                }
            }

            if session.check_finish(self.map.end, spec) {
                let time = session.timer.t;
                info!(username = %name, time, "Finished");
                if self.record.map_or(true, |r| time < r) {
                    self.record = Some(time);
                }
                continue;
            }

            session.timer.advance(dt);
            session.record_tracer(self.settings.tracer_resolution);
        }

        if !self.paused {
            self.resolve_boat_contacts();
        }

        let (clock, timeout) = (self.clock, self.settings.client_timeout);
        for (name, session) in self.sessions.iter_mut() {
            if session.check_timeout(clock, timeout) {
                info!(sim = %self.name, username = %name, "Session timed out");
            }
        }
    }

    /// Bounding-circle contacts between every pair of boats
    ///
    /// A boat that is not eligible to move is a fixed obstacle: it keeps its
    /// position, velocity and hull while an eligible boat bounces off it.
    fn resolve_boat_contacts(&mut self) {
        let factor = self.settings.collision_damage_factor;
        let globally_paused = self.paused;
        let boats = self.boats.clone();
        let mut entries: Vec<(&String, &mut ClientSession)> = self.sessions.iter_mut().collect();

        for i in 0..entries.len() {
            let (head, tail) = entries.split_at_mut(i + 1);
            let (name_a, a) = &mut head[i];

            for (name_b, b) in tail.iter_mut() {
                let (a_moves, b_moves) =
                    (a.is_eligible(globally_paused), b.is_eligible(globally_paused));
                if !a_moves && !b_moves {
                    continue;
                }
                let (Some(spec_a), Some(spec_b)) =
                    (boats.get(&a.boat.boat_type), boats.get(&b.boat.boat_type))
                else {
                    continue;
                };
                let (ra, rb) = (spec_a.max_radius(), spec_b.max_radius());
                if !PhysicsSystem::check_boat_collision(a.boat.pos, ra, b.boat.pos, rb) {
                    continue;
                }

                let speed = (a.boat.velocity - b.boat.velocity).length();
                let damage = factor.max(0.0) * speed * spec_a.mass.min(spec_b.mass);
                info!(a = %name_a, b = %name_b, damage, "Boats collided");

                let (pa, pb) = PhysicsSystem::separate(a.boat.pos, ra, b.boat.pos, rb);
                let (shift_a, shift_b) = (pa - a.boat.pos, pb - b.boat.pos);

                if a_moves && b_moves {
                    std::mem::swap(&mut a.boat.velocity, &mut b.boat.velocity);
                    std::mem::swap(&mut a.boat.angular_velocity, &mut b.boat.angular_velocity);
                    a.boat.pos = pa;
                    b.boat.pos = pb;
                    collide(a, spec_a, damage, name_b.as_str());
                    collide(b, spec_b, damage, name_a.as_str());
                } else if a_moves {
                    bounce_off(a, shift_a - shift_b);
                    collide(a, spec_a, damage, name_b.as_str());
                } else {
                    bounce_off(b, shift_b - shift_a);
                    collide(b, spec_b, damage, name_a.as_str());
                }
            }
        }
    }

    /// Build this tick's snapshot, copying every undelivered event
    pub fn snapshot(&mut self) -> Snapshot {
        let mut clients = BTreeMap::new();
        let mut events = BTreeMap::new();

        for (name, session) in self.sessions.iter_mut() {
            let reach = self
                .boats
                .get(&session.boat.boat_type)
                .map_or(0.0, BoatSpec::max_radius);
            clients.insert(name.clone(), ClientEntry::capture(session, self.paused, reach));

            session.trim_events(MAX_PENDING_EVENTS);
            if !session.events.is_empty() {
                events.insert(
                    name.clone(),
                    PendingEvents {
                        first: session.events_base,
                        events: session.events.clone(),
                    },
                );
            }
        }

        Snapshot {
            version: software_version(),
            global: GlobalData {
                tick: self.tick,
                paused: self.paused,
                record: self.record,
                timer: GlobalTimer {
                    t: self.timer.t,
                    ratio: self.timer.ratio,
                },
                wind: self.wind.vector(),
            },
            clients,
            events,
        }
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            paused: self.paused,
            ratio: self.timer.ratio,
            t: self.timer.t,
            clients: self
                .sessions
                .iter()
                .map(|(name, s)| {
                    (
                        name.clone(),
                        ClientStatus {
                            connection: s.connection,
                            enabled: s.enabled,
                            paused: s.paused,
                            blocked: s.blocked,
                            finished: s.is_finished(),
                            hull_durability: s.boat.hull_durability,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Persistable copy of the current state
    pub fn to_file(&self) -> SimFile {
        SimFile {
            map: self.map_name.clone(),
            boat: self.default_boat.clone(),
            password: self.password.clone(),
            paused: self.paused,
            record: self.record,
            timer: self.timer,
            settings: self.overrides.clone(),
            wind_state: Some(self.wind.state()),
            clients: self.sessions.clone(),
            saved_at: None,
        }
    }
}

/// Reflect a boat off a fixed obstacle, taking the whole separation itself
fn bounce_off(session: &mut ClientSession, shift: DVec2) {
    session.boat.velocity = -session.boat.velocity;
    session.boat.angular_velocity = -session.boat.angular_velocity;
    session.boat.pos += shift;
}

fn collide(session: &mut ClientSession, spec: &BoatSpec, damage: f64, other: &str) {
    session.events.push(SessionEvent::Collision {
        damage,
        with: Some(other.to_string()),
    });
    if PhysicsSystem::apply_damage(&mut session.boat, spec, damage) {
        info!(username = %session.username, "Shipwrecked in a collision");
        session.shipwreck();
    }
}

/// Commands accepted by the tick task, applied at the next tick boundary
#[derive(Debug)]
pub enum Command {
    Join {
        username: String,
        password: String,
        sim_password: Option<String>,
        reply: oneshot::Sender<Result<JoinAccepted, AuthError>>,
    },
    Update {
        username: String,
        input: ClientInput,
    },
    Heartbeat {
        username: String,
    },
    Admin {
        command: AdminCommand,
        reply: oneshot::Sender<Result<StatusReport, AdminError>>,
    },
    Disconnect {
        username: String,
    },
    EventsDelivered {
        username: String,
        upto: u64,
    },
    SaveFinished(Result<PathBuf, PersistenceError>),
    SettingsReloaded(Result<SimulatorSettings, PersistenceError>),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle used by network tasks to reach the tick task
#[derive(Clone)]
pub struct SimulationHandle {
    tx: mpsc::Sender<Command>,
    snapshots: Arc<SnapshotServer>,
}

impl SimulationHandle {
    pub fn snapshots(&self) -> &Arc<SnapshotServer> {
        &self.snapshots
    }

    pub async fn join(
        &self,
        username: &str,
        password: &str,
        sim_password: Option<&str>,
    ) -> Result<JoinAccepted, AuthError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Join {
            username: username.to_string(),
            password: password.to_string(),
            sim_password: sim_password.map(str::to_string),
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return Err(AuthError::Unavailable);
        }
        rx.await.unwrap_or(Err(AuthError::Unavailable))
    }

    /// Queue an update; false once the simulation has stopped
    pub async fn update(&self, username: &str, input: ClientInput) -> bool {
        self.tx
            .send(Command::Update {
                username: username.to_string(),
                input,
            })
            .await
            .is_ok()
    }

    pub async fn heartbeat(&self, username: &str) -> bool {
        self.tx
            .send(Command::Heartbeat {
                username: username.to_string(),
            })
            .await
            .is_ok()
    }

    pub async fn admin(&self, command: AdminCommand) -> Result<StatusReport, AdminError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Admin { command, reply }).await.is_err() {
            return Err(AdminError::Closed);
        }
        rx.await.unwrap_or(Err(AdminError::Closed))
    }

    pub async fn disconnect(&self, username: &str) {
        let _ = self
            .tx
            .send(Command::Disconnect {
                username: username.to_string(),
            })
            .await;
    }

    /// Events up to `upto` reached the client and can be dropped
    pub async fn events_delivered(&self, username: &str, upto: u64) -> bool {
        self.tx
            .send(Command::EventsDelivered {
                username: username.to_string(),
                upto,
            })
            .await
            .is_ok()
    }

    /// Stop the tick task after a final save
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Owns the simulation and drives it on a fixed interval
pub struct SimulationRunner {
    sim: Simulation,
    store: FileStore,
    rx: mpsc::Receiver<Command>,
    /// Lets background saves and reloads report back
    tx: mpsc::Sender<Command>,
    snapshots: Arc<SnapshotServer>,
    save_in_flight: bool,
}

impl SimulationRunner {
    pub fn new(
        sim: Simulation,
        store: FileStore,
        snapshots: Arc<SnapshotServer>,
    ) -> (Self, SimulationHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = SimulationHandle {
            tx: tx.clone(),
            snapshots: snapshots.clone(),
        };
        let runner = Self {
            sim,
            store,
            rx,
            tx,
            snapshots,
            save_in_flight: false,
        };
        (runner, handle)
    }

    /// Run ticks until shutdown or a faulted tick
    pub async fn run(mut self) {
        let tick_rate = self.sim.settings().tick_rate.clamp(1.0, 240.0);
        info!(sim = %self.sim.name(), tick_rate, "Simulation started");

        let mut tick_interval = interval(Duration::from_secs_f64(1.0 / tick_rate));
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        loop {
            tick_interval.tick().await;

            // Drain command queue
            if let Some(reply) = self.process_commands() {
                self.save_now().await;
                let _ = reply.send(());
                break;
            }

            let now = Instant::now();
            let elapsed = now.duration_since(last_tick).as_secs_f64();
            last_tick = now;

            let sim = &mut self.sim;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                sim.tick(elapsed);
                sim.snapshot()
            }));

            match outcome {
                Ok(snapshot) => self.snapshots.publish(snapshot),
                Err(_) => {
                    error!(sim = %self.sim.name(), "Tick faulted, saving and stopping");
                    self.save_now().await;
                    break;
                }
            }
        }

        info!(sim = %self.sim.name(), "Simulation stopped");
    }

    /// Apply queued commands; returns the shutdown reply if one arrived
    fn process_commands(&mut self) -> Option<oneshot::Sender<()>> {
        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Join {
                    username,
                    password,
                    sim_password,
                    reply,
                } => {
                    let result = self.sim.join(&username, &password, sim_password.as_deref());
                    if let Err(e) = &result {
                        warn!(username = %username, error = %e, "Join rejected");
                    }
                    let _ = reply.send(result);
                }
                Command::Update { username, input } => {
                    if let Err(e) = self.sim.apply_input(&username, input) {
                        warn!(username = %username, error = %e, "Input rejected");
                    }
                }
                Command::Heartbeat { username } => self.sim.heartbeat(&username),
                Command::Admin { command, reply } => {
                    let result = self.handle_admin(command);
                    let _ = reply.send(result);
                }
                Command::Disconnect { username } => self.sim.disconnect(&username),
                Command::EventsDelivered { username, upto } => {
                    self.sim.acknowledge_events(&username, upto)
                }
                Command::SaveFinished(result) => {
                    self.save_in_flight = false;
                    match result {
                        Ok(path) => info!(path = %path.display(), "Simulation saved"),
                        Err(e) => error!(error = %e, "Simulation save failed"),
                    }
                }
                Command::SettingsReloaded(result) => match result {
                    Ok(settings) => self.sim.apply_settings(settings),
                    Err(e) => error!(error = %e, "Settings reload failed, keeping current settings"),
                },
                Command::Shutdown { reply } => return Some(reply),
            }
        }
        None
    }

    fn handle_admin(&mut self, command: AdminCommand) -> Result<StatusReport, AdminError> {
        match command {
            AdminCommand::Save => self.spawn_save(),
            AdminCommand::ReloadSettings => self.spawn_reload(),
            other => self.sim.apply_admin(&other)?,
        }
        Ok(self.sim.status())
    }

    fn spawn_save(&mut self) {
        if !self.sim.settings().save_sims {
            debug!(sim = %self.sim.name(), "Saving disabled by settings");
            return;
        }
        if self.save_in_flight {
            debug!(sim = %self.sim.name(), "Save already running");
            return;
        }
        self.save_in_flight = true;

        let file = self.sim.to_file();
        let name = self.sim.name().to_string();
        let store = self.store.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || store.save_sim(&name, &file))
                .await
                .unwrap_or_else(|e| Err(PersistenceError::Task(e.to_string())));
            let _ = tx.send(Command::SaveFinished(result)).await;
        });
    }

    fn spawn_reload(&self) {
        let overrides = self.sim.overrides().cloned();
        let store = self.store.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || store.resolve_settings(overrides.as_ref()))
                    .await
                    .unwrap_or_else(|e| Err(PersistenceError::Task(e.to_string())));
            let _ = tx.send(Command::SettingsReloaded(result)).await;
        });
    }

    /// Save and wait for the result
    async fn save_now(&self) {
        if !self.sim.settings().save_sims {
            return;
        }
        let file = self.sim.to_file();
        let name = self.sim.name().to_string();
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || store.save_sim(&name, &file))
            .await
            .unwrap_or_else(|e| Err(PersistenceError::Task(e.to_string())));
        match result {
            Ok(path) => info!(path = %path.display(), "Final save complete"),
            Err(e) => error!(error = %e, "Final save failed"),
        }
    }
}

/// Bound on queued commands before senders wait
const COMMAND_QUEUE: usize = 1024;

/// Unacknowledged events kept per user; older ones are dropped first
const MAX_PENDING_EVENTS: usize = 64;
