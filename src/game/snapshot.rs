//! Tick-consistent snapshots and their publication

use std::collections::BTreeMap;
use std::sync::Arc;

use glam::DVec2;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::autopilot::Autopilot;
use super::boat::BoatState;
use super::forces::Forces;
use super::session::{ClientSession, Completion, ConnectionState, SessionEvent, SessionTimer};

/// `[major, minor, patch]` of this build
pub fn software_version() -> [u32; 3] {
    [
        env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalTimer {
    pub t: f64,
    pub ratio: f64,
}

/// Simulation-wide values sent with every update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GlobalData {
    pub tick: u64,
    pub paused: bool,
    pub record: Option<f64>,
    pub timer: GlobalTimer,
    /// True wind vector
    pub wind: DVec2,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeneralView {
    pub enabled: bool,
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoatView {
    pub pos: DVec2,
    pub angle: f64,
    pub velocity: DVec2,
}

/// What anyone may see of a boat
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PublicView {
    pub general: GeneralView,
    pub boat: BoatView,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GeneralDetail {
    pub enabled: bool,
    pub paused: bool,
    pub blocked: bool,
    pub finished: bool,
    pub connection: ConnectionState,
    pub record: Option<f64>,
    pub timer: SessionTimer,
    pub completion: Option<Completion>,
}

/// Full state of a boat, sent to clients within render distance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DetailView {
    pub general: GeneralDetail,
    pub boat: BoatState,
    pub forces: Forces,
    pub autopilot: Autopilot,
    pub tracer_lst: Vec<DVec2>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientView {
    Full(Box<DetailView>),
    Minimal(PublicView),
}

/// One session as captured at the end of a tick
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEntry {
    pub public: PublicView,
    pub detail: DetailView,
    /// Bounding radius of the hull
    pub reach: f64,
}

impl ClientEntry {
    pub fn capture(session: &ClientSession, globally_paused: bool, reach: f64) -> Self {
        let paused = session.paused || globally_paused;
        let boat = &session.boat;
        Self {
            public: PublicView {
                general: GeneralView {
                    enabled: session.enabled,
                    paused,
                },
                boat: BoatView {
                    pos: boat.pos,
                    angle: boat.angle,
                    velocity: boat.velocity,
                },
            },
            detail: DetailView {
                general: GeneralDetail {
                    enabled: session.enabled,
                    paused,
                    blocked: session.blocked,
                    finished: session.is_finished(),
                    connection: session.connection,
                    record: session.record,
                    timer: session.timer,
                    completion: session.completion,
                },
                boat: boat.clone(),
                forces: session.forces,
                autopilot: session.autopilot.clone(),
                tracer_lst: session.tracer.clone(),
            },
            reach,
        }
    }
}

/// A user's undelivered events, numbered from `first`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingEvents {
    pub first: u64,
    pub events: Vec<SessionEvent>,
}

impl PendingEvents {
    /// Sequence number after the last event
    pub fn end(&self) -> u64 {
        self.first + self.events.len() as u64
    }

    /// Events numbered `from` onwards
    ///
    /// A `from` past the end means the session was recreated, so everything
    /// is returned again.
    pub fn since(&self, from: u64) -> &[SessionEvent] {
        let skip = if from > self.end() {
            0
        } else {
            from.saturating_sub(self.first) as usize
        };
        &self.events[skip..]
    }
}

/// Immutable copy of the simulation taken once per tick
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub version: [u32; 3],
    pub global: GlobalData,
    pub clients: BTreeMap<String, ClientEntry>,
    /// Events no connection has acknowledged yet, by username
    pub events: BTreeMap<String, PendingEvents>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            version: software_version(),
            global: GlobalData {
                tick: 0,
                paused: false,
                record: None,
                timer: GlobalTimer { t: 0.0, ratio: 1.0 },
                wind: DVec2::ZERO,
            },
            clients: BTreeMap::new(),
            events: BTreeMap::new(),
        }
    }

    /// Per-boat views for one interactive client
    ///
    /// `viewer` of `None` sees everything in full. Otherwise boats whose hull
    /// comes within `render_dist` of the viewer's position are sent in full
    /// and the rest in their minimal public form.
    pub fn views_for(
        &self,
        viewer: Option<&str>,
        render_dist: Option<f64>,
    ) -> BTreeMap<String, ClientView> {
        let origin = viewer
            .and_then(|name| self.clients.get(name))
            .map(|entry| entry.public.boat.pos);

        self.clients
            .iter()
            .map(|(name, entry)| {
                let visible = match (viewer, origin, render_dist) {
                    (None, _, _) => true,
                    (Some(v), _, _) if v == name => true,
                    (Some(_), Some(origin), Some(dist)) => {
                        origin.distance(entry.public.boat.pos) - entry.reach < dist
                    }
                    (Some(_), Some(_), None) => true,
                    (Some(_), None, _) => false,
                };
                let view = if visible {
                    ClientView::Full(Box::new(entry.detail.clone()))
                } else {
                    ClientView::Minimal(entry.public)
                };
                (name.clone(), view)
            })
            .collect()
    }

    pub fn events_for(&self, username: &str) -> Vec<SessionEvent> {
        self.events_since(username, 0).0
    }

    /// Undelivered events from sequence `from` on, and the sequence to acknowledge
    pub fn events_since(&self, username: &str, from: u64) -> (Vec<SessionEvent>, u64) {
        match self.events.get(username) {
            Some(pending) => (pending.since(from).to_vec(), pending.end()),
            None => (Vec::new(), from),
        }
    }

    /// Document served to passive monitors
    pub fn monitor(&self) -> MonitorDocument {
        MonitorDocument {
            server_software_version: self.version,
            paused: self.global.paused,
            record: self.global.record.unwrap_or(-1.0),
            timer: self.global.timer,
            clients: self
                .clients
                .iter()
                .map(|(name, entry)| (name.clone(), entry.public))
                .collect(),
        }
    }
}

/// Snapshot schema polled by monitors over HTTP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MonitorDocument {
    pub server_software_version: [u32; 3],
    pub paused: bool,
    /// Seconds, `-1` when nobody has finished
    pub record: f64,
    pub timer: GlobalTimer,
    pub clients: BTreeMap<String, PublicView>,
}

/// Holds the latest snapshot and fans each new one out to subscribers
pub struct SnapshotServer {
    latest: RwLock<Arc<Snapshot>>,
    tx: broadcast::Sender<Arc<Snapshot>>,
}

impl SnapshotServer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            latest: RwLock::new(Arc::new(Snapshot::empty())),
            tx,
        }
    }

    /// Replace the current snapshot and notify subscribers
    pub fn publish(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        *self.latest.write() = snapshot.clone();
        // no subscribers is fine
        let _ = self.tx.send(snapshot);
    }

    pub fn latest(&self) -> Arc<Snapshot> {
        self.latest.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
