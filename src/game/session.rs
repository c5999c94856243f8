//! Per-client session state

use glam::DVec2;
use serde::{Deserialize, Serialize};

use super::autopilot::{Autopilot, RudderInput};
use super::boat::{BoatSpec, BoatState};
use super::forces::Forces;
use super::map::Map;

/// Network-facing lifecycle of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Authenticated, waiting for the first update
    Connecting,
    Active,
    /// Timed out or not yet rejoined since load
    #[default]
    Disconnected,
}

/// How a session finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    ReachedGoal,
    Shipwrecked,
}

/// Completion record, present once a session has finished
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub outcome: Outcome,
    /// Timer value at completion
    pub elapsed: f64,
}

/// Race timer in simulated seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionTimer {
    pub t: f64,
    pub running: bool,
    pub ratio: f64,
}

impl SessionTimer {
    pub fn new(ratio: f64) -> Self {
        Self {
            t: 0.0,
            running: true,
            ratio,
        }
    }

    /// Advance by already-scaled simulated seconds
    pub fn advance(&mut self, sim_dt: f64) {
        if self.running && sim_dt > 0.0 {
            self.t += sim_dt;
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn reset(&mut self) {
        self.t = 0.0;
        self.running = true;
    }
}

impl Default for SessionTimer {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Something a client should hear about on its next update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    Finished { time: f64, new_record: bool },
    Shipwreck,
    Collision {
        damage: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        with: Option<String>,
    },
    Reset,
    SanityLimit,
    Repaired,
}

/// One authenticated user and their boat
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientSession {
    pub username: String,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub completion: Option<Completion>,
    #[serde(default)]
    pub record: Option<f64>,
    #[serde(default)]
    pub timer: SessionTimer,
    #[serde(default, rename = "tracer-lst")]
    pub tracer: Vec<DVec2>,
    pub autopilot: Autopilot,
    pub boat_start: BoatState,
    pub boat: BoatState,
    #[serde(default)]
    pub forces: Forces,

    #[serde(skip)]
    pub connection: ConnectionState,
    /// Server clock reading at the last message from this client
    #[serde(skip)]
    pub last_contact: f64,
    #[serde(skip)]
    pub rudder_input: RudderInput,
    /// Raised but not yet acknowledged by a connection of this user
    #[serde(skip)]
    pub events: Vec<SessionEvent>,
    /// Sequence number of `events[0]`
    #[serde(skip)]
    pub events_base: u64,
}

fn default_enabled() -> bool {
    true
}

impl ClientSession {
    /// Fresh session at the map's start line, aiming the autopilot at the finish
    pub fn new(username: &str, boat_type: &str, spec: &BoatSpec, map: &Map, ratio: f64) -> Self {
        let boat = BoatState::new(boat_type, spec, map.start);
        Self {
            username: username.to_string(),
            paused: false,
            blocked: false,
            enabled: true,
            completion: None,
            record: None,
            timer: SessionTimer::new(ratio),
            tracer: Vec::new(),
            autopilot: Autopilot::new(map.end),
            boat_start: boat.clone(),
            boat,
            forces: Forces::default(),
            connection: ConnectionState::Disconnected,
            last_contact: 0.0,
            rudder_input: RudderInput::default(),
            events: Vec::new(),
            events_base: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connection != ConnectionState::Disconnected
    }

    /// Whether physics and the timer may advance for this session
    pub fn is_eligible(&self, globally_paused: bool) -> bool {
        !globally_paused
            && self.enabled
            && !self.paused
            && !self.is_finished()
            && !self.blocked
            && self.connection == ConnectionState::Active
    }

    /// Authentication succeeded; a dormant session waits for its first update
    pub fn connect(&mut self, now: f64) {
        if self.connection != ConnectionState::Active {
            self.connection = ConnectionState::Connecting;
        }
        self.last_contact = now;
    }

    /// Any message over an authenticated connection counts as contact
    ///
    /// The first one activates a fresh session; a later one revives a
    /// session that timed out while its connection stayed open.
    pub fn touch(&mut self, now: f64) {
        self.last_contact = now;
        self.connection = ConnectionState::Active;
    }

    /// Drop to `Disconnected` after `timeout` seconds of silence; true on transition
    pub fn check_timeout(&mut self, now: f64, timeout: f64) -> bool {
        if self.is_connected() && now - self.last_contact > timeout {
            self.connection = ConnectionState::Disconnected;
            self.rudder_input = RudderInput::default();
            return true;
        }
        false
    }

    /// Append the current position when it is far enough from the last point
    pub fn record_tracer(&mut self, resolution: Option<f64>) -> bool {
        let Some(resolution) = resolution else {
            return false;
        };
        let far_enough = self
            .tracer
            .last()
            .map_or(true, |last| last.distance(self.boat.pos) >= resolution);
        if far_enough {
            self.tracer.push(self.boat.pos);
        }
        far_enough
    }

    /// Finish the race if the end point lies under the hull
    pub fn check_finish(&mut self, end: DVec2, spec: &BoatSpec) -> bool {
        if self.is_finished() || !self.enabled {
            return false;
        }
        if !spec.hull_contains(self.boat.to_local_point(end)) {
            return false;
        }

        self.timer.stop();
        let time = self.timer.t;
        let new_record = self.record.map_or(true, |r| time < r);
        if new_record {
            self.record = Some(time);
        }
        self.completion = Some(Completion {
            outcome: Outcome::ReachedGoal,
            elapsed: time,
        });
        self.events.push(SessionEvent::Finished { time, new_record });
        true
    }

    /// The hull gave out: disable the boat for good
    pub fn shipwreck(&mut self) {
        self.timer.stop();
        self.boat.velocity = DVec2::ZERO;
        self.boat.angular_velocity = 0.0;
        self.forces = Forces::default();
        self.autopilot.set_enabled(false);
        if !self.enabled {
            return;
        }
        self.enabled = false;
        if self.completion.is_none() {
            self.completion = Some(Completion {
                outcome: Outcome::Shipwrecked,
                elapsed: self.timer.t,
            });
        }
        self.events.push(SessionEvent::Shipwreck);
    }

    /// Put the boat back at its start configuration, keeping the record
    pub fn reset(&mut self) {
        self.boat = self.boat_start.clone();
        self.tracer.clear();
        self.completion = None;
        self.enabled = true;
        self.paused = false;
        self.forces = Forces::default();
        self.rudder_input = RudderInput::default();
        self.autopilot.last_command = None;
        self.timer.reset();
        self.events.push(SessionEvent::Reset);
    }

    /// Restore full hull durability; wrecked boats stay wrecked
    pub fn repair(&mut self, spec: &BoatSpec) -> bool {
        if !self.enabled {
            return false;
        }
        self.boat.hull_durability = spec.max_hull_durability;
        self.events.push(SessionEvent::Repaired);
        true
    }

    /// Drop the events numbered below `upto`
    pub fn acknowledge_events(&mut self, upto: u64) {
        let delivered = upto
            .saturating_sub(self.events_base)
            .min(self.events.len() as u64);
        self.events.drain(..delivered as usize);
        self.events_base += delivered;
    }

    /// Keep only the newest `max` undelivered events
    pub fn trim_events(&mut self, max: usize) {
        let excess = self.events.len().saturating_sub(max);
        self.events.drain(..excess);
        self.events_base += excess as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::boat::test_boat;
    use crate::game::map::open_water_map;

    fn session() -> ClientSession {
        ClientSession::new("amy", "dinghy", &test_boat(), &open_water_map(), 1.0)
    }

    #[test]
    fn loaded_sessions_start_disconnected_and_ineligible() {
        let s = session();
        assert_eq!(s.connection, ConnectionState::Disconnected);
        assert!(!s.is_eligible(false));
    }

    #[test]
    fn connect_then_first_update_activates() {
        let mut s = session();
        s.connect(1.0);
        assert_eq!(s.connection, ConnectionState::Connecting);
        assert!(!s.is_eligible(false));

        s.touch(1.5);
        assert_eq!(s.connection, ConnectionState::Active);
        assert!(s.is_eligible(false));
        assert!(!s.is_eligible(true));
    }

    #[test]
    fn every_flag_blocks_eligibility() {
        let mut s = session();
        s.connect(0.0);
        s.touch(0.0);

        s.paused = true;
        assert!(!s.is_eligible(false));
        s.paused = false;

        s.blocked = true;
        assert!(!s.is_eligible(false));
        s.blocked = false;

        s.enabled = false;
        assert!(!s.is_eligible(false));
        s.enabled = true;

        s.completion = Some(Completion {
            outcome: Outcome::ReachedGoal,
            elapsed: 1.0,
        });
        assert!(!s.is_eligible(false));
    }

    #[test]
    fn timeout_disconnects_after_silence() {
        let mut s = session();
        s.connect(0.0);
        s.touch(0.0);
        assert!(!s.check_timeout(5.0, 5.0));
        assert!(s.check_timeout(6.0, 5.0));
        assert_eq!(s.connection, ConnectionState::Disconnected);
        assert!(!s.check_timeout(7.0, 5.0));
    }

    #[test]
    fn tracer_respects_resolution() {
        let mut s = session();
        assert!(!s.record_tracer(None));
        assert!(s.tracer.is_empty());

        assert!(s.record_tracer(Some(10.0)));
        s.boat.pos += DVec2::new(9.0, 0.0);
        assert!(!s.record_tracer(Some(10.0)));
        s.boat.pos += DVec2::new(1.0, 0.0);
        assert!(s.record_tracer(Some(10.0)));
        assert_eq!(s.tracer.len(), 2);
    }

    #[test]
    fn finishing_stops_timer_and_sets_record() {
        let spec = test_boat();
        let mut s = session();
        s.timer.t = 42.0;
        s.record = Some(50.0);
        s.boat.pos = DVec2::new(900.0, 900.0);

        assert!(s.check_finish(DVec2::new(900.0, 900.0), &spec));
        assert!(!s.timer.running);
        assert_eq!(s.record, Some(42.0));
        assert_eq!(
            s.events,
            vec![SessionEvent::Finished {
                time: 42.0,
                new_record: true
            }]
        );

        // only the first arrival counts
        assert!(!s.check_finish(DVec2::new(900.0, 900.0), &spec));
    }

    #[test]
    fn slower_finish_keeps_record() {
        let spec = test_boat();
        let mut s = session();
        s.timer.t = 60.0;
        s.record = Some(50.0);
        s.boat.pos = DVec2::new(900.0, 900.0);
        s.check_finish(DVec2::new(900.0, 900.0), &spec);
        assert_eq!(s.record, Some(50.0));
    }

    #[test]
    fn shipwreck_then_reset() {
        let spec = test_boat();
        let mut s = session();
        s.boat.velocity = DVec2::new(3.0, 0.0);
        s.boat.pos = DVec2::new(400.0, 400.0);
        s.timer.t = 12.0;
        s.record = Some(100.0);

        s.shipwreck();
        assert!(!s.enabled);
        assert_eq!(s.completion.unwrap().outcome, Outcome::Shipwrecked);
        assert_eq!(s.boat.velocity, DVec2::ZERO);
        assert!(!s.repair(&spec));

        s.reset();
        assert!(s.enabled);
        assert!(s.completion.is_none());
        assert_eq!(s.boat.pos, s.boat_start.pos);
        assert_eq!(s.timer.t, 0.0);
        assert_eq!(s.record, Some(100.0));
    }

    #[test]
    fn events_stay_until_acknowledged() {
        let mut s = session();
        s.events.push(SessionEvent::Reset);
        s.events.push(SessionEvent::SanityLimit);

        s.acknowledge_events(1);
        assert_eq!(s.events, vec![SessionEvent::SanityLimit]);
        assert_eq!(s.events_base, 1);

        // stale acknowledgements change nothing
        s.acknowledge_events(1);
        assert_eq!(s.events.len(), 1);

        s.events.push(SessionEvent::Repaired);
        s.acknowledge_events(10);
        assert!(s.events.is_empty());
        assert_eq!(s.events_base, 3);
    }

    #[test]
    fn trimming_keeps_newest_events() {
        let mut s = session();
        s.events = vec![
            SessionEvent::Reset,
            SessionEvent::SanityLimit,
            SessionEvent::Repaired,
        ];
        s.trim_events(2);
        assert_eq!(s.events, vec![SessionEvent::SanityLimit, SessionEvent::Repaired]);
        assert_eq!(s.events_base, 1);
    }

    #[test]
    fn rejoin_keeps_active_session_active() {
        let mut s = session();
        s.connect(0.0);
        s.touch(0.5);
        s.connect(1.0);
        assert_eq!(s.connection, ConnectionState::Active);
        assert_eq!(s.last_contact, 1.0);
        assert!(s.is_eligible(false));
    }

    #[test]
    fn wreck_after_finishing_keeps_goal_outcome() {
        let spec = test_boat();
        let mut s = session();
        s.timer.t = 30.0;
        s.boat.pos = DVec2::new(900.0, 900.0);
        assert!(s.check_finish(DVec2::new(900.0, 900.0), &spec));

        s.shipwreck();
        let completion = s.completion.unwrap();
        assert_eq!(completion.outcome, Outcome::ReachedGoal);
        assert_eq!(completion.elapsed, 30.0);
    }

    #[test]
    fn persisted_form_skips_transient_state() {
        let mut s = session();
        s.connect(3.0);
        s.events.push(SessionEvent::Reset);

        let json = serde_json::to_value(&s).unwrap();
        assert!(json.get("connection").is_none());
        assert!(json.get("events").is_none());
        assert!(json.get("tracer-lst").is_some());

        let back: ClientSession = serde_json::from_value(json).unwrap();
        assert_eq!(back.connection, ConnectionState::Disconnected);
        assert!(back.events.is_empty());
        assert_eq!(back.boat, s.boat);
    }
}
