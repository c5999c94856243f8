//! TCP protocol message definitions
//! These are the wire types for client-server communication

use std::collections::BTreeMap;

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::config::GuiSettings;
use crate::game::autopilot::{TargetSpec, RUDDER_RANGE};
use crate::game::boat::BoatSpec;
use crate::game::map::Map;
use crate::game::session::{ConnectionState, SessionEvent};
use crate::game::snapshot::{ClientView, GlobalData};

/// Username reserved for the operator
pub const ADMIN_USERNAME: &str = "__admin__";

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMsg {
    /// Authenticate and attach to a session
    Join {
        username: String,
        password: String,
        #[serde(default, rename = "sim-password")]
        sim_password: Option<String>,
    },

    /// Control input, applied at the next tick
    Update {
        #[serde(default)]
        input: ClientInput,
    },

    /// Operator command, only honoured for the admin user
    Admin { command: AdminCommand },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

/// Autopilot changes requested by a client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutopilotInput {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub target: Option<TargetSpec>,
}

/// One client update; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientInput {
    /// Relative rudder angle from a direct drag
    #[serde(default)]
    pub rudder: Option<f64>,
    #[serde(default)]
    pub rudder_slider: Option<f64>,
    /// Sheeting angle per sail name, 0 to 90 degrees
    #[serde(default)]
    pub sheeting_angles: BTreeMap<String, f64>,
    #[serde(default)]
    pub autopilot: Option<AutopilotInput>,
    #[serde(default)]
    pub paused: Option<bool>,
    #[serde(default)]
    pub reset: bool,
    /// Meters; boats further away are sent in minimal form
    #[serde(default)]
    pub render_dist: Option<f64>,
}

/// Rejected client input
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputError {
    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },

    #[error("rudder angle {0} is outside ±90 degrees")]
    RudderRange(f64),

    #[error("boat has no sail named {0:?}")]
    UnknownSail(String),

    #[error("sheeting angle for {sail:?} must be within 0..=90, got {angle}")]
    SheetingRange { sail: String, angle: f64 },

    #[error("render-dist must not be negative")]
    RenderDist,

    #[error("autopilot cannot follow its own boat")]
    SelfTarget,

    #[error("no session for this connection")]
    NoSession,
}

impl ClientInput {
    /// Check every field against `spec` without touching any state
    pub fn validate(&self, username: &str, spec: &BoatSpec) -> Result<(), InputError> {
        for (field, value) in [("rudder", self.rudder), ("rudder-slider", self.rudder_slider)] {
            if let Some(angle) = value {
                if !angle.is_finite() {
                    return Err(InputError::NotFinite { field });
                }
                if angle.abs() > RUDDER_RANGE {
                    return Err(InputError::RudderRange(angle));
                }
            }
        }

        for (sail, &angle) in &self.sheeting_angles {
            if !spec.sails_static.contains_key(sail) {
                return Err(InputError::UnknownSail(sail.clone()));
            }
            if !angle.is_finite() || !(0.0..=90.0).contains(&angle) {
                return Err(InputError::SheetingRange {
                    sail: sail.clone(),
                    angle,
                });
            }
        }

        if let Some(dist) = self.render_dist {
            if dist.is_nan() || dist < 0.0 {
                return Err(InputError::RenderDist);
            }
        }

        if let Some(target) = self.autopilot.as_ref().and_then(|a| a.target.as_ref()) {
            match target {
                TargetSpec::GlobalPos(p) | TargetSpec::LocalPos(p) if !p.is_finite() => {
                    return Err(InputError::NotFinite {
                        field: "autopilot.target",
                    });
                }
                TargetSpec::User(name) if name == username => return Err(InputError::SelfTarget),
                _ => {}
            }
        }

        Ok(())
    }
}

/// Operator commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum AdminCommand {
    TogglePause,
    SetTimeRatio { ratio: f64 },
    /// Reset every session and the global timer
    Reset,
    ReloadSettings,
    Save,
    Status,
    UserReset { username: String },
    UserTogglePause { username: String },
    UserSetPos {
        username: String,
        pos: DVec2,
        #[serde(default)]
        angle: Option<f64>,
    },
    UserRepair { username: String },
    UserBlock { username: String },
    UserUnblock { username: String },
    UserRemove { username: String },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMsg {
    /// Confirmation of a successful join
    Joined {
        username: String,
        admin: bool,
        #[serde(rename = "server-software-version")]
        version: [u32; 3],
        map: Map,
        /// Static specs for every boat type in the simulation
        #[serde(rename = "boats-static-config")]
        boats: BTreeMap<String, BoatSpec>,
        gui: GuiSettings,
    },

    /// State pushed after each tick
    Update {
        #[serde(rename = "global-data")]
        global_data: GlobalData,
        clients: BTreeMap<String, ClientView>,
        events: Vec<SessionEvent>,
    },

    /// Operator overview, answer to every admin command
    Status(StatusReport),

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

impl ServerMsg {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Operator view of the simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatusReport {
    pub paused: bool,
    pub ratio: f64,
    pub t: f64,
    pub clients: BTreeMap<String, ClientStatus>,
}

/// Operator view of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientStatus {
    pub connection: ConnectionState,
    pub enabled: bool,
    pub paused: bool,
    pub blocked: bool,
    pub finished: bool,
    pub hull_durability: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::boat::test_boat;
    use serde_json::json;

    #[test]
    fn parses_join_and_update() {
        let join: ClientMsg = serde_json::from_value(json!({
            "type": "join", "username": "amy", "password": "pw", "sim-password": "s"
        }))
        .unwrap();
        assert!(matches!(join, ClientMsg::Join { sim_password: Some(ref p), .. } if p == "s"));

        let update: ClientMsg = serde_json::from_value(json!({
            "type": "update",
            "input": {
                "rudder-slider": 10.0,
                "sheeting-angles": {"main": 30.0},
                "autopilot": {"enabled": true, "target": {"type": "user", "target": "bob"}}
            }
        }))
        .unwrap();
        let ClientMsg::Update { input } = update else {
            panic!("expected update");
        };
        assert_eq!(input.rudder_slider, Some(10.0));
        assert_eq!(input.sheeting_angles["main"], 30.0);
        assert!(!input.reset);
    }

    #[test]
    fn admin_commands_use_action_tag() {
        let msg: ClientMsg = serde_json::from_value(json!({
            "type": "admin",
            "command": {"action": "user-set-pos", "username": "amy", "pos": [3.0, 4.0]}
        }))
        .unwrap();
        let ClientMsg::Admin { command } = msg else {
            panic!("expected admin");
        };
        assert_eq!(
            command,
            AdminCommand::UserSetPos {
                username: "amy".into(),
                pos: DVec2::new(3.0, 4.0),
                angle: None
            }
        );
    }

    #[test]
    fn validation_rejects_bad_input() {
        let spec = test_boat();
        let ok = ClientInput {
            rudder: Some(-45.0),
            ..Default::default()
        };
        assert!(ok.validate("amy", &spec).is_ok());

        let rudder = ClientInput {
            rudder: Some(120.0),
            ..Default::default()
        };
        assert_eq!(rudder.validate("amy", &spec), Err(InputError::RudderRange(120.0)));

        let mut sheets = ClientInput::default();
        sheets.sheeting_angles.insert("spinnaker".into(), 10.0);
        assert!(matches!(
            sheets.validate("amy", &spec),
            Err(InputError::UnknownSail(_))
        ));

        let mut sheets = ClientInput::default();
        sheets.sheeting_angles.insert("main".into(), 95.0);
        assert!(matches!(
            sheets.validate("amy", &spec),
            Err(InputError::SheetingRange { .. })
        ));

        let own = ClientInput {
            autopilot: Some(AutopilotInput {
                enabled: Some(true),
                target: Some(TargetSpec::User("amy".into())),
            }),
            ..Default::default()
        };
        assert_eq!(own.validate("amy", &spec), Err(InputError::SelfTarget));
    }

    #[test]
    fn error_frame_shape() {
        let json = serde_json::to_value(ServerMsg::error("auth", "bad password")).unwrap();
        assert_eq!(
            json,
            json!({"type": "error", "code": "auth", "message": "bad password"})
        );
    }
}
