//! Layered simulator settings
//!
//! Settings are resolved in two passes. First the global document and the
//! optional per-simulation override are deep-merged (objects merge key by key,
//! everything else is replaced by the override). Then the merged document is
//! checked against a schema table that enumerates every recognized key with
//! its expected kind and whether it is required or defaulted. Every problem is
//! collected so an operator sees the full list at once. Only a document that
//! passes validation is turned into the typed [`SimulatorSettings`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Expected kind of a settings value
#[derive(Debug, Clone, Copy)]
pub enum Kind {
    Bool,
    /// Any JSON number
    Float,
    /// A JSON number or `null`
    NullableFloat,
    /// A JSON number greater than zero
    PositiveFloat,
    Text,
    Object(&'static [KeySpec]),
}

impl Kind {
    fn name(&self) -> &'static str {
        match self {
            Kind::Bool => "bool",
            Kind::Float => "float",
            Kind::NullableFloat => "float or null",
            Kind::PositiveFloat => "positive float",
            Kind::Text => "string",
            Kind::Object(_) => "object",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            Kind::Bool => value.is_boolean(),
            Kind::Float => value.is_number(),
            Kind::NullableFloat => value.is_number() || value.is_null(),
            Kind::PositiveFloat => value.as_f64().is_some_and(|v| v > 0.0),
            Kind::Text => value.is_string(),
            Kind::Object(_) => value.is_object(),
        }
    }
}

/// Value used when an optional key is absent
#[derive(Debug, Clone, Copy)]
pub enum DefaultValue {
    Bool(bool),
    Float(f64),
}

impl DefaultValue {
    fn to_value(self) -> Value {
        match self {
            DefaultValue::Bool(b) => Value::Bool(b),
            DefaultValue::Float(f) => Value::from(f),
        }
    }
}

/// Whether a key must be supplied
#[derive(Debug, Clone, Copy)]
pub enum Presence {
    Required,
    Optional(DefaultValue),
}

/// One entry of a settings schema
#[derive(Debug, Clone, Copy)]
pub struct KeySpec {
    pub key: &'static str,
    pub kind: Kind,
    pub presence: Presence,
}

const fn required(key: &'static str, kind: Kind) -> KeySpec {
    KeySpec {
        key,
        kind,
        presence: Presence::Required,
    }
}

const fn optional(key: &'static str, kind: Kind, default: DefaultValue) -> KeySpec {
    KeySpec {
        key,
        kind,
        presence: Presence::Optional(default),
    }
}

const SANITY_LIMITS_SCHEMA: &[KeySpec] = &[
    required("velocity", Kind::PositiveFloat),
    required("angular-velocity", Kind::PositiveFloat),
];

const WIND_SCHEMA: &[KeySpec] = &[
    required("speed-average", Kind::Float),
    required("max-gust", Kind::Float),
    required("speed-variability", Kind::Float),
    required("direction-variability", Kind::Float),
    optional("mean-reversion", Kind::Float, DefaultValue::Float(0.5)),
];

/// Schema of the `simulator` settings section
pub const SIMULATOR_SCHEMA: &[KeySpec] = &[
    optional("save-sims", Kind::Bool, DefaultValue::Bool(true)),
    required("lag-limit", Kind::Float),
    required("max-rudder-movement", Kind::Float),
    required("client-timeout", Kind::Float),
    required("tracer-resolution", Kind::NullableFloat),
    optional("tick-rate", Kind::Float, DefaultValue::Float(30.0)),
    optional("collision-damage-factor", Kind::Float, DefaultValue::Float(0.01)),
    optional("autopilot-gain", Kind::Float, DefaultValue::Float(1.0)),
    optional("autopilot-max-rudder", Kind::Float, DefaultValue::Float(60.0)),
    required("sanity-limits", Kind::Object(SANITY_LIMITS_SCHEMA)),
    required("wind", Kind::Object(WIND_SCHEMA)),
];

const PIXEL_UNITS_SCHEMA: &[KeySpec] = &[
    required("force", Kind::Float),
    required("distance", Kind::Float),
    required("momentum", Kind::Float),
];

/// Schema of the `gui` settings section (only the keys the server checks)
pub const GUI_SCHEMA: &[KeySpec] = &[required("pixel-units", Kind::Object(PIXEL_UNITS_SCHEMA))];

/// Hard clamps applied after every integration step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SanityLimits {
    /// Meters per second
    pub velocity: f64,
    /// Degrees per second
    pub angular_velocity: f64,
}

/// Wind generator parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WindSettings {
    pub speed_average: f64,
    pub max_gust: f64,
    /// Max speed change in m/s per second
    pub speed_variability: f64,
    /// Max direction change in degrees per second
    pub direction_variability: f64,
    /// 0 = pure random walk, 1 = strongest pull toward `speed_average`
    pub mean_reversion: f64,
}

/// Fully resolved simulator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SimulatorSettings {
    pub save_sims: bool,
    /// Max real seconds simulated by one tick
    pub lag_limit: f64,
    /// Autopilot rudder slew rate, degrees per simulated second
    pub max_rudder_movement: f64,
    /// Seconds without contact before a session is considered disconnected
    pub client_timeout: f64,
    /// Min distance between tracer points, `None` disables tracing
    pub tracer_resolution: Option<f64>,
    pub tick_rate: f64,
    pub collision_damage_factor: f64,
    pub autopilot_gain: f64,
    pub autopilot_max_rudder: f64,
    pub sanity_limits: SanityLimits,
    pub wind: WindSettings,
}

/// GUI settings forwarded to clients after validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuiSettings(pub Value);

/// A syntax error in a settings document
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("failed to parse {document} at line {line}, column {column}: {message}")]
pub struct ConfigParseError {
    pub document: String,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// What is wrong with one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    Missing,
    Mistyped { expected: &'static str },
}

/// One offending key in a merged document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyProblem {
    /// Dotted key path, e.g. `sanity-limits.velocity`
    pub path: String,
    pub problem: Problem,
}

impl fmt::Display for KeyProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.problem {
            Problem::Missing => write!(f, "missing \"{}\"", self.path),
            Problem::Mistyped { expected } => {
                write!(f, "\"{}\" must be of type {}", self.path, expected)
            }
        }
    }
}

/// Every missing or mistyped key found in a merged document
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub struct ConfigValidationError {
    pub problems: Vec<KeyProblem>,
}

impl ConfigValidationError {
    /// Paths of all offending keys, in schema order
    pub fn paths(&self) -> Vec<&str> {
        self.problems.iter().map(|p| p.path.as_str()).collect()
    }
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid settings: ")?;
        for (i, problem) in self.problems.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", problem)?;
        }
        Ok(())
    }
}

/// Settings resolution errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Parse(#[from] ConfigParseError),

    #[error(transparent)]
    Validation(#[from] ConfigValidationError),

    #[error("settings passed validation but could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Merges and validates layered settings documents
pub struct ConfigResolver;

impl ConfigResolver {
    /// Parse a JSON document, keeping the location of any syntax fault
    pub fn parse(document: &str, text: &str) -> Result<Value, ConfigParseError> {
        serde_json::from_str(text).map_err(|e| ConfigParseError {
            document: document.to_string(),
            line: e.line(),
            column: e.column(),
            message: e.to_string(),
        })
    }

    /// Deep-merge `overrides` into `global`; the override wins per key
    pub fn merge(global: &Value, overrides: Option<&Value>) -> Value {
        let mut merged = global.clone();
        if let Some(overrides) = overrides {
            merge_into(&mut merged, overrides);
        }
        merged
    }

    /// Check `doc` against `schema`, filling defaults for absent optional keys
    pub fn validate(mut doc: Value, schema: &[KeySpec]) -> Result<Value, ConfigValidationError> {
        let mut problems = Vec::new();
        match doc.as_object_mut() {
            Some(obj) => validate_object(obj, schema, "", &mut problems),
            None => problems.push(KeyProblem {
                path: "<root>".to_string(),
                problem: Problem::Mistyped { expected: "object" },
            }),
        }

        if problems.is_empty() {
            Ok(doc)
        } else {
            Err(ConfigValidationError { problems })
        }
    }

    /// Resolve the simulator section from the global and per-simulation layers
    pub fn resolve_simulator(
        global: &Value,
        overrides: Option<&Value>,
    ) -> Result<SimulatorSettings, SettingsError> {
        let merged = Self::merge(global, overrides);
        let validated = Self::validate(merged, SIMULATOR_SCHEMA)?;
        Ok(serde_json::from_value(validated)?)
    }

    /// Resolve the GUI section that is handed to joining clients
    pub fn resolve_gui(global: &Value) -> Result<GuiSettings, SettingsError> {
        let validated = Self::validate(global.clone(), GUI_SCHEMA)?;
        Ok(GuiSettings(validated))
    }
}

fn merge_into(target: &mut Value, overrides: &Value) {
    match (target, overrides) {
        (Value::Object(target), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_into(existing, value);
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, overrides) => *target = overrides.clone(),
    }
}

fn validate_object(
    obj: &mut Map<String, Value>,
    schema: &[KeySpec],
    prefix: &str,
    problems: &mut Vec<KeyProblem>,
) {
    for spec in schema {
        let path = if prefix.is_empty() {
            spec.key.to_string()
        } else {
            format!("{}.{}", prefix, spec.key)
        };

        match obj.get_mut(spec.key) {
            None => match spec.presence {
                Presence::Required => problems.push(KeyProblem {
                    path,
                    problem: Problem::Missing,
                }),
                Presence::Optional(default) => {
                    obj.insert(spec.key.to_string(), default.to_value());
                }
            },
            Some(value) if !spec.kind.accepts(value) => problems.push(KeyProblem {
                path,
                problem: Problem::Mistyped {
                    expected: spec.kind.name(),
                },
            }),
            Some(value) => {
                if let (Kind::Object(children), Some(child)) = (spec.kind, value.as_object_mut()) {
                    validate_object(child, children, &path, problems);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_settings_value() -> Value {
    serde_json::json!({
        "save-sims": false,
        "lag-limit": 0.5,
        "max-rudder-movement": 45.0,
        "client-timeout": 5.0,
        "tracer-resolution": 10.0,
        "sanity-limits": { "velocity": 20.0, "angular-velocity": 90.0 },
        "wind": {
            "speed-average": 5.0,
            "max-gust": 10.0,
            "speed-variability": 1.0,
            "direction-variability": 2.0
        }
    })
}

#[cfg(test)]
pub(crate) fn test_settings() -> SimulatorSettings {
    ConfigResolver::resolve_simulator(&test_settings_value(), None)
        .expect("test settings are valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_complete_document_with_defaults() {
        let settings = test_settings();
        assert_eq!(settings.lag_limit, 0.5);
        assert_eq!(settings.tick_rate, 30.0);
        assert_eq!(settings.wind.mean_reversion, 0.5);
        assert_eq!(settings.tracer_resolution, Some(10.0));
    }

    #[test]
    fn override_wins_per_key_and_keeps_siblings() {
        let global = test_settings_value();
        let overrides = json!({ "sanity-limits": { "velocity": 7 } });

        let settings = ConfigResolver::resolve_simulator(&global, Some(&overrides)).unwrap();
        assert_eq!(settings.sanity_limits.velocity, 7.0);
        assert_eq!(settings.sanity_limits.angular_velocity, 90.0);
    }

    #[test]
    fn merge_is_idempotent() {
        let global = test_settings_value();
        let overrides = json!({
            "lag-limit": 1.0,
            "wind": { "max-gust": 3.0 },
            "tracer-resolution": null
        });

        let once = ConfigResolver::merge(&global, Some(&overrides));
        let twice = ConfigResolver::merge(&once, Some(&overrides));
        assert_eq!(once, twice);

        let self_merged = ConfigResolver::merge(&overrides, Some(&overrides));
        assert_eq!(self_merged, overrides);
    }

    #[test]
    fn missing_lag_limit_is_reported_alone() {
        let mut global = test_settings_value();
        global.as_object_mut().unwrap().remove("lag-limit");
        // per-sim override supplies everything else
        let mut overrides = test_settings_value();
        overrides.as_object_mut().unwrap().remove("lag-limit");

        let err = ConfigResolver::resolve_simulator(&global, Some(&overrides)).unwrap_err();
        match err {
            SettingsError::Validation(e) => assert_eq!(e.paths(), vec!["lag-limit"]),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn reports_every_problem_including_nested_keys() {
        let doc = json!({
            "lag-limit": "fast",
            "max-rudder-movement": 45,
            "client-timeout": 5,
            "tracer-resolution": null,
            "sanity-limits": { "velocity": 20 },
            "wind": {
                "speed-average": 5,
                "max-gust": 10,
                "speed-variability": 1,
                "direction-variability": 1
            }
        });

        let err = ConfigResolver::validate(doc, SIMULATOR_SCHEMA).unwrap_err();
        assert_eq!(err.paths(), vec!["lag-limit", "sanity-limits.angular-velocity"]);
        assert_eq!(
            err.problems[0].problem,
            Problem::Mistyped { expected: "float" }
        );
        assert!(err.to_string().contains("sanity-limits.angular-velocity"));
    }

    #[test]
    fn sanity_limits_must_be_positive() {
        let overrides = json!({ "sanity-limits": { "velocity": -5, "angular-velocity": 0 } });
        let err = ConfigResolver::resolve_simulator(&test_settings_value(), Some(&overrides))
            .unwrap_err();
        match err {
            SettingsError::Validation(e) => {
                assert_eq!(
                    e.paths(),
                    vec!["sanity-limits.velocity", "sanity-limits.angular-velocity"]
                );
                assert_eq!(
                    e.problems[0].problem,
                    Problem::Mistyped {
                        expected: "positive float"
                    }
                );
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn null_tracer_resolution_disables_tracing() {
        let overrides = json!({ "tracer-resolution": null });
        let settings =
            ConfigResolver::resolve_simulator(&test_settings_value(), Some(&overrides)).unwrap();
        assert_eq!(settings.tracer_resolution, None);
    }

    #[test]
    fn parse_error_carries_location() {
        let err = ConfigResolver::parse("settings.json", "{\n  \"lag-limit\": ,\n}").unwrap_err();
        assert_eq!(err.document, "settings.json");
        assert_eq!(err.line, 2);
        assert!(err.column > 0);
    }

    #[test]
    fn gui_requires_pixel_units() {
        let err = ConfigResolver::resolve_gui(&json!({ "pixel-units": { "force": 1 } })).unwrap_err();
        match err {
            SettingsError::Validation(e) => {
                assert_eq!(e.paths(), vec!["pixel-units.distance", "pixel-units.momentum"])
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
