//! JSON documents under the data directory

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{
    ConfigParseError, ConfigResolver, GuiSettings, SettingsError, SimulatorSettings,
};
use crate::game::boat::BoatSpec;
use crate::game::map::Map;
use crate::game::session::{ClientSession, SessionTimer};
use crate::game::wind::WindState;
use crate::net::protocol::ADMIN_USERNAME;

/// Attempts made for each simulation save
pub const SAVE_ATTEMPTS: u32 = 3;
const SAVE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// One entry of `contacts.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub username: String,
    pub password: String,
}

/// A simulation document, `simulations/<name>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SimFile {
    /// Map name under `maps/`
    pub map: String,
    /// Boat type given to new sessions
    pub boat: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub paused: bool,
    /// Best finishing time; older files write `-1` for none
    #[serde(default)]
    pub record: Option<f64>,
    #[serde(default)]
    pub timer: SessionTimer,
    /// Per-simulation override of the `simulator` settings section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(default)]
    pub wind_state: Option<WindState>,
    #[serde(default)]
    pub clients: BTreeMap<String, ClientSession>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

impl SimFile {
    /// Empty simulation on `map` handing out `boat`s
    pub fn new(map: &str, boat: &str) -> Self {
        Self {
            map: map.to_string(),
            boat: boat.to_string(),
            password: None,
            paused: false,
            record: None,
            timer: SessionTimer::default(),
            settings: None,
            wind_state: None,
            clients: BTreeMap::new(),
            saved_at: None,
        }
    }
}

/// Everything needed to start a simulation
#[derive(Debug, Clone)]
pub struct LoadedSimulation {
    pub name: String,
    pub file: SimFile,
    pub map: Map,
    pub boats: BTreeMap<String, BoatSpec>,
    pub settings: SimulatorSettings,
    pub gui: GuiSettings,
    pub contacts: Vec<Contact>,
}

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Parse(#[from] ConfigParseError),

    #[error("{path} has an unexpected shape: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("failed to encode simulation: {0}")]
    Encode(serde_json::Error),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("save failed after {attempts} attempts: {last}")]
    SaveFailed { attempts: u32, last: Box<PersistenceError> },
}

/// Reads and writes the data directory
///
/// Layout: `settings.json`, `contacts.json`, `maps/<name>.json`,
/// `boats/<type>.json`, `simulations/<name>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn document_path(&self, dir: &str, name: &str) -> PathBuf {
        self.root.join(dir).join(format!("{}.json", name))
    }

    pub fn sim_path(&self, name: &str) -> PathBuf {
        self.document_path("simulations", name)
    }

    fn read_value(&self, path: &Path) -> Result<Value, PersistenceError> {
        let text = fs::read_to_string(path).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(ConfigResolver::parse(&path.display().to_string(), &text)?)
    }

    fn read_document<T: DeserializeOwned>(&self, path: &Path) -> Result<T, PersistenceError> {
        let value = self.read_value(path)?;
        serde_json::from_value(value).map_err(|source| PersistenceError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The whole `settings.json` document
    pub fn load_settings(&self) -> Result<Value, PersistenceError> {
        self.read_value(&self.root.join("settings.json"))
    }

    /// Resolve simulator settings from `settings.json` and a simulation override
    pub fn resolve_settings(
        &self,
        overrides: Option<&Value>,
    ) -> Result<SimulatorSettings, PersistenceError> {
        let global = self.load_settings()?;
        Ok(ConfigResolver::resolve_simulator(&section(&global, "simulator"), overrides)?)
    }

    /// Contact list with the admin entry forced to `admin_code`
    pub fn load_contacts(&self, admin_code: &str) -> Result<Vec<Contact>, PersistenceError> {
        let path = self.root.join("contacts.json");
        let mut contacts: Vec<Contact> = if path.exists() {
            self.read_document(&path)?
        } else {
            warn!(path = %path.display(), "No contact list, only the admin can join");
            Vec::new()
        };

        contacts.retain(|c| c.username != ADMIN_USERNAME);
        contacts.push(Contact {
            username: ADMIN_USERNAME.to_string(),
            password: admin_code.to_string(),
        });
        Ok(contacts)
    }

    pub fn load_map(&self, name: &str) -> Result<Map, PersistenceError> {
        self.read_document(&self.document_path("maps", name))
    }

    pub fn load_boat(&self, boat_type: &str) -> Result<BoatSpec, PersistenceError> {
        self.read_document(&self.document_path("boats", boat_type))
    }

    pub fn load_sim(&self, name: &str) -> Result<SimFile, PersistenceError> {
        let mut file: SimFile = self.read_document(&self.sim_path(name))?;
        if file.record.is_some_and(|r| r < 0.0) {
            file.record = None;
        }
        Ok(file)
    }

    /// Load a simulation with its map, every boat type it uses, and resolved settings
    pub fn load_simulation(
        &self,
        name: &str,
        admin_code: &str,
    ) -> Result<LoadedSimulation, PersistenceError> {
        let file = self.load_sim(name)?;
        let global = self.load_settings()?;

        let settings =
            ConfigResolver::resolve_simulator(&section(&global, "simulator"), file.settings.as_ref())?;
        let gui = ConfigResolver::resolve_gui(&section(&global, "gui"))?;

        let map = self.load_map(&file.map)?;

        let mut boats = BTreeMap::new();
        let types = std::iter::once(file.boat.clone())
            .chain(file.clients.values().map(|c| c.boat.boat_type.clone()));
        for boat_type in types {
            if !boats.contains_key(&boat_type) {
                let spec = self.load_boat(&boat_type)?;
                boats.insert(boat_type, spec);
            }
        }

        let contacts = self.load_contacts(admin_code)?;

        info!(
            sim = %name,
            map = %file.map,
            boat_types = boats.len(),
            sessions = file.clients.len(),
            "Loaded simulation"
        );

        Ok(LoadedSimulation {
            name: name.to_string(),
            file,
            map,
            boats,
            settings,
            gui,
            contacts,
        })
    }

    /// Write the simulation through a temporary file and rename, retrying on failure
    pub fn save_sim(&self, name: &str, file: &SimFile) -> Result<PathBuf, PersistenceError> {
        let mut file = file.clone();
        file.saved_at = Some(Utc::now());
        let bytes = serde_json::to_vec_pretty(&file).map_err(PersistenceError::Encode)?;
        let path = self.sim_path(name);

        let mut last = None;
        for attempt in 1..=SAVE_ATTEMPTS {
            match write_atomic(&path, &bytes) {
                Ok(()) => {
                    debug!(path = %path.display(), attempt, "Saved simulation");
                    return Ok(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), attempt, error = %e, "Save attempt failed");
                    last = Some(e);
                    if attempt < SAVE_ATTEMPTS {
                        thread::sleep(SAVE_RETRY_DELAY);
                    }
                }
            }
        }

        Err(PersistenceError::SaveFailed {
            attempts: SAVE_ATTEMPTS,
            last: Box::new(last.unwrap_or_else(|| PersistenceError::Io {
                path: path.clone(),
                source: io::Error::other("no attempt made"),
            })),
        })
    }
}

/// A top-level section of `settings.json`, empty when absent
fn section(global: &Value, key: &str) -> Value {
    global
        .get(key)
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let io_err = |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}


#[cfg(test)]
mod tests {
    use super::fixtures::write_data_dir;
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        write_data_dir(dir.path());
        let store = FileStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn loads_simulation_with_override() {
        let (_dir, store) = store();
        let loaded = store.load_simulation("regatta", "1234").unwrap();

        assert_eq!(loaded.map.end.x, 900.0);
        assert!(loaded.boats.contains_key("dinghy"));
        assert_eq!(loaded.settings.tracer_resolution, None);
        assert_eq!(loaded.settings.lag_limit, 0.5);
        assert_eq!(loaded.file.record, None);
    }

    #[test]
    fn admin_contact_uses_admin_code() {
        let (_dir, store) = store();
        let contacts = store.load_contacts("1234").unwrap();
        let admins: Vec<_> = contacts
            .iter()
            .filter(|c| c.username == ADMIN_USERNAME)
            .collect();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].password, "1234");
    }

    #[test]
    fn parse_errors_carry_location() {
        let (dir, store) = store();
        fs::write(dir.path().join("settings.json"), "{\n  \"simulator\": ,\n}").unwrap();

        match store.load_simulation("regatta", "1234") {
            Err(PersistenceError::Parse(e)) => {
                assert_eq!(e.line, 2);
                assert!(e.document.ends_with("settings.json"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn missing_settings_key_is_reported() {
        let (dir, store) = store();
        let mut settings: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("settings.json")).unwrap())
                .unwrap();
        settings["simulator"]
            .as_object_mut()
            .unwrap()
            .remove("lag-limit");
        fs::write(dir.path().join("settings.json"), settings.to_string()).unwrap();

        match store.load_simulation("regatta", "1234") {
            Err(PersistenceError::Settings(SettingsError::Validation(e))) => {
                assert_eq!(e.paths(), vec!["lag-limit"]);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn save_round_trip_stamps_time() {
        let (_dir, store) = store();
        let mut file = store.load_sim("regatta").unwrap();
        file.paused = true;
        file.record = Some(81.5);

        let path = store.save_sim("regatta", &file).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let back = store.load_sim("regatta").unwrap();
        assert!(back.paused);
        assert_eq!(back.record, Some(81.5));
        assert!(back.saved_at.is_some());
    }

    #[test]
    fn save_into_unwritable_location_fails_after_retries() {
        let dir = TempDir::new().unwrap();
        // a regular file where the simulations directory should be
        fs::write(dir.path().join("simulations"), "").unwrap();
        let store = FileStore::new(dir.path());

        match store.save_sim("regatta", &SimFile::new("bay", "dinghy")) {
            Err(PersistenceError::SaveFailed { attempts, .. }) => assert_eq!(attempts, SAVE_ATTEMPTS),
            other => panic!("expected save failure, got {other:?}"),
        }
    }
}
