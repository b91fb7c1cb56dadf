// Copyright (C) 2020  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU Common Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Common Public License for more details.
//
// You should have received a copy of the GNU Common Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Persisted operator settings
//!
//! The store owns `config/gui_settings.json` and its rotating backups.
//! Every mutation validates first, merges into the existing document,
//! stamps `last_updated`, writes atomically (tmp + rename) and only then
//! snapshots a timestamped backup. The on-disk document is canonical
//! truth: a missing or corrupt file at boot is a fatal condition.

pub mod error;
mod mode;

// Reexport inner structures
pub use error::{Error, ErrorKind, Result};
pub use mode::Mode;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use chrono::Local;

pub const SETTINGS_FILE: &str = "gui_settings.json";
pub const DEFAULTS_FILE: &str = "defaults.json";
pub const BACKUPS_DIR: &str = "backups";

/// How many backups survive a prune, counting historical name prefixes too
pub const MAX_BACKUPS: usize = 5;

pub const FORMAT_VERSION: &str = "1.0";

pub const DEFAULT_MIN_TEMP: f32 = 45.0;
pub const DEFAULT_MAX_TEMP: f32 = 55.0;

const DEFAULT_DEVICE_ID: &str = "raspberry_pi_01";

/// All operations on the settings file are serialized process-wide
static FILE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Validated temperature band as published to the data plane
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSettings {
    pub min_c: f32,
    pub max_c: f32,
    /// Width of the regulated band, always `max_c - min_c`
    pub hysteresis_c: f32,
}

impl TemperatureSettings {
    pub fn new(min_c: f32, max_c: f32) -> Result<Self> {
        validate_band(min_c, max_c).map_err(ErrorKind::Config)?;
        Ok(Self {
            min_c,
            max_c,
            hysteresis_c: max_c - min_c,
        })
    }
}

/// Check the §"temperature_settings" invariants, returning the first
/// violation as a human-readable message.
pub fn validate_band(min_c: f32, max_c: f32) -> std::result::Result<(), String> {
    if !min_c.is_finite() || !max_c.is_finite() {
        return Err("temperatures must be finite numbers".to_string());
    }
    if min_c >= max_c {
        return Err(format!(
            "min temperature ({}) must be below max temperature ({})",
            min_c, max_c
        ));
    }
    if min_c < 0.0 || min_c > 100.0 {
        return Err(format!("min temperature ({}) outside 0-100 °C", min_c));
    }
    if max_c < 0.0 || max_c > 100.0 {
        return Err(format!("max temperature ({}) outside 0-100 °C", max_c));
    }
    let band = max_c - min_c;
    if band < 0.1 {
        return Err(format!("band ({}) too narrow, minimum is 0.1 °C", band));
    }
    if band > 30.0 {
        return Err(format!("band ({}) too wide, maximum is 30.0 °C", band));
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TemperatureSection {
    pub min_temp: f32,
    pub max_temp: f32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModeSection {
    pub mode: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CoolingSection {
    pub cooling_on: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MetadataSection {
    pub device_id: String,
    pub created_by: String,
    pub backup_count: u32,
    pub source: String,
}

impl Default for MetadataSection {
    fn default() -> Self {
        Self {
            device_id: DEFAULT_DEVICE_ID.to_string(),
            created_by: "settings_manager".to_string(),
            backup_count: 3,
            source: "unknown".to_string(),
        }
    }
}

/// The persisted document, field-for-field
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SettingsDocument {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    pub temperature_settings: TemperatureSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode_settings: Option<ModeSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooling_settings: Option<CoolingSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address_asic: Option<String>,
    #[serde(default)]
    pub metadata: MetadataSection,
}

impl Default for SettingsDocument {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            last_updated: None,
            temperature_settings: TemperatureSection {
                min_temp: DEFAULT_MIN_TEMP,
                max_temp: DEFAULT_MAX_TEMP,
            },
            mode_settings: None,
            cooling_settings: None,
            ip_address_asic: None,
            metadata: MetadataSection::default(),
        }
    }
}

impl SettingsDocument {
    /// The validated temperature band carried by this document
    pub fn band(&self) -> Result<TemperatureSettings> {
        TemperatureSettings::new(
            self.temperature_settings.min_temp,
            self.temperature_settings.max_temp,
        )
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode_settings
            .as_ref()
            .and_then(|section| Mode::parse(&section.mode))
    }

    pub fn cooling_on(&self) -> Option<bool> {
        self.cooling_settings.as_ref().map(|c| c.cooling_on)
    }
}

/// Partial update merged into the persisted document
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub min_temp: Option<f32>,
    pub max_temp: Option<f32>,
    pub mode: Option<Mode>,
    pub cooling_on: Option<bool>,
    pub ip_address_asic: Option<String>,
    /// Who initiated the change, recorded in `metadata.source`
    pub source: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub exists: bool,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

pub struct SettingsStore {
    settings_file: PathBuf,
    defaults_file: PathBuf,
    backups_dir: PathBuf,
}

impl SettingsStore {
    /// Open the store rooted at `config_dir`, creating the directory tree
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();
        let backups_dir = config_dir.join(BACKUPS_DIR);
        fs::create_dir_all(&backups_dir)?;

        Ok(Self {
            settings_file: config_dir.join(SETTINGS_FILE),
            defaults_file: config_dir.join(DEFAULTS_FILE),
            backups_dir,
        })
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_file
    }

    /// Load and validate the whole document. The file is canonical truth:
    /// missing or corrupt content is reported as `Persistence` and the
    /// caller decides whether that is fatal (it is, at boot).
    pub fn load_all(&self) -> Result<SettingsDocument> {
        let _guard = FILE_LOCK.lock().expect("BUG: settings lock poisoned");
        self.read_document()
    }

    /// Convenience accessor for the validated temperature band
    pub fn load_settings(&self) -> Result<TemperatureSettings> {
        self.load_all()?.band()
    }

    /// Materialize the user file from `defaults.json` when it is missing.
    /// An existing user file is never touched.
    pub fn ensure_settings_file(&self) -> Result<()> {
        let _guard = FILE_LOCK.lock().expect("BUG: settings lock poisoned");
        if self.settings_file.exists() {
            return Ok(());
        }
        self.copy_defaults_locked()
    }

    /// Overwrite the user file from `defaults.json`
    pub fn copy_defaults_to_settings(&self) -> Result<()> {
        let _guard = FILE_LOCK.lock().expect("BUG: settings lock poisoned");
        self.copy_defaults_locked()
    }

    /// Merge `update` into the persisted document. Returns `Ok(false)` and
    /// leaves the file untouched when the merged band fails validation.
    pub fn save_settings(&self, update: &SettingsUpdate) -> Result<bool> {
        let _guard = FILE_LOCK.lock().expect("BUG: settings lock poisoned");

        let mut document = self.read_document_or_default();
        let min_temp = update
            .min_temp
            .unwrap_or(document.temperature_settings.min_temp);
        let max_temp = update
            .max_temp
            .unwrap_or(document.temperature_settings.max_temp);
        if validate_band(min_temp, max_temp).is_err() {
            return Ok(false);
        }

        document.temperature_settings = TemperatureSection { min_temp, max_temp };
        if let Some(mode) = update.mode {
            document.mode_settings = Some(ModeSection {
                mode: mode.as_str().to_string(),
            });
        }
        if let Some(cooling_on) = update.cooling_on {
            document.cooling_settings = Some(CoolingSection { cooling_on });
        }
        if let Some(ip) = update.ip_address_asic.as_deref() {
            document.ip_address_asic = Some(ip.to_string());
        }

        let source = update.source.as_deref().unwrap_or("unknown");
        self.write_document(&mut document, "core_system", source)?;
        Ok(true)
    }

    pub fn load_ip(&self) -> Option<String> {
        let _guard = FILE_LOCK.lock().expect("BUG: settings lock poisoned");
        self.read_document()
            .ok()
            .and_then(|document| document.ip_address_asic)
            .filter(|ip| !ip.is_empty())
    }

    pub fn save_ip(&self, ip: &str) -> Result<bool> {
        let _guard = FILE_LOCK.lock().expect("BUG: settings lock poisoned");
        let mut document = self.read_document_or_default();
        document.ip_address_asic = Some(ip.to_string());
        self.write_document(&mut document, "settings_manager", "ip_update")?;
        Ok(true)
    }

    pub fn load_mode(&self) -> Option<Mode> {
        let _guard = FILE_LOCK.lock().expect("BUG: settings lock poisoned");
        self.read_document().ok().and_then(|d| d.mode())
    }

    /// Persist the regulation mode. Saving the already-persisted mode is a
    /// no-op: no write, no backup.
    pub fn save_mode(&self, mode: Mode) -> Result<bool> {
        let _guard = FILE_LOCK.lock().expect("BUG: settings lock poisoned");
        let mut document = self.read_document_or_default();
        if document.mode() == Some(mode) {
            return Ok(true);
        }
        document.mode_settings = Some(ModeSection {
            mode: mode.as_str().to_string(),
        });
        self.write_document(&mut document, "settings_manager", "mode_update")?;
        Ok(true)
    }

    pub fn load_cooling(&self) -> Option<bool> {
        let _guard = FILE_LOCK.lock().expect("BUG: settings lock poisoned");
        self.read_document().ok().and_then(|d| d.cooling_on())
    }

    pub fn save_cooling(&self, cooling_on: bool) -> Result<bool> {
        let _guard = FILE_LOCK.lock().expect("BUG: settings lock poisoned");
        let mut document = self.read_document_or_default();
        document.cooling_settings = Some(CoolingSection { cooling_on });
        self.write_document(&mut document, "settings_manager", "cooling_update")?;
        Ok(true)
    }

    pub fn settings_file_info(&self) -> FileInfo {
        match fs::metadata(&self.settings_file) {
            Ok(meta) => FileInfo {
                exists: true,
                path: self.settings_file.clone(),
                size: meta.len(),
                modified: meta.modified().ok(),
            },
            Err(_) => FileInfo {
                exists: false,
                path: self.settings_file.clone(),
                size: 0,
                modified: None,
            },
        }
    }

    fn copy_defaults_locked(&self) -> Result<()> {
        if !self.defaults_file.exists() {
            Err(ErrorKind::Persistence(format!(
                "defaults file not found: {}",
                self.defaults_file.display()
            )))?;
        }
        let raw = fs::read(&self.defaults_file)?;
        let mut document: SettingsDocument = serde_json::from_slice(&raw).map_err(|e| {
            ErrorKind::Persistence(format!(
                "corrupt defaults file {}: {}",
                self.defaults_file.display(),
                e
            ))
        })?;
        document.last_updated = Some(Local::now().to_rfc3339());
        document.metadata.created_by = "settings_manager".to_string();
        self.atomic_write(&document)
    }

    fn read_document(&self) -> Result<SettingsDocument> {
        let raw = fs::read(&self.settings_file).map_err(|e| {
            Error::from(ErrorKind::Persistence(format!(
                "settings file {}: {}",
                self.settings_file.display(),
                e
            )))
        })?;
        let document: SettingsDocument = serde_json::from_slice(&raw).map_err(|e| {
            ErrorKind::Persistence(format!(
                "corrupt settings file {}: {}",
                self.settings_file.display(),
                e
            ))
        })?;
        // A document that fails band validation is as unusable as a
        // syntactically broken one
        document.band().map_err(|e| {
            ErrorKind::Persistence(format!("invalid persisted temperature band: {}", e))
        })?;
        Ok(document)
    }

    fn read_document_or_default(&self) -> SettingsDocument {
        if self.settings_file.exists() {
            self.read_document().unwrap_or_default()
        } else {
            SettingsDocument::default()
        }
    }

    /// Stamp, back up the previous revision, write atomically, prune
    fn write_document(
        &self,
        document: &mut SettingsDocument,
        created_by: &str,
        source: &str,
    ) -> Result<()> {
        document.version = FORMAT_VERSION.to_string();
        document.last_updated = Some(Local::now().to_rfc3339());
        document.metadata.created_by = created_by.to_string();
        document.metadata.source = source.to_string();

        if self.settings_file.exists() {
            // Failure to back up is logged by the caller's error path but
            // never blocks the save itself
            let _ = self.create_backup();
        }
        self.atomic_write(document)
    }

    fn atomic_write(&self, document: &SettingsDocument) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(document)
            .map_err(|e| ErrorKind::Persistence(format!("serialize settings: {}", e)))?;
        let tmp_path = self.settings_file.with_extension("json.tmp");
        fs::write(&tmp_path, &serialized)?;
        fs::rename(&tmp_path, &self.settings_file)?;
        Ok(())
    }

    fn create_backup(&self) -> Result<()> {
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let backup_path = self.backups_dir.join(format!("gui_settings_{}.json", stamp));
        fs::copy(&self.settings_file, &backup_path)?;
        self.prune_backups()
    }

    fn prune_backups(&self) -> Result<()> {
        let mut backups: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.backups_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // The historical prefix is still pruned so old installations
            // don't accumulate stale copies forever
            let known = (name.starts_with("gui_settings_")
                || name.starts_with("temperature_settings_"))
                && name.ends_with(".json");
            if !known {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            backups.push((modified, entry.path()));
        }

        if backups.len() > MAX_BACKUPS {
            backups.sort_by_key(|(modified, _)| *modified);
            for (_, path) in backups.iter().take(backups.len() - MAX_BACKUPS) {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::File;
    use std::io::Write;

    fn store() -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn seed(store: &SettingsStore) {
        assert!(store
            .save_settings(&SettingsUpdate {
                min_temp: Some(45.0),
                max_temp: Some(55.0),
                source: Some("test".to_string()),
                ..Default::default()
            })
            .unwrap());
    }

    #[test]
    fn test_validate_band() {
        assert!(validate_band(45.0, 55.0).is_ok());
        assert!(validate_band(0.0, 100.0).is_err()); // band too wide
        assert!(validate_band(50.0, 50.0).is_err()); // empty band
        assert!(validate_band(55.0, 45.0).is_err()); // inverted
        assert!(validate_band(-1.0, 10.0).is_err());
        assert!(validate_band(95.0, 101.0).is_err());
        assert!(validate_band(50.0, 50.05).is_err()); // below 0.1 minimum
        assert!(validate_band(40.0, 70.05).is_err()); // above 30.0 maximum
    }

    #[test]
    fn test_hysteresis_is_band_width() {
        let settings = TemperatureSettings::new(45.0, 55.0).unwrap();
        assert_eq!(settings.hysteresis_c, 10.0);
    }

    #[test]
    fn test_load_all_missing_file_is_persistence_error() {
        let (_dir, store) = store();
        match store.load_all() {
            Err(e) => match e.kind() {
                ErrorKind::Persistence(_) => (),
                other => panic!("expected Persistence, got {:?}", other),
            },
            Ok(_) => panic!("missing file must fail"),
        }
    }

    #[test]
    fn test_load_all_corrupt_file_is_persistence_error() {
        let (_dir, store) = store();
        let mut file = File::create(store.settings_path()).unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(store.load_all().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let (_dir, store) = store();
        seed(&store);
        let settings = store.load_settings().unwrap();
        assert_eq!(settings.min_c, 45.0);
        assert_eq!(settings.max_c, 55.0);
        assert_eq!(settings.hysteresis_c, 10.0);

        let document = store.load_all().unwrap();
        assert_eq!(document.version, FORMAT_VERSION);
        assert!(document.last_updated.is_some());
        assert_eq!(document.metadata.source, "test");
    }

    /// Re-saving a loaded document only changes `last_updated`
    #[test]
    fn test_round_trip_is_stable() {
        let (_dir, store) = store();
        seed(&store);
        let first = store.load_all().unwrap();
        assert!(store
            .save_settings(&SettingsUpdate {
                source: Some("test".to_string()),
                ..Default::default()
            })
            .unwrap());
        let second = store.load_all().unwrap();
        assert_eq!(first.temperature_settings, second.temperature_settings);
        assert_eq!(first.mode_settings, second.mode_settings);
        assert_eq!(first.cooling_settings, second.cooling_settings);
        assert_eq!(first.ip_address_asic, second.ip_address_asic);
        assert_eq!(first.metadata.created_by, second.metadata.created_by);
    }

    #[test]
    fn test_invalid_update_is_refused() {
        let (_dir, store) = store();
        seed(&store);
        // Inverted band: refused, file untouched
        let accepted = store
            .save_settings(&SettingsUpdate {
                min_temp: Some(60.0),
                max_temp: Some(50.0),
                ..Default::default()
            })
            .unwrap();
        assert!(!accepted);
        let settings = store.load_settings().unwrap();
        assert_eq!((settings.min_c, settings.max_c), (45.0, 55.0));
    }

    #[test]
    fn test_partial_update_preserves_other_fields() {
        let (_dir, store) = store();
        seed(&store);
        assert!(store.save_ip("192.168.0.127").unwrap());
        assert!(store.save_mode(Mode::Predictive).unwrap());
        assert!(store.save_cooling(true).unwrap());

        // A band-only update must not lose ip/mode/cooling
        assert!(store
            .save_settings(&SettingsUpdate {
                min_temp: Some(46.0),
                max_temp: Some(48.0),
                ..Default::default()
            })
            .unwrap());

        let document = store.load_all().unwrap();
        assert_eq!(document.ip_address_asic.as_deref(), Some("192.168.0.127"));
        assert_eq!(document.mode(), Some(Mode::Predictive));
        assert_eq!(document.cooling_on(), Some(true));
        assert_eq!(document.temperature_settings.min_temp, 46.0);
        assert_eq!(document.temperature_settings.max_temp, 48.0);
    }

    #[test]
    fn test_save_creates_backup_of_previous_revision() {
        let (dir, store) = store();
        seed(&store);
        assert!(store.save_ip("10.0.0.2").unwrap());

        let backups: Vec<_> = fs::read_dir(dir.path().join(BACKUPS_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(!backups.is_empty());
        assert!(backups
            .iter()
            .all(|name| name.starts_with("gui_settings_") && name.ends_with(".json")));
    }

    #[test]
    fn test_backup_pruning_keeps_five() {
        let (dir, store) = store();
        seed(&store);

        // Pre-populate more than MAX_BACKUPS historical copies
        for i in 0..8 {
            let name = format!("gui_settings_2020-01-0{}_00-00-00.json", i + 1);
            fs::write(dir.path().join(BACKUPS_DIR).join(name), b"{}").unwrap();
        }
        // Old-prefix files count against the limit as well
        fs::write(
            dir.path()
                .join(BACKUPS_DIR)
                .join("temperature_settings_2019-12-31_00-00-00.json"),
            b"{}",
        )
        .unwrap();

        assert!(store.save_ip("10.0.0.3").unwrap());

        let count = fs::read_dir(dir.path().join(BACKUPS_DIR)).unwrap().count();
        assert!(count <= MAX_BACKUPS, "kept {} backups", count);
    }

    #[test]
    fn test_mode_save_unchanged_is_noop() {
        let (dir, store) = store();
        seed(&store);
        assert!(store.save_mode(Mode::Auto).unwrap());
        let backups_before = fs::read_dir(dir.path().join(BACKUPS_DIR)).unwrap().count();
        let info_before = store.settings_file_info();

        // Same mode again: no write, no backup
        assert!(store.save_mode(Mode::Auto).unwrap());
        let backups_after = fs::read_dir(dir.path().join(BACKUPS_DIR)).unwrap().count();
        assert_eq!(backups_before, backups_after);
        assert_eq!(
            info_before.modified,
            store.settings_file_info().modified,
        );
    }

    #[test]
    fn test_helpers_round_trip() {
        let (_dir, store) = store();
        seed(&store);

        assert_eq!(store.load_ip(), None);
        assert!(store.save_ip("192.168.0.127").unwrap());
        assert_eq!(store.load_ip().as_deref(), Some("192.168.0.127"));

        assert_eq!(store.load_mode(), None);
        assert!(store.save_mode(Mode::Manual).unwrap());
        assert_eq!(store.load_mode(), Some(Mode::Manual));

        assert_eq!(store.load_cooling(), None);
        assert!(store.save_cooling(true).unwrap());
        assert_eq!(store.load_cooling(), Some(true));
    }

    #[test]
    fn test_defaults_materialization() {
        let (dir, store) = store();
        let defaults = SettingsDocument::default();
        fs::write(
            dir.path().join(DEFAULTS_FILE),
            serde_json::to_vec_pretty(&defaults).unwrap(),
        )
        .unwrap();

        store.ensure_settings_file().unwrap();
        let document = store.load_all().unwrap();
        assert_eq!(document.temperature_settings.min_temp, DEFAULT_MIN_TEMP);
        assert_eq!(document.temperature_settings.max_temp, DEFAULT_MAX_TEMP);

        // A later ensure must not clobber user edits
        assert!(store.save_ip("10.1.1.1").unwrap());
        store.ensure_settings_file().unwrap();
        assert_eq!(store.load_ip().as_deref(), Some("10.1.1.1"));
    }

    #[test]
    fn test_ensure_without_defaults_fails() {
        let (_dir, store) = store();
        assert!(store.ensure_settings_file().is_err());
    }

    /// The tmp file never survives a completed write
    #[test]
    fn test_atomic_write_leaves_no_tmp() {
        let (dir, store) = store();
        seed(&store);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "stray tmp files: {:?}", leftovers);
    }
}
