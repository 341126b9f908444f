//! Settings file handling.
//!
//! - Writes go to a temp file that is renamed over the target
//! - `update_section` rewrites one table and keeps the rest of the file
//! - Loaded settings are validated before they are accepted

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use toml_edit::{DocumentMut, Item};

use super::settings::{ConfigSection, Settings};
use crate::analysis::AnalysisConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot access settings file: {0}")]
    Read(#[from] io::Error),

    #[error("Malformed settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot encode settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Malformed TOML document: {0}")]
    EditParse(#[from] toml_edit::TomlError),

    #[error("No settings file at {}", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Section order and the comment written above each table.
const SECTIONS: [(ConfigSection, &str); 3] = [
    (ConfigSection::Analysis, "Offset analysis"),
    (ConfigSection::Scheduler, "Batch scheduling"),
    (ConfigSection::Logging, "Logging"),
];

/// Owns one settings file and its parsed contents.
pub struct ConfigManager {
    path: PathBuf,
    settings: Settings,
}

impl ConfigManager {
    /// Nothing is read until `load` or `load_or_create`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            settings: Settings::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// In-memory edits; persisted by `save` or `update_section`.
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Read and validate the file. Fails with `NotFound` when it is missing.
    pub fn load(&mut self) -> ConfigResult<()> {
        let (_, settings) = self.read_settings()?;
        self.settings = settings;
        Ok(())
    }

    /// Like `load`, but a missing file is created from defaults and a file
    /// with missing keys or stray tables is rewritten in full.
    pub fn load_or_create(&mut self) -> ConfigResult<()> {
        if !self.path.exists() {
            tracing::info!("Creating default settings at {}", self.path.display());
            self.settings = Settings::default();
            return self.save();
        }

        let (raw, settings) = self.read_settings()?;
        let on_disk: toml::Table = toml::from_str(&raw)?;
        let complete: toml::Table = toml::from_str(&toml::to_string_pretty(&settings)?)?;
        let stale = on_disk != complete;

        self.settings = settings;
        if stale {
            tracing::debug!("Filling in defaults for {}", self.path.display());
            self.save()?;
        }
        Ok(())
    }

    /// Write every section, replacing the file.
    pub fn save(&self) -> ConfigResult<()> {
        let mut rendered = String::from("# dubsync configuration\n\n");
        for (section, title) in SECTIONS {
            rendered.push_str(&format!("# {}\n[{}]\n", title, section.table_name()));
            rendered.push_str(&self.section_body(section)?);
            rendered.push('\n');
        }
        self.replace_file(&rendered)?;
        Ok(())
    }

    /// Replace one table on disk and keep everything else byte for byte.
    ///
    /// The file is re-read first, so edits made to other sections since
    /// loading survive.
    pub fn update_section(&mut self, section: ConfigSection) -> ConfigResult<()> {
        validate(&self.settings)?;

        let mut doc = match fs::read_to_string(&self.path) {
            Ok(text) if !text.trim().is_empty() => text.parse::<DocumentMut>()?,
            Ok(_) => DocumentMut::new(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => DocumentMut::new(),
            Err(e) => return Err(e.into()),
        };

        let table = self.section_body(section)?.parse::<DocumentMut>()?;
        doc[section.table_name()] = Item::Table(table.as_table().clone());

        self.replace_file(&doc.to_string())?;
        tracing::debug!("Updated [{}] in {}", section.table_name(), self.path.display());
        Ok(())
    }

    fn read_settings(&self) -> ConfigResult<(String, Settings)> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(self.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let settings: Settings = toml::from_str(&raw)?;
        validate(&settings)?;
        Ok((raw, settings))
    }

    fn section_body(&self, section: ConfigSection) -> ConfigResult<String> {
        let body = match section {
            ConfigSection::Analysis => toml::to_string_pretty(&self.settings.analysis)?,
            ConfigSection::Scheduler => toml::to_string_pretty(&self.settings.scheduler)?,
            ConfigSection::Logging => toml::to_string_pretty(&self.settings.logging)?,
        };
        Ok(body)
    }

    /// Temp file plus rename, so readers never see a half-written file.
    fn replace_file(&self, content: &str) -> io::Result<()> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir)?,
            _ => {}
        }

        let staging = self.path.with_extension("toml.tmp");
        let mut file = fs::File::create(&staging)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&staging, &self.path)
    }
}

/// Reject settings the engine cannot run with.
pub fn validate(settings: &Settings) -> ConfigResult<()> {
    let scheduler = &settings.scheduler;
    if scheduler.workers == 0 {
        return Err(ConfigError::Invalid(
            "scheduler.workers must be at least 1".to_string(),
        ));
    }
    let Some(largest) = scheduler.accelerator_memory_mb.iter().copied().max() else {
        return Err(ConfigError::Invalid(
            "scheduler.accelerator_memory_mb needs at least one device".to_string(),
        ));
    };
    if scheduler.job_memory_mb == 0 || scheduler.job_memory_mb > largest {
        return Err(ConfigError::Invalid(format!(
            "scheduler.job_memory_mb ({}) must be between 1 and the largest accelerator ({})",
            scheduler.job_memory_mb, largest
        )));
    }

    AnalysisConfig::from(&settings.analysis)
        .validate()
        .map_err(|e| ConfigError::Invalid(e.to_string()))
}
