//! `settings.txt`: flat `key=value` lines, read once at startup.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, warn};

use crate::error::{Error, Result};
use crate::training::TrainerCommand;

pub const SETTINGS_FILE: &str = "settings.txt";
pub const DEFAULT_CLASSES_FILE: &str = "classes.yaml";

pub const KEYS: [&str; 4] = ["default_save_dir", "classes_file", "trainer", "autosave"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Pre-fills the export destination.
    pub default_save_dir: Option<PathBuf>,
    pub classes_file: PathBuf,
    pub trainer: TrainerCommand,
    /// Write a dirty image's labels before switching away from it.
    pub autosave: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_save_dir: None,
            classes_file: PathBuf::from(DEFAULT_CLASSES_FILE),
            trainer: TrainerCommand::default(),
            autosave: true,
        }
    }
}

impl Settings {
    /// Blank lines and `#` comments are skipped, unknown keys are warned about,
    /// and a line without `=` is an error.
    pub fn parse(text: &str) -> Result<Self> {
        let mut settings = Self::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::Settings {
                    line: idx + 1,
                    message: format!("expected key=value, found `{line}`"),
                });
            };
            let key = key.trim();
            if !KEYS.contains(&key) {
                warn!("Ignoring unknown setting `{key}` on line {}", idx + 1);
                continue;
            }
            settings.set(key, value.trim()).map_err(|e| Error::Settings {
                line: idx + 1,
                message: e.to_string(),
            })?;
        }
        Ok(settings)
    }

    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => {
                debug!("Loaded settings from {}", path.display());
                Self::parse(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            error!("Failed to load settings: {e}, using defaults");
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_text()).map_err(|e| Error::io(path, e))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "default_save_dir" => self
                .default_save_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            "classes_file" => self.classes_file.display().to_string(),
            "trainer" => self.trainer.to_string(),
            "autosave" => self.autosave.to_string(),
            _ => return None,
        };
        Some(value)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "default_save_dir" => {
                self.default_save_dir = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "classes_file" => {
                if value.is_empty() {
                    return Err(Error::validation("classes_file must not be empty"));
                }
                self.classes_file = PathBuf::from(value);
            }
            "trainer" => self.trainer = value.parse()?,
            "autosave" => {
                self.autosave = match value.to_ascii_lowercase().as_str() {
                    "true" | "yes" | "on" | "1" => true,
                    "false" | "no" | "off" | "0" => false,
                    _ => {
                        return Err(Error::validation(format!(
                            "autosave must be true or false, got `{value}`"
                        )));
                    }
                };
            }
            _ => return Err(Error::validation(format!("unknown setting `{key}`"))),
        }
        Ok(())
    }

    pub fn to_text(&self) -> String {
        KEYS.iter()
            .filter_map(|key| self.get(key).map(|v| format!("{key}={v}\n")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys_and_skips_noise() {
        let text = "# saved by annotrain\n\ndefault_save_dir=/data/out\nautosave = off\ncolour=blue\ntrainer=python -u train.py\n";
        let s = Settings::parse(text).unwrap();
        assert_eq!(s.default_save_dir, Some(PathBuf::from("/data/out")));
        assert!(!s.autosave);
        assert_eq!(s.trainer.program, "python");
        assert_eq!(s.classes_file, PathBuf::from(DEFAULT_CLASSES_FILE));
    }

    #[test]
    fn line_without_equals_is_an_error() {
        match Settings::parse("autosave=true\nnonsense\n") {
            Err(Error::Settings { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_value_reports_its_line() {
        assert!(matches!(
            Settings::parse("autosave=maybe"),
            Err(Error::Settings { line: 1, .. })
        ));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        assert_eq!(Settings::load(&path).unwrap(), Settings::default());

        let mut s = Settings::default();
        s.set("default_save_dir", "/tmp/export").unwrap();
        s.set("autosave", "false").unwrap();
        s.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), s);
    }

    #[test]
    fn empty_save_dir_clears_it() {
        let mut s = Settings::default();
        s.set("default_save_dir", "/x").unwrap();
        s.set("default_save_dir", "").unwrap();
        assert_eq!(s.default_save_dir, None);
        assert!(s.set("nope", "1").is_err());
    }
}
