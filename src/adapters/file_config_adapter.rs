//! INI file configuration adapter.

use crate::domain::error::EngineError;
use crate::ports::config_port::ConfigPort;
use configparser::ini::Ini;
use std::path::Path;

pub struct FileConfigAdapter {
    config: Ini,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let mut config = Ini::new();
        config.load(path).map_err(|reason| EngineError::ConfigParse {
            file: path.display().to_string(),
            reason,
        })?;
        Ok(Self { config })
    }

    pub fn from_string(content: &str) -> Result<Self, EngineError> {
        let mut config = Ini::new();
        config
            .read(content.to_string())
            .map_err(|reason| EngineError::ConfigParse {
                file: "<string>".to_string(),
                reason,
            })?;
        Ok(Self { config })
    }

    fn parse_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Some(true),
            "false" | "no" | "0" | "off" => Some(false),
            _ => None,
        }
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.config.get(section, key)
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.config
            .getint(section, key)
            .ok()
            .flatten()
            .unwrap_or(default)
    }

    fn get_double(&self, section: &str, key: &str, default: f64) -> f64 {
        self.config
            .getfloat(section, key)
            .ok()
            .flatten()
            .unwrap_or(default)
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        self.config
            .get(section, key)
            .as_deref()
            .and_then(Self::parse_bool)
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn reads_engine_sections() {
        let content = r#"
[engine]
live_mode = on
time_loop_maximum_minutes = 20

[algorithm]
time_zone = America/New_York
initial_cash = 25000.5
"#;
        let adapter = FileConfigAdapter::from_string(content).unwrap();
        assert!(adapter.get_bool("engine", "live_mode", false));
        assert_eq!(adapter.get_int("engine", "time_loop_maximum_minutes", 0), 20);
        assert_eq!(adapter.get_double("algorithm", "initial_cash", 0.0), 25000.5);
        assert_eq!(
            adapter.get_string("algorithm", "time_zone").as_deref(),
            Some("America/New_York")
        );
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let adapter = FileConfigAdapter::from_string("[engine]\n").unwrap();
        assert_eq!(adapter.get_string("engine", "stream_buffer"), None);
        assert_eq!(adapter.get_int("engine", "stream_buffer", 64), 64);
        assert_eq!(adapter.get_double("algorithm", "initial_cash", 1.5), 1.5);
        assert!(adapter.get_bool("engine", "live_mode", true));
    }

    #[test]
    fn malformed_numbers_fall_back_to_defaults() {
        let adapter =
            FileConfigAdapter::from_string("[engine]\nstream_buffer = many\nlive_mode = maybe\n")
                .unwrap();
        assert_eq!(adapter.get_int("engine", "stream_buffer", 64), 64);
        assert!(!adapter.get_bool("engine", "live_mode", false));
    }

    #[test]
    fn from_file_reads_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[data]\ndirectory = /srv/bars\n").unwrap();
        let adapter = FileConfigAdapter::from_file(file.path()).unwrap();
        assert_eq!(adapter.get_string("data", "directory").as_deref(), Some("/srv/bars"));
    }

    #[test]
    fn missing_file_is_a_parse_error() {
        let result = FileConfigAdapter::from_file("/nonexistent/path/engine.ini");
        assert!(matches!(result, Err(EngineError::ConfigParse { .. })));
    }
}
