// SPDX-License-Identifier: Apache-2.0

//! YAML queue-definition loader.
//!
//! A definition file declares queues to provision at startup: depth
//! limit, access mode, event thresholds, and policy flags. Loading is
//! two-phase: serde deserializes a raw shape, then every field is
//! validated into a typed `QueueSpec`. Any invalid field fails the whole
//! file.
//!
//! ```yaml
//! queues:
//!   - name: telemetry
//!     max_depth: 128
//!     mode: read_write
//!     level: 64
//!     time_limit_ms: 5000
//!     discard: true
//!     subscribe: [empty, nonempty]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, ShqResult};
use crate::queue::SharedQueue;
use crate::shm::layout::SYSTEM_MAX_DEPTH;
use crate::types::{Event, Mode, QueueName};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    queues: Vec<RawQueue>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawQueue {
    name: String,
    #[serde(default)]
    max_depth: u64,
    #[serde(default = "default_mode")]
    mode: Mode,
    #[serde(default)]
    level: u64,
    #[serde(default)]
    time_limit_ms: u64,
    #[serde(default)]
    target_delay_ms: u64,
    #[serde(default)]
    discard: bool,
    #[serde(default)]
    adaptive_lifo: bool,
    #[serde(default)]
    subscribe: Vec<Event>,
}

fn default_mode() -> Mode {
    Mode::ReadWrite
}

/// A validated queue definition, ready to provision.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: QueueName,
    pub max_depth: u64,
    pub mode: Mode,
    pub level: u64,
    pub time_limit: Duration,
    pub target_delay: Duration,
    pub discard: bool,
    pub adaptive_lifo: bool,
    pub subscribe: Vec<Event>,
}

impl QueueSpec {
    fn from_raw(raw: RawQueue) -> Result<Self, ConfigError> {
        let name =
            QueueName::new(raw.name.as_str()).map_err(|e| ConfigError::InvalidFieldValue {
                field: "name",
                value: raw.name.clone(),
                reason: e.to_string(),
            })?;

        if raw.max_depth > SYSTEM_MAX_DEPTH {
            return Err(ConfigError::InvalidFieldValue {
                field: "max_depth",
                value: raw.max_depth.to_string(),
                reason: format!("exceeds the system maximum of {}", SYSTEM_MAX_DEPTH),
            });
        }
        if raw.level > SYSTEM_MAX_DEPTH {
            return Err(ConfigError::InvalidFieldValue {
                field: "level",
                value: raw.level.to_string(),
                reason: format!("exceeds the system maximum of {}", SYSTEM_MAX_DEPTH),
            });
        }

        let wants_settings = raw.level > 0
            || raw.time_limit_ms > 0
            || raw.target_delay_ms > 0
            || raw.discard
            || raw.adaptive_lifo;
        if wants_settings && !raw.mode.can_write() {
            return Err(ConfigError::InvalidFieldValue {
                field: "mode",
                value: format!("{}", raw.mode),
                reason: "queue settings require a writable mode".to_string(),
            });
        }

        Ok(Self {
            name,
            max_depth: raw.max_depth,
            mode: raw.mode,
            level: raw.level,
            time_limit: Duration::from_millis(raw.time_limit_ms),
            target_delay: Duration::from_millis(raw.target_delay_ms),
            discard: raw.discard,
            adaptive_lifo: raw.adaptive_lifo,
            subscribe: raw.subscribe,
        })
    }

    /// Open or create the queue and apply every declared setting.
    pub fn provision(&self) -> ShqResult<SharedQueue> {
        let queue = SharedQueue::open_or_create(self.name.as_str(), self.max_depth, self.mode)?;
        if self.level > 0 {
            queue.set_level(self.level)?;
        }
        if !self.time_limit.is_zero() {
            queue.set_time_limit(self.time_limit)?;
        }
        if !self.target_delay.is_zero() {
            queue.set_target_delay(self.target_delay)?;
        }
        if self.discard {
            queue.set_discard(true)?;
        }
        if self.adaptive_lifo {
            queue.set_adaptive_lifo(true)?;
        }
        for event in &self.subscribe {
            queue.subscribe(*event)?;
        }
        tracing::info!(name = %self.name, mode = %self.mode, "provisioned queue");
        Ok(queue)
    }
}

/// A loaded and validated queue-definition file.
#[derive(Debug)]
pub struct Config {
    specs: Vec<QueueSpec>,
}

impl Config {
    /// Load and validate a definition file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { source })?;
        Self::from_yaml(&text)
    }

    /// Parse and validate definitions from a YAML string.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;

        let mut specs = Vec::with_capacity(raw.queues.len());
        for raw_queue in raw.queues {
            let spec = QueueSpec::from_raw(raw_queue)?;
            if specs.iter().any(|s: &QueueSpec| s.name == spec.name) {
                return Err(ConfigError::DuplicateQueueName {
                    name: spec.name.to_string(),
                });
            }
            specs.push(spec);
        }
        Ok(Self { specs })
    }

    /// Validated definitions in file order.
    pub fn specs(&self) -> &[QueueSpec] {
        &self.specs
    }

    /// Provision every declared queue, in file order.
    pub fn provision_all(&self) -> ShqResult<Vec<SharedQueue>> {
        self.specs.iter().map(QueueSpec::provision).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_full_definition() {
        let cfg = Config::from_yaml(
            r#"
queues:
  - name: telemetry
    max_depth: 128
    mode: read_write
    level: 64
    time_limit_ms: 5000
    target_delay_ms: 100
    discard: true
    adaptive_lifo: true
    subscribe: [empty, nonempty, time]
  - name: audit
    mode: write_only
"#,
        )
        .unwrap();

        let specs = cfg.specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name.as_str(), "telemetry");
        assert_eq!(specs[0].max_depth, 128);
        assert_eq!(specs[0].time_limit, Duration::from_secs(5));
        assert!(specs[0].discard && specs[0].adaptive_lifo);
        assert_eq!(specs[0].subscribe, vec![Event::Empty, Event::Nonempty, Event::Time]);
        assert_eq!(specs[1].mode, Mode::WriteOnly);
        assert_eq!(specs[1].max_depth, 0);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = Config::from_yaml(
            "queues:\n  - name: q1\n  - name: q1\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateQueueName { .. }));
    }

    #[test]
    fn test_settings_require_writable_mode() {
        let err = Config::from_yaml(
            "queues:\n  - name: q1\n    mode: read_only\n    discard: true\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidFieldValue { field: "mode", .. }
        ));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let err = Config::from_yaml("queues:\n  - name: 'a/b'\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidFieldValue { field: "name", .. }
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            Config::from_yaml("queues:\n  - name: q1\n    depth: 4\n"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_file("/nonexistent/queues.yaml"),
            Err(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_load_from_file_and_provision() {
        let name = format!("shq-cfg-{}", std::process::id());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "queues:\n  - name: {}\n    max_depth: 8\n    level: 4\n    subscribe: [all]\n",
            name
        )
        .unwrap();

        let cfg = Config::from_file(file.path()).unwrap();
        let queues = cfg.provision_all().unwrap();
        assert_eq!(queues.len(), 1);
        assert!(queues[0].is_subscribed(Event::All));
        assert_eq!(queues[0].max_depth(), 8);

        queues.into_iter().next().unwrap().destroy().unwrap();
    }
}
