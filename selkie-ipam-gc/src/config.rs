//! Layered configuration: built-in defaults, then an optional YAML file,
//! then environment variables, then CLI overrides.

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use crate::controller::ControllerConfig;

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid log level {0:?}")]
    LogLevel(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Conf {
    #[serde(with = "conf_serde::level")]
    pub log_level: Level,

    /// Dwell before a candidate leak is confirmed, and before an empty
    /// block's affinity is released. Absent disables the candidacy stage
    /// entirely.
    #[serde(with = "conf_serde::duration::option")]
    pub leak_grace_period: Option<Duration>,

    /// How long to keep draining deletion channels after a first event, so
    /// mass deletions consolidate into one pass.
    #[serde(with = "conf_serde::duration")]
    pub consolidation_window: Duration,

    pub metrics: MetricsConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConf {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            leak_grace_period: Some(Duration::from_secs(15 * 60)),
            consolidation_window: Duration::from_secs(1),
            metrics: MetricsConf::default(),
        }
    }
}

impl Default for MetricsConf {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:9094".to_string(),
        }
    }
}

impl Conf {
    pub fn load(path: Option<&Path>, log_level: Option<&str>) -> Result<Self, ConfError> {
        let mut figment = Figment::from(Serialized::defaults(Conf::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let mut conf: Conf = figment
            .merge(Env::prefixed("SELKIE_GC_").split("__"))
            .extract()
            .map_err(Box::new)?;
        if let Some(level) = log_level {
            conf.log_level = level
                .parse()
                .map_err(|_| ConfError::LogLevel(level.to_string()))?;
        }
        Ok(conf)
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            leak_grace_period: self.leak_grace_period,
            consolidation_window: self.consolidation_window,
        }
    }
}

pub mod conf_serde {
    pub mod level {
        use serde::{Deserialize, Deserializer, Serializer};
        use tracing::Level;

        pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(level.as_str())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            s.parse::<Level>().map_err(serde::de::Error::custom)
        }
    }

    pub mod duration {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&humantime::format_duration(*duration).to_string())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            humantime::parse_duration(&s).map_err(serde::de::Error::custom)
        }

        pub mod option {
            use super::*;

            pub fn serialize<S>(
                duration: &Option<Duration>,
                serializer: S,
            ) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                match duration {
                    Some(d) => super::serialize(d, serializer),
                    None => serializer.serialize_none(),
                }
            }

            pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
            where
                D: Deserializer<'de>,
            {
                let opt = Option::<String>::deserialize(deserializer)?;
                match opt {
                    Some(s) => humantime::parse_duration(&s)
                        .map(Some)
                        .map_err(serde::de::Error::custom),
                    None => Ok(None),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let conf = Conf::default();
        assert_eq!(conf.log_level, Level::INFO);
        assert_eq!(conf.leak_grace_period, Some(Duration::from_secs(900)));
        assert_eq!(conf.consolidation_window, Duration::from_secs(1));
        assert!(conf.metrics.enabled);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let conf: Conf = Figment::from(Serialized::defaults(Conf::default()))
            .merge(Yaml::string(
                r#"
log_level: debug
leak_grace_period: 2m
consolidation_window: 500ms
metrics:
  enabled: false
"#,
            ))
            .extract()
            .unwrap();
        assert_eq!(conf.log_level, Level::DEBUG);
        assert_eq!(conf.leak_grace_period, Some(Duration::from_secs(120)));
        assert_eq!(conf.consolidation_window, Duration::from_millis(500));
        assert!(!conf.metrics.enabled);
    }

    #[test]
    fn cli_log_level_wins() {
        let conf = Conf::load(None, Some("trace")).unwrap();
        assert_eq!(conf.log_level, Level::TRACE);

        assert!(Conf::load(None, Some("noisy")).is_err());
    }

    #[test]
    fn durations_round_trip() {
        let conf = Conf::default();
        let yaml = serde_json::to_string(&conf).unwrap();
        assert!(yaml.contains("15m"));
    }
}
