use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use serde_yaml::{Mapping, Value};

use crate::config::Settings;

/// Settings whose override value is taken verbatim.
const STRING_SETTINGS: [&str; 4] = [
    "BOT_NAME",
    "NEWSPIDER_MODULE",
    "FEED_EXPORT_ENCODING",
    "LOG_LEVEL",
];

#[derive(Debug, Clone)]
enum Source {
    Defaults,
    File(PathBuf),
    Yaml(String),
}

/// Builds [`Settings`] from a yaml source and `NAME=VALUE` overrides.
///
/// Overrides are applied on top of the source, each value is parsed as yaml
/// so that `DOWNLOAD_DELAY=2` or `FEEDS={out.csv: {format: csv}}` keep their
/// types. The loaded settings are validated.
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    source: Source,
    overrides: Vec<(String, Value)>,
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self {
            source: Source::Defaults,
            overrides: vec![],
        }
    }

    pub fn file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.source = Source::File(path.into());
        self
    }

    pub fn yaml<S: Into<String>>(mut self, yaml: S) -> Self {
        self.source = Source::Yaml(yaml.into());
        self
    }

    pub fn set(mut self, name: &str, value: &str) -> anyhow::Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            bail!("Invalid override, missing setting name");
        }
        let name = name.to_uppercase();
        let value = if value.is_empty() || STRING_SETTINGS.contains(&name.as_str()) {
            Value::String(value.to_string())
        } else {
            serde_yaml::from_str(value)
                .with_context(|| format!("Couldn't parse value of {name}: {value}"))?
        };
        self.overrides.push((name, value));
        Ok(self)
    }

    /// Applies an override written as `NAME=VALUE`.
    pub fn set_pair(self, pair: &str) -> anyhow::Result<Self> {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid override `{pair}`, expected NAME=VALUE"))?;
        self.set(name, value)
    }

    pub fn load(&self) -> anyhow::Result<Settings> {
        let mut mapping = match &self.source {
            Source::Defaults => Mapping::new(),
            Source::File(path) => {
                let yaml = fs_err::read_to_string(path)?;
                parse_mapping(&yaml)
                    .with_context(|| format!("Couldn't read settings {}", path.display()))?
            }
            Source::Yaml(yaml) => parse_mapping(yaml).context("Couldn't read settings")?,
        };

        for (name, value) in &self.overrides {
            log::debug!("Overriding {name} with {value:?}");
            mapping.insert(Value::String(name.clone()), value.clone());
        }

        let settings: Settings = serde_yaml::from_value(Value::Mapping(mapping))
            .context("Couldn't read settings")?;
        settings.validate()?;

        Ok(settings)
    }
}

fn parse_mapping(yaml: &str) -> anyhow::Result<Mapping> {
    match serde_yaml::from_str(yaml)? {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(mapping) => Ok(mapping),
        _ => bail!("Expected a mapping of settings"),
    }
}
