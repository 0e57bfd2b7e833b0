use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};

/// Settings of a crawler instance.
///
/// Every key is optional in a settings file, missing keys take the values of
/// the `koc_crawler` project. Once loaded the settings are never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_bot_name")]
    pub bot_name: String,

    #[serde(default = "default_spider_modules")]
    pub spider_modules: Vec<String>,

    #[serde(default = "default_newspider_module")]
    pub newspider_module: String,

    #[serde(default = "default_robotstxt_obey")]
    pub robotstxt_obey: bool,

    #[serde(default = "default_concurrent_requests_per_domain")]
    pub concurrent_requests_per_domain: NonZeroUsize,

    /// Delay in seconds between two requests to the same domain
    #[serde(default = "default_download_delay")]
    pub download_delay: f64,

    #[serde(default = "default_feed_export_encoding")]
    pub feed_export_encoding: FeedEncoding,

    #[serde(default = "default_feeds")]
    pub feeds: BTreeMap<String, FeedOptions>,

    #[serde(default = "default_request_headers")]
    pub default_request_headers: BTreeMap<String, String>,

    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Pipeline identifiers mapped to their priority, lower runs first
    #[serde(default)]
    pub item_pipelines: BTreeMap<String, i32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bot_name: default_bot_name(),
            spider_modules: default_spider_modules(),
            newspider_module: default_newspider_module(),
            robotstxt_obey: default_robotstxt_obey(),
            concurrent_requests_per_domain: default_concurrent_requests_per_domain(),
            download_delay: default_download_delay(),
            feed_export_encoding: default_feed_export_encoding(),
            feeds: default_feeds(),
            default_request_headers: default_request_headers(),
            log_level: default_log_level(),
            item_pipelines: BTreeMap::new(),
        }
    }
}

fn default_bot_name() -> String {
    String::from("koc_crawler")
}

fn default_spider_modules() -> Vec<String> {
    vec![String::from("koc_crawler.spiders")]
}

fn default_newspider_module() -> String {
    String::from("koc_crawler.spiders")
}

fn default_robotstxt_obey() -> bool {
    false
}

fn default_concurrent_requests_per_domain() -> NonZeroUsize {
    NonZeroUsize::MIN
}

fn default_download_delay() -> f64 {
    0.5
}

fn default_feed_export_encoding() -> FeedEncoding {
    FeedEncoding::Utf8
}

fn default_feeds() -> BTreeMap<String, FeedOptions> {
    BTreeMap::from([(
        String::from("data/koc.jsonl"),
        FeedOptions::new(FeedFormat::JsonLines),
    )])
}

fn default_request_headers() -> BTreeMap<String, String> {
    BTreeMap::from([(
        String::from("User-Agent"),
        String::from(concat!(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) ",
            "AppleWebKit/537.36 (KHTML, like Gecko) ",
            "Chrome/120.0.0.0 Safari/537.36"
        )),
    )])
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

pub(crate) const MAX_PIPELINE_PRIORITY: i32 = 1000;

impl Settings {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        crate::SettingsLoader::new().yaml(yaml).load()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        crate::SettingsLoader::new().file(path.as_ref()).load()
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Checks the values the types alone cannot enforce.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bot_name.is_empty() || self.bot_name.contains(char::is_whitespace) {
            bail!(
                "Invalid BOT_NAME, expected a non-empty name without whitespace got: {:?}",
                self.bot_name
            );
        }

        if self.spider_modules.is_empty() {
            bail!("Invalid SPIDER_MODULES, expected at least one module");
        }
        for module in &self.spider_modules {
            if !is_module_path(module) {
                bail!("Invalid SPIDER_MODULES, not a module path: {module:?}");
            }
        }
        if !is_module_path(&self.newspider_module) {
            bail!(
                "Invalid NEWSPIDER_MODULE, not a module path: {:?}",
                self.newspider_module
            );
        }

        if !self.download_delay.is_finite() || self.download_delay < 0.0 {
            bail!(
                "Invalid DOWNLOAD_DELAY, expected a non-negative number of seconds got: {}",
                self.download_delay
            );
        }

        for (path, options) in &self.feeds {
            if path.trim().is_empty() {
                bail!("Invalid FEEDS, empty output path");
            }
            if options.format == FeedFormat::Csv
                && self.feed_encoding(options) == FeedEncoding::Ascii
            {
                bail!(
                    "Invalid FEEDS, {path} cannot export csv with {} encoding",
                    FeedEncoding::Ascii
                );
            }
        }

        self.request_headers().context("Invalid DEFAULT_REQUEST_HEADERS")?;

        for (id, priority) in &self.item_pipelines {
            if !is_module_path(id) {
                bail!("Invalid ITEM_PIPELINES, not a module path: {id:?}");
            }
            if !(0..=MAX_PIPELINE_PRIORITY).contains(priority) {
                bail!(
                    "Invalid ITEM_PIPELINES, priority of {id} must be within \
                     0..={MAX_PIPELINE_PRIORITY} got: {priority}"
                );
            }
        }

        Ok(())
    }

    /// The encoding of a feed, its own or `FEED_EXPORT_ENCODING`.
    pub fn feed_encoding(&self, options: &FeedOptions) -> FeedEncoding {
        options.encoding.unwrap_or(self.feed_export_encoding)
    }
}

/// Whether `path` is a dotted sequence of identifiers, such as
/// `koc_crawler.spiders`.
pub fn is_module_path(path: &str) -> bool {
    path.split('.').all(|segment| {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c == '_' || c.is_ascii_alphabetic() => {
                chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
            }
            _ => false,
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedOptions {
    pub format: FeedFormat,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<FeedEncoding>,

    /// Truncate the output file instead of appending to it
    #[serde(default, skip_serializing_if = "is_false")]
    pub overwrite: bool,

    /// Fields to export, in this order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indent: Option<usize>,
}

impl FeedOptions {
    pub fn new(format: FeedFormat) -> Self {
        Self {
            format,
            encoding: None,
            overwrite: false,
            fields: None,
            indent: None,
        }
    }
}

fn is_false(b: &bool) -> bool {
    !b
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    #[serde(alias = "jl", alias = "jsonl")]
    JsonLines,
    Json,
    Csv,
}

impl fmt::Display for FeedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JsonLines => f.write_str("jsonlines"),
            Self::Json => f.write_str("json"),
            Self::Csv => f.write_str("csv"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FeedEncoding {
    Utf8,
    /// Non-ASCII characters are escaped in JSON output
    Ascii,
}

impl FromStr for FeedEncoding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "ascii" | "us-ascii" => Ok(Self::Ascii),
            _ => Err(anyhow!(
                "Unsupported encoding `{s}`, expected one of: utf-8, ascii"
            )),
        }
    }
}

impl TryFrom<String> for FeedEncoding {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FeedEncoding> for String {
    fn from(encoding: FeedEncoding) -> Self {
        encoding.to_string()
    }
}

impl fmt::Display for FeedEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8 => f.write_str("utf-8"),
            Self::Ascii => f.write_str("ascii"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        Self::Critical,
        Self::Error,
        Self::Warning,
        Self::Info,
        Self::Debug,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        }
    }

    /// `log` has no critical level, it shares `Error` with `ERROR`.
    pub fn as_filter(&self) -> log::LevelFilter {
        match self {
            Self::Critical | Self::Error => log::LevelFilter::Error,
            Self::Warning => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                anyhow!(
                    "Unknown log level `{s}`, expected one of: {}",
                    Self::ALL.map(|l| l.as_str()).join(", ")
                )
            })
    }
}

impl TryFrom<String> for LogLevel {
    type Error = anyhow::Error;

    // `Self::Error` would be ambiguous with the `Error` variant
    fn try_from(s: String) -> Result<Self, anyhow::Error> {
        s.parse()
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.as_str().to_string()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_settings() {
        let settings = Settings::default();
        assert_eq!(settings.bot_name, "koc_crawler");
        assert_eq!(settings.spider_modules, vec!["koc_crawler.spiders"]);
        assert_eq!(settings.newspider_module, "koc_crawler.spiders");
        assert!(!settings.robotstxt_obey);
        assert_eq!(settings.concurrent_requests_per_domain.get(), 1);
        assert_eq!(settings.download_delay, 0.5);
        assert_eq!(settings.feed_export_encoding, FeedEncoding::Utf8);
        assert_eq!(
            settings.feeds.get("data/koc.jsonl"),
            Some(&FeedOptions::new(FeedFormat::JsonLines))
        );
        assert!(settings.default_request_headers["User-Agent"]
            .starts_with("Mozilla/5.0 (Windows"));
        assert_eq!(settings.log_level, LogLevel::Info);
        assert!(settings.item_pipelines.is_empty());
        settings.validate().unwrap();
    }

    #[test]
    fn module_paths() {
        assert!(is_module_path("koc_crawler.spiders"));
        assert!(is_module_path("koc_crawler.pipelines.KocCrawlerPipeline"));
        assert!(is_module_path("_private"));
        assert!(!is_module_path(""));
        assert!(!is_module_path("koc_crawler."));
        assert!(!is_module_path("koc-crawler.spiders"));
        assert!(!is_module_path("1spiders"));
    }

    #[test]
    fn log_levels() {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::Critical.as_filter(), log::LevelFilter::Error);
        assert_eq!(LogLevel::Info.as_filter(), log::LevelFilter::Info);

        let err = "VERBOSE".parse::<LogLevel>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown log level `VERBOSE`, expected one of: CRITICAL, ERROR, WARNING, INFO, DEBUG"
        );
    }

    #[test]
    fn log_level_from_string() {
        assert_eq!(LogLevel::try_from(String::from("Error")).unwrap(), LogLevel::Error);
        assert_eq!(String::from(LogLevel::Warning), "WARNING");
        assert!(LogLevel::try_from(String::from("trace")).is_err());
    }

    #[test]
    fn encodings() {
        assert_eq!("UTF-8".parse::<FeedEncoding>().unwrap(), FeedEncoding::Utf8);
        assert_eq!("utf8".parse::<FeedEncoding>().unwrap(), FeedEncoding::Utf8);
        assert_eq!("us-ascii".parse::<FeedEncoding>().unwrap(), FeedEncoding::Ascii);
        assert!("latin-1".parse::<FeedEncoding>().is_err());
    }

    #[test]
    fn invalid_values() {
        let settings = Settings {
            download_delay: -0.1,
            ..Default::default()
        };
        assert!(settings
            .validate()
            .unwrap_err()
            .to_string()
            .starts_with("Invalid DOWNLOAD_DELAY"));

        let settings = Settings {
            download_delay: f64::NAN,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            bot_name: String::from("koc crawler"),
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            spider_modules: vec![],
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            default_request_headers: BTreeMap::from([(
                String::from("User Agent"),
                String::from("koc"),
            )]),
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(format!("{err:#}").starts_with("Invalid DEFAULT_REQUEST_HEADERS"));

        let settings = Settings {
            item_pipelines: BTreeMap::from([(
                String::from("koc_crawler.pipelines.KocCrawlerPipeline"),
                1001,
            )]),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn csv_feed_requires_utf8() {
        let mut csv = FeedOptions::new(FeedFormat::Csv);
        csv.encoding = Some(FeedEncoding::Ascii);
        let settings = Settings {
            feeds: BTreeMap::from([(String::from("data/koc.csv"), csv)]),
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            feeds: BTreeMap::from([(
                String::from("data/koc.json"),
                FeedOptions::new(FeedFormat::Json),
            )]),
            feed_export_encoding: FeedEncoding::Ascii,
            ..Default::default()
        };
        settings.validate().unwrap();
    }
}
