mod client;
mod config;
mod feed;
mod loader;
mod pipeline;
mod robots;
mod throttle;

pub use config::{is_module_path, FeedEncoding, FeedFormat, FeedOptions, LogLevel, Settings};
pub use feed::{FeedExporter, Feeds, Item};
pub use loader::SettingsLoader;
pub use pipeline::{ItemPipeline, PipelineChain, PipelineRegistry};
pub use robots::RobotsPolicy;
pub use throttle::{Throttle, ThrottlePermit};

pub use anyhow;
