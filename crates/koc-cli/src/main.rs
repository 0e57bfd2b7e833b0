use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use koc_crawler::{
    Feeds, Item, LogLevel, PipelineRegistry, RobotsPolicy, Settings, SettingsLoader, Throttle,
};
use tokio::runtime;

/// Settings runner of the koc_crawler instance
#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    #[command(flatten)]
    pub settings: SettingsArgs,
    #[command(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Debug, clap::Args)]
pub struct SettingsArgs {
    /// Path to the yaml settings file, project settings when missing
    #[arg(env = "KOC_SETTINGS", long, global = true)]
    pub settings: Option<PathBuf>,
    /// Override a setting, can be repeated
    #[arg(long = "set", short = 's', value_name = "NAME=VALUE", global = true)]
    pub overrides: Vec<String>,
    /// Override the log level
    #[arg(value_enum, long, global = true)]
    pub log_level: Option<LogLevel>,
    /// When quiet no logs are outputted
    #[arg(long, short, global = true)]
    pub quiet: bool,
}

#[derive(Debug, clap::Subcommand)]
pub enum SubCommand {
    /// Load and validate the settings
    Check,
    /// Print the effective settings as yaml
    Show,
    Fetch(FetchArgs),
    Export(ExportArgs),
    #[command(hide = true)]
    Completion,
}

impl TryFrom<&SettingsArgs> for Settings {
    type Error = anyhow::Error;

    fn try_from(args: &SettingsArgs) -> Result<Self, Self::Error> {
        let mut loader = SettingsLoader::new();
        if let Some(path) = &args.settings {
            loader = loader.file(path);
        }
        for pair in &args.overrides {
            loader = loader.set_pair(pair)?;
        }
        if let Some(log_level) = args.log_level {
            loader = loader.set("LOG_LEVEL", log_level.as_str())?;
        }
        loader.load()
    }
}

/// Download a page with the configured headers and throttling
#[derive(Debug, clap::Args)]
pub struct FetchArgs {
    /// The page to download
    pub url: String,
}

pub fn fetch(settings: &Settings, args: FetchArgs) -> anyhow::Result<()> {
    let client = settings.http_client()?;
    let throttle = Throttle::from_settings(settings)?;
    let robots = RobotsPolicy::from_settings(settings);

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let page = rt.block_on(async {
        if !robots.check(&client, &throttle, &args.url).await? {
            bail!("Forbidden by robots.txt: {}", args.url);
        }
        let page = throttle.fetch(&client, &args.url).await?;
        Ok::<_, anyhow::Error>(page)
    })?;

    println!("{page}");
    Ok(())
}

/// Run json lines items through the pipelines and into the feeds
#[derive(Debug, clap::Args)]
pub struct ExportArgs {
    /// Json lines input, stdin when missing
    #[arg(long, short)]
    pub input: Option<PathBuf>,
}

pub fn export(settings: &Settings, args: ExportArgs) -> anyhow::Result<()> {
    let input: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Couldn't open {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };

    // Pipelines named by the settings have no implementation here
    let mut pipelines = PipelineRegistry::new().build(settings)?;
    let mut feeds = Feeds::open(settings)?;
    if feeds.is_empty() {
        log::warn!("No feed configured, items will be discarded");
    }

    let (mut exported, mut dropped) = (0, 0);
    for (n, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let item: Item = serde_json::from_str(&line)
            .with_context(|| format!("Invalid item on line {}", n + 1))?;
        match pipelines.process(item)? {
            Some(item) => {
                feeds.export(&item)?;
                exported += 1;
            }
            None => dropped += 1,
        }
    }

    pipelines.close()?;
    feeds.close()?;
    log::info!("Exported {exported} items, dropped {dropped}");
    Ok(())
}

fn init_logger(level: LogLevel) {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level.as_filter().to_string()),
    )
    .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let SubCommand::Completion = args.cmd {
        generate(Shell::Bash, &mut Args::command(), "koc", &mut io::stdout());
        return Ok(());
    }

    let settings = Settings::try_from(&args.settings)?;
    if !args.settings.quiet {
        init_logger(settings.log_level);
    }
    log::debug!("Loaded settings of {}", settings.bot_name);

    match args.cmd {
        SubCommand::Check => {
            println!("OK");
            Ok(())
        }
        SubCommand::Show => {
            print!("{}", settings.to_yaml()?);
            Ok(())
        }
        SubCommand::Fetch(args) => fetch(&settings, args),
        SubCommand::Export(args) => export(&settings, args),
        SubCommand::Completion => unreachable!(),
    }
}
