use anyhow::Context;
use texting_robots::Robot;

use crate::config::Settings;
use crate::throttle::Throttle;

/// Applies robots.txt rules when `ROBOTSTXT_OBEY` is set.
#[derive(Debug, Clone)]
pub struct RobotsPolicy {
    obey: bool,
    agent: String,
}

impl RobotsPolicy {
    pub fn new(obey: bool, agent: impl Into<String>) -> Self {
        Self {
            obey,
            agent: agent.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.robotstxt_obey, settings.bot_name.clone())
    }

    pub fn obeys(&self) -> bool {
        self.obey
    }

    /// Location of the robots.txt that rules `url`.
    pub fn robots_url(url: &str) -> anyhow::Result<String> {
        let url = reqwest::Url::parse(url).with_context(|| format!("Invalid URL {url}"))?;
        Ok(url.join("/robots.txt")?.to_string())
    }

    /// Whether `url` may be requested given the robots.txt content.
    ///
    /// An unparsable robots.txt allows everything.
    pub fn allowed(&self, url: &str, robots_txt: &[u8]) -> bool {
        if !self.obey {
            return true;
        }
        match Robot::new(&self.agent, robots_txt) {
            Ok(robot) => robot.allowed(url),
            Err(e) => {
                log::warn!("Ignoring robots.txt for {url} got: {e}");
                true
            }
        }
    }

    /// Downloads the robots.txt of `url` (if obeyed) and checks `url`.
    ///
    /// A robots.txt that can't be downloaded allows everything.
    pub async fn check(
        &self,
        client: &reqwest::Client,
        throttle: &Throttle,
        url: &str,
    ) -> anyhow::Result<bool> {
        if !self.obey {
            return Ok(true);
        }
        let robots_url = Self::robots_url(url)?;
        match throttle.fetch(client, &robots_url).await {
            Ok(robots_txt) => Ok(self.allowed(url, robots_txt.as_bytes())),
            Err(e) => {
                log::warn!("Skipping robots.txt: {robots_url} got: {e}");
                Ok(true)
            }
        }
    }
}
