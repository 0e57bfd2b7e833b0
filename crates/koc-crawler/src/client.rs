use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};

use crate::config::Settings;

impl Settings {
    /// Headers sent with every request.
    ///
    /// Without a configured `User-Agent`, the bot name is used as user agent.
    pub fn request_headers(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.default_request_headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid header name {name:?}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid value for header {name}"))?;
            headers.insert(header, value);
        }
        if !headers.contains_key(USER_AGENT) {
            let bot = HeaderValue::from_str(&self.bot_name)
                .with_context(|| format!("Invalid bot name {:?}", self.bot_name))?;
            headers.insert(USER_AGENT, bot);
        }
        Ok(headers)
    }

    pub fn http_client(&self) -> anyhow::Result<reqwest::Client> {
        let client = reqwest::ClientBuilder::new()
            .default_headers(self.request_headers()?)
            .gzip(true)
            .deflate(true)
            .build()?;
        Ok(client)
    }
}
