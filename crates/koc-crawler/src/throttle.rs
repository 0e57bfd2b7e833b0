use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};

use crate::config::Settings;

/// Per-domain request throttle.
///
/// Each domain gets at most `per_domain` permits alive at once, and two
/// consecutive permits of a domain are spaced by at least `delay`.
///
/// Domains are tracked until [`Throttle::prune`] forgets the idle ones.
#[derive(Clone)]
pub struct Throttle {
    per_domain: NonZeroUsize,
    delay: Duration,
    domains: Arc<Mutex<HashMap<String, Arc<DomainSlot>>>>,
}

struct DomainSlot {
    permits: Arc<Semaphore>,
    next_at: AsyncMutex<Option<Instant>>,
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("per_domain", &self.per_domain)
            .field("delay", &self.delay)
            .finish()
    }
}

impl Throttle {
    pub fn new(per_domain: NonZeroUsize, delay: Duration) -> Self {
        Self {
            per_domain,
            delay,
            domains: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let delay = Duration::try_from_secs_f64(settings.download_delay)
            .with_context(|| format!("Invalid DOWNLOAD_DELAY {}", settings.download_delay))?;
        Ok(Self::new(settings.concurrent_requests_per_domain, delay))
    }

    pub fn per_domain(&self) -> NonZeroUsize {
        self.per_domain
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    fn slot(&self, domain: &str) -> Arc<DomainSlot> {
        let mut domains = self.domains.lock().unwrap_or_else(|e| e.into_inner());
        domains
            .entry(domain.to_string())
            .or_insert_with(|| {
                Arc::new(DomainSlot {
                    permits: Arc::new(Semaphore::new(self.per_domain.get())),
                    next_at: AsyncMutex::new(None),
                })
            })
            .clone()
    }

    pub fn tracked_domains(&self) -> usize {
        self.domains.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Forgets domains with no permit alive and no pending delay.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut domains = self.domains.lock().unwrap_or_else(|e| e.into_inner());
        domains.retain(|_, slot| {
            if Arc::strong_count(slot) > 1
                || slot.permits.available_permits() < self.per_domain.get()
            {
                return true;
            }
            match slot.next_at.try_lock() {
                Ok(next_at) => matches!(*next_at, Some(at) if at > now),
                Err(_) => true,
            }
        });
    }

    /// Waits until a request to `url` is allowed.
    pub async fn acquire(&self, url: &str) -> anyhow::Result<ThrottlePermit> {
        let domain = domain_of(url)?;
        let slot = self.slot(&domain);

        let permit = slot.permits.clone().acquire_owned().await?;

        let mut next_at = slot.next_at.lock().await;
        if let Some(at) = *next_at {
            if at > Instant::now() {
                log::trace!("Delaying request to {domain}");
                sleep_until(at).await;
            }
        }
        *next_at = Some(Instant::now() + self.delay);
        drop(next_at);

        Ok(ThrottlePermit {
            domain,
            _permit: permit,
        })
    }

    /// Downloads `url` once a permit is granted.
    pub async fn fetch(&self, client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
        let _permit = self.acquire(url).await?;
        log::debug!("Downloading {url}");
        let page = client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(page)
    }
}

/// A granted request slot, released when dropped.
#[derive(Debug)]
pub struct ThrottlePermit {
    domain: String,
    _permit: OwnedSemaphorePermit,
}

impl ThrottlePermit {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

/// The host of `url`, URLs without host share the empty domain.
fn domain_of(url: &str) -> anyhow::Result<String> {
    let url = reqwest::Url::parse(url).with_context(|| format!("Invalid URL {url}"))?;
    Ok(url.host_str().unwrap_or_default().to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future;

    use super::*;

    #[test]
    fn domains() {
        assert_eq!(domain_of("https://KOC.example.com/a?b=c").unwrap(), "koc.example.com");
        assert_eq!(domain_of("data:text/plain,koc").unwrap(), "");
        assert!(domain_of("not a url").is_err());
    }

    #[test]
    fn from_settings() {
        let throttle = Throttle::from_settings(&Settings::default()).unwrap();
        assert_eq!(throttle.per_domain().get(), 1);
        assert_eq!(throttle.delay(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn spaces_requests_to_a_domain() {
        let delay = Duration::from_millis(50);
        let throttle = Throttle::new(NonZeroUsize::new(4).unwrap(), delay);

        let start = Instant::now();
        for _ in 0..3 {
            let permit = throttle.acquire("https://koc.example.com/page").await.unwrap();
            assert_eq!(permit.domain(), "koc.example.com");
        }
        assert!(start.elapsed() >= delay * 2);
    }

    #[tokio::test]
    async fn prunes_idle_domains() {
        let throttle = Throttle::new(NonZeroUsize::MIN, Duration::ZERO);

        let busy = throttle.acquire("https://a.example.com/").await.unwrap();
        drop(throttle.acquire("https://b.example.com/").await.unwrap());
        assert_eq!(throttle.tracked_domains(), 2);

        throttle.prune();
        assert_eq!(throttle.tracked_domains(), 1);

        drop(busy);
        throttle.prune();
        assert_eq!(throttle.tracked_domains(), 0);
    }

    #[tokio::test]
    async fn keeps_delayed_domains() {
        let throttle = Throttle::new(NonZeroUsize::MIN, Duration::from_secs(60));
        drop(throttle.acquire("https://a.example.com/").await.unwrap());
        throttle.prune();
        assert_eq!(throttle.tracked_domains(), 1);
    }

    #[tokio::test]
    async fn domains_are_independent() {
        let throttle = Throttle::new(NonZeroUsize::MIN, Duration::from_secs(60));

        let _a = throttle.acquire("https://a.example.com/").await.unwrap();
        let b = tokio::time::timeout(
            Duration::from_secs(1),
            throttle.acquire("https://b.example.com/"),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn bounds_concurrency_per_domain() {
        let throttle = Throttle::new(NonZeroUsize::new(2).unwrap(), Duration::ZERO);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..8).map(|_| {
            let throttle = throttle.clone();
            let active = active.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                let _permit = throttle.acquire("https://koc.example.com/").await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            })
        });
        for res in future::join_all(tasks).await {
            res.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
