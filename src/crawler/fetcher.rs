use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{Quota, RateLimiter};
use md5::{Digest, Md5};
use nonzero_ext::nonzero;
use rand::seq::IndexedRandom;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONNECTION, LOCATION, USER_AGENT};
use reqwest::Client;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Settings;
use crate::models::ErrorKind;

use super::robots::RobotsCache;

const MAX_REDIRECTS: usize = 5;
const SOCIAL_TIMEOUT_SECS: u64 = 60;

/// Browser user agents rotated across requests.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Edge/120.0.0.0",
];

/// Hosts that get the longer timeout and the 401/403 retry treatment.
const SOCIAL_HOSTS: &[&str] = &[
    "facebook.com",
    "twitter.com",
    "x.com",
    "instagram.com",
    "linkedin.com",
    "pinterest.com",
    "youtube.com",
    "tiktok.com",
    "snapchat.com",
    "reddit.com",
];

pub fn is_social_host(authority: &str) -> bool {
    SOCIAL_HOSTS.iter().any(|social| authority.contains(social))
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("blocked by robots.txt")]
    RobotsBlocked,
    #[error("HTTP {0}")]
    HttpStatus(u16),
    #[error("request timed out")]
    Timeout,
    #[error("redirect limit exceeded")]
    TooManyRedirects,
    #[error("request failed: {0}")]
    Network(reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Map onto the recorded error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::RobotsBlocked => ErrorKind::RobotsBlocked,
            FetchError::HttpStatus(_) | FetchError::TooManyRedirects => ErrorKind::HttpError,
            FetchError::Timeout => ErrorKind::Timeout,
            FetchError::Network(_) | FetchError::InvalidUrl(_) | FetchError::Cancelled => {
                ErrorKind::ClientError
            }
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus(status) => Some(*status),
            _ => None,
        }
    }
}

/// A successfully fetched response body with its transport metadata.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: String,
    /// The URL that was requested.
    pub original_url: String,
    /// Empty when no redirect occurred; otherwise every hop including
    /// the final URL as the last element.
    pub redirect_chain: Vec<String>,
    pub status: u16,
    pub body: Vec<u8>,
    pub text: String,
    pub charset: &'static str,
    pub content_hash: String,
    pub response_time_ms: u64,
}

type HostLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

enum Terminal {
    Success {
        final_url: String,
        chain: Vec<String>,
        status: u16,
        body: Vec<u8>,
    },
    Retry {
        status: u16,
        wait: Option<Duration>,
    },
    Fail {
        status: u16,
    },
    RedirectOverflow,
}

/// Polite HTTP fetcher: per-host rate limiting at the greater of the
/// configured delay and the host's robots crawl-delay, rotating user
/// agents, bounded redirects with chain capture, and the retry ladder
/// for transient statuses.
pub struct Fetcher {
    client: Client,
    robots: Arc<RobotsCache>,
    limiters: RwLock<HashMap<String, Arc<HostLimiter>>>,
    delay_secs: f64,
    timeout_secs: u64,
    max_retries: u32,
    retry_base_delay_secs: f64,
    cancel: CancellationToken,
}

impl Fetcher {
    pub fn new(settings: &Settings, robots: Arc<RobotsCache>, cancel: CancellationToken) -> Self {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .gzip(true)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_default();

        Fetcher {
            client,
            robots,
            limiters: RwLock::new(HashMap::new()),
            delay_secs: settings.crawl_delay_secs,
            timeout_secs: settings.request_timeout_secs,
            max_retries: settings.max_retries,
            retry_base_delay_secs: settings.retry_base_delay_secs,
            cancel,
        }
    }

    fn pick_user_agent() -> &'static str {
        let mut rng = rand::rng();
        USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0])
    }

    fn headers_for(user_agent: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(ua) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, ua);
        }
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers
    }

    /// Limiter for a host, created on first use with the politeness
    /// period already folded in. Read lock on the hot path.
    async fn limiter_for(&self, authority: &str, delay_secs: f64) -> Option<Arc<HostLimiter>> {
        if delay_secs <= 0.0 {
            return None;
        }
        {
            let limiters = self.limiters.read().await;
            if let Some(limiter) = limiters.get(authority) {
                return Some(limiter.clone());
            }
        }
        let mut limiters = self.limiters.write().await;
        let limiter = limiters
            .entry(authority.to_string())
            .or_insert_with(|| {
                let quota = Quota::with_period(Duration::from_secs_f64(delay_secs))
                    .unwrap_or_else(|| Quota::per_second(nonzero!(1u32)));
                Arc::new(RateLimiter::direct(quota))
            })
            .clone();
        Some(limiter)
    }

    /// Fetch one URL through the whole politeness and retry pipeline.
    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let parsed =
            Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let authority = crate::crawler::urls::authority_of(url)
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;
        let is_social = is_social_host(&authority);

        let user_agent = Self::pick_user_agent();
        let policy = self.robots.policy_for(&parsed).await;
        if !policy.is_allowed(url, user_agent) {
            return Err(FetchError::RobotsBlocked);
        }

        let delay = self
            .delay_secs
            .max(policy.crawl_delay(user_agent).unwrap_or(0.0));
        let limiter = self.limiter_for(&authority, delay).await;

        let timeout = Duration::from_secs(if is_social {
            SOCIAL_TIMEOUT_SECS.max(self.timeout_secs)
        } else {
            self.timeout_secs
        });

        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            if let Some(limiter) = &limiter {
                limiter.until_ready().await;
            }

            // A fresh user agent per attempt doubles as the "different
            // headers" tactic for social 401/403 responses.
            let attempt_ua = if attempt == 0 {
                user_agent
            } else {
                Self::pick_user_agent()
            };
            let headers = Self::headers_for(attempt_ua);

            let outcome = self.request_once(url, headers, timeout, is_social).await;
            match outcome {
                Ok(Terminal::Success {
                    final_url,
                    chain,
                    status,
                    body,
                }) => {
                    let (text, charset) = decode_body(&body);
                    let content_hash = hex::encode(Md5::digest(&body));
                    return Ok(FetchedPage {
                        url: final_url,
                        original_url: url.to_string(),
                        redirect_chain: chain,
                        status,
                        text,
                        charset,
                        content_hash,
                        response_time_ms: started.elapsed().as_millis() as u64,
                        body,
                    });
                }
                Ok(Terminal::Retry { status, wait }) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(FetchError::HttpStatus(status));
                    }
                    let pause = wait.unwrap_or_else(|| self.backoff(attempt));
                    tracing::debug!(url, status, attempt, wait_s = pause.as_secs_f64(), "retrying");
                    self.sleep_or_cancel(pause).await?;
                }
                Ok(Terminal::Fail { status }) => {
                    return Err(FetchError::HttpStatus(status));
                }
                Ok(Terminal::RedirectOverflow) => {
                    return Err(FetchError::TooManyRedirects);
                }
                Err(error) if error.is_timeout() => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(FetchError::Timeout);
                    }
                    let pause = self.backoff(attempt);
                    self.sleep_or_cancel(pause).await?;
                }
                Err(error) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(FetchError::Network(error));
                    }
                    let pause = self.backoff(attempt);
                    self.sleep_or_cancel(pause).await?;
                }
            }
        }
    }

    /// One logical request: follow up to MAX_REDIRECTS hops manually so
    /// the chain can be recorded, then classify the terminal status.
    async fn request_once(
        &self,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
        is_social: bool,
    ) -> Result<Terminal, reqwest::Error> {
        let mut hops: Vec<String> = Vec::new();
        let mut current = url.to_string();

        for _ in 0..=MAX_REDIRECTS {
            let response = self
                .client
                .get(&current)
                .headers(headers.clone())
                .timeout(timeout)
                .send()
                .await?;
            let status = response.status().as_u16();

            if (300..400).contains(&status) && status != 304 {
                let next = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|location| {
                        Url::parse(&current)
                            .ok()
                            .and_then(|base| base.join(location).ok())
                    })
                    .map(|u| u.to_string());
                match next {
                    Some(next) => {
                        hops.push(current);
                        current = next;
                        continue;
                    }
                    None => return Ok(Terminal::Fail { status }),
                }
            }

            return Ok(match status {
                200..=299 => {
                    let body = response.bytes().await?.to_vec();
                    let chain = if hops.is_empty() {
                        Vec::new()
                    } else {
                        let mut chain = hops;
                        chain.push(current.clone());
                        chain
                    };
                    Terminal::Success {
                        final_url: current,
                        chain,
                        status,
                        body,
                    }
                }
                429 => Terminal::Retry {
                    status,
                    wait: Some(rate_limit_pause()),
                },
                401 | 403 if is_social => Terminal::Retry { status, wait: None },
                404 => Terminal::Fail { status },
                500..=599 => Terminal::Retry { status, wait: None },
                _ => Terminal::Fail { status },
            });
        }

        Ok(Terminal::RedirectOverflow)
    }

    /// Retry delay: base * attempt, scaled by a random factor in [1, 2).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = {
            let mut rng = rand::rng();
            rand::Rng::random_range(&mut rng, 1.0..2.0)
        };
        Duration::from_secs_f64(self.retry_base_delay_secs * attempt as f64 * factor)
    }

    async fn sleep_or_cancel(&self, pause: Duration) -> Result<(), FetchError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            _ = tokio::time::sleep(pause) => Ok(()),
        }
    }
}

/// Wait applied after a 429: ten seconds plus up to ten more of jitter.
fn rate_limit_pause() -> Duration {
    let jitter = {
        let mut rng = rand::rng();
        rand::Rng::random_range(&mut rng, 0.0..10.0)
    };
    Duration::from_secs_f64(10.0 + jitter)
}

/// Decode a response body: UTF-8 first, Latin-1 when that fails.
fn decode_body(bytes: &[u8]) -> (String, &'static str) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), "utf-8"),
        Err(_) => (bytes.iter().map(|&b| b as char).collect(), "latin-1"),
    }
}
