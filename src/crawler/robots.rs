use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use url::Url;

const ROBOTS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const ROBOTS_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Parsed robots.txt rules for one host.
#[derive(Debug, Default)]
pub struct RobotsPolicy {
    /// Map from lowercase user-agent to disallowed path prefixes.
    rules: HashMap<String, Vec<String>>,
    /// Crawl-delay per lowercase user-agent, in seconds.
    delays: HashMap<String, f64>,
    /// Whether a robots.txt was actually fetched and parsed.
    pub loaded: bool,
}

impl RobotsPolicy {
    /// Parse robots.txt content. Group lines by user-agent; an empty line
    /// resets the current group, comments are stripped.
    pub fn from_content(content: &str) -> Self {
        let mut rules: HashMap<String, Vec<String>> = HashMap::new();
        let mut delays: HashMap<String, f64> = HashMap::new();
        let mut current_agents: Vec<String> = Vec::new();

        for line in content.lines() {
            let line = match line.find('#') {
                Some(idx) => line[..idx].trim(),
                None => line.trim(),
            };
            if line.is_empty() {
                current_agents.clear();
                continue;
            }

            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim().to_lowercase();
                let value = value.trim();
                match key.as_str() {
                    "user-agent" => {
                        current_agents.push(value.to_lowercase());
                    }
                    "disallow" => {
                        for agent in &current_agents {
                            rules.entry(agent.clone()).or_default().push(value.to_string());
                        }
                    }
                    "crawl-delay" => {
                        if let Ok(delay) = value.parse::<f64>() {
                            for agent in &current_agents {
                                delays.insert(agent.clone(), delay);
                            }
                        }
                    }
                    _ => {
                        // Allow, Sitemap and friends are not needed for gating.
                    }
                }
            }
        }

        RobotsPolicy {
            rules,
            delays,
            loaded: true,
        }
    }

    /// Policy used when robots.txt is missing or unreachable.
    pub fn allow_all() -> Self {
        RobotsPolicy::default()
    }

    /// Check whether a URL may be fetched by the given user agent.
    /// Specific user-agent groups are consulted first, then the `*`
    /// fallback. An empty Disallow value allows everything.
    pub fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        let path = match Url::parse(url) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => return true,
        };

        let ua_lower = user_agent.to_lowercase();
        for agent in [ua_lower.as_str(), "*"] {
            if let Some(disallowed) = self.rules.get(agent) {
                for pattern in disallowed {
                    if pattern.is_empty() {
                        continue;
                    }
                    if path.starts_with(pattern) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Crawl-delay for the user agent, falling back to the `*` group.
    pub fn crawl_delay(&self, user_agent: &str) -> Option<f64> {
        let ua_lower = user_agent.to_lowercase();
        self.delays
            .get(ua_lower.as_str())
            .or_else(|| self.delays.get("*"))
            .copied()
    }
}

/// Per-host robots.txt cache with a 24 hour TTL. Fetch failures and
/// non-200 answers are cached as allow-all so a missing file does not get
/// re-fetched for every URL on the host.
pub struct RobotsCache {
    client: reqwest::Client,
    entries: RwLock<HashMap<String, (Arc<RobotsPolicy>, Instant)>>,
}

impl RobotsCache {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(ROBOTS_FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        RobotsCache {
            client,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Policy for the host of `url`, fetching robots.txt when the cache
    /// has nothing fresh.
    pub async fn policy_for(&self, url: &Url) -> Arc<RobotsPolicy> {
        let Some(host) = url.host_str() else {
            return Arc::new(RobotsPolicy::allow_all());
        };
        let authority = match url.port() {
            Some(port) => format!("{}:{port}", host.to_lowercase()),
            None => host.to_lowercase(),
        };

        {
            let entries = self.entries.read().await;
            if let Some((policy, fetched)) = entries.get(&authority) {
                if fetched.elapsed() < ROBOTS_CACHE_TTL {
                    return policy.clone();
                }
            }
        }

        let robots_url = format!("{}://{}/robots.txt", url.scheme(), authority);
        let policy = Arc::new(self.fetch_policy(&robots_url).await);
        self.entries
            .write()
            .await
            .insert(authority, (policy.clone(), Instant::now()));
        policy
    }

    async fn fetch_policy(&self, robots_url: &str) -> RobotsPolicy {
        match self.client.get(robots_url).send().await {
            Ok(response) if response.status().is_success() => {
                let body = response.text().await.unwrap_or_default();
                RobotsPolicy::from_content(&body)
            }
            Ok(_) | Err(_) => RobotsPolicy::allow_all(),
        }
    }
}

impl Default for RobotsCache {
    fn default() -> Self {
        RobotsCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_ROBOTS: &str = r#"
User-agent: *
Disallow: /admin/
Disallow: /private
Crawl-delay: 2

User-agent: HungryBot
Disallow: /
"#;

    #[test]
    fn wildcard_rules_block_prefixes() {
        let policy = RobotsPolicy::from_content(SAMPLE_ROBOTS);
        assert!(policy.loaded);
        assert!(!policy.is_allowed("https://example.com/admin/page", "AnyBot"));
        assert!(!policy.is_allowed("https://example.com/private", "AnyBot"));
        assert!(!policy.is_allowed("https://example.com/private/data", "AnyBot"));
        assert!(policy.is_allowed("https://example.com/public", "AnyBot"));
    }

    #[test]
    fn specific_agent_rules_take_effect() {
        let policy = RobotsPolicy::from_content(SAMPLE_ROBOTS);
        assert!(!policy.is_allowed("https://example.com/", "HungryBot"));
        assert!(!policy.is_allowed("https://example.com/anything", "hungrybot"));
        assert!(policy.is_allowed("https://example.com/blog", "OtherBot"));
    }

    #[test]
    fn empty_disallow_allows_everything() {
        let policy = RobotsPolicy::from_content("User-agent: *\nDisallow:\n");
        assert!(policy.is_allowed("https://example.com/anything", "AnyBot"));
    }

    #[test]
    fn missing_robots_allows_everything() {
        let policy = RobotsPolicy::allow_all();
        assert!(!policy.loaded);
        assert!(policy.is_allowed("https://example.com/private", "AnyBot"));
        assert_eq!(policy.crawl_delay("AnyBot"), None);
    }

    #[test]
    fn crawl_delay_with_wildcard_fallback() {
        let policy = RobotsPolicy::from_content(SAMPLE_ROBOTS);
        assert_eq!(policy.crawl_delay("AnyBot"), Some(2.0));

        let specific = RobotsPolicy::from_content(
            "User-agent: SlowBot\nCrawl-delay: 10\n\nUser-agent: *\nCrawl-delay: 1\n",
        );
        assert_eq!(specific.crawl_delay("SlowBot"), Some(10.0));
        assert_eq!(specific.crawl_delay("FastBot"), Some(1.0));
    }

    #[test]
    fn comments_are_stripped() {
        let policy = RobotsPolicy::from_content("User-agent: * # everyone\nDisallow: /x # no x\n");
        assert!(!policy.is_allowed("https://example.com/x", "AnyBot"));
    }

    #[tokio::test]
    async fn cache_serves_policy_and_caches_it() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/robots.txt")
            .with_status(200)
            .with_body("User-agent: *\nDisallow: /private\n")
            .expect(1)
            .create_async()
            .await;

        let cache = RobotsCache::new();
        let url = Url::parse(&format!("{}/page", server.url())).unwrap();

        let policy = cache.policy_for(&url).await;
        assert!(!policy.is_allowed(&format!("{}/private", server.url()), "AnyBot"));

        // Second lookup must come from the cache.
        let again = cache.policy_for(&url).await;
        assert!(again.loaded);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_200_robots_means_allow_all() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/robots.txt")
            .with_status(404)
            .create_async()
            .await;

        let cache = RobotsCache::new();
        let url = Url::parse(&format!("{}/anything", server.url())).unwrap();
        let policy = cache.policy_for(&url).await;
        assert!(!policy.loaded);
        assert!(policy.is_allowed(&format!("{}/anything", server.url()), "AnyBot"));
    }
}
