pub mod frontier;
pub mod graph;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::crawler::fetcher::Fetcher;
use crate::crawler::parser::Parser;
use crate::crawler::urls;
use crate::models::Backlink;

use frontier::{priority, Frontier};

const DEPTH_DELAY_RANGE_SECS: (f64, f64) = (3.0, 7.0);

/// Breadth-first backlink discovery from a seed set. Each depth's URL set
/// is fetched concurrently behind a worker bound; a backlink record is
/// emitted whenever a crawled page links to a URL on one of the target
/// hosts (the hosts of the seeds).
pub struct BacklinkDiscoverer {
    fetcher: Arc<Fetcher>,
    max_depth: u32,
    max_concurrent: usize,
    cancel: CancellationToken,
    /// Hosts whose inbound links become backlink records.
    target_hosts: HashSet<String>,
    frontier: Frontier,
    visited: HashSet<String>,
}

impl BacklinkDiscoverer {
    pub fn new(
        fetcher: Arc<Fetcher>,
        max_depth: u32,
        max_concurrent: usize,
        cancel: CancellationToken,
    ) -> Self {
        BacklinkDiscoverer {
            fetcher,
            max_depth,
            max_concurrent: max_concurrent.max(1),
            cancel,
            target_hosts: HashSet::new(),
            frontier: Frontier::new(),
            visited: HashSet::new(),
        }
    }

    /// Queue URLs already known from stored backlinks. They rank after
    /// everything discovered organically.
    pub fn prime_from_known(&mut self, urls_from_store: &[String]) {
        for url in urls_from_store {
            if let Some(normalized) = urls::normalize(url) {
                self.frontier.push(&normalized, priority::KNOWN_BACKLINK);
            }
        }
    }

    /// Run discovery to `max_depth` and return every backlink found.
    pub async fn discover(&mut self, seed_urls: &[String]) -> Vec<Backlink> {
        for seed in seed_urls {
            let Some(normalized) = urls::normalize(seed) else {
                tracing::warn!(url = %seed, "dropping invalid seed URL");
                continue;
            };
            if let Some(host) = urls::authority_of(&normalized) {
                self.target_hosts.insert(host);
            }
            self.frontier.push(&normalized, priority::SEED);
        }
        tracing::info!(
            targets = self.target_hosts.len(),
            max_depth = self.max_depth,
            "backlink discovery starting"
        );

        let mut backlinks: Vec<Backlink> = Vec::new();
        for depth in 1..=self.max_depth {
            if self.cancel.is_cancelled() {
                tracing::info!("discovery cancelled");
                break;
            }
            let level = self.frontier.drain_level();
            if level.is_empty() {
                break;
            }
            tracing::info!(depth, urls = level.len(), "crawling depth");

            let found = self.crawl_level(&level).await;
            tracing::info!(
                depth,
                new_backlinks = found.len(),
                total = backlinks.len() + found.len(),
                "depth complete"
            );
            backlinks.extend(found);

            if depth < self.max_depth && !self.frontier.is_empty() {
                self.depth_pause().await;
            }
        }
        backlinks
    }

    /// Fetch and parse one depth's URLs with bounded concurrency,
    /// queueing outbound links for the next depth.
    async fn crawl_level(&mut self, level: &[String]) -> Vec<Backlink> {
        let mut backlinks = Vec::new();
        let pending: Vec<String> = level
            .iter()
            .filter(|url| !self.visited.contains(*url))
            .cloned()
            .collect();
        let mut pending = pending.into_iter();
        let cancel = self.cancel.clone();
        let mut join_set: JoinSet<(String, Option<(String, Vec<crate::crawler::parser::PageLink>)>)> =
            JoinSet::new();

        loop {
            while join_set.len() < self.max_concurrent {
                let Some(url) = pending.next() else {
                    break;
                };
                let fetcher = self.fetcher.clone();
                join_set.spawn(async move {
                    match fetcher.fetch(&url).await {
                        Ok(page) => {
                            let parsed = Parser::parse(&page.text, &page.url);
                            let title = parsed.title.clone().unwrap_or_default();
                            (page.url, Some((title, parsed.links)))
                        }
                        Err(error) => {
                            tracing::debug!(url = %url, %error, "discovery fetch failed");
                            (url, None)
                        }
                    }
                });
            }
            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    break;
                }
                Some(result) = join_set.join_next() => {
                    let Ok((url, outcome)) = result else {
                        continue;
                    };
                    self.visited.insert(url.clone());
                    let Some((page_title, links)) = outcome else {
                        continue;
                    };
                    for link in links {
                        if urls::authority_of(&link.url)
                            .map(|host| self.target_hosts.contains(&host))
                            .unwrap_or(false)
                        {
                            backlinks.push(Backlink {
                                source_url: url.clone(),
                                target_url: link.url.clone(),
                                anchor_text: link.anchor_text.clone(),
                                context: link.context.clone(),
                                page_title: page_title.clone(),
                                domain_authority: 0.0,
                                is_nofollow: link.is_nofollow,
                            });
                        }
                        if urls::has_skipped_extension(&link.url) || self.visited.contains(&link.url) {
                            continue;
                        }
                        let link_priority = if link.is_internal {
                            priority::INTERNAL
                        } else {
                            priority::EXTERNAL
                        };
                        self.frontier.push(&link.url, link_priority);
                    }
                }
            }
        }

        backlinks
    }

    /// Pause between depths, three to seven seconds.
    async fn depth_pause(&self) {
        let pause = {
            let mut rng = rand::rng();
            rand::Rng::random_range(
                &mut rng,
                DEPTH_DELAY_RANGE_SECS.0..DEPTH_DELAY_RANGE_SECS.1,
            )
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_secs_f64(pause)) => {}
        }
    }

    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }
}
