use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::crawler::urls;
use crate::models::Backlink;

pub const DAMPING_FACTOR: f64 = 0.85;
const CONVERGENCE_TOLERANCE: f64 = 1e-6;
const MAX_ITERATIONS: usize = 100;

const FOLLOW_WEIGHT: f64 = 1.0;
const NOFOLLOW_WEIGHT: f64 = 0.1;

pub const SPAM_THRESHOLD: f64 = 0.8;

/// Directed weighted link graph over interned URL ids. Parallel edges
/// collapse to a single edge carrying the maximum weight.
pub struct LinkGraph {
    ids: HashMap<String, usize>,
    urls: Vec<String>,
    /// Outgoing adjacency per node: (target id, weight).
    adjacency: Vec<Vec<(usize, f64)>>,
}

impl LinkGraph {
    pub fn from_backlinks(backlinks: &[Backlink]) -> Self {
        let mut graph = LinkGraph {
            ids: HashMap::new(),
            urls: Vec::new(),
            adjacency: Vec::new(),
        };

        let mut edges: HashMap<(usize, usize), f64> = HashMap::new();
        for backlink in backlinks {
            let source = graph.intern(&backlink.source_url);
            let target = graph.intern(&backlink.target_url);
            let weight = if backlink.is_nofollow {
                NOFOLLOW_WEIGHT
            } else {
                FOLLOW_WEIGHT
            };
            edges
                .entry((source, target))
                .and_modify(|w| *w = w.max(weight))
                .or_insert(weight);
        }

        for ((source, target), weight) in edges {
            graph.adjacency[source].push((target, weight));
        }
        for neighbors in &mut graph.adjacency {
            neighbors.sort_by_key(|(target, _)| *target);
        }
        graph
    }

    fn intern(&mut self, url: &str) -> usize {
        if let Some(&id) = self.ids.get(url) {
            return id;
        }
        let id = self.urls.len();
        self.ids.insert(url.to_string(), id);
        self.urls.push(url.to_string());
        self.adjacency.push(Vec::new());
        id
    }

    pub fn node_count(&self) -> usize {
        self.urls.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(Vec::len).sum()
    }

    /// Weighted PageRank by power iteration with uniform personalization.
    /// Mass from dangling nodes is redistributed uniformly. Iteration
    /// stops when the largest per-node delta drops under the tolerance,
    /// or after the iteration cap.
    pub fn pagerank(&self, damping: f64) -> HashMap<String, f64> {
        let n = self.node_count();
        if n == 0 {
            return HashMap::new();
        }

        let out_weight: Vec<f64> = self
            .adjacency
            .iter()
            .map(|neighbors| neighbors.iter().map(|(_, w)| w).sum())
            .collect();

        let uniform = 1.0 / n as f64;
        let mut rank = vec![uniform; n];

        for _ in 0..MAX_ITERATIONS {
            let dangling_mass: f64 = rank
                .iter()
                .zip(&out_weight)
                .filter(|(_, &weight)| weight == 0.0)
                .map(|(r, _)| r)
                .sum();
            let base = (1.0 - damping) * uniform + damping * dangling_mass * uniform;

            let mut next = vec![base; n];
            for (source, neighbors) in self.adjacency.iter().enumerate() {
                if out_weight[source] == 0.0 {
                    continue;
                }
                let share = damping * rank[source] / out_weight[source];
                for &(target, weight) in neighbors {
                    next[target] += share * weight;
                }
            }

            let delta = rank
                .iter()
                .zip(&next)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f64, f64::max);
            rank = next;
            if delta < CONVERGENCE_TOLERANCE {
                break;
            }
        }

        self.urls
            .iter()
            .cloned()
            .zip(rank)
            .collect()
    }
}

/// Domain authority per target host:
/// `min(100, 2 * unique_source_domains + 50 * quality_per_link)` where
/// quality per link averages the per-backlink signals.
pub fn domain_authority(backlinks: &[Backlink]) -> HashMap<String, f64> {
    struct DomainStats {
        sources: HashSet<String>,
        total_links: usize,
        quality: f64,
    }

    let mut stats: HashMap<String, DomainStats> = HashMap::new();
    for backlink in backlinks {
        let Some(target_domain) = urls::authority_of(&backlink.target_url) else {
            continue;
        };
        let Some(source_domain) = urls::authority_of(&backlink.source_url) else {
            continue;
        };

        let entry = stats.entry(target_domain).or_insert_with(|| DomainStats {
            sources: HashSet::new(),
            total_links: 0,
            quality: 0.0,
        });
        entry.sources.insert(source_domain);
        entry.total_links += 1;
        if !backlink.is_nofollow {
            entry.quality += 1.0;
        }
        if !backlink.anchor_text.is_empty() {
            entry.quality += 0.5;
        }
        if !backlink.context.is_empty() {
            entry.quality += 0.5;
        }
    }

    stats
        .into_iter()
        .map(|(domain, stats)| {
            let quality_per_link = stats.quality / stats.total_links as f64;
            let score = 2.0 * stats.sources.len() as f64 + 50.0 * quality_per_link;
            (domain, score.min(100.0))
        })
        .collect()
}

fn commercial_anchor_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(buy|cheap|discount|sale)").unwrap_or_else(|_| Regex::new("$^").unwrap())
    })
}

const SUSPICIOUS_HOST_TOKENS: &[&str] = &["link", "seo", "directory"];

/// Heuristic spam score for one backlink.
pub fn spam_score(backlink: &Backlink) -> f64 {
    let mut score = 0.0;

    if backlink.anchor_text.split_whitespace().count() > 5 {
        score += 0.2;
    }
    if !backlink.anchor_text.is_empty()
        && commercial_anchor_pattern().is_match(&backlink.anchor_text)
    {
        score += 0.3;
    }
    if let Some(source_host) = urls::authority_of(&backlink.source_url) {
        if SUSPICIOUS_HOST_TOKENS
            .iter()
            .any(|token| source_host.contains(token))
        {
            score += 0.4;
        }
    }
    if backlink.context.chars().count() < 50 {
        score += 0.2;
    }

    score
}

/// Indices of backlinks whose spam score reaches the flag threshold.
pub fn detect_spam(backlinks: &[Backlink]) -> Vec<usize> {
    backlinks
        .iter()
        .enumerate()
        .filter(|(_, backlink)| spam_score(backlink) >= SPAM_THRESHOLD)
        .map(|(index, _)| index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(source: &str, target: &str, anchor: &str, nofollow: bool, context: &str) -> Backlink {
        Backlink {
            source_url: source.to_string(),
            target_url: target.to_string(),
            anchor_text: anchor.to_string(),
            context: context.to_string(),
            page_title: String::new(),
            domain_authority: 0.0,
            is_nofollow: nofollow,
        }
    }

    const LONG_CONTEXT: &str = "a perfectly ordinary sentence of surrounding text that is long enough";

    #[test]
    fn graph_collapses_parallel_edges_to_max_weight() {
        let links = vec![
            link("https://a.test/", "https://b.test/", "x", true, ""),
            link("https://a.test/", "https://b.test/", "y", false, ""),
        ];
        let graph = LinkGraph::from_backlinks(&links);
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn pagerank_sums_to_one_and_ranks_hub_target_highest() {
        let links = vec![
            link("https://a.test/", "https://hub.test/", "x", false, ""),
            link("https://b.test/", "https://hub.test/", "x", false, ""),
            link("https://c.test/", "https://hub.test/", "x", false, ""),
            link("https://a.test/", "https://other.test/", "x", false, ""),
        ];
        let graph = LinkGraph::from_backlinks(&links);
        let scores = graph.pagerank(DAMPING_FACTOR);

        let total: f64 = scores.values().sum();
        assert!((total - 1.0).abs() < 1e-6);

        let hub = scores["https://hub.test/"];
        for (url, score) in &scores {
            if url != "https://hub.test/" {
                assert!(hub > *score, "{url} should rank below the hub");
            }
        }
    }

    #[test]
    fn pagerank_is_deterministic() {
        let links = vec![
            link("https://a.test/", "https://b.test/", "x", false, ""),
            link("https://b.test/", "https://c.test/", "x", true, ""),
            link("https://c.test/", "https://a.test/", "x", false, ""),
        ];
        let graph = LinkGraph::from_backlinks(&links);
        let first = graph.pagerank(DAMPING_FACTOR);
        let second = graph.pagerank(DAMPING_FACTOR);
        for (url, score) in &first {
            assert!((score - second[url]).abs() < 1e-9);
        }
    }

    #[test]
    fn pagerank_of_empty_graph_is_empty() {
        let graph = LinkGraph::from_backlinks(&[]);
        assert!(graph.pagerank(DAMPING_FACTOR).is_empty());
    }

    #[test]
    fn nofollow_weight_lowers_contribution() {
        let follow = vec![link("https://a.test/", "https://b.test/", "x", false, "")];
        let nofollow = vec![link("https://a.test/", "https://b.test/", "x", true, "")];

        let follow_score =
            LinkGraph::from_backlinks(&follow).pagerank(DAMPING_FACTOR)["https://b.test/"];
        let nofollow_score =
            LinkGraph::from_backlinks(&nofollow).pagerank(DAMPING_FACTOR)["https://b.test/"];
        // With a single outgoing edge the normalized share is identical,
        // so scores match; the weighting matters once a source has mixed
        // follow and nofollow edges.
        let mixed = vec![
            link("https://a.test/", "https://b.test/", "x", true, ""),
            link("https://a.test/", "https://c.test/", "x", false, ""),
        ];
        let mixed_scores = LinkGraph::from_backlinks(&mixed).pagerank(DAMPING_FACTOR);
        assert!(mixed_scores["https://c.test/"] > mixed_scores["https://b.test/"]);
        assert!((follow_score - nofollow_score).abs() < 1e-9);
    }

    #[test]
    fn domain_authority_matches_hand_computation() {
        // One followed link with anchor and context: quality = 2.0,
        // one source domain. 2*1 + 50*2.0/1 ... capped at 100.
        let links = vec![link(
            "https://a.test/page",
            "https://b.test/",
            "anchor",
            false,
            LONG_CONTEXT,
        )];
        let scores = domain_authority(&links);
        assert_eq!(scores["b.test"], 100.0);

        // All nofollow, no anchor, no context: quality per link 0.
        let weak = vec![
            link("https://a.test/", "https://b.test/", "", true, ""),
            link("https://c.test/", "https://b.test/", "", true, ""),
        ];
        let weak_scores = domain_authority(&weak);
        assert_eq!(weak_scores["b.test"], 4.0); // 2 * 2 unique sources
    }

    #[test]
    fn spam_scoring_flags_stacked_signals() {
        // Commercial anchor text, long anchor, thin context, and a spammy
        // source host all at once.
        let spammy = link(
            "https://best-seo-directory.test/links",
            "https://t.test/",
            "buy cheap discount pills online now",
            false,
            "",
        );
        assert!(spam_score(&spammy) >= SPAM_THRESHOLD);

        let clean = link(
            "https://blog.example.test/post",
            "https://t.test/",
            "a reference",
            false,
            LONG_CONTEXT,
        );
        assert!(spam_score(&clean) < SPAM_THRESHOLD);

        let flagged = detect_spam(&[spammy, clean]);
        assert_eq!(flagged, vec![0]);
    }

    #[test]
    fn spam_signals_individually() {
        let long_anchor = link(
            "https://a.test/",
            "https://t.test/",
            "one two three four five six",
            false,
            LONG_CONTEXT,
        );
        assert!((spam_score(&long_anchor) - 0.2).abs() < 1e-9);

        let commercial = link("https://a.test/", "https://t.test/", "sale", false, LONG_CONTEXT);
        assert!((spam_score(&commercial) - 0.3).abs() < 1e-9);

        let thin_context = link("https://a.test/", "https://t.test/", "ok", false, "short");
        assert!((spam_score(&thin_context) - 0.2).abs() < 1e-9);
    }
}
