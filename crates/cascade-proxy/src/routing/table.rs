//! Host override table.
//!
//! Hosts that share an upstream are folded into one regex alternation, so the
//! table holds one entry per upstream rather than one per rule. Entries are
//! immutable once published: adding a rule compiles a replacement entry outside
//! the lock and swaps it in, so a reader never sees a half-built matcher.

use crate::config::{normalize_proxy_url, RoutingRule};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("host override '{host}' has an empty host")]
    EmptyHost { host: String },
    #[error("host override '{host}' could not be compiled: {source}")]
    Compile {
        host: String,
        #[source]
        source: regex::Error,
    },
}

/// All hosts routed to one upstream, and the matcher built from them.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    hosts: Vec<String>,
    pattern: String,
    matcher: Regex,
    upstream_proxy: String,
}

impl RouteEntry {
    fn compile(hosts: Vec<String>, upstream_proxy: String) -> Result<Self, regex::Error> {
        let pattern = hosts
            .iter()
            .map(|host| format!(".*{}.*", regex::escape(host)))
            .collect::<Vec<_>>()
            .join("|");
        let matcher = Regex::new(&pattern)?;
        Ok(Self {
            hosts,
            pattern,
            matcher,
            upstream_proxy,
        })
    }

    /// Host substrings in the order their rules were added.
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Normalized upstream (`http://...`), empty for direct.
    pub fn upstream_proxy(&self) -> &str {
        &self.upstream_proxy
    }

    pub fn is_direct(&self) -> bool {
        self.upstream_proxy.is_empty()
    }

    pub fn matches(&self, target: &str) -> bool {
        self.matcher.is_match(target)
    }
}

/// Outcome of looking a host up in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// An override says: connect straight to the target.
    Direct,
    /// An override names a specific upstream.
    Upstream(String),
    /// No override: use the default cascade upstream.
    Default,
}

/// Concurrent map from normalized upstream to its [`RouteEntry`].
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: RwLock<HashMap<String, Arc<RouteEntry>>>,
    // Serializes writers so two AddRule calls for one upstream can't lose a host.
    writer: Mutex<()>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `host` to the entry for `upstream_proxy`, creating it if needed.
    pub fn add_rule(
        &self,
        host: &str,
        upstream_proxy: &str,
    ) -> Result<Arc<RouteEntry>, RouteError> {
        if host.is_empty() {
            return Err(RouteError::EmptyHost {
                host: host.to_string(),
            });
        }
        let key = normalize_proxy_url(upstream_proxy);

        let _writer = self.writer.lock();
        let mut hosts = self
            .entries
            .read()
            .get(&key)
            .map(|entry| entry.hosts.clone())
            .unwrap_or_default();
        hosts.push(host.to_string());

        let entry = RouteEntry::compile(hosts, key.clone()).map_err(|source| {
            RouteError::Compile {
                host: host.to_string(),
                source,
            }
        })?;
        let entry = Arc::new(entry);

        info!(
            "Adding redirect: {} for {} (pattern: {})",
            display_upstream(&key),
            host,
            entry.pattern
        );
        self.entries.write().insert(key, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn add(&self, rule: &RoutingRule) -> Result<Arc<RouteEntry>, RouteError> {
        self.add_rule(&rule.host, &rule.upstream_proxy)
    }

    /// Apply every rule, logging and skipping the ones that are rejected.
    /// Returns how many were accepted.
    pub fn apply_rules(&self, rules: &[RoutingRule]) -> usize {
        rules
            .iter()
            .filter(|rule| match self.add(rule) {
                Ok(_) => true,
                Err(e) => {
                    warn!("Rejected host override '{}': {}", rule, e);
                    false
                }
            })
            .count()
    }

    /// Atomically swap the whole table for one built from `rules`.
    ///
    /// Readers see either the old table or the new one, never a mix.
    pub fn replace_rules(&self, rules: &[RoutingRule]) -> usize {
        let staged = RoutingTable::new();
        let accepted = staged.apply_rules(rules);
        let fresh = staged.entries.into_inner();

        let _writer = self.writer.lock();
        *self.entries.write() = fresh;
        accepted
    }

    /// First entry whose matcher matches `target`.
    ///
    /// Iteration order over entries is unspecified. When overlapping rules
    /// match the same target, which one wins is not defined.
    pub fn match_host(&self, target: &str) -> Option<Arc<RouteEntry>> {
        let entries = self.entries.read();
        let found = entries.values().find(|entry| entry.matches(target)).cloned();
        if let Some(ref entry) = found {
            debug!(
                "Matching host found: {} for: {} -> {}",
                target,
                entry.pattern,
                display_upstream(&entry.upstream_proxy)
            );
        }
        found
    }

    pub fn decide(&self, target: &str) -> RouteDecision {
        match self.match_host(target) {
            Some(entry) if entry.is_direct() => RouteDecision::Direct,
            Some(entry) => RouteDecision::Upstream(entry.upstream_proxy.clone()),
            None => RouteDecision::Default,
        }
    }

    pub fn get(&self, upstream_proxy: &str) -> Option<Arc<RouteEntry>> {
        self.entries
            .read()
            .get(&normalize_proxy_url(upstream_proxy))
            .cloned()
    }

    pub fn clear(&self) {
        let _writer = self.writer.lock();
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn display_upstream(upstream: &str) -> &str {
    if upstream.is_empty() {
        "direct"
    } else {
        upstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_rule_list;
    use tracing_test::traced_test;

    #[test]
    fn test_rule_list_scenario() {
        let table = RoutingTable::new();
        let (rules, _) = parse_rule_list("a.example.com,b.example.com->10.0.0.1:8080");
        assert_eq!(table.apply_rules(&rules), 2);

        let direct = table.match_host("x.a.example.com").unwrap();
        assert!(direct.is_direct());
        assert_eq!(direct.upstream_proxy(), "");

        let redirected = table.match_host("y.b.example.com").unwrap();
        assert_eq!(redirected.upstream_proxy(), "http://10.0.0.1:8080");

        assert!(table.match_host("other.com").is_none());
    }

    #[test]
    fn test_same_upstream_extends_one_entry() {
        let table = RoutingTable::new();
        let hosts = ["one.corp", "two.corp", "three.corp"];
        for host in hosts {
            table.add_rule(host, "proxy.corp:3128").unwrap();
        }

        assert_eq!(table.len(), 1);
        for host in hosts {
            let entry = table.match_host(&format!("www.{host}:443")).unwrap();
            assert_eq!(entry.upstream_proxy(), "http://proxy.corp:3128");
        }
        let entry = table.get("proxy.corp:3128").unwrap();
        assert_eq!(entry.hosts(), &hosts);
        assert_eq!(entry.pattern(), r".*one\.corp.*|.*two\.corp.*|.*three\.corp.*");
    }

    #[test]
    fn test_prefixed_and_bare_upstream_share_entry() {
        let table = RoutingTable::new();
        table.add_rule("one.corp", "10.0.0.1:8080").unwrap();
        table.add_rule("two.corp", "http://10.0.0.1:8080").unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(
            table.get("10.0.0.1:8080").unwrap().upstream_proxy(),
            "http://10.0.0.1:8080"
        );
    }

    #[test]
    fn test_host_is_matched_literally() {
        let table = RoutingTable::new();
        table.add_rule("a.example.com", "").unwrap();

        // '.' is escaped, so it does not match arbitrary characters
        assert!(table.match_host("aXexampleYcom").is_none());
        assert!(table.match_host("sub.a.example.com:443").is_some());
    }

    #[test]
    fn test_regex_metacharacters_do_not_break_compilation() {
        let table = RoutingTable::new();
        let entry = table.add_rule("weird(host", "").unwrap();
        assert!(entry.matches("a.weird(host.com"));
        assert!(table.add_rule("[", "").is_ok());
    }

    #[test]
    fn test_empty_host_rejected() {
        let table = RoutingTable::new();
        assert!(matches!(
            table.add_rule("", "proxy:3128"),
            Err(RouteError::EmptyHost { .. })
        ));
        assert!(table.is_empty());
    }

    #[test]
    #[traced_test]
    fn test_rejected_rules_are_logged_and_skipped() {
        let table = RoutingTable::new();
        let rules = vec![
            RoutingRule::direct("intranet.corp"),
            RoutingRule::via("", "10.0.0.1:8080"),
            RoutingRule::via("git.corp", "10.0.0.1:8080"),
        ];

        assert_eq!(table.apply_rules(&rules), 2);
        assert!(table.match_host("git.corp:22").is_some());
        assert!(logs_contain("Rejected host override"));

        assert_eq!(table.replace_rules(&rules), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_overlapping_rules_first_match_wins_order_unspecified() {
        let table = RoutingTable::new();
        table.add_rule("example.com", "").unwrap();
        table.add_rule("api.example.com", "10.0.0.2:3128").unwrap();

        let entry = table.match_host("api.example.com").unwrap();
        assert!(
            entry.is_direct() || entry.upstream_proxy() == "http://10.0.0.2:3128",
            "overlap resolves to one of the matching entries"
        );
    }

    #[test]
    fn test_decide() {
        let table = RoutingTable::new();
        table.add_rule("intranet", "").unwrap();
        table.add_rule("git", "10.0.0.1:8080").unwrap();

        assert_eq!(table.decide("intranet.corp:443"), RouteDecision::Direct);
        assert_eq!(
            table.decide("git.corp:22"),
            RouteDecision::Upstream("http://10.0.0.1:8080".to_string())
        );
        assert_eq!(table.decide("example.org:443"), RouteDecision::Default);
    }

    #[test]
    fn test_clear() {
        let table = RoutingTable::new();
        table.add_rule("a", "").unwrap();
        table.add_rule("b", "p:1").unwrap();
        table.clear();
        assert!(table.is_empty());
        assert!(table.match_host("a").is_none());
    }

    #[test]
    fn test_replace_rules_is_idempotent() {
        let table = RoutingTable::new();
        let rules = vec![
            RoutingRule::direct("intranet"),
            RoutingRule::via("git", "10.0.0.1:8080"),
        ];

        table.replace_rules(&rules);
        table.replace_rules(&rules);

        assert_eq!(table.len(), 2);
        assert_eq!(table.get("").unwrap().hosts(), &["intranet".to_string()]);
    }

    #[test]
    fn test_concurrent_readers_see_complete_entries() {
        let table = Arc::new(RoutingTable::new());
        table.add_rule("seed.corp", "proxy:3128").unwrap();

        let writer = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                for i in 0..200 {
                    table.add_rule(&format!("host{i}.corp"), "proxy:3128").unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let entry = table.match_host("www.seed.corp").unwrap();
                        // Every host recorded in a published entry is matched by its regex
                        for host in entry.hosts() {
                            assert!(entry.matches(host));
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(table.get("proxy:3128").unwrap().hosts().len(), 201);
    }
}
