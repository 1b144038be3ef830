//! Host override rules for cascade mode.
//!
//! Each rule is either a bare host substring (always connect directly) or
//! `host->upstream` (route that host through a different upstream proxy).

use std::fmt;
use std::str::FromStr;

const REDIRECT_SEPARATOR: &str = "->";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    /// Substring matched against the target host
    pub host: String,
    /// Upstream proxy for the host; empty means direct
    pub upstream_proxy: String,
}

impl RoutingRule {
    pub fn direct(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            upstream_proxy: String::new(),
        }
    }

    pub fn via(host: impl Into<String>, upstream_proxy: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            upstream_proxy: upstream_proxy.into(),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.upstream_proxy.is_empty()
    }
}

impl fmt::Display for RoutingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_direct() {
            write!(f, "{}", self.host)
        } else {
            write!(f, "{}{}{}", self.host, REDIRECT_SEPARATOR, self.upstream_proxy)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleParseError {
    #[error("override rule '{0}' has an empty host")]
    EmptyHost(String),
    #[error("override rule '{0}' has more than one '->'")]
    ChainedRedirect(String),
}

impl FromStr for RoutingRule {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rule = match s.split_once(REDIRECT_SEPARATOR) {
            Some((_, upstream)) if upstream.contains(REDIRECT_SEPARATOR) => {
                return Err(RuleParseError::ChainedRedirect(s.to_string()));
            }
            Some((host, upstream)) => RoutingRule::via(host.trim(), upstream.trim()),
            None => RoutingRule::direct(s.trim()),
        };
        if rule.host.is_empty() {
            return Err(RuleParseError::EmptyHost(s.to_string()));
        }
        Ok(rule)
    }
}

/// Parse a comma-separated override list such as
/// `"intranet.corp,git.corp->10.0.0.1:8080"`.
///
/// Blank entries are skipped. Malformed entries are returned as errors next to
/// the rules that did parse so the caller can report them.
pub fn parse_rule_list(list: &str) -> (Vec<RoutingRule>, Vec<RuleParseError>) {
    parse_rules(list.split(','))
}

pub fn parse_rules<'a>(
    entries: impl IntoIterator<Item = &'a str>,
) -> (Vec<RoutingRule>, Vec<RuleParseError>) {
    let mut rules = Vec::new();
    let mut errors = Vec::new();
    for entry in entries {
        if entry.trim().is_empty() {
            continue;
        }
        match entry.parse::<RoutingRule>() {
            Ok(rule) => rules.push(rule),
            Err(e) => errors.push(e),
        }
    }
    (rules, errors)
}
