//! Who counts as a reviewer.

use std::collections::BTreeMap;

use crate::config::ReviewConfig;

/// Sentinel reviewer meaning "this CL is abandoned".
pub const CLOSE: &str = "close";

/// Committers, mail aliases and reviewer groups from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewerDirectory {
    committers: Vec<String>,
    alias_domains: BTreeMap<String, String>,
    groups: Vec<String>,
}

impl ReviewerDirectory {
    #[must_use]
    pub fn new(
        committers: Vec<String>,
        alias_domains: BTreeMap<String, String>,
        groups: Vec<String>,
    ) -> Self {
        Self {
            committers,
            alias_domains,
            groups,
        }
    }

    #[must_use]
    pub fn from_config(cfg: &ReviewConfig) -> Self {
        Self::new(
            cfg.committers.clone(),
            cfg.alias_domains.clone(),
            cfg.groups.clone(),
        )
    }

    /// Canonical committer identity for `email`, following domain aliases.
    #[must_use]
    pub fn is_reviewer(&self, email: &str) -> Option<&str> {
        if email.is_empty() {
            return None;
        }
        let other = email.split_once('@').and_then(|(local, domain)| {
            self.alias_domains
                .get(domain)
                .map(|to| format!("{local}@{to}"))
        });
        self.committers
            .iter()
            .find(|c| c.as_str() == email || other.as_deref() == Some(c.as_str()))
            .map(String::as_str)
    }

    /// Expand a short name (`rsc`) or address to a committer identity.
    #[must_use]
    pub fn expand(&self, short: &str) -> Option<&str> {
        if short.contains('@') {
            return self.is_reviewer(short);
        }
        self.committers
            .iter()
            .find(|c| match c.split_once('@') {
                Some((local, _)) => local == short,
                None => c.as_str() == short,
            })
            .map(String::as_str)
    }

    /// Whether `name` is one of the mailing-list reviewer groups.
    #[must_use]
    pub fn is_group(&self, name: &str) -> bool {
        self.groups.iter().any(|g| g == name)
    }

    /// The group standing in for "anyone": the first configured one.
    #[must_use]
    pub fn default_group(&self) -> &str {
        self.groups.first().map_or("", String::as_str)
    }

    #[must_use]
    pub fn groups(&self) -> &[String] {
        &self.groups
    }
}
