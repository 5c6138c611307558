//! [`IssueTracker`] over the tracker's Atom feeds.

use chrono::SecondsFormat;

use super::atom::{self, AtomError};
use super::{Comment, FeedQuery, Issue, IssueTracker};
use crate::config::TrackerConfig;
use crate::remote::{self, FetchError};

#[derive(Debug, Clone)]
pub struct HttpTracker {
    feeds: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl HttpTracker {
    /// Feeds of `project` under `base_url`; posting needs `token`.
    #[must_use]
    pub fn new(base_url: &str, project: &str, token: Option<String>) -> Self {
        Self {
            feeds: format!(
                "{}/feeds/issues/p/{project}/issues",
                base_url.trim_end_matches('/')
            ),
            token,
            agent: remote::agent(),
        }
    }

    /// Tracker from config, reading the bearer token from the configured
    /// environment variable.
    #[must_use]
    pub fn from_config(cfg: &TrackerConfig) -> Self {
        let token = std::env::var(&cfg.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        Self::new(&cfg.base_url, &cfg.project, token)
    }

    fn comments_url(&self, id: &str) -> String {
        format!("{}/{id}/comments/full", self.feeds)
    }
}

fn decode_error(url: &str, err: &AtomError) -> FetchError {
    FetchError::Decode {
        url: url.to_string(),
        message: err.to_string(),
    }
}

impl IssueTracker for HttpTracker {
    fn search(&self, q: &FeedQuery) -> Result<Vec<Issue>, FetchError> {
        let url = format!("{}/full", self.feeds);
        let min = q.updated_min.to_rfc3339_opts(SecondsFormat::Secs, true);
        let max = q.updated_max.to_rfc3339_opts(SecondsFormat::Secs, true);
        let limit = q.max_results.to_string();
        let request = self
            .agent
            .get(&url)
            .query("q", &q.query)
            .query("can", &q.can)
            .query("max-results", &limit)
            .query("updated-min", &min)
            .query("updated-max", &max);
        let body = remote::call_text(&url, request)?;
        atom::parse_issues(&body).map_err(|err| decode_error(&url, &err))
    }

    fn comments(&self, id: &str) -> Result<Vec<Comment>, FetchError> {
        let url = self.comments_url(id);
        let body = remote::call_text(&url, self.agent.get(&url))?;
        atom::parse_comments(&body).map_err(|err| decode_error(&url, &err))
    }

    fn post_comment(&self, id: &str, text: &str) -> Result<(), FetchError> {
        let url = self.comments_url(id);
        let Some(token) = &self.token else {
            return Err(FetchError::Unauthorized { url });
        };
        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/atom+xml")
            .set("Authorization", &format!("Bearer {token}"))
            .send_string(&atom::comment_entry(text))
            .map_err(|err| FetchError::from_ureq(&url, err))?;
        if response.status() != 201 {
            let status = response.status();
            return Err(FetchError::Status {
                url,
                status,
                body: response.into_string().unwrap_or_default(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_urls() {
        let t = HttpTracker::new("https://code.google.com/", "go", None);
        assert_eq!(t.feeds, "https://code.google.com/feeds/issues/p/go/issues");
        assert_eq!(
            t.comments_url("7523"),
            "https://code.google.com/feeds/issues/p/go/issues/7523/comments/full"
        );
    }

    #[test]
    fn posting_without_token_is_unauthorized() {
        let t = HttpTracker::new("http://127.0.0.1:9", "go", None);
        let err = t.post_comment("1", "hi").expect_err("no token");
        assert!(err.is_unauthorized());
    }
}
