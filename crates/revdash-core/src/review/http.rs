//! [`ReviewService`] over HTTP.

use super::client::{Comment, Credentials, JsonCl, JsonPatch, ReviewService, SearchPage, SearchQuery, Session};
use crate::remote::{self, FetchError};

/// Account login endpoint exchanging a password for an auth token.
pub const CLIENT_LOGIN_URL: &str = "https://www.google.com/accounts/ClientLogin";

const LOGIN_SOURCE: &str = "revdash";

#[derive(Debug, Clone)]
pub struct HttpReviewService {
    base_url: String,
    login_url: String,
    agent: ureq::Agent,
    no_redirects: ureq::Agent,
}

impl HttpReviewService {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            login_url: CLIENT_LOGIN_URL.to_string(),
            agent: remote::agent(),
            no_redirects: remote::agent_without_redirects(),
        }
    }

    #[must_use]
    pub fn with_login_url(mut self, url: &str) -> Self {
        self.login_url = url.to_string();
        self
    }

    fn auth_token(&self, credentials: &Credentials) -> Result<String, FetchError> {
        let url = &self.login_url;
        let body = self
            .agent
            .post(url)
            .send_form(&[
                ("Email", credentials.user.as_str()),
                ("Passwd", credentials.password.as_str()),
                ("source", LOGIN_SOURCE),
                ("service", "ah"),
                ("accountType", "HOSTED_OR_GOOGLE"),
            ])
            .map_err(|err| FetchError::from_ureq(url, err))?
            .into_string()
            .map_err(|err| FetchError::Transport {
                url: url.clone(),
                message: err.to_string(),
            })?;
        auth_from_response(url, &body)
    }

    fn xsrf_token(&self, session: &Session) -> Result<String, FetchError> {
        let url = format!("{}/xsrf_token", self.base_url);
        let request = self
            .agent
            .get(&url)
            .set("X-Requesting-XSRF-Token", "1")
            .set("Cookie", &session.cookie);
        remote::call_text(&url, request).map(|t| t.trim().to_string())
    }
}

/// The `Auth` token of a login response; a response without one is a refusal.
fn auth_from_response(url: &str, body: &str) -> Result<String, FetchError> {
    login_field(body, "Auth")
        .map(str::to_string)
        .ok_or_else(|| FetchError::Unauthorized { url: url.to_string() })
}

/// Value of `key=` in a `key=value` per line login response.
fn login_field<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    body.lines()
        .filter_map(|line| line.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

/// `name=value` pairs of every `Set-Cookie` header, joined for a `Cookie` header.
fn cookie_header(set_cookies: &[&str]) -> String {
    set_cookies
        .iter()
        .filter_map(|c| c.split(';').next())
        .map(str::trim)
        .filter(|c| c.contains('='))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ReviewService for HttpReviewService {
    fn search(&self, q: &SearchQuery<'_>) -> Result<SearchPage, FetchError> {
        let url = format!("{}/search", self.base_url);
        let limit = q.limit.to_string();
        let request = self
            .agent
            .get(&url)
            // closed=1 means "either".
            .query("closed", "1")
            .query("owner", "")
            .query(q.axis, q.group)
            .query("repo_guid", "")
            .query("base", "")
            .query("private", "1")
            .query("created_before", "")
            .query("created_after", "")
            .query("modified_before", "")
            .query("modified_after", q.modified_after)
            .query("order", "modified")
            .query("format", "json")
            .query("keys_only", "False")
            .query("with_messages", "False")
            .query("cursor", q.cursor)
            .query("limit", &limit);
        remote::call_json(&url, request)
    }

    fn issue(&self, cl: &str) -> Result<JsonCl, FetchError> {
        let url = format!("{}/api/{cl}", self.base_url);
        let request = self.agent.get(&url).query("messages", "true");
        remote::call_json(&url, request)
    }

    fn patch_set(&self, cl: &str, patch_set: &str) -> Result<JsonPatch, FetchError> {
        let url = format!("{}/api/{cl}/{patch_set}", self.base_url);
        let request = self.agent.get(&url);
        remote::call_json(&url, request)
    }

    fn login(&self, credentials: &Credentials) -> Result<Session, FetchError> {
        let token = self.auth_token(credentials)?;
        let url = format!("{}/_ah/login", self.base_url);
        let marker = format!("{}/", self.base_url);
        tracing::debug!(user = %credentials.user, "review server login");
        let response = self
            .no_redirects
            .get(&url)
            .query("continue", &marker)
            .query("auth", &token)
            .call()
            .map_err(|err| FetchError::from_ureq(&url, err))?;
        let cookie = cookie_header(&response.all("set-cookie"));
        if cookie.is_empty() {
            return Err(FetchError::Unauthorized { url });
        }
        Ok(Session { cookie })
    }

    fn publish(&self, session: &Session, cl: &str, comment: &Comment) -> Result<(), FetchError> {
        let xsrf = self.xsrf_token(session)?;
        let url = format!("{}/{cl}/publish", self.base_url);
        let reviewers = comment.reviewers.join(",");
        let cc = comment.cc.join(",");
        let send_mail = if comment.send_mail { "1" } else { "" };
        self.agent
            .post(&url)
            .set("Cookie", &session.cookie)
            .send_form(&[
                ("xsrf_token", xsrf.as_str()),
                ("message", comment.message.as_str()),
                ("reviewers", reviewers.as_str()),
                ("cc", cc.as_str()),
                ("send_mail", send_mail),
                ("message_only", ""),
                ("no_redirect", "True"),
            ])
            .map_err(|err| FetchError::from_ureq(&url, err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_response_fields() {
        let body = "SID=abc\nLSID=def\nAuth=tok123\n";
        assert_eq!(login_field(body, "Auth"), Some("tok123"));
        assert_eq!(login_field("Error=BadAuthentication\n", "Auth"), None);
        assert_eq!(login_field("Auth=\n", "Auth"), None);
    }

    #[test]
    fn auth_token_or_refusal() {
        let url = "https://www.google.com/accounts/ClientLogin";
        let token = auth_from_response(url, "SID=abc\nAuth=tok123\n").expect("token");
        assert_eq!(token, "tok123");
        let err = auth_from_response(url, "Error=BadAuthentication\n").expect_err("refused");
        assert!(matches!(err, FetchError::Unauthorized { url: u } if u == url));
    }

    #[test]
    fn cookies_keep_name_value_pairs() {
        let header = cookie_header(&[
            "ACSID=xyz; expires=Fri, 01-Jan-2100 00:00:00 GMT; path=/",
            "dev_appserver_login=a@b.c:False:1; Path=/",
            "garbage",
        ]);
        assert_eq!(header, "ACSID=xyz; dev_appserver_login=a@b.c:False:1");
    }

    #[test]
    fn base_url_is_normalized() {
        let svc = HttpReviewService::new("https://codereview.example.com/");
        assert_eq!(svc.base_url, "https://codereview.example.com");
        let svc = svc.with_login_url("http://localhost:1/login");
        assert_eq!(svc.login_url, "http://localhost:1/login");
    }
}
