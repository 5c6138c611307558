//! Operator-triggered CL mutations.

use anyhow::{Context, anyhow};
use tracing::{info, warn};

use super::client::{Comment, Credentials, ReviewService, Session};
use super::followup::load_messages;
use super::Cl;
use super::reviewers::{CLOSE, ReviewerDirectory};
use crate::jobs::scan::{SCAN_LEASE, scan_lease};
use crate::lease::LeaseGuard;
use crate::remote::FetchError;
use crate::store::{Record, Store};

/// Meta key holding the bot account's [`Credentials`].
pub const CREDENTIALS_KEY: &str = "codereview.bot.credentials";

/// Meta key caching the bot's [`Session`].
pub const SESSION_KEY: &str = "codereview.session";

/// Re-merge one CL with its message thread, under the same per-record
/// lease the background scan uses.
///
/// # Errors
///
/// Fails if the CL is being worked on elsewhere, or on fetch or merge failure.
pub fn refresh_cl(store: &Store, service: &dyn ReviewService, cl: &str) -> anyhow::Result<()> {
    let _guard = LeaseGuard::acquire_or_busy(store, &scan_lease(Cl::KIND, cl), SCAN_LEASE)?;
    load_messages(store, service, cl)
}

/// Assign `who` as reviewer of `cl` by posting `R=<who>` as the bot, then
/// re-merge the CL.
///
/// `who` is added to the reviewer list unless it is `close` or a group.
///
/// # Errors
///
/// Fails if `cl` is not numeric, credentials are missing, or the server
/// rejects the comment.
pub fn set_reviewer(
    store: &Store,
    service: &dyn ReviewService,
    reviewers: &ReviewerDirectory,
    cl: &str,
    who: &str,
    by: &str,
) -> anyhow::Result<()> {
    cl.parse::<u64>()
        .map_err(|_| anyhow!("invalid CL number {cl:?}"))?;
    if by.is_empty() {
        return Err(anyhow!("assigning a reviewer needs the assigner's address"));
    }

    let issue = service.issue(cl).with_context(|| format!("loading CL {cl}"))?;
    let mut list = issue.reviewers.clone();
    if who != CLOSE && !reviewers.is_group(who) && !list.iter().any(|r| r == who) {
        list.push(who.to_string());
    }
    let comment = Comment {
        message: format!("R={who} (assigned by {by})"),
        reviewers: list,
        cc: issue.cc,
        send_mail: true,
    };
    publish(store, service, cl, &comment)?;
    info!(cl, who, by, "reviewer assigned");

    if let Err(err) = refresh_cl(store, service, cl) {
        warn!(cl, error = %format!("{err:#}"), "refresh after assignment failed; the scan will catch up");
    }
    Ok(())
}

/// Publish with the cached session, logging in again once if it expired.
fn publish(store: &Store, service: &dyn ReviewService, cl: &str, comment: &Comment) -> anyhow::Result<()> {
    let cached = store.read_meta::<Session>(SESSION_KEY)?;
    let fresh = cached.is_none();
    let session = match cached {
        Some(session) => session,
        None => login(store, service)?,
    };
    match service.publish(&session, cl, comment) {
        Err(err) if err.is_unauthorized() && !fresh => {
            info!("review session expired; logging in again");
            let session = login(store, service)?;
            service.publish(&session, cl, comment).map_err(|err| publish_error(cl, err))
        }
        other => other.map_err(|err| publish_error(cl, err)),
    }
}

fn publish_error(cl: &str, err: FetchError) -> anyhow::Error {
    anyhow::Error::new(err).context(format!("commenting on CL {cl}"))
}

fn login(store: &Store, service: &dyn ReviewService) -> anyhow::Result<Session> {
    let credentials = store
        .read_meta::<Credentials>(CREDENTIALS_KEY)?
        .ok_or_else(|| anyhow!("no bot credentials; set meta {CREDENTIALS_KEY}"))?;
    let session = service
        .login(&credentials)
        .with_context(|| format!("logging in as {}", credentials.user))?;
    store.write_meta(SESSION_KEY, &session)?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::review::client::{JsonCl, JsonPatch, SearchPage, SearchQuery};
    use crate::review::{ClDeriver, register_kinds};
    use crate::store::DataKinds;
    use chrono::DateTime;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    fn setup() -> Store {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_399_996_800, 0).expect("valid timestamp"),
        ));
        let deriver = ClDeriver::new(directory(), "code.google.com/p/", "go").expect("patterns");
        let mut kinds = DataKinds::default();
        register_kinds(&mut kinds, Arc::new(deriver)).expect("kinds");
        Store::open_in_memory(Arc::new(kinds), clock).expect("store")
    }

    fn directory() -> ReviewerDirectory {
        ReviewerDirectory::new(
            vec!["rsc@golang.org".to_string()],
            BTreeMap::new(),
            vec!["golang-dev".to_string(), "golang-codereviews".to_string()],
        )
    }

    /// Accepts session "good"; hands out "good" on login.
    #[derive(Default)]
    struct Server {
        logins: Mutex<usize>,
        published: Mutex<Vec<(String, Comment)>>,
        messages: Mutex<Vec<String>>,
    }

    impl ReviewService for Server {
        fn search(&self, _: &SearchQuery<'_>) -> Result<SearchPage, FetchError> {
            Ok(SearchPage::default())
        }

        fn issue(&self, cl: &str) -> Result<JsonCl, FetchError> {
            Ok(JsonCl {
                issue: cl.parse().unwrap_or_default(),
                modified: "2014-05-13 15:00:00".to_string(),
                reviewers: vec!["gri@golang.org".to_string()],
                cc: vec!["golang-codereviews@googlegroups.com".to_string()],
                messages: self
                    .messages
                    .lock()
                    .expect("lock")
                    .iter()
                    .map(|text| crate::review::client::JsonMessage {
                        sender: "bot@example.com".to_string(),
                        text: text.clone(),
                        date: "2014-05-13 15:00:00".to_string(),
                    })
                    .collect(),
                ..JsonCl::default()
            })
        }

        fn patch_set(&self, cl: &str, _: &str) -> Result<JsonPatch, FetchError> {
            Err(FetchError::NotFound { url: cl.to_string() })
        }

        fn login(&self, c: &Credentials) -> Result<Session, FetchError> {
            if c.password != "hunter2" {
                return Err(FetchError::Unauthorized { url: "login".to_string() });
            }
            *self.logins.lock().expect("lock") += 1;
            Ok(Session {
                cookie: "good".to_string(),
            })
        }

        fn publish(&self, s: &Session, cl: &str, c: &Comment) -> Result<(), FetchError> {
            if s.cookie != "good" {
                return Err(FetchError::Unauthorized { url: "publish".to_string() });
            }
            self.messages.lock().expect("lock").push(c.message.clone());
            self.published.lock().expect("lock").push((cl.to_string(), c.clone()));
            Ok(())
        }
    }

    fn credentials(store: &Store, password: &str) {
        store
            .write_meta(
                CREDENTIALS_KEY,
                &Credentials {
                    user: "bot@example.com".to_string(),
                    password: password.to_string(),
                },
            )
            .expect("write credentials");
    }

    #[test]
    fn assigns_reviewer_and_refreshes() -> anyhow::Result<()> {
        let store = setup();
        credentials(&store, "hunter2");
        let server = Server::default();
        set_reviewer(&store, &server, &directory(), "42", "rsc@golang.org", "adg@golang.org")?;

        let published = server.published.lock().expect("lock").clone();
        assert_eq!(published.len(), 1);
        let (cl, comment) = &published[0];
        assert_eq!(cl, "42");
        assert_eq!(comment.message, "R=rsc@golang.org (assigned by adg@golang.org)");
        assert_eq!(comment.reviewers, vec!["gri@golang.org", "rsc@golang.org"]);
        assert_eq!(comment.cc, vec!["golang-codereviews@googlegroups.com"]);

        let stored: Cl = store.get("42")?;
        assert!(stored.messages_loaded);
        assert_eq!(stored.primary_reviewer, "rsc@golang.org");
        assert_eq!(
            store.read_meta::<Session>(SESSION_KEY)?.map(|s| s.cookie).as_deref(),
            Some("good")
        );
        Ok(())
    }

    #[test]
    fn close_and_groups_are_not_added_as_reviewers() -> anyhow::Result<()> {
        let store = setup();
        credentials(&store, "hunter2");
        let server = Server::default();
        set_reviewer(&store, &server, &directory(), "42", CLOSE, "adg@golang.org")?;
        set_reviewer(&store, &server, &directory(), "42", "golang-dev", "adg@golang.org")?;
        for (_, c) in server.published.lock().expect("lock").iter() {
            assert_eq!(c.reviewers, vec!["gri@golang.org"]);
        }
        Ok(())
    }

    #[test]
    fn expired_session_logs_in_once_more() -> anyhow::Result<()> {
        let store = setup();
        credentials(&store, "hunter2");
        store.write_meta(
            SESSION_KEY,
            &Session {
                cookie: "expired".to_string(),
            },
        )?;
        let server = Server::default();
        set_reviewer(&store, &server, &directory(), "42", "rsc", "adg@golang.org")?;
        assert_eq!(*server.logins.lock().expect("lock"), 1);
        assert_eq!(server.published.lock().expect("lock").len(), 1);
        Ok(())
    }

    #[test]
    fn bad_input_and_missing_credentials_fail() {
        let store = setup();
        let server = Server::default();
        let dir = directory();
        assert!(set_reviewer(&store, &server, &dir, "abc", "rsc", "adg@golang.org").is_err());
        let err = set_reviewer(&store, &server, &dir, "42", "rsc", "adg@golang.org")
            .expect_err("no credentials");
        assert!(format!("{err:#}").contains(CREDENTIALS_KEY));

        credentials(&store, "wrong");
        assert!(set_reviewer(&store, &server, &dir, "42", "rsc", "adg@golang.org").is_err());
        assert!(server.published.lock().expect("lock").is_empty());
    }

    #[test]
    fn refresh_refuses_busy_record() -> anyhow::Result<()> {
        let store = setup();
        let server = Server::default();
        let lease = scan_lease("CL", "42");
        assert!(crate::lease::acquire(&store, &lease, SCAN_LEASE));
        assert!(refresh_cl(&store, &server, "42").is_err());
        crate::lease::release(&store, &lease);
        refresh_cl(&store, &server, "42")?;
        assert!(store.get::<Cl>("42")?.messages_loaded);
        Ok(())
    }
}
