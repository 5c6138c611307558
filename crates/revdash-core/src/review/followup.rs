//! Per-CL follow-up work dispatched by scans: loading the message thread,
//! loading patch sets, and telling mentioned issues about the CL.

use anyhow::{Context, bail};
use tracing::{debug, error, info};

use super::client::ReviewService;
use super::derive::Patterns;
use super::load::write_cl;
use super::{Cl, Patch};
use crate::store::Store;
use crate::tracker::IssueTracker;

pub const LOADMSG_SCAN: &str = "codereview.loadmsg";
pub const LOADPATCH_SCAN: &str = "codereview.loadpatch";
pub const MAIL_SCAN: &str = "codereview.mail";

/// Most file names kept on a CL.
pub const MAX_FILES: usize = 100;

/// Fetch one CL with its messages and merge it. A CL the server no longer
/// has is tombstoned.
///
/// # Errors
///
/// Returns the fetch error (other than not found) or the merge error.
pub fn load_messages(store: &Store, service: &dyn ReviewService, key: &str) -> anyhow::Result<()> {
    let jcl = match service.issue(key) {
        Ok(jcl) => jcl,
        Err(err) if err.is_not_found() => {
            info!(cl = key, "CL deleted on server");
            let dead = Cl {
                cl: key.to_string(),
                dead: true,
                ..Cl::default()
            };
            write_cl(store, &dead, None)?;
            return Ok(());
        }
        Err(err) => return Err(err).with_context(|| format!("loading CL {key}")),
    };
    let mut cl = jcl.to_cl();
    cl.messages_loaded = true;
    write_cl(store, &cl, None)?;
    Ok(())
}

/// Store every patch set of a CL, then record the latest one's files,
/// size and repository on the CL.
///
/// # Errors
///
/// Fails if a fetch or write fails, or if more patch sets were added
/// while loading.
pub fn load_patches(
    store: &Store,
    service: &dyn ReviewService,
    patterns: &Patterns,
    key: &str,
) -> anyhow::Result<()> {
    let Some(cl) = store.try_get::<Cl>(key)? else {
        debug!(cl = key, "CL vanished before patch load");
        return Ok(());
    };
    if cl.patch_sets_loaded {
        return Ok(());
    }

    let mut last = None;
    for id in &cl.patch_sets {
        let mut patch = service
            .patch_set(&cl.cl, id)
            .with_context(|| format!("loading patch set {key}/{id}"))?
            .to_patch();
        store.put(&Patch::key(&cl.cl, id), &mut patch)?;
        last = Some(patch);
    }

    store.transaction(|tx| {
        let mut old: Cl = tx.get(key)?;
        if old.patch_sets.len() > cl.patch_sets.len() {
            bail!("CL {key}: more patch sets added");
        }
        old.patch_sets_loaded = true;
        if let Some(last) = &last {
            old.files_modified = last.modified;
            old.files = last.files.iter().map(|f| f.name.clone()).collect();
            old.delta = last.files.iter().map(|f| f.num_added + f.num_removed).sum();
            old.more_files = old.files.len() > MAX_FILES;
            old.files.truncate(MAX_FILES);
            if let Some(repo) = patterns.repo_from_diff(&last.message) {
                old.repo = repo;
            }
        }
        tx.put(key, &mut old)?;
        Ok(())
    })
}

/// Text posted on an issue mentioned by a CL.
#[must_use]
pub fn mention_text(review_base_url: &str, cl: &str) -> String {
    format!("CL {}/{cl} mentions this issue.", review_base_url.trim_end_matches('/'))
}

/// Comment on every issue the CL mentions that was not told yet. Failed
/// posts stay pending for the next scan.
///
/// # Errors
///
/// Fails if the CL cannot be read or the mailed list cannot be saved.
pub fn mail_issues(
    store: &Store,
    tracker: &dyn IssueTracker,
    review_base_url: &str,
    key: &str,
) -> anyhow::Result<()> {
    let Some(cl) = store.try_get::<Cl>(key)? else {
        return Ok(());
    };
    if cl.need_mail_issue.is_empty() {
        return Ok(());
    }

    let text = mention_text(review_base_url, &cl.cl);
    let mut mailed = Vec::new();
    for issue in &cl.need_mail_issue {
        match tracker.post_comment(issue, &text) {
            Ok(()) => mailed.push(issue.clone()),
            Err(err) => error!(cl = key, issue = %issue, code = %err.code(), error = %err, "posting to issue failed"),
        }
    }
    if mailed.is_empty() {
        return Ok(());
    }

    store.transaction(|tx| {
        let mut old: Cl = tx.get(key)?;
        old.mailed_issue.extend(mailed);
        tx.put(key, &mut old)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::remote::FetchError;
    use crate::review::client::{
        Comment, Credentials, JsonCl, JsonFile, JsonMessage, JsonPatch, SearchPage, SearchQuery, Session,
    };
    use crate::review::{ClDeriver, ReviewerDirectory, register_kinds};
    use crate::store::DataKinds;
    use chrono::DateTime;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    const HELLO: &str = "Hello rsc@golang.org,\n\nI'd like you to review this change to\nhttps://code.google.com/p/go/\n";

    fn setup() -> Store {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_399_996_800, 0).expect("valid timestamp"),
        ));
        let deriver = ClDeriver::new(
            ReviewerDirectory::new(vec!["rsc@golang.org".to_string()], BTreeMap::new(), vec![
                "golang-dev".to_string(),
            ]),
            "code.google.com/p/",
            "go",
        )
        .expect("patterns");
        let mut kinds = DataKinds::default();
        register_kinds(&mut kinds, Arc::new(deriver)).expect("kinds");
        Store::open_in_memory(Arc::new(kinds), clock).expect("store")
    }

    #[derive(Default)]
    struct Server {
        issues: BTreeMap<String, JsonCl>,
        patches: BTreeMap<String, JsonPatch>,
    }

    impl ReviewService for Server {
        fn search(&self, _: &SearchQuery<'_>) -> Result<SearchPage, FetchError> {
            Ok(SearchPage::default())
        }

        fn issue(&self, cl: &str) -> Result<JsonCl, FetchError> {
            self.issues
                .get(cl)
                .cloned()
                .ok_or_else(|| FetchError::NotFound { url: cl.to_string() })
        }

        fn patch_set(&self, cl: &str, ps: &str) -> Result<JsonPatch, FetchError> {
            self.patches
                .get(&format!("{cl}/{ps}"))
                .cloned()
                .ok_or_else(|| FetchError::Status {
                    url: cl.to_string(),
                    status: 500,
                    body: String::new(),
                })
        }

        fn login(&self, _: &Credentials) -> Result<Session, FetchError> {
            Err(FetchError::Unauthorized { url: String::new() })
        }

        fn publish(&self, _: &Session, _: &str, _: &Comment) -> Result<(), FetchError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Tracker {
        posted: Mutex<Vec<(String, String)>>,
    }

    impl IssueTracker for Tracker {
        fn post_comment(&self, id: &str, text: &str) -> Result<(), FetchError> {
            if id == "13" {
                return Err(FetchError::Status {
                    url: id.to_string(),
                    status: 403,
                    body: String::new(),
                });
            }
            self.posted.lock().expect("lock").push((id.to_string(), text.to_string()));
            Ok(())
        }

        fn search(
            &self,
            _: &crate::tracker::FeedQuery,
        ) -> Result<Vec<crate::tracker::Issue>, FetchError> {
            Ok(Vec::new())
        }

        fn comments(&self, _: &str) -> Result<Vec<crate::tracker::Comment>, FetchError> {
            Ok(Vec::new())
        }
    }

    fn server_cl(issue: i64, desc: &str) -> JsonCl {
        JsonCl {
            issue,
            desc: desc.to_string(),
            owner_email: "dev@example.com".to_string(),
            modified: "2014-05-13 15:00:00".to_string(),
            reviewers: vec!["rsc@golang.org".to_string()],
            patch_sets: vec![1, 2],
            messages: vec![JsonMessage {
                sender: "dev@example.com".to_string(),
                text: HELLO.to_string(),
                date: "2014-05-13 15:00:00".to_string(),
            }],
            ..JsonCl::default()
        }
    }

    #[test]
    fn load_messages_marks_loaded_and_tombstones_missing() -> anyhow::Result<()> {
        let store = setup();
        let mut server = Server::default();
        server.issues.insert("5".to_string(), server_cl(5, "fmt: x"));

        load_messages(&store, &server, "5")?;
        let mut cl: Cl = store.get("5")?;
        assert!(cl.messages_loaded);
        assert_eq!(cl.primary_reviewer, "rsc@golang.org");
        // Patch sets are still pending.
        assert!(!cl.active);
        cl.patch_sets_loaded = true;
        store.put("5", &mut cl)?;
        assert!(store.get::<Cl>("5")?.active);

        server.issues.clear();
        load_messages(&store, &server, "5")?;
        let cl: Cl = store.get("5")?;
        assert!(cl.dead);
        assert!(!cl.active);
        Ok(())
    }

    #[test]
    fn load_patches_records_latest_files() -> anyhow::Result<()> {
        let store = setup();
        let mut server = Server::default();
        server.issues.insert("5".to_string(), server_cl(5, "fmt: x"));
        for ps in [1, 2] {
            let mut files = BTreeMap::new();
            for i in 0..(ps * 60) {
                files.insert(
                    format!("src/pkg/fmt/f{i:03}.go"),
                    JsonFile {
                        num_added: 2,
                        num_removed: 1,
                        ..JsonFile::default()
                    },
                );
            }
            server.patches.insert(
                format!("5/{ps}"),
                JsonPatch {
                    issue: 5,
                    patch_set: ps,
                    files,
                    message: "diff -r 0abc https://code.google.com/p/go.net".to_string(),
                    modified: "2014-05-13 15:00:00".to_string(),
                    ..JsonPatch::default()
                },
            );
        }
        load_messages(&store, &server, "5")?;
        let p = Patterns::new()?;
        load_patches(&store, &server, &p, "5")?;

        let cl: Cl = store.get("5")?;
        assert!(cl.patch_sets_loaded);
        assert_eq!(cl.files.len(), MAX_FILES);
        assert!(cl.more_files);
        assert_eq!(cl.delta, 360);
        assert_eq!(cl.repo, "go.net");
        assert_eq!(store.get::<Patch>("5/1")?.files.len(), 60);
        Ok(())
    }

    #[test]
    fn load_patches_fails_without_marking_on_fetch_error() -> anyhow::Result<()> {
        let store = setup();
        let mut server = Server::default();
        server.issues.insert("5".to_string(), server_cl(5, "fmt: x"));
        load_messages(&store, &server, "5")?;
        assert!(load_patches(&store, &server, &Patterns::new()?, "5").is_err());
        assert!(!store.get::<Cl>("5")?.patch_sets_loaded);
        Ok(())
    }

    #[test]
    fn mail_issues_records_only_successful_posts() -> anyhow::Result<()> {
        let store = setup();
        let mut server = Server::default();
        server
            .issues
            .insert("5".to_string(), server_cl(5, "fmt: x\n\nFixes issue 12.\nSee issue 13."));
        load_messages(&store, &server, "5")?;
        let mut cl: Cl = store.get("5")?;
        assert!(cl.need_mail_issue.is_empty());
        cl.patch_sets_loaded = true;
        store.put("5", &mut cl)?;
        assert_eq!(store.get::<Cl>("5")?.need_mail_issue, vec!["12", "13"]);

        let tracker = Tracker::default();
        mail_issues(&store, &tracker, "https://codereview.appspot.com/", "5")?;
        assert_eq!(
            tracker.posted.lock().expect("lock").as_slice(),
            [(
                "12".to_string(),
                "CL https://codereview.appspot.com/5 mentions this issue.".to_string()
            )]
        );
        let cl: Cl = store.get("5")?;
        assert_eq!(cl.mailed_issue, vec!["12"]);
        assert_eq!(cl.need_mail_issue, vec!["13"]);
        Ok(())
    }
}
