//! Review server API surface and its JSON wire types.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Cl, Message, Patch, PatchFile};
use crate::remote::FetchError;

/// Time format used by the review server, always UTC.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Parse a server timestamp; anything unparsable becomes the Unix epoch.
#[must_use]
pub fn parse_time(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .map(|t| t.and_utc())
        .unwrap_or_default()
}

/// The server rejects fractional seconds in `modified_after`.
#[must_use]
pub fn trim_fraction(mtime: &str) -> &str {
    mtime.split_once('.').map_or(mtime, |(whole, _)| whole)
}

/// One page of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchQuery<'a> {
    /// `reviewer` or `cc`.
    pub axis: &'a str,
    /// Full group address.
    pub group: &'a str,
    pub modified_after: &'a str,
    pub cursor: &'a str,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchPage {
    pub cursor: String,
    pub results: Vec<JsonCl>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonCl {
    pub issue: i64,
    #[serde(rename = "description")]
    pub desc: String,
    pub owner_email: String,
    pub owner: String,
    pub created: String,
    /// Kept as text: the checkpoint stores exactly what the server sent.
    pub modified: String,
    pub messages: Vec<JsonMessage>,
    pub reviewers: Vec<String>,
    pub cc: Vec<String>,
    pub closed: bool,
    #[serde(rename = "patchsets")]
    pub patch_sets: Vec<i64>,
}

impl JsonCl {
    /// Raw CL fields; derived and locally owned fields stay default.
    #[must_use]
    pub fn to_cl(&self) -> Cl {
        Cl {
            cl: self.issue.to_string(),
            desc: self.desc.clone(),
            owner: self.owner.clone(),
            owner_email: self.owner_email.clone(),
            created: parse_time(&self.created),
            modified: parse_time(&self.modified),
            messages: self.messages.iter().map(JsonMessage::to_message).collect(),
            reviewers: self.reviewers.clone(),
            cc: self.cc.clone(),
            closed: self.closed,
            patch_sets: self.patch_sets.iter().map(ToString::to_string).collect(),
            ..Cl::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonMessage {
    pub sender: String,
    pub text: String,
    /// e.g. `2012-04-07 00:51:58.602055`
    pub date: String,
}

impl JsonMessage {
    #[must_use]
    pub fn to_message(&self) -> Message {
        Message {
            sender: self.sender.clone(),
            text: self.text.clone(),
            time: parse_time(&self.date),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonPatch {
    pub files: BTreeMap<String, JsonFile>,
    pub created: String,
    pub owner: String,
    pub num_comments: i64,
    #[serde(rename = "patchset")]
    pub patch_set: i64,
    pub issue: i64,
    pub message: String,
    pub modified: String,
}

impl JsonPatch {
    /// Files come out sorted by name.
    #[must_use]
    pub fn to_patch(&self) -> Patch {
        Patch {
            dv: 0,
            cl: self.issue.to_string(),
            patch_set: self.patch_set.to_string(),
            files: self
                .files
                .iter()
                .map(|(name, f)| f.to_file(name))
                .collect(),
            created: parse_time(&self.created),
            modified: parse_time(&self.modified),
            owner: self.owner.clone(),
            num_comments: self.num_comments,
            message: self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonFile {
    pub status: String,
    pub num_chunks: i64,
    pub no_base_file: bool,
    pub property_changes: String,
    pub num_added: i64,
    pub num_removed: i64,
    pub id: i64,
    pub is_binary: bool,
}

impl JsonFile {
    #[must_use]
    pub fn to_file(&self, name: &str) -> PatchFile {
        PatchFile {
            name: name.to_string(),
            status: self.status.clone(),
            num_chunks: self.num_chunks,
            no_base_file: self.no_base_file,
            property_changes: self.property_changes.clone(),
            num_added: self.num_added,
            num_removed: self.num_removed,
            id: self.id.to_string(),
            is_binary: self.is_binary,
        }
    }
}

/// Bot account used for outbound comments, stored in meta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Authenticated session: the cookie header value to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub cookie: String,
}

/// A published review comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub message: String,
    pub reviewers: Vec<String>,
    pub cc: Vec<String>,
    pub send_mail: bool,
}

/// The review server.
pub trait ReviewService: Send + Sync {
    /// One page of CLs where `group` is on the `axis` list, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] on transport, status or decode failure.
    fn search(&self, query: &SearchQuery<'_>) -> Result<SearchPage, FetchError>;

    /// One CL including its message thread.
    ///
    /// # Errors
    ///
    /// [`FetchError::NotFound`] when the CL was deleted.
    fn issue(&self, cl: &str) -> Result<JsonCl, FetchError>;

    /// # Errors
    ///
    /// Returns a [`FetchError`] on transport, status or decode failure.
    fn patch_set(&self, cl: &str, patch_set: &str) -> Result<JsonPatch, FetchError>;

    /// Exchange credentials for a session.
    ///
    /// # Errors
    ///
    /// [`FetchError::Unauthorized`] when the credentials are rejected.
    fn login(&self, credentials: &Credentials) -> Result<Session, FetchError>;

    /// Publish `comment` on `cl`.
    ///
    /// # Errors
    ///
    /// [`FetchError::Unauthorized`] when the session has expired.
    fn publish(&self, session: &Session, cl: &str, comment: &Comment) -> Result<(), FetchError>;
}
