//! Atom feeds of the issue tracker.
//!
//! Feeds are read into a small element tree with the quick-xml event
//! reader; namespace prefixes are ignored (`issues:state` is `state`).

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::escape::{escape, unescape};
use quick_xml::reader::Reader;

use super::{Comment, Issue};

#[derive(Debug, thiserror::Error)]
pub enum AtomError {
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("{0}")]
    Shape(String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Element {
    name: String,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Self> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn text_of(&self, name: &str) -> String {
        self.child(name).map(|c| c.text.trim().to_string()).unwrap_or_default()
    }

    /// Texts of `<outer><inner>..</inner></outer>` for every `outer`.
    fn nested_texts(&self, outer: &str, inner: &str) -> Vec<String> {
        self.children(outer)
            .filter_map(|o| o.child(inner))
            .map(|c| c.text.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

fn local_name(raw: &[u8]) -> String {
    let name = String::from_utf8_lossy(raw);
    match name.rsplit_once(':') {
        Some((_, local)) => local.to_string(),
        None => name.into_owned(),
    }
}

fn parse_tree(xml: &str) -> Result<Element, AtomError> {
    let mut reader = Reader::from_str(xml);
    let mut stack = vec![Element::default()];
    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(Element {
                name: local_name(start.name().as_ref()),
                ..Element::default()
            }),
            Event::Empty(empty) => {
                if let Some(top) = stack.last_mut() {
                    top.children.push(Element {
                        name: local_name(empty.name().as_ref()),
                        ..Element::default()
                    });
                }
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                let done = stack.pop();
                match (done, stack.last_mut()) {
                    (Some(done), Some(parent)) => parent.children.push(done),
                    _ => return Err(AtomError::Shape("unbalanced end tag".to_string())),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if stack.len() != 1 {
        return Err(AtomError::Shape("unexpected end of document".to_string()));
    }
    let mut root = stack.pop().unwrap_or_default();
    root.children
        .pop()
        .ok_or_else(|| AtomError::Shape("empty document".to_string()))
}

fn entries(xml: &str) -> Result<Vec<Element>, AtomError> {
    let feed = parse_tree(xml)?;
    if feed.name != "feed" {
        return Err(AtomError::Shape(format!("expected <feed>, found <{}>", feed.name)));
    }
    Ok(feed.children.into_iter().filter(|c| c.name == "entry").collect())
}

fn time_of(entry: &Element, name: &str) -> Result<Option<DateTime<Utc>>, AtomError> {
    let text = entry.text_of(name);
    if text.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(&text)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|err| AtomError::Shape(format!("<{name}> {text:?}: {err}")))
}

/// Content is HTML carried as text; undo its entity escaping as well.
fn html_text(entry: &Element) -> String {
    let content = entry.text_of("content");
    unescape(&content).map_or(content.clone(), |s| s.into_owned())
}

fn number(text: &str) -> i64 {
    text.trim().parse().unwrap_or(0)
}

/// Issue number from an entry id such as
/// `http://code.google.com/feeds/issues/p/go/issues/full/1234`.
fn issue_id(id: &str) -> Result<i64, AtomError> {
    let last = id.trim().rsplit(['/', '=']).next().unwrap_or("");
    last.parse()
        .map_err(|_| AtomError::Shape(format!("invalid issue ID {id:?}")))
}

/// Issues of a search feed, each with its initial report as `comment[0]`.
///
/// # Errors
///
/// Fails on malformed XML, a non-numeric id or a bad timestamp.
pub fn parse_issues(xml: &str) -> Result<Vec<Issue>, AtomError> {
    let mut out = Vec::new();
    for e in entries(xml)? {
        let created = time_of(&e, "published")?.unwrap_or_default();
        let author = e
            .child("author")
            .map(|a| a.text_of("name"))
            .unwrap_or_default();
        out.push(Issue {
            id: issue_id(&e.text_of("id"))?,
            created,
            modified: time_of(&e, "updated")?.unwrap_or_default(),
            summary: e.text_of("title").replace('\n', " "),
            status: e.text_of("status"),
            duplicate: number(&e.text_of("mergedInto")),
            owner: e.nested_texts("owner", "username").into_iter().next().unwrap_or_default(),
            cc: e.nested_texts("cc", "username"),
            label: e
                .children("label")
                .map(|l| l.text.trim().to_string())
                .collect(),
            comment: vec![Comment {
                author,
                time: created,
                text: html_text(&e),
                ..Comment::default()
            }],
            state: e.text_of("state"),
            stars: number(&e.text_of("stars")),
            closed_date: time_of(&e, "closedDate")?,
            ..Issue::default()
        });
    }
    Ok(out)
}

/// Comments of an issue's comment feed, with each entry's field updates
/// folded in.
///
/// # Errors
///
/// Fails on malformed XML or a bad timestamp.
pub fn parse_comments(xml: &str) -> Result<Vec<Comment>, AtomError> {
    let mut out = Vec::new();
    for e in entries(xml)? {
        let title = e.text_of("title");
        let mut c = Comment {
            author: title.strip_prefix("Comment by ").unwrap_or(&title).to_string(),
            time: time_of(&e, "published")?.unwrap_or_default(),
            text: html_text(&e),
            ..Comment::default()
        };
        let mut cc = Vec::new();
        let mut labels = Vec::new();
        for up in e.children("updates") {
            let summary = up.text_of("summary");
            if !summary.is_empty() {
                c.summary = summary;
            }
            let owner = up.text_of("ownerUpdate");
            if !owner.is_empty() {
                c.owner = owner;
            }
            let status = up.text_of("status");
            if !status.is_empty() {
                c.status = status;
            }
            let merged = up.text_of("mergedInto");
            if !merged.is_empty() {
                c.duplicate = number(&merged);
            }
            labels.extend(
                up.children("label")
                    .map(|l| l.text.trim().to_string())
                    .filter(|l| !l.is_empty()),
            );
            cc.extend(up.nested_texts("ccUpdate", "username"));
            cc.extend(up.nested_texts("cc", "username"));
        }
        c.cc = cc.join(",");
        c.label = labels.join(",");
        out.push(c);
    }
    Ok(out)
}

/// Atom entry posting `text` as a new comment.
#[must_use]
pub fn comment_entry(text: &str) -> String {
    format!(
        "<?xml version='1.0' encoding='UTF-8'?>\n\
         <entry xmlns='http://www.w3.org/2005/Atom' \
         xmlns:issues='http://schemas.google.com/projecthosting/issues/2009'>\n  \
         <content type='html'>{}</content>\n  \
         <author>\n    <name>ignored</name>\n  </author>\n\
         </entry>\n",
        escape(text)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<feed xmlns='http://www.w3.org/2005/Atom' xmlns:issues='http://schemas.google.com/projecthosting/issues/2009'>
  <id>http://code.google.com/feeds/issues/p/go/issues/full</id>
  <entry>
    <id>http://code.google.com/feeds/issues/p/go/issues/full/7523</id>
    <published>2014-03-13T18:04:11.000Z</published>
    <updated>2014-05-12T09:15:00.000Z</updated>
    <title>net/http: Transport
 leaks on redirect</title>
    <content type='html'>Run this &amp;lt;b&amp;gt;program&amp;lt;/b&amp;gt;</content>
    <author><name>gopher@example.com</name></author>
    <issues:cc><issues:username>rsc@golang.org</issues:username></issues:cc>
    <issues:cc><issues:username>bradfitz@golang.org</issues:username></issues:cc>
    <issues:label>Release-Go1.3</issues:label>
    <issues:label>Type-Bug</issues:label>
    <issues:owner><issues:username>bradfitz@golang.org</issues:username></issues:owner>
    <issues:stars>4</issues:stars>
    <issues:state>open</issues:state>
    <issues:status>Accepted</issues:status>
  </entry>
  <entry>
    <id>http://code.google.com/feeds/issues/p/go/issues/full/7524</id>
    <published>2014-03-14T00:00:00Z</published>
    <updated>2014-05-12T09:16:00Z</updated>
    <title>dup</title>
    <issues:closedDate>2014-05-12T09:16:00Z</issues:closedDate>
    <issues:mergedInto>7523</issues:mergedInto>
    <issues:state>closed</issues:state>
    <issues:status>Duplicate</issues:status>
  </entry>
</feed>"#;

    #[test]
    fn search_feed_becomes_issues() -> Result<(), AtomError> {
        let issues = parse_issues(SEARCH)?;
        assert_eq!(issues.len(), 2);

        let first = &issues[0];
        assert_eq!(first.id, 7523);
        assert_eq!(first.summary, "net/http: Transport  leaks on redirect");
        assert_eq!(first.cc, vec!["rsc@golang.org", "bradfitz@golang.org"]);
        assert_eq!(first.label, vec!["Release-Go1.3", "Type-Bug"]);
        assert_eq!(first.owner, "bradfitz@golang.org");
        assert_eq!(first.stars, 4);
        assert_eq!(first.state, "open");
        assert_eq!(first.modified.to_rfc3339(), "2014-05-12T09:15:00+00:00");
        assert_eq!(first.comment.len(), 1);
        assert_eq!(first.comment[0].author, "gopher@example.com");
        assert_eq!(first.comment[0].text, "Run this <b>program</b>");
        assert_eq!(first.closed_date, None);

        let second = &issues[1];
        assert_eq!(second.duplicate, 7523);
        assert_eq!(second.status, "Duplicate");
        assert!(second.closed_date.is_some());
        Ok(())
    }

    #[test]
    fn comment_updates_are_folded() -> Result<(), AtomError> {
        let xml = r"<feed xmlns='http://www.w3.org/2005/Atom' xmlns:issues='x'>
  <entry>
    <id>http://code.google.com/feeds/issues/p/go/issues/7523/comments/full/1</id>
    <published>2014-05-01T10:00:00Z</published>
    <updated>2014-05-01T10:00:00Z</updated>
    <title>Comment by rsc@golang.org</title>
    <content type='html'>Looking.</content>
    <issues:updates>
      <issues:status>Started</issues:status>
      <issues:ownerUpdate>rsc@golang.org</issues:ownerUpdate>
      <issues:label>Release-Go1.3</issues:label>
      <issues:label>-Release-Go1.2.2</issues:label>
      <issues:ccUpdate><issues:username>iant@golang.org</issues:username></issues:ccUpdate>
    </issues:updates>
  </entry>
  <entry>
    <published>2014-05-02T10:00:00Z</published>
    <title>Comment by gopher</title>
    <content type='html'></content>
  </entry>
</feed>";
        let comments = parse_comments(xml)?;
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].author, "rsc@golang.org");
        assert_eq!(comments[0].status, "Started");
        assert_eq!(comments[0].owner, "rsc@golang.org");
        assert_eq!(comments[0].label, "Release-Go1.3,-Release-Go1.2.2");
        assert_eq!(comments[0].cc, "iant@golang.org");
        assert_eq!(comments[1].author, "gopher");
        assert!(comments[1].text.is_empty());
        Ok(())
    }

    #[test]
    fn bad_documents_are_errors() {
        assert!(parse_issues("<feed><entry><id>x/abc</id></entry></feed>").is_err());
        assert!(parse_issues("<html></html>").is_err());
        assert!(parse_issues("<feed><entry>").is_err());
        assert!(
            parse_issues("<feed><entry><id>a/1</id><updated>yesterday</updated></entry></feed>")
                .is_err()
        );
        assert_eq!(parse_issues("<feed></feed>").map(|v| v.len()).ok(), Some(0));
    }

    #[test]
    fn posted_entry_escapes_text() {
        let entry = comment_entry("CL <x> & y");
        assert!(entry.contains("<content type='html'>CL &lt;x&gt; &amp; y</content>"));
    }
}
