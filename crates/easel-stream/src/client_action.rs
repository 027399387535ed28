//! Inline client-action tags.
//!
//! Some agent backends execute tools server-side and hand client-side actions
//! back as text: `<CLIENT_ACTION type="create_ai_node" args='{"prompt":"x"}' />`.
//! [`ClientActionScanner`] pulls those tags out of chat text, even when a tag
//! is split across several deltas.

use regex::Regex;

const TAG_OPEN: &str = "<CLIENT_ACTION";
const TAG_CLOSE: &str = "/>";
/// An unterminated tag longer than this is treated as plain text.
const MAX_PENDING_TAG: usize = 64 * 1024;

/// A piece of scanned text, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Action { name: String, args: String },
}

#[derive(Debug)]
pub struct ClientActionScanner {
    carry: String,
    tag: Regex,
}

impl ClientActionScanner {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            carry: String::new(),
            tag: Regex::new(r#"^<CLIENT_ACTION\s+type="([^"]+)"\s+args='([^']*)'\s*/>"#)?,
        })
    }

    /// Feed one text delta; returns whatever can be released so far.
    pub fn push(&mut self, delta: &str) -> Vec<Segment> {
        self.carry.push_str(delta);
        let mut out = Vec::new();
        let mut text = String::new();

        loop {
            let Some(start) = self.carry.find(TAG_OPEN) else {
                // Hold back a suffix that could still grow into a tag.
                let keep = partial_open_suffix(&self.carry);
                let release = self.carry.len() - keep;
                text.push_str(&self.carry[..release]);
                self.carry.drain(..release);
                break;
            };

            text.push_str(&self.carry[..start]);
            self.carry.drain(..start);

            if let Some(caps) = self.tag.captures(&self.carry) {
                let whole = caps[0].len();
                let segment = Segment::Action {
                    name: caps[1].to_string(),
                    args: caps[2].to_string(),
                };
                self.carry.drain(..whole);
                flush_text(&mut out, &mut text);
                out.push(segment);
                continue;
            }

            match self.carry.find(TAG_CLOSE) {
                Some(end) => {
                    // Closed but not a well-formed tag: plain text.
                    let end = end + TAG_CLOSE.len();
                    text.push_str(&self.carry[..end]);
                    self.carry.drain(..end);
                }
                None if self.carry.len() > MAX_PENDING_TAG => {
                    text.push_str(&self.carry);
                    self.carry.clear();
                    break;
                }
                None => break,
            }
        }

        flush_text(&mut out, &mut text);
        out
    }

    /// Release anything still held back at end of stream.
    pub fn finish(&mut self) -> Option<Segment> {
        if self.carry.is_empty() {
            None
        } else {
            Some(Segment::Text(std::mem::take(&mut self.carry)))
        }
    }
}

fn flush_text(out: &mut Vec<Segment>, text: &mut String) {
    if !text.is_empty() {
        out.push(Segment::Text(std::mem::take(text)));
    }
}

/// Length of the longest suffix of `s` that is a proper prefix of the tag opener.
fn partial_open_suffix(s: &str) -> usize {
    (1..TAG_OPEN.len())
        .rev()
        .find(|&n| s.ends_with(&TAG_OPEN[..n]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> ClientActionScanner {
        ClientActionScanner::new().unwrap()
    }

    #[test]
    fn test_plain_text_passes_through() {
        let mut s = scanner();
        assert_eq!(s.push("hello"), vec![Segment::Text("hello".into())]);
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn test_single_tag_in_one_delta() {
        let mut s = scanner();
        let out = s.push(r#"ok <CLIENT_ACTION type="delete_node" args='{"node_id":"n1"}' /> done"#);
        assert_eq!(
            out,
            vec![
                Segment::Text("ok ".into()),
                Segment::Action {
                    name: "delete_node".into(),
                    args: r#"{"node_id":"n1"}"#.into()
                },
                Segment::Text(" done".into()),
            ]
        );
    }

    #[test]
    fn test_tag_split_across_deltas() {
        let mut s = scanner();
        assert_eq!(s.push("a <CLIENT_"), vec![Segment::Text("a ".into())]);
        assert!(s.push(r#"ACTION type="generate_content" args='{"node"#).is_empty());
        let out = s.push(r#"_id":"n2"}' />"#);
        assert_eq!(
            out,
            vec![Segment::Action {
                name: "generate_content".into(),
                args: r#"{"node_id":"n2"}"#.into()
            }]
        );
    }

    #[test]
    fn test_malformed_tag_is_text() {
        let mut s = scanner();
        let out = s.push("<CLIENT_ACTION broken />");
        assert_eq!(out, vec![Segment::Text("<CLIENT_ACTION broken />".into())]);
    }

    #[test]
    fn test_unterminated_tag_released_on_finish() {
        let mut s = scanner();
        assert!(s.push("<CLIENT_ACTION type=\"x\"").is_empty());
        assert_eq!(
            s.finish(),
            Some(Segment::Text("<CLIENT_ACTION type=\"x\"".into()))
        );
    }

    #[test]
    fn test_partial_open_suffix() {
        assert_eq!(partial_open_suffix("abc <CLI"), 4);
        assert_eq!(partial_open_suffix("abc <"), 1);
        assert_eq!(partial_open_suffix("abc"), 0);
    }
}
