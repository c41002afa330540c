//! Incremental push parser for the ever-open stream root.
//!
//! Bytes are accumulated and scanned with quick-xml; only complete markup
//! events are consumed, so a partial tag, entity or text run stays buffered
//! until the next [`StreamParser::feed`]. The resulting tree does not depend
//! on how the input was chunked.

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, trace};

use super::{NodeId, NodeRef, Tree};
use crate::error::XmlError;

/// Maximum number of unconsumed bytes kept while waiting for a markup event
/// to complete.
///
/// Consumed events are dropped from the buffer immediately, so this only
/// bounds a single tag or text run. 1 MB is far above anything a server
/// sends in one piece (avatars and archive pages rarely exceed 100 KB).
pub const MAX_PENDING_BYTES: usize = 1_024 * 1_024;

/// Maximum element nesting, root included.
pub const MAX_DEPTH: usize = 64;

/// What a handler wants the dispatcher to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    /// Try the next matching entry for the same node
    Next,
    /// Stop trying entries for this node
    Handled,
    /// Stop the whole walk immediately
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamePattern {
    Exact(&'static str),
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentPattern {
    Exact(&'static str),
    Any,
    /// Matches only the stream root itself, the node with no parent element
    Root,
}

pub type HandlerFn<C> = fn(NodeRef<'_>, &mut C) -> HandlerStatus;

/// One row of the dispatch table.
pub struct HandlerEntry<C> {
    pub name: NamePattern,
    pub parent: ParentPattern,
    pub handler: HandlerFn<C>,
}

impl<C> HandlerEntry<C> {
    pub const fn new(name: NamePattern, parent: ParentPattern, handler: HandlerFn<C>) -> Self {
        Self {
            name,
            parent,
            handler,
        }
    }

    pub fn matches(&self, node: NodeRef<'_>) -> bool {
        let name_ok = match self.name {
            NamePattern::Any => true,
            NamePattern::Exact(name) => node.name() == name,
        };
        let parent_ok = match self.parent {
            ParentPattern::Any => true,
            ParentPattern::Root => node.parent().is_none(),
            ParentPattern::Exact(parent) => node.parent().is_some_and(|p| p.name() == parent),
        };
        name_ok && parent_ok
    }
}

impl<C> Clone for HandlerEntry<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            parent: self.parent,
            handler: self.handler,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// Input accepted, root still open
    Ok,
    /// The root element has been closed by the remote
    RootClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Completed,
    Aborted,
}

/// Stream parser over a fixed handler table. `C` is the context handed to
/// every handler.
pub struct StreamParser<C> {
    tree: Tree,
    handlers: Vec<HandlerEntry<C>>,
    pending: Vec<u8>,
    /// Innermost open element
    cur: Option<NodeId>,
    depth: usize,
    root_closed: bool,
    /// Total bytes consumed since the last reset, for error positions
    offset: usize,
    resets: u64,
}

impl<C> StreamParser<C> {
    pub fn new(handlers: Vec<HandlerEntry<C>>) -> Self {
        Self {
            tree: Tree::default(),
            handlers,
            pending: Vec::new(),
            cur: None,
            depth: 0,
            root_closed: false,
            offset: 0,
            resets: 0,
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn root(&self) -> Option<NodeRef<'_>> {
        self.tree.root()
    }

    pub fn is_root_closed(&self) -> bool {
        self.root_closed
    }

    /// Number of times [`StreamParser::reset`] has run.
    pub fn reset_count(&self) -> u64 {
        self.resets
    }

    /// Bytes held back waiting for the rest of a markup event.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Append `bytes` and build every node that is now complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<FeedStatus, XmlError> {
        self.pending.extend_from_slice(bytes);

        let buf = std::mem::take(&mut self.pending);
        let result = self.scan(&buf);
        let consumed = match &result {
            Ok(consumed) => *consumed,
            Err(_) => buf.len(),
        };
        self.offset += consumed;
        self.pending = buf;
        self.pending.drain(..consumed);
        result?;

        if self.pending.len() > MAX_PENDING_BYTES {
            return Err(XmlError::BufferOverflow {
                limit: MAX_PENDING_BYTES,
            });
        }
        Ok(if self.root_closed {
            FeedStatus::RootClosed
        } else {
            FeedStatus::Ok
        })
    }

    /// Scan `buf`, returning how many bytes were turned into tree updates.
    fn scan(&mut self, buf: &[u8]) -> Result<usize, XmlError> {
        let mut reader = Reader::from_reader(buf);
        reader.config_mut().trim_text(false);
        // Each scan starts mid-document: end tags for elements opened in an
        // earlier feed are matched against our own tree instead.
        reader.config_mut().check_end_names = false;
        reader.config_mut().allow_unmatched_ends = true;

        let mut consumed = 0usize;
        loop {
            let pos = reader.buffer_position() as usize;
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(quick_xml::Error::Syntax(
                    SyntaxError::UnclosedTag
                    | SyntaxError::UnclosedCData
                    | SyntaxError::UnclosedComment
                    | SyntaxError::UnclosedDoctype
                    | SyntaxError::UnclosedPIOrXmlDecl,
                )) => return Ok(consumed),
                // "<!" with nothing after it yet
                Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup))
                    if buf.len() - pos <= 2 =>
                {
                    return Ok(consumed)
                }
                Err(e) => return Err(XmlError::malformed(self.offset + pos, e.to_string())),
            };
            let end = reader.buffer_position() as usize;

            match event {
                Event::Eof => return Ok(consumed),
                Event::Start(e) => {
                    self.open(&e, self.offset + pos)?;
                }
                Event::Empty(e) => {
                    let id = self.open(&e, self.offset + pos)?;
                    self.close(id);
                }
                Event::End(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    self.end(&name)?;
                }
                Event::Text(e) => {
                    // A text run touching the end of the buffer may continue
                    // in the next chunk.
                    if end >= buf.len() {
                        return Ok(consumed);
                    }
                    let text = e
                        .unescape()
                        .map_err(|err| XmlError::malformed(self.offset + pos, err.to_string()))?;
                    self.text(&text)?;
                }
                Event::CData(e) => {
                    let text = String::from_utf8_lossy(&e).into_owned();
                    self.text(&text)?;
                }
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
            }
            consumed = end;
        }
    }

    fn open(&mut self, e: &BytesStart<'_>, position: usize) -> Result<NodeId, XmlError> {
        if self.root_closed {
            return Err(XmlError::TrailingContent);
        }
        if self.depth >= MAX_DEPTH {
            return Err(XmlError::TooDeep { limit: MAX_DEPTH });
        }
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let mut attrs: Vec<(String, String)> = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|err| XmlError::malformed(position, err.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|err| XmlError::malformed(position, err.to_string()))?
                .into_owned();
            attrs.push((key, value));
        }
        let parent = self.cur;
        if parent.is_none() && self.tree.root_id().is_some() {
            return Err(XmlError::TrailingContent);
        }
        trace!(name = %name, depth = self.depth, "open element");
        let id = self.tree.insert(name, attrs, parent);
        self.cur = Some(id);
        self.depth += 1;
        Ok(id)
    }

    fn close(&mut self, id: NodeId) {
        self.tree.set_complete(id);
        let parent = self.tree.get(id).and_then(|n| n.parent()).map(|p| p.id());
        self.cur = parent;
        self.depth -= 1;
        if parent.is_none() {
            debug!("stream root closed");
            self.root_closed = true;
        }
    }

    fn end(&mut self, name: &str) -> Result<(), XmlError> {
        let Some(cur) = self.cur else {
            return Err(XmlError::UnexpectedEnd(name.to_string()));
        };
        let expected = self.tree.get(cur).map(|n| n.name()).unwrap_or_default();
        if expected != name {
            return Err(XmlError::MismatchedEnd {
                expected: expected.to_string(),
                found: name.to_string(),
            });
        }
        self.close(cur);
        Ok(())
    }

    fn text(&mut self, text: &str) -> Result<(), XmlError> {
        match self.cur {
            // Whitespace between stanzas and keep-alives land here; the root
            // never accumulates text.
            Some(cur) if Some(cur) != self.tree.root_id() => {
                self.tree.append_text(cur, text);
                Ok(())
            }
            Some(_) => Ok(()),
            None if text.trim().is_empty() => Ok(()),
            None if self.root_closed => Err(XmlError::TrailingContent),
            None => Err(XmlError::malformed(self.offset, "text outside the root element")),
        }
    }

    /// Run handlers over every complete, not yet dispatched node, children
    /// before parents.
    pub fn dispatch(&mut self, ctx: &mut C) -> Dispatch {
        let Some(root) = self.tree.root_id() else {
            return Dispatch::Completed;
        };
        if dispatch_node(&mut self.tree, &self.handlers, root, ctx) {
            Dispatch::Completed
        } else {
            Dispatch::Aborted
        }
    }

    /// Free dispatched subtrees. Subtrees still holding undispatched nodes
    /// are kept and searched for dispatched children.
    pub fn cleanup(&mut self) {
        let Some(root) = self.tree.root_id() else {
            return;
        };
        if self.tree.get(root).is_some_and(|r| r.is_dispatched()) {
            self.tree.clear();
            self.cur = None;
            return;
        }
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let children = self.tree.children_of(id).to_vec();
            let mut kept = Vec::with_capacity(children.len());
            for child in children {
                if self.tree.get(child).is_some_and(|c| c.is_dispatched()) {
                    self.tree.free_subtree(child);
                } else {
                    kept.push(child);
                    stack.push(child);
                }
            }
            self.tree.replace_children(id, kept);
        }
    }

    /// Drop the whole tree and start over as if no bytes had been fed.
    pub fn reset(&mut self) {
        self.tree.clear();
        self.pending.clear();
        self.cur = None;
        self.depth = 0;
        self.root_closed = false;
        self.offset = 0;
        self.resets += 1;
        debug!(resets = self.resets, "stream parser reset");
    }
}

fn dispatch_node<C>(
    tree: &mut Tree,
    handlers: &[HandlerEntry<C>],
    id: NodeId,
    ctx: &mut C,
) -> bool {
    let children = tree.children_of(id).to_vec();
    for child in children {
        let seen = tree.get(child).map_or(true, |c| c.is_dispatched());
        if !seen && !dispatch_node(tree, handlers, child, ctx) {
            return false;
        }
    }

    let Some(node) = tree.get(id) else {
        return true;
    };
    if !node.is_complete() || node.is_dispatched() {
        return true;
    }
    for entry in handlers {
        if !entry.matches(node) {
            continue;
        }
        match (entry.handler)(node, ctx) {
            HandlerStatus::Next => continue,
            HandlerStatus::Handled => break,
            HandlerStatus::Abort => return false,
        }
    }
    tree.set_dispatched(id);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmltree::Element;

    const STREAM: &str = "<?xml version='1.0'?>\
        <stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='abc' version='1.0'>\
        <stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>\n\
        <message from='bob@example.org' type='chat'><body>hi &amp; bye</body><![CDATA[<raw>]]></message> \
        <iq type='result' id='BeeC1'/>\
        <presence from='carol@example.org'><status>away  here</status></presence>";

    #[derive(Default)]
    struct Log {
        seen: Vec<String>,
    }

    fn record(node: NodeRef<'_>, log: &mut Log) -> HandlerStatus {
        log.seen.push(node.to_element().to_xml());
        HandlerStatus::Next
    }

    fn record_top(node: NodeRef<'_>, log: &mut Log) -> HandlerStatus {
        log.seen.push(format!("top:{}", node.name()));
        HandlerStatus::Handled
    }

    fn never(_: NodeRef<'_>, log: &mut Log) -> HandlerStatus {
        log.seen.push("never".into());
        HandlerStatus::Handled
    }

    fn abort_on_iq(node: NodeRef<'_>, log: &mut Log) -> HandlerStatus {
        log.seen.push(format!("abort:{}", node.name()));
        HandlerStatus::Abort
    }

    fn table() -> Vec<HandlerEntry<Log>> {
        vec![
            HandlerEntry::new(NamePattern::Any, ParentPattern::Any, record),
            HandlerEntry::new(
                NamePattern::Any,
                ParentPattern::Exact("stream:stream"),
                record_top,
            ),
            HandlerEntry::new(
                NamePattern::Exact("message"),
                ParentPattern::Exact("stream:stream"),
                never,
            ),
        ]
    }

    fn run_chunks(chunks: &[&[u8]]) -> (Vec<String>, Option<Element>) {
        let mut parser = StreamParser::new(table());
        let mut log = Log::default();
        for chunk in chunks {
            parser.feed(chunk).unwrap();
            assert_eq!(parser.dispatch(&mut log), Dispatch::Completed);
        }
        let root = parser.root().map(|r| r.to_element());
        (log.seen, root)
    }

    #[test]
    fn test_single_feed_builds_tree_and_dispatches_post_order() {
        let (seen, root) = run_chunks(&[STREAM.as_bytes()]);
        let root = root.unwrap();
        assert_eq!(root.name(), "stream:stream");
        assert_eq!(root.attr("id"), Some("abc"));
        assert_eq!(root.text(), "");
        assert_eq!(root.children().len(), 4);

        let message = root.child("message").unwrap();
        assert_eq!(message.child_text("body"), Some("hi & bye"));
        assert_eq!(message.text(), "<raw>");
        assert_eq!(
            root.child("presence").and_then(|p| p.child_text("status")),
            Some("away  here")
        );

        // Children before parents, "never" shadowed by the Handled entry
        assert!(seen[0].starts_with("<required"));
        assert!(seen[1].starts_with("<starttls"));
        assert!(seen[2].starts_with("<stream:features"));
        assert_eq!(seen[3], "top:stream:features");
        assert!(seen.contains(&"top:message".to_string()));
        assert!(!seen.contains(&"never".to_string()));
    }

    #[test]
    fn test_any_chunking_yields_same_tree_and_dispatch_order() {
        let bytes = STREAM.as_bytes();
        let (expected_seen, expected_root) = run_chunks(&[bytes]);

        for split in 1..bytes.len() {
            let (seen, root) = run_chunks(&[&bytes[..split], &bytes[split..]]);
            assert_eq!(root, expected_root, "tree differs for split at {}", split);
            assert_eq!(seen, expected_seen, "dispatch differs for split at {}", split);
        }

        let singles: Vec<&[u8]> = bytes.chunks(1).collect();
        let (seen, root) = run_chunks(&singles);
        assert_eq!(root, expected_root);
        assert_eq!(seen, expected_seen);

        let sevens: Vec<&[u8]> = bytes.chunks(7).collect();
        let (seen, root) = run_chunks(&sevens);
        assert_eq!(root, expected_root);
        assert_eq!(seen, expected_seen);
    }

    #[test]
    fn test_incomplete_stanza_is_not_dispatched() {
        let mut parser = StreamParser::new(table());
        let mut log = Log::default();
        parser
            .feed(b"<stream:stream version='1.0'><message><body>par")
            .unwrap();
        parser.dispatch(&mut log);
        assert!(log.seen.is_empty());
        assert!(parser.pending_len() > 0);

        parser.feed(b"tial</body></message>").unwrap();
        parser.dispatch(&mut log);
        assert_eq!(log.seen.len(), 3);
        assert_eq!(log.seen[2], "top:message");
    }

    #[test]
    fn test_cleanup_frees_dispatched_stanzas_only() {
        let mut parser = StreamParser::new(table());
        let mut log = Log::default();
        parser
            .feed(b"<stream:stream><iq id='1'/><message><body>open")
            .unwrap();
        parser.dispatch(&mut log);
        assert_eq!(parser.tree().len(), 4);

        parser.cleanup();
        // The finished iq is gone, the open message and its body stay
        assert_eq!(parser.tree().len(), 3);
        let root = parser.root().unwrap();
        assert_eq!(root.children().count(), 1);
        assert_eq!(root.child("message").unwrap().child("body").unwrap().name(), "body");

        parser.feed(b"</body></message>").unwrap();
        parser.dispatch(&mut log);
        parser.cleanup();
        assert_eq!(parser.tree().len(), 1);
        // Each stanza was handed to the top-level handler exactly once
        assert_eq!(log.seen.iter().filter(|s| s.starts_with("top:")).count(), 2);
    }

    #[test]
    fn test_cleanup_after_root_closed_empties_tree() {
        let mut parser = StreamParser::new(table());
        let mut log = Log::default();
        let status = parser
            .feed(b"<stream:stream><iq id='1'/></stream:stream>")
            .unwrap();
        assert_eq!(status, FeedStatus::RootClosed);
        parser.dispatch(&mut log);
        parser.cleanup();
        assert!(parser.tree().is_empty());
    }

    #[test]
    fn test_reset_mid_element_yields_empty_tree() {
        let mut parser = StreamParser::new(table());
        parser
            .feed(b"<stream:stream><message to='x'><bo")
            .unwrap();
        assert!(!parser.tree().is_empty());
        parser.reset();
        assert!(parser.tree().is_empty());
        assert!(parser.root().is_none());
        assert_eq!(parser.pending_len(), 0);
        assert_eq!(parser.reset_count(), 1);

        // A fresh stream parses cleanly after the reset
        parser
            .feed(b"<?xml version='1.0'?><stream:stream id='2'><iq/>")
            .unwrap();
        assert_eq!(parser.root().unwrap().attr("id"), Some("2"));
        assert_eq!(parser.tree().len(), 2);
    }

    #[test]
    fn test_abort_stops_walk() {
        let mut parser = StreamParser::new(vec![
            HandlerEntry::new(NamePattern::Exact("iq"), ParentPattern::Any, abort_on_iq),
            HandlerEntry::new(NamePattern::Any, ParentPattern::Exact("stream:stream"), record_top),
        ]);
        let mut log = Log::default();
        parser
            .feed(b"<stream:stream><message/><iq/><presence/>")
            .unwrap();
        assert_eq!(parser.dispatch(&mut log), Dispatch::Aborted);
        assert_eq!(log.seen, vec!["top:message", "abort:iq"]);
        // The aborted node is not marked and is retried on the next walk
        assert!(!parser.root().unwrap().child("iq").unwrap().is_dispatched());
    }

    #[test]
    fn test_root_pattern_matches_only_stream_root() {
        fn root_only(node: NodeRef<'_>, log: &mut Log) -> HandlerStatus {
            log.seen.push(format!("root:{}", node.name()));
            HandlerStatus::Handled
        }
        let mut parser = StreamParser::new(vec![HandlerEntry::new(
            NamePattern::Any,
            ParentPattern::Root,
            root_only,
        )]);
        let mut log = Log::default();
        parser.feed(b"<stream:stream><a><b/></a>").unwrap();
        parser.dispatch(&mut log);
        assert!(log.seen.is_empty());
        parser.feed(b"</stream:stream>").unwrap();
        parser.dispatch(&mut log);
        assert_eq!(log.seen, vec!["root:stream:stream"]);
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        let mut parser = StreamParser::new(table());
        parser.feed(b"<stream:stream><message>").unwrap();
        assert!(matches!(
            parser.feed(b"</iq>"),
            Err(XmlError::MismatchedEnd { .. })
        ));

        let mut parser = StreamParser::new(table());
        assert!(matches!(
            parser.feed(b"<stream:stream><iq a='1' a='2'/>"),
            Err(XmlError::Malformed { .. })
        ));

        let mut parser = StreamParser::new(table());
        parser.feed(b"<stream:stream/>").unwrap();
        assert_eq!(parser.feed(b"<iq/>"), Err(XmlError::TrailingContent));
    }

    #[test]
    fn test_depth_limit() {
        let mut parser = StreamParser::new(table());
        let deep = "<a>".repeat(MAX_DEPTH + 1);
        assert_eq!(
            parser.feed(deep.as_bytes()),
            Err(XmlError::TooDeep { limit: MAX_DEPTH })
        );
    }
}
