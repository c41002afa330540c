//! XML node storage for the inbound stream and an owned element type for
//! building outbound stanzas.
//!
//! Inbound nodes live in an arena ([`Tree`]) owned by the parser: each node
//! owns its children through index lists and keeps a non-owning parent
//! index. Handlers see nodes through the borrowed [`NodeRef`] view and copy
//! out whatever they need to keep with [`NodeRef::to_element`].

pub mod parser;

use std::fmt;

use quick_xml::escape::escape;

pub use parser::{
    Dispatch, FeedStatus, HandlerEntry, HandlerFn, HandlerStatus, NamePattern, ParentPattern,
    StreamParser,
};

/// Owned XML element used for outbound stanzas and for copies of inbound ones.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder form of [`Element::set_attr`].
    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing an existing value for the same key.
    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key.to_string(), value)),
        }
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let pos = self.attrs.iter().position(|(k, _)| k == key)?;
        Some(self.attrs.remove(pos).1)
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(child);
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First child with the given name and `xmlns`.
    pub fn child_ns(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|c| c.name == name && c.attr("xmlns") == Some(ns))
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of the named child, if present.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&escape(v.as_str()));
            out.push('"');
        }
        if self.text.is_empty() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(self.text.as_str()));
        for child in &self.children {
            child.write_xml(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

/// Index of a node inside a [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
struct NodeData {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
    /// Closing tag seen
    complete: bool,
    /// Handlers have run
    dispatched: bool,
}

/// Arena of parsed nodes. Freed slots are recycled.
#[derive(Debug, Default)]
pub struct Tree {
    nodes: Vec<Option<NodeData>>,
    free: Vec<usize>,
    root: Option<NodeId>,
}

impl Tree {
    pub fn root(&self) -> Option<NodeRef<'_>> {
        self.root.map(|id| NodeRef { tree: self, id })
    }

    pub fn root_id(&self) -> Option<NodeId> {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<NodeRef<'_>> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .map(|_| NodeRef { tree: self, id })
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every node at once.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = None;
    }

    /// Allocate a node and link it under `parent`, or make it the root.
    pub(crate) fn insert(
        &mut self,
        name: String,
        attrs: Vec<(String, String)>,
        parent: Option<NodeId>,
    ) -> NodeId {
        let data = NodeData {
            name,
            attrs,
            text: String::new(),
            children: Vec::new(),
            parent,
            complete: false,
            dispatched: false,
        };
        let id = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(data);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(data));
                NodeId(self.nodes.len() - 1)
            }
        };
        match parent {
            Some(p) => self.data_mut(p).children.push(id),
            None => self.root = Some(id),
        }
        id
    }

    /// Free `id` and everything below it, children before parents. The caller
    /// unlinks `id` from its parent.
    pub(crate) fn free_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        let mut order = Vec::new();
        while let Some(n) = stack.pop() {
            order.push(n);
            if let Some(Some(data)) = self.nodes.get(n.0) {
                stack.extend(data.children.iter().copied());
            }
        }
        for n in order.into_iter().rev() {
            if let Some(slot) = self.nodes.get_mut(n.0) {
                if slot.take().is_some() {
                    self.free.push(n.0);
                }
            }
        }
        if self.root == Some(id) {
            self.clear();
        }
    }

    fn data(&self, id: NodeId) -> &NodeData {
        match self.nodes.get(id.0) {
            Some(Some(data)) => data,
            _ => unreachable!("dangling node id {:?}", id),
        }
    }

    fn data_mut(&mut self, id: NodeId) -> &mut NodeData {
        match self.nodes.get_mut(id.0) {
            Some(Some(data)) => data,
            _ => unreachable!("dangling node id {:?}", id),
        }
    }

    pub(crate) fn append_text(&mut self, id: NodeId, text: &str) {
        self.data_mut(id).text.push_str(text);
    }

    pub(crate) fn set_complete(&mut self, id: NodeId) {
        self.data_mut(id).complete = true;
    }

    pub(crate) fn set_dispatched(&mut self, id: NodeId) {
        self.data_mut(id).dispatched = true;
    }

    pub(crate) fn children_of(&self, id: NodeId) -> &[NodeId] {
        &self.data(id).children
    }

    pub(crate) fn replace_children(&mut self, id: NodeId, children: Vec<NodeId>) {
        self.data_mut(id).children = children;
    }
}

/// Borrowed view of one node.
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    tree: &'a Tree,
    id: NodeId,
}

impl<'a> NodeRef<'a> {
    fn data(&self) -> &'a NodeData {
        self.tree.data(self.id)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &'a str {
        &self.data().name
    }

    pub fn attr(&self, key: &str) -> Option<&'a str> {
        self.data()
            .attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> &'a str {
        &self.data().text
    }

    pub fn is_complete(&self) -> bool {
        self.data().complete
    }

    pub fn is_dispatched(&self) -> bool {
        self.data().dispatched
    }

    pub fn parent(&self) -> Option<NodeRef<'a>> {
        self.data().parent.map(|id| NodeRef {
            tree: self.tree,
            id,
        })
    }

    pub fn children(&self) -> impl Iterator<Item = NodeRef<'a>> + 'a {
        let tree = self.tree;
        self.data()
            .children
            .iter()
            .map(move |&id| NodeRef { tree, id })
    }

    pub fn child(&self, name: &str) -> Option<NodeRef<'a>> {
        self.children().find(|c| c.name() == name)
    }

    pub fn child_ns(&self, name: &str, ns: &str) -> Option<NodeRef<'a>> {
        self.children()
            .find(|c| c.name() == name && c.attr("xmlns") == Some(ns))
    }

    /// Deep copy into an owned [`Element`].
    pub fn to_element(&self) -> Element {
        let data = self.data();
        Element {
            name: data.name.clone(),
            attrs: data.attrs.clone(),
            text: data.text.clone(),
            children: self.children().map(|c| c.to_element()).collect(),
        }
    }
}

impl fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_serializes_with_escaping() {
        let msg = Element::new("message")
            .with_attr("to", "bob@example.org")
            .with_attr("type", "chat")
            .with_child(Element::new("body").with_text("1 < 2 & \"quoted\""));
        assert_eq!(
            msg.to_xml(),
            "<message to=\"bob@example.org\" type=\"chat\"><body>1 &lt; 2 &amp; &quot;quoted&quot;</body></message>"
        );
    }

    #[test]
    fn test_element_empty_is_self_closing() {
        assert_eq!(
            Element::new("starttls")
                .with_attr("xmlns", "urn:ietf:params:xml:ns:xmpp-tls")
                .to_xml(),
            "<starttls xmlns=\"urn:ietf:params:xml:ns:xmpp-tls\"/>"
        );
    }

    #[test]
    fn test_set_attr_replaces() {
        let mut iq = Element::new("iq").with_attr("id", "a");
        iq.set_attr("id", "b");
        assert_eq!(iq.attr("id"), Some("b"));
        assert_eq!(iq.attrs().count(), 1);
        assert_eq!(iq.remove_attr("id"), Some("b".to_string()));
        assert_eq!(iq.attr("id"), None);
    }

    #[test]
    fn test_tree_insert_and_free_recycles_slots() {
        let mut tree = Tree::default();
        let root = tree.insert("stream:stream".into(), vec![], None);
        let iq = tree.insert("iq".into(), vec![("id".into(), "1".into())], Some(root));
        let _query = tree.insert("query".into(), vec![], Some(iq));
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.get(iq).unwrap().parent().unwrap().name(), "stream:stream");

        tree.replace_children(root, vec![]);
        tree.free_subtree(iq);
        assert_eq!(tree.len(), 1);
        assert!(tree.get(iq).is_none());

        let msg = tree.insert("message".into(), vec![], Some(root));
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.get(msg).unwrap().name(), "message");
    }

    #[test]
    fn test_node_to_element_is_deep() {
        let mut tree = Tree::default();
        let root = tree.insert("stream:stream".into(), vec![], None);
        let iq = tree.insert("iq".into(), vec![("type".into(), "result".into())], Some(root));
        let bind = tree.insert(
            "bind".into(),
            vec![("xmlns".into(), "urn:ietf:params:xml:ns:xmpp-bind".into())],
            Some(iq),
        );
        let jid = tree.insert("jid".into(), vec![], Some(bind));
        tree.append_text(jid, "alice@example.org/gateway");

        let elem = tree.get(iq).unwrap().to_element();
        assert_eq!(
            elem.child_ns("bind", "urn:ietf:params:xml:ns:xmpp-bind")
                .and_then(|b| b.child_text("jid")),
            Some("alice@example.org/gateway")
        );
    }
}
