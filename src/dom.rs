//! In-memory document tree that diagram hydration operates on.
//!
//! The tree is an arena of element, text and raw-HTML nodes shared behind an
//! `Arc`, so the coordinator, its watch task and whoever builds the page can
//! all hold a [`Document`] handle. Nodes are never freed; detached nodes simply
//! stop being reachable from the root.
//!
//! Insertions are reported to observers as [`InsertionBatch`] values over an
//! unbounded channel, one batch per insertion call.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};

/// Index of a node inside its document's arena.
pub type NodeId = usize;

/// Identifies one observer registration on a document.
pub type ObserverId = u64;

/// Document lifecycle, ordered from earliest to latest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    /// Content is still being appended by the builder.
    Loading,
    /// Structure is complete; late insertions may still happen.
    Interactive,
    /// No further structural work is expected.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomError {
    #[error("unknown node id {0}")]
    UnknownNode(NodeId),
    #[error("node {0} is not an element")]
    NotAnElement(NodeId),
}

#[derive(Debug, Clone)]
enum NodeKind {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
    Raw(String),
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// A detached subtree waiting to be inserted with [`Document::append`].
#[derive(Debug, Clone)]
pub struct NodeSpec {
    kind: NodeKind,
    children: Vec<NodeSpec>,
}

impl NodeSpec {
    pub fn element(tag: &str) -> Self {
        Self {
            kind: NodeKind::Element {
                tag: tag.to_ascii_lowercase(),
                attrs: Vec::new(),
            },
            children: Vec::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Text(text.into()),
            children: Vec::new(),
        }
    }

    /// Pre-rendered HTML, serialized verbatim.
    pub fn raw(html: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Raw(html.into()),
            children: Vec::new(),
        }
    }

    /// Set an attribute. Ignored on text and raw nodes.
    pub fn attr(mut self, name: &str, value: impl Into<String>) -> Self {
        if let NodeKind::Element { attrs, .. } = &mut self.kind {
            let value = value.into();
            match attrs.iter_mut().find(|(n, _)| n == name) {
                Some(slot) => slot.1 = value,
                None => attrs.push((name.to_owned(), value)),
            }
        }
        self
    }

    /// Append a child. Ignored on text and raw nodes.
    pub fn child(mut self, child: NodeSpec) -> Self {
        if matches!(self.kind, NodeKind::Element { .. }) {
            self.children.push(child);
        }
        self
    }
}

/// Subtree roots added by one insertion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertionBatch {
    pub added: Vec<NodeId>,
}

/// Receiving end of an observer registration.
///
/// Yields one [`InsertionBatch`] per insertion under the observed node and
/// ends after [`Document::disconnect`] is called for it.
pub struct MutationStream {
    id: ObserverId,
    rx: mpsc::UnboundedReceiver<InsertionBatch>,
}

impl MutationStream {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub async fn next(&mut self) -> Option<InsertionBatch> {
        self.rx.recv().await
    }

    /// Take a buffered batch without waiting.
    pub fn try_next(&mut self) -> Option<InsertionBatch> {
        self.rx.try_recv().ok()
    }
}

/// Simple compound selector: optional tag, optional `#id`, any `.class`es.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
}

impl Selector {
    /// Parse forms like `pre.mermaid`, `.mermaid`, `main.content`, `#toc`.
    pub fn parse(input: &str) -> Self {
        let is_marker = |c: char| c == '.' || c == '#';
        let mut selector = Selector::default();
        let mut rest = input.trim();

        let tag_end = rest.find(is_marker).unwrap_or(rest.len());
        if tag_end > 0 {
            selector.tag = Some(rest[..tag_end].to_ascii_lowercase());
        }
        rest = &rest[tag_end..];

        while let Some(marker) = rest.chars().next() {
            let body = &rest[marker.len_utf8()..];
            let end = body.find(is_marker).unwrap_or(body.len());
            let name = &body[..end];
            if !name.is_empty() {
                if marker == '.' {
                    selector.classes.push(name.to_owned());
                } else {
                    selector.id = Some(name.to_owned());
                }
            }
            rest = &body[end..];
        }
        selector
    }

    fn matches(&self, kind: &NodeKind) -> bool {
        let NodeKind::Element { tag, attrs } = kind else {
            return false;
        };
        if self.tag.as_deref().is_some_and(|t| t != tag.as_str()) {
            return false;
        }
        let lookup = |name: &str| {
            attrs
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };
        if let Some(want) = &self.id {
            if lookup("id") != Some(want.as_str()) {
                return false;
            }
        }
        let class_list = lookup("class").unwrap_or("");
        self.classes
            .iter()
            .all(|c| class_list.split_whitespace().any(|have| have == c))
    }
}

struct Observer {
    id: ObserverId,
    target: NodeId,
    tx: mpsc::UnboundedSender<InsertionBatch>,
}

struct Tree {
    nodes: Vec<Node>,
    observers: Vec<Observer>,
    next_observer: ObserverId,
}

impl Tree {
    fn node(&self, id: NodeId) -> Result<&Node, DomError> {
        self.nodes.get(id).ok_or(DomError::UnknownNode(id))
    }

    fn attrs_mut(&mut self, id: NodeId) -> Result<&mut Vec<(String, String)>, DomError> {
        match &mut self.nodes.get_mut(id).ok_or(DomError::UnknownNode(id))?.kind {
            NodeKind::Element { attrs, .. } => Ok(attrs),
            _ => Err(DomError::NotAnElement(id)),
        }
    }

    fn ensure_element(&self, id: NodeId) -> Result<(), DomError> {
        match self.node(id)?.kind {
            NodeKind::Element { .. } => Ok(()),
            _ => Err(DomError::NotAnElement(id)),
        }
    }

    fn build(&mut self, spec: NodeSpec, parent: NodeId) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            kind: spec.kind,
            parent: Some(parent),
            children: Vec::new(),
        });
        for child in spec.children {
            let child_id = self.build(child, id);
            self.nodes[id].children.push(child_id);
        }
        id
    }

    fn is_inclusive_ancestor(&self, ancestor: NodeId, mut node: NodeId) -> bool {
        loop {
            if node == ancestor {
                return true;
            }
            match self.nodes.get(node).and_then(|n| n.parent) {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    /// Preorder walk of `start` and its descendants.
    fn preorder(&self, start: NodeId, out: &mut Vec<NodeId>) {
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(node) = self.nodes.get(id) {
                stack.extend(node.children.iter().rev());
            }
        }
    }

    fn notify(&mut self, parent: NodeId, added: &[NodeId]) {
        if added.is_empty() {
            return;
        }
        let interested: Vec<usize> = self
            .observers
            .iter()
            .enumerate()
            .filter(|(_, o)| self.is_inclusive_ancestor(o.target, parent))
            .map(|(i, _)| i)
            .collect();
        let mut closed = Vec::new();
        for i in interested {
            let batch = InsertionBatch {
                added: added.to_vec(),
            };
            if self.observers[i].tx.send(batch).is_err() {
                closed.push(self.observers[i].id);
            }
        }
        self.observers.retain(|o| !closed.contains(&o.id));
    }

    fn write_html(&self, id: NodeId, out: &mut String) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        match &node.kind {
            NodeKind::Text(text) => out.push_str(&html_escape(text)),
            NodeKind::Raw(html) => out.push_str(html),
            NodeKind::Element { tag, attrs } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attrs {
                    out.push_str(&format!(" {}=\"{}\"", name, html_escape(value)));
                }
                out.push('>');
                for child in &node.children {
                    self.write_html(*child, out);
                }
                out.push_str(&format!("</{tag}>"));
            }
        }
    }
}

struct Shared {
    tree: Mutex<Tree>,
    ready: watch::Sender<ReadyState>,
    inserted: Notify,
}

/// Cheaply cloneable handle to a shared document tree.
#[derive(Clone)]
pub struct Document {
    shared: Arc<Shared>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Create an empty document whose root is a `<body>` element, in the
    /// [`ReadyState::Loading`] state.
    pub fn new() -> Self {
        let root = Node {
            kind: NodeKind::Element {
                tag: "body".to_owned(),
                attrs: Vec::new(),
            },
            parent: None,
            children: Vec::new(),
        };
        let (ready, _) = watch::channel(ReadyState::Loading);
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree {
                    nodes: vec![root],
                    observers: Vec::new(),
                    next_observer: 0,
                }),
                ready,
                inserted: Notify::new(),
            }),
        }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    // --- lifecycle ---

    pub fn ready_state(&self) -> ReadyState {
        *self.shared.ready.borrow()
    }

    /// Advance the lifecycle. Moving backwards is ignored.
    pub fn set_ready_state(&self, state: ReadyState) {
        self.shared.ready.send_if_modified(|current| {
            if state > *current {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    /// Resolve once the document is at least [`ReadyState::Interactive`].
    pub async fn structure_parsed(&self) {
        let mut rx = self.shared.ready.subscribe();
        let _ = rx.wait_for(|s| *s >= ReadyState::Interactive).await;
    }

    // --- insertion ---

    /// Insert `spec` as the last child of `parent`.
    pub fn append(&self, parent: NodeId, spec: NodeSpec) -> Result<NodeId, DomError> {
        let ids = self.append_all(parent, vec![spec])?;
        ids.first().copied().ok_or(DomError::UnknownNode(parent))
    }

    /// Insert several subtrees under `parent`, reported as a single batch.
    pub fn append_all(&self, parent: NodeId, specs: Vec<NodeSpec>) -> Result<Vec<NodeId>, DomError> {
        let added = {
            let mut tree = self.shared.tree.lock();
            tree.ensure_element(parent)?;
            let mut added = Vec::with_capacity(specs.len());
            for spec in specs {
                let id = tree.build(spec, parent);
                tree.nodes[parent].children.push(id);
                added.push(id);
            }
            tree.notify(parent, &added);
            added
        };
        self.shared.inserted.notify_waiters();
        Ok(added)
    }

    /// Detach every child of `id` and insert `spec` in their place.
    pub fn replace_children(&self, id: NodeId, spec: NodeSpec) -> Result<NodeId, DomError> {
        let new_id = {
            let mut tree = self.shared.tree.lock();
            tree.ensure_element(id)?;
            let old = std::mem::take(&mut tree.nodes[id].children);
            for child in old {
                tree.nodes[child].parent = None;
            }
            let new_id = tree.build(spec, id);
            tree.nodes[id].children.push(new_id);
            tree.notify(id, &[new_id]);
            new_id
        };
        self.shared.inserted.notify_waiters();
        Ok(new_id)
    }

    // --- attributes ---

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<String> {
        let tree = self.shared.tree.lock();
        match &tree.nodes.get(id)?.kind {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    pub fn has_attribute(&self, id: NodeId, name: &str) -> bool {
        self.attribute(id, name).is_some()
    }

    pub fn set_attribute(&self, id: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        let mut tree = self.shared.tree.lock();
        let attrs = tree.attrs_mut(id)?;
        match attrs.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value.to_owned(),
            None => attrs.push((name.to_owned(), value.to_owned())),
        }
        Ok(())
    }

    /// Set `name` only when it is absent. Returns whether this call set it.
    ///
    /// The check and the write happen under one lock, so two concurrent
    /// callers can never both win.
    pub fn set_attribute_if_absent(&self, id: NodeId, name: &str, value: &str) -> Result<bool, DomError> {
        let mut tree = self.shared.tree.lock();
        let attrs = tree.attrs_mut(id)?;
        if attrs.iter().any(|(n, _)| n == name) {
            return Ok(false);
        }
        attrs.push((name.to_owned(), value.to_owned()));
        Ok(true)
    }

    /// Remove an attribute, returning whether it was present.
    pub fn remove_attribute(&self, id: NodeId, name: &str) -> Result<bool, DomError> {
        let mut tree = self.shared.tree.lock();
        let attrs = tree.attrs_mut(id)?;
        let before = attrs.len();
        attrs.retain(|(n, _)| n != name);
        Ok(attrs.len() != before)
    }

    // --- content and queries ---

    /// Concatenated text of all text descendants (raw HTML is not text).
    pub fn text_content(&self, id: NodeId) -> Result<String, DomError> {
        let tree = self.shared.tree.lock();
        tree.node(id)?;
        let mut order = Vec::new();
        tree.preorder(id, &mut order);
        Ok(order
            .into_iter()
            .filter_map(|n| match &tree.nodes[n].kind {
                NodeKind::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect())
    }

    /// Descendants of `scope` (excluding `scope`) matching `selector`, in
    /// document order.
    pub fn query_all(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        let tree = self.shared.tree.lock();
        let mut order = Vec::new();
        tree.preorder(scope, &mut order);
        order
            .into_iter()
            .skip(1)
            .filter(|n| selector.matches(&tree.nodes[*n].kind))
            .collect()
    }

    /// First node in the whole tree (root included) matching `selector`.
    pub fn query_first(&self, selector: &Selector) -> Option<NodeId> {
        let tree = self.shared.tree.lock();
        let mut order = Vec::new();
        tree.preorder(0, &mut order);
        order
            .into_iter()
            .find(|n| selector.matches(&tree.nodes[*n].kind))
    }

    /// Nodes in `roots` and their descendants that match `selector`.
    pub fn select_in(&self, roots: &[NodeId], selector: &Selector) -> Vec<NodeId> {
        let tree = self.shared.tree.lock();
        let mut order = Vec::new();
        for root in roots {
            if tree.nodes.get(*root).is_some() {
                tree.preorder(*root, &mut order);
            }
        }
        order
            .into_iter()
            .filter(|n| selector.matches(&tree.nodes[*n].kind))
            .collect()
    }

    pub fn element_by_id(&self, value: &str) -> Option<NodeId> {
        self.query_first(&Selector {
            id: Some(value.to_owned()),
            ..Selector::default()
        })
    }

    /// Wait until a node matching `selector` is attached, then return it.
    pub async fn wait_for(&self, selector: &Selector) -> NodeId {
        loop {
            let notified = self.shared.inserted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(id) = self.query_first(selector) {
                return id;
            }
            notified.await;
        }
    }

    // --- observation ---

    /// Subscribe to insertions under `target` (inclusive).
    pub fn observe(&self, target: NodeId) -> Result<MutationStream, DomError> {
        let mut tree = self.shared.tree.lock();
        tree.node(target)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = tree.next_observer;
        tree.next_observer += 1;
        tree.observers.push(Observer { id, target, tx });
        Ok(MutationStream { id, rx })
    }

    /// Drop an observer; its stream ends once buffered batches are consumed.
    pub fn disconnect(&self, observer: ObserverId) {
        self.shared
            .tree
            .lock()
            .observers
            .retain(|o| o.id != observer);
    }

    // --- serialization ---

    pub fn outer_html(&self, id: NodeId) -> String {
        let tree = self.shared.tree.lock();
        let mut out = String::new();
        tree.write_html(id, &mut out);
        out
    }

    pub fn inner_html(&self, id: NodeId) -> String {
        let tree = self.shared.tree.lock();
        let mut out = String::new();
        if let Some(node) = tree.nodes.get(id) {
            for child in &node.children {
                tree.write_html(*child, &mut out);
            }
        }
        out
    }
}

/// Minimal HTML entity escaping for text content and attribute values.
pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn diagram(source: &str) -> NodeSpec {
        NodeSpec::element("pre")
            .attr("class", "mermaid")
            .child(NodeSpec::text(source))
    }

    // --- Selector ---

    #[test]
    fn selector_parses_tag_and_class() {
        let sel = Selector::parse("main.content");
        assert_eq!(sel.tag.as_deref(), Some("main"));
        assert_eq!(sel.classes, vec!["content".to_owned()]);
        assert!(sel.id.is_none());
    }

    #[test]
    fn selector_parses_id_and_multiple_classes() {
        let sel = Selector::parse("#toc.a.b");
        assert!(sel.tag.is_none());
        assert_eq!(sel.id.as_deref(), Some("toc"));
        assert_eq!(sel.classes, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn class_selector_matches_any_token_of_class_list() {
        let doc = Document::new();
        let id = doc
            .append(doc.root(), NodeSpec::element("pre").attr("class", "code mermaid wide"))
            .unwrap();
        assert_eq!(doc.query_all(doc.root(), &Selector::parse(".mermaid")), vec![id]);
        assert!(doc.query_all(doc.root(), &Selector::parse(".merm")).is_empty());
    }

    // --- tree operations ---

    #[test]
    fn query_all_returns_document_order() {
        let doc = Document::new();
        let main = doc.append(doc.root(), NodeSpec::element("main")).unwrap();
        let a = doc.append(main, diagram("a")).unwrap();
        let wrapper = doc
            .append(main, NodeSpec::element("div").child(diagram("b")))
            .unwrap();
        let c = doc.append(main, diagram("c")).unwrap();
        let b = doc.select_in(&[wrapper], &Selector::parse(".mermaid"))[0];

        assert_eq!(doc.query_all(doc.root(), &Selector::parse(".mermaid")), vec![a, b, c]);
    }

    #[test]
    fn append_to_text_node_is_rejected() {
        let doc = Document::new();
        let text = doc.append(doc.root(), NodeSpec::text("hi")).unwrap();
        assert_eq!(
            doc.append(text, NodeSpec::element("p")),
            Err(DomError::NotAnElement(text))
        );
        assert_eq!(
            doc.append(999, NodeSpec::element("p")),
            Err(DomError::UnknownNode(999))
        );
    }

    #[test]
    fn set_attribute_if_absent_only_wins_once() {
        let doc = Document::new();
        let id = doc.append(doc.root(), diagram("x")).unwrap();
        assert!(doc.set_attribute_if_absent(id, "data-processed", "true").unwrap());
        assert!(!doc.set_attribute_if_absent(id, "data-processed", "true").unwrap());
        assert!(doc.remove_attribute(id, "data-processed").unwrap());
        assert!(!doc.has_attribute(id, "data-processed"));
    }

    #[test]
    fn text_content_ignores_raw_html() {
        let doc = Document::new();
        let id = doc
            .append(
                doc.root(),
                NodeSpec::element("div")
                    .child(NodeSpec::text("graph TD;"))
                    .child(NodeSpec::raw("<b>x</b>"))
                    .child(NodeSpec::text(" A-->B")),
            )
            .unwrap();
        assert_eq!(doc.text_content(id).unwrap(), "graph TD; A-->B");
    }

    #[test]
    fn replace_children_detaches_old_content() {
        let doc = Document::new();
        let pre = doc.append(doc.root(), diagram("graph TD; A-->B")).unwrap();
        doc.replace_children(pre, NodeSpec::raw("<svg></svg>")).unwrap();
        assert_eq!(doc.inner_html(pre), "<svg></svg>");
        assert_eq!(doc.text_content(pre).unwrap(), "");
    }

    #[test]
    fn serialization_escapes_text_and_attributes() {
        let doc = Document::new();
        let id = doc
            .append(
                doc.root(),
                NodeSpec::element("pre")
                    .attr("title", "a\"b")
                    .child(NodeSpec::text("A<>B")),
            )
            .unwrap();
        assert_eq!(doc.outer_html(id), "<pre title=\"a&quot;b\">A&lt;&gt;B</pre>");
    }

    #[test]
    fn element_by_id_finds_attached_node() {
        let doc = Document::new();
        let id = doc
            .append(doc.root(), NodeSpec::element("div").attr("id", "mermaid-1"))
            .unwrap();
        assert_eq!(doc.element_by_id("mermaid-1"), Some(id));
        assert_eq!(doc.element_by_id("mermaid-2"), None);
    }

    #[test]
    fn html_escape_handles_special_chars() {
        assert_eq!(html_escape("<>&\"'"), "&lt;&gt;&amp;&quot;&#39;");
    }

    // --- lifecycle ---

    #[test]
    fn ready_state_never_moves_backwards() {
        let doc = Document::new();
        doc.set_ready_state(ReadyState::Complete);
        doc.set_ready_state(ReadyState::Interactive);
        assert_eq!(doc.ready_state(), ReadyState::Complete);
    }

    #[tokio::test]
    async fn structure_parsed_waits_for_interactive() {
        let doc = Document::new();
        let waiter = {
            let doc = doc.clone();
            tokio::spawn(async move { doc.structure_parsed().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        doc.set_ready_state(ReadyState::Interactive);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("structure_parsed resolves")
            .unwrap();
    }

    // --- observation ---

    #[tokio::test]
    async fn observer_sees_insertions_under_target_only() {
        let doc = Document::new();
        let main = doc.append(doc.root(), NodeSpec::element("main")).unwrap();
        let aside = doc.append(doc.root(), NodeSpec::element("aside")).unwrap();
        let mut stream = doc.observe(main).unwrap();

        doc.append(aside, diagram("outside")).unwrap();
        let inner = doc.append(main, diagram("inside")).unwrap();

        let batch = stream.next().await.unwrap();
        assert_eq!(batch.added, vec![inner]);
        doc.disconnect(stream.id());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn append_all_is_one_batch() {
        let doc = Document::new();
        let mut stream = doc.observe(doc.root()).unwrap();
        let ids = doc
            .append_all(doc.root(), vec![diagram("a"), diagram("b")])
            .unwrap();
        assert_eq!(stream.next().await.unwrap().added, ids);
    }

    #[tokio::test]
    async fn wait_for_resolves_when_element_is_inserted_later() {
        let doc = Document::new();
        let waiter = {
            let doc = doc.clone();
            tokio::spawn(async move { doc.wait_for(&Selector::parse("main.content")).await })
        };
        tokio::task::yield_now().await;
        let main = doc
            .append(doc.root(), NodeSpec::element("main").attr("class", "content"))
            .unwrap();
        let found = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_for resolves")
            .unwrap();
        assert_eq!(found, main);
    }
}
