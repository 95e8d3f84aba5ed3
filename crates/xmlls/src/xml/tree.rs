//
// xml/tree.rs
//
// Arena-backed element tree produced by the XML parser
//

use super::{ExpandedName, NamedNode};

/// Index of an element inside its owning [`XmlDocument`]
pub type NodeId = usize;

/// An attribute with its namespace already resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: ExpandedName,
    pub prefix: Option<String>,
    pub value: String,
}

/// Storage for a single element
#[derive(Debug, Clone)]
pub struct ElementNode {
    pub name: ExpandedName,
    pub prefix: Option<String>,
    pub attributes: Vec<Attribute>,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
    /// 1-based line of the start tag
    pub line: usize,
    /// `xmlns` declarations made on this element (prefix, uri)
    pub declarations: Vec<(Option<String>, String)>,
}

/// A parsed document.
///
/// Nodes live in a flat arena; parent/child links are indices. Elements that
/// the recovering parser saw outside the root element stay in the arena but
/// are unreachable from [`XmlDocument::root`].
#[derive(Debug, Clone)]
pub struct XmlDocument {
    nodes: Vec<ElementNode>,
    root: NodeId,
}

impl XmlDocument {
    pub(crate) fn from_parts(nodes: Vec<ElementNode>, root: NodeId) -> Self {
        Self { nodes, root }
    }

    pub fn root(&self) -> Element<'_> {
        self.element(self.root)
    }

    /// # Panics
    /// Panics if `id` did not come from this document.
    pub fn element(&self, id: NodeId) -> Element<'_> {
        assert!(id < self.nodes.len(), "node {id} out of range");
        Element { doc: self, id }
    }

    /// Depth-first search from the root for the first element matching `pred`
    pub fn find(&self, mut pred: impl FnMut(Element<'_>) -> bool) -> Option<Element<'_>> {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let element = self.element(id);
            if pred(element) {
                return Some(element);
            }
            stack.extend(self.nodes[id].children.iter().rev());
        }
        None
    }

    /// Number of elements reachable from the root
    pub fn element_count(&self) -> usize {
        let mut count = 0;
        self.find(|_| {
            count += 1;
            false
        });
        count
    }
}

/// Borrowed view of one element
#[derive(Clone, Copy)]
pub struct Element<'a> {
    doc: &'a XmlDocument,
    id: NodeId,
}

impl<'a> Element<'a> {
    fn node(&self) -> &'a ElementNode {
        &self.doc.nodes[self.id]
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn prefix(&self) -> Option<&'a str> {
        self.node().prefix.as_deref()
    }

    /// Source line (1-based) of the start tag
    pub fn line(&self) -> usize {
        self.node().line
    }

    pub fn parent(&self) -> Option<Element<'a>> {
        self.node().parent.map(|id| self.doc.element(id))
    }

    pub fn children(&self) -> impl Iterator<Item = Element<'a>> + 'a {
        let doc = self.doc;
        self.node().children.iter().map(move |&id| doc.element(id))
    }

    /// The `index`-th (0-based) child element
    pub fn child(&self, index: usize) -> Option<Element<'a>> {
        self.node()
            .children
            .get(index)
            .map(|&id| self.doc.element(id))
    }

    pub fn child_count(&self) -> usize {
        self.node().children.len()
    }

    /// Resolve a prefix through the declarations in scope at this element.
    /// `None` asks for the default namespace.
    pub fn lookup_namespace(&self, prefix: Option<&str>) -> Option<&'a str> {
        if prefix == Some("xml") {
            return Some(super::XML_NAMESPACE);
        }
        let mut current = Some(*self);
        while let Some(element) = current {
            let node = element.node();
            if let Some((_, uri)) = node
                .declarations
                .iter()
                .find(|(declared, _)| declared.as_deref() == prefix)
            {
                return Some(uri.as_str()).filter(|u| !u.is_empty());
            }
            current = element.parent();
        }
        None
    }

    pub fn attributes(&self) -> &'a [Attribute] {
        &self.node().attributes
    }

    /// Look up an attribute by namespace and local name
    pub fn attribute(&self, namespace: Option<&str>, local: &str) -> Option<&'a str> {
        self.node()
            .attributes
            .iter()
            .find(|a| a.name.local == local && a.name.namespace.as_deref() == namespace)
            .map(|a| a.value.as_str())
    }
}

impl NamedNode for Element<'_> {
    fn expanded_name(&self) -> &ExpandedName {
        &self.doc.nodes[self.id].name
    }
}

impl std::fmt::Debug for Element<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element")
            .field("name", &self.expanded_name().to_string())
            .field("line", &self.line())
            .finish()
    }
}
