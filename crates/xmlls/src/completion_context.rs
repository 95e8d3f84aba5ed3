//
// completion_context.rs
//
// Finds the element enclosing the cursor and the child elements the schema
// allows there. Works on half-typed documents by splicing a marker element
// at the cursor and parsing with recovery.
//

use std::collections::{BTreeSet, HashSet};

use ropey::Rope;
use tower_lsp::lsp_types::{CompletionItem, CompletionItemKind, Position};

use crate::position::offset_in_rope;
use crate::schema::{Derivation, ElementId, Schema, TypeId};
use crate::xml::{parse_recovering, ExpandedName, NamedNode};

/// Tag spliced in at the cursor. Never used by real documents.
pub const MARKER_TAG: &str = "completion_marker_fa6fb971-e37d-4316-84ed-27507cf687b8";

/// The document element that would contain an element inserted at the cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclosingElement {
    pub name: ExpandedName,
    pub prefix: Option<String>,
    /// 1-based source line
    pub line: usize,
}

impl EnclosingElement {
    /// Name as written in the document, prefix included
    pub fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", prefix, self.name.local),
            None => self.name.local.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionContext {
    pub parent: Option<EnclosingElement>,
    /// Sorted, without duplicates
    pub children: Vec<String>,
}

/// Resolve the completion context at `position`.
///
/// `default_namespace` applies when the document's root element has no
/// namespace of its own.
pub fn resolve_context(
    schema: &Schema,
    default_namespace: Option<&str>,
    content: &str,
    position: Position,
) -> CompletionContext {
    let mut rope = Rope::from_str(content);
    let offset = offset_in_rope(&rope, position);
    rope.insert(offset, &format!("<{}/>", MARKER_TAG));
    let marked = rope.to_string();

    let document = match parse_recovering(&marked) {
        Ok(document) => document,
        Err(err) => {
            log::info!("Could not parse document for completion: {}", err);
            return CompletionContext::default();
        }
    };

    let Some(marker) = document.find(|e| e.has_local_name(MARKER_TAG)) else {
        log::trace!("Marker element not found in recovered tree");
        return CompletionContext::default();
    };
    let Some(parent) = marker.parent() else {
        log::trace!("Marker is the root element, nothing to complete");
        return CompletionContext::default();
    };

    let root = document.root();
    let effective_namespace = root.namespace().or(default_namespace);
    let enclosing = EnclosingElement {
        name: parent.expanded_name().clone(),
        prefix: parent.prefix().map(str::to_string),
        line: parent.line(),
    };

    let Some(decl) = find_declaration(schema, parent.local_name()) else {
        log::info!("No schema declaration for <{}>", parent.local_name());
        return CompletionContext {
            parent: Some(enclosing),
            children: Vec::new(),
        };
    };

    let mut names = BTreeSet::new();
    if let Some(type_id) = schema.element(decl).type_id {
        for child in allowed_children(schema, type_id) {
            let name = &schema.element(child).name;
            if name.namespace.as_deref() == effective_namespace {
                names.insert(name.local.clone());
            } else {
                names.insert(name.to_string());
            }
        }
    }

    CompletionContext {
        parent: Some(enclosing),
        children: names.into_iter().collect(),
    }
}

/// Depth-first search from the schema's root elements for a declaration
/// with the given local name.
fn find_declaration(schema: &Schema, local: &str) -> Option<ElementId> {
    let mut visited = HashSet::new();
    let mut stack: Vec<ElementId> = schema.root_elements().iter().rev().copied().collect();

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let decl = schema.element(id);
        if decl.has_local_name(local) {
            return Some(id);
        }
        if let Some(type_id) = decl.type_id {
            let children = allowed_children(schema, type_id);
            stack.extend(children.into_iter().rev().filter(|c| !visited.contains(c)));
        }
    }
    None
}

/// Child declarations of a type's content model, followed by those inherited
/// through extension.
fn allowed_children(schema: &Schema, type_id: TypeId) -> Vec<ElementId> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for id in schema.type_chain(type_id) {
        let def = schema.type_def(id);
        if let Some(content) = &def.content {
            out.extend(content.element_decls().into_iter().filter(|d| seen.insert(*d)));
        }
        if def.derivation != Derivation::Extension {
            break;
        }
    }
    out
}

/// Completion items for a resolved context: an open tag per allowed child
/// and a close tag for the enclosing element.
pub fn completion_items(context: &CompletionContext) -> Vec<CompletionItem> {
    let mut items: Vec<CompletionItem> = context
        .children
        .iter()
        .map(|name| CompletionItem {
            label: name.clone(),
            kind: Some(CompletionItemKind::STRUCT),
            insert_text: Some(format!("<{}>", name)),
            ..Default::default()
        })
        .collect();

    if let Some(parent) = &context.parent {
        items.push(CompletionItem {
            label: format!("close {}", parent.name.local),
            kind: Some(CompletionItemKind::STRUCT),
            insert_text: Some(format!("</{}>", parent.qualified_name())),
            ..Default::default()
        });
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::test_schemas::{compile, PROJECT_NS, ROOT_AB};

    fn children(schema: &Schema, default_ns: Option<&str>, content: &str, pos: Position) -> Vec<String> {
        resolve_context(schema, default_ns, content, pos).children
    }

    #[test]
    fn test_children_inside_root() {
        let schema = compile(ROOT_AB);
        let context = resolve_context(&schema, None, "<root></root>", Position::new(0, 6));
        assert_eq!(context.children, vec!["a", "b"]);
        assert_eq!(context.parent.unwrap().name, ExpandedName::local("root"));
    }

    #[test]
    fn test_self_closing_root_has_no_parent() {
        let schema = compile(ROOT_AB);
        // Cursor before the root: the marker becomes the root element
        let context = resolve_context(&schema, None, "<root/>", Position::new(0, 0));
        assert_eq!(context, CompletionContext::default());
    }

    #[test]
    fn test_nested_element_with_simple_type() {
        let schema = compile(ROOT_AB);
        let context = resolve_context(&schema, None, "<root><a></a></root>", Position::new(0, 9));
        assert_eq!(context.parent.unwrap().name.local, "a");
        assert!(context.children.is_empty());
    }

    #[test]
    fn test_malformed_document_still_resolves() {
        let schema = compile(ROOT_AB);
        let context = resolve_context(&schema, None, "<root><a></root>", Position::new(0, 9));
        assert!(context.parent.is_some());
    }

    #[test]
    fn test_after_typed_lt() {
        let schema = compile(ROOT_AB);
        let context = resolve_context(&schema, None, "<root>\n  <\n</root>", Position::new(1, 3));
        assert_eq!(context.parent.as_ref().unwrap().name.local, "root");
        assert_eq!(context.children, vec!["a", "b"]);
        assert_eq!(completion_items(&context).len(), 3);
    }

    #[test]
    fn test_after_partial_name() {
        let schema = compile(ROOT_AB);
        let context = resolve_context(&schema, None, "<root>\n  <a\n</root>", Position::new(1, 4));
        assert_eq!(context.parent.unwrap().name.local, "root");
        assert_eq!(context.children, vec!["a", "b"]);
    }

    #[test]
    fn test_empty_document_has_no_parent() {
        let schema = compile(ROOT_AB);
        let context = resolve_context(&schema, None, "", Position::new(0, 0));
        assert_eq!(context, CompletionContext::default());
    }

    #[test]
    fn test_unknown_parent_has_no_children() {
        let schema = compile(ROOT_AB);
        let context = resolve_context(&schema, None, "<root><zzz></zzz></root>", Position::new(0, 11));
        assert_eq!(context.parent.unwrap().name.local, "zzz");
        assert!(context.children.is_empty());
    }

    #[test]
    fn test_namespaced_document_uses_local_names() {
        let schema = compile(PROJECT_NS);
        let content = r#"<Project xmlns="urn:project"><ItemGroup></ItemGroup></Project>"#;
        assert_eq!(
            children(&schema, None, content, Position::new(0, 29)),
            vec!["Import", "ItemGroup"]
        );
        // Base content and extension content are both offered
        assert_eq!(
            children(&schema, None, content, Position::new(0, 40)),
            vec!["Item", "Note"]
        );
    }

    #[test]
    fn test_default_namespace_override() {
        let schema = compile(PROJECT_NS);
        let content = "<Project>\n  \n</Project>";
        assert_eq!(
            children(&schema, None, content, Position::new(1, 2)),
            vec!["{urn:project}Import", "{urn:project}ItemGroup"]
        );
        assert_eq!(
            children(&schema, Some("urn:project"), content, Position::new(1, 2)),
            vec!["Import", "ItemGroup"]
        );
    }

    #[test]
    fn test_recursive_content_terminates() {
        let schema = compile(
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:complexType name="Node">
    <xs:sequence>
      <xs:element name="node" type="Node" minOccurs="0" maxOccurs="unbounded"/>
    </xs:sequence>
  </xs:complexType>
  <xs:element name="tree" type="Node"/>
</xs:schema>"#,
        );
        assert_eq!(
            children(&schema, None, "<tree><node><node></node></node></tree>", Position::new(0, 18)),
            vec!["node"]
        );
        assert!(children(&schema, None, "<tree><missing></missing></tree>", Position::new(0, 15)).is_empty());
    }

    #[test]
    fn test_items_include_close_tag() {
        let context = CompletionContext {
            parent: Some(EnclosingElement {
                name: ExpandedName::new(Some("urn:x"), "root"),
                prefix: Some("p".to_string()),
                line: 1,
            }),
            children: vec!["a".to_string(), "b".to_string()],
        };
        let items = completion_items(&context);
        let inserts: Vec<_> = items.iter().filter_map(|i| i.insert_text.as_deref()).collect();
        assert_eq!(inserts, vec!["<a>", "<b>", "</p:root>"]);
        assert_eq!(items[2].label, "close root");
        assert!(items.iter().all(|i| i.kind == Some(CompletionItemKind::STRUCT)));

        assert!(completion_items(&CompletionContext::default()).is_empty());
    }
}
