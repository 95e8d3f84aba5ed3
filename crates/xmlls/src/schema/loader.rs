//
// schema/loader.rs
//
// XSD compiler: turns schema documents (plus their includes) into the
// arena model in schema/mod.rs
//

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use indexmap::IndexMap;

use super::{
    Derivation, ElementDecl, ElementId, Occurs, Particle, Schema, TypeDef, TypeId, TypeKind,
    XSD_NAMESPACE,
};
use crate::xml::{self, split_qname, Element, ExpandedName, NamedNode, NodeId, XmlDocument};

const ANY_SIMPLE_TYPE: TypeId = 0;
const ANY_TYPE: TypeId = 1;

pub(super) fn load(path: &Path) -> anyhow::Result<Schema> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Schema file not found: {}", path.display()))?;
    let text = fs::read_to_string(&canonical)
        .with_context(|| format!("Failed to read schema {}", canonical.display()))?;
    compile(&text, &canonical)
}

pub(super) fn compile(text: &str, location: &Path) -> anyhow::Result<Schema> {
    let mut docs = Vec::new();
    let mut visited = HashSet::new();
    visited.insert(location.to_path_buf());
    let main = parse_schema_document(text, location)?;
    let target_namespace = main
        .document
        .root()
        .attribute(None, "targetNamespace")
        .filter(|ns| !ns.is_empty())
        .map(str::to_string);
    docs.push(main);
    collect_includes(0, &mut docs, &mut visited, location)?;

    let mut compiler = Compiler::new(&docs, target_namespace.clone());
    compiler.compile_all();
    let Compiler {
        elements,
        types,
        globals,
        referenced,
        ..
    } = compiler;

    let mut root_elements: Vec<ElementId> = globals
        .values()
        .copied()
        .filter(|id| !referenced.contains(id))
        .collect();
    if root_elements.is_empty() {
        root_elements = globals.values().copied().collect();
    }

    log::info!(
        "Compiled schema {} ({} global elements, {} types)",
        location.display(),
        globals.len(),
        types.len()
    );

    Ok(Schema {
        path: location.to_path_buf(),
        target_namespace,
        elements,
        types,
        globals,
        root_elements,
    })
}

struct SchemaDocument {
    document: XmlDocument,
    location: PathBuf,
    qualified_elements: bool,
}

fn parse_schema_document(text: &str, location: &Path) -> anyhow::Result<SchemaDocument> {
    let document = xml::parse(text)
        .with_context(|| format!("Malformed schema document {}", location.display()))?;
    let root = document.root();
    if !is_xsd(root, "schema") {
        bail!(
            "{} is not an XML Schema (root element is {})",
            location.display(),
            root.expanded_name()
        );
    }
    let qualified_elements = root.attribute(None, "elementFormDefault") == Some("qualified");
    Ok(SchemaDocument {
        document,
        location: location.to_path_buf(),
        qualified_elements,
    })
}

/// Follow `xs:include` from `docs[index]`. Included files must stay inside
/// the directory of the top-level schema.
fn collect_includes(
    index: usize,
    docs: &mut Vec<SchemaDocument>,
    visited: &mut HashSet<PathBuf>,
    top_level: &Path,
) -> anyhow::Result<()> {
    let base_dir = docs[index]
        .location
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let allowed_dir = top_level.parent().unwrap_or(Path::new("/"));
    let locations: Vec<String> = docs[index]
        .document
        .root()
        .children()
        .filter(|c| is_xsd(*c, "include"))
        .filter_map(|c| c.attribute(None, "schemaLocation").map(str::to_string))
        .collect();

    for location in locations {
        let candidate = base_dir.join(&location);
        let canonical = candidate
            .canonicalize()
            .with_context(|| format!("Included schema not found: {}", candidate.display()))?;
        if !canonical.starts_with(allowed_dir) {
            log::warn!(
                "Ignoring include {} outside schema directory {}",
                canonical.display(),
                allowed_dir.display()
            );
            continue;
        }
        if !visited.insert(canonical.clone()) {
            continue;
        }
        let text = fs::read_to_string(&canonical)
            .with_context(|| format!("Failed to read included schema {}", canonical.display()))?;
        docs.push(parse_schema_document(&text, &canonical)?);
        let included = docs.len() - 1;
        collect_includes(included, docs, visited, top_level)?;
    }
    Ok(())
}

fn is_xsd(element: Element<'_>, local: &str) -> bool {
    element.namespace() == Some(XSD_NAMESPACE) && element.has_local_name(local)
}

type Source = (usize, NodeId);

struct Compiler<'d> {
    docs: &'d [SchemaDocument],
    target_namespace: Option<String>,
    elements: Vec<ElementDecl>,
    types: Vec<TypeDef>,
    globals: IndexMap<ExpandedName, ElementId>,
    referenced: HashSet<ElementId>,
    global_sources: Vec<(ElementId, Source)>,
    type_sources: HashMap<ExpandedName, Source>,
    group_sources: HashMap<ExpandedName, Source>,
    named_types: HashMap<ExpandedName, TypeId>,
    groups: HashMap<ExpandedName, Particle>,
    groups_in_progress: HashSet<ExpandedName>,
}

impl<'d> Compiler<'d> {
    fn new(docs: &'d [SchemaDocument], target_namespace: Option<String>) -> Self {
        let any_simple = TypeDef::simple(Some(ExpandedName::new(
            Some(XSD_NAMESPACE),
            "anySimpleType",
        )));
        let any_type = TypeDef {
            name: Some(ExpandedName::new(Some(XSD_NAMESPACE), "anyType")),
            kind: TypeKind::Complex,
            base: None,
            derivation: Derivation::None,
            content: Some(Particle::Any { occurs: Occurs::ANY }),
            mixed: true,
            required_attributes: Vec::new(),
        };

        Self {
            docs,
            target_namespace,
            elements: Vec::new(),
            types: vec![any_simple, any_type],
            globals: IndexMap::new(),
            referenced: HashSet::new(),
            global_sources: Vec::new(),
            type_sources: HashMap::new(),
            group_sources: HashMap::new(),
            named_types: HashMap::new(),
            groups: HashMap::new(),
            groups_in_progress: HashSet::new(),
        }
    }

    fn node(&self, (doc, id): Source) -> Element<'d> {
        let docs: &'d [SchemaDocument] = self.docs;
        docs[doc].document.element(id)
    }

    fn global_name(&self, local: &str) -> ExpandedName {
        ExpandedName::new(self.target_namespace.as_deref(), local)
    }

    fn compile_all(&mut self) {
        // Register every top-level component first so references resolve
        // regardless of declaration order.
        let docs: &'d [SchemaDocument] = self.docs;
        for (doc_index, doc) in docs.iter().enumerate() {
            for child in doc.document.root().children() {
                let Some(name) = child.attribute(None, "name") else {
                    continue;
                };
                let source = (doc_index, child.id());
                let qualified = self.global_name(name);
                if is_xsd(child, "element") {
                    if self.globals.contains_key(&qualified) {
                        log::warn!("Duplicate global element {}", qualified);
                        continue;
                    }
                    let id = self.elements.len();
                    self.elements.push(ElementDecl {
                        name: qualified.clone(),
                        type_id: None,
                        is_global: true,
                    });
                    self.globals.insert(qualified, id);
                    self.global_sources.push((id, source));
                } else if is_xsd(child, "complexType") || is_xsd(child, "simpleType") {
                    self.type_sources.insert(qualified, source);
                } else if is_xsd(child, "group") {
                    self.group_sources.insert(qualified, source);
                }
            }
        }

        let type_names: Vec<ExpandedName> = self.type_sources.keys().cloned().collect();
        for name in type_names {
            self.named_type(&name);
        }

        for (id, source) in self.global_sources.clone() {
            let type_id = self.element_type(source);
            self.elements[id].type_id = Some(type_id);
        }
    }

    /// Resolve a QName attribute value against the namespaces in scope at
    /// `context`.
    fn resolve_qname(&self, context: Element<'_>, raw: &str) -> ExpandedName {
        let (prefix, local) = split_qname(raw.trim());
        ExpandedName::new(context.lookup_namespace(prefix), local)
    }

    fn named_type(&mut self, name: &ExpandedName) -> Option<TypeId> {
        if let Some(&id) = self.named_types.get(name) {
            return Some(id);
        }
        let source = *self.type_sources.get(name)?;
        let node = self.node(source);
        if is_xsd(node, "simpleType") {
            let id = self.types.len();
            self.types.push(TypeDef::simple(Some(name.clone())));
            self.named_types.insert(name.clone(), id);
            return Some(id);
        }
        Some(self.complex_type(source, Some(name.clone())))
    }

    fn type_reference(&mut self, context: Element<'_>, raw: &str) -> TypeId {
        let name = self.resolve_qname(context, raw);
        if name.namespace.as_deref() == Some(XSD_NAMESPACE) {
            return if name.local == "anyType" {
                ANY_TYPE
            } else {
                ANY_SIMPLE_TYPE
            };
        }
        match self.named_type(&name) {
            Some(id) => id,
            None => {
                log::warn!("Unresolved type reference {}; treating as anyType", name);
                ANY_TYPE
            }
        }
    }

    /// Type of an element declaration: `type` attribute, inline anonymous
    /// type, or anyType.
    fn element_type(&mut self, source: Source) -> TypeId {
        let node = self.node(source);
        if let Some(raw) = node.attribute(None, "type") {
            return self.type_reference(node, raw);
        }
        for child in node.children() {
            if is_xsd(child, "complexType") {
                return self.complex_type((source.0, child.id()), None);
            }
            if is_xsd(child, "simpleType") {
                let id = self.types.len();
                self.types.push(TypeDef::simple(None));
                return id;
            }
        }
        ANY_TYPE
    }

    fn complex_type(&mut self, source: Source, name: Option<ExpandedName>) -> TypeId {
        let id = self.types.len();
        let mut def = TypeDef::simple(name.clone());
        def.kind = TypeKind::Complex;
        self.types.push(def);
        if let Some(name) = &name {
            // Registered before the body so self-referencing types terminate.
            self.named_types.insert(name.clone(), id);
        }

        let node = self.node(source);
        let mut mixed = node.attribute(None, "mixed") == Some("true");
        let mut base = None;
        let mut derivation = Derivation::None;
        let mut content = None;
        let mut required = Vec::new();

        for child in node.children() {
            if is_xsd(child, "complexContent") || is_xsd(child, "simpleContent") {
                mixed |= child.attribute(None, "mixed") == Some("true");
                let simple_content = is_xsd(child, "simpleContent");
                let Some(derived) = child
                    .children()
                    .find(|d| is_xsd(*d, "extension") || is_xsd(*d, "restriction"))
                else {
                    continue;
                };
                derivation = if is_xsd(derived, "extension") {
                    Derivation::Extension
                } else {
                    Derivation::Restriction
                };
                base = derived
                    .attribute(None, "base")
                    .map(|raw| self.type_reference(derived, raw));
                for item in derived.children() {
                    if !simple_content && content.is_none() {
                        content = self.particle((source.0, item.id()));
                    }
                    self.required_attribute(item, &mut required);
                }
            } else {
                if content.is_none() {
                    content = self.particle((source.0, child.id()));
                }
                self.required_attribute(child, &mut required);
            }
        }

        let def = &mut self.types[id];
        def.mixed = mixed;
        def.base = base;
        def.derivation = derivation;
        def.content = content;
        def.required_attributes = required;
        id
    }

    fn required_attribute(&self, node: Element<'_>, out: &mut Vec<ExpandedName>) {
        if !is_xsd(node, "attribute") || node.attribute(None, "use") != Some("required") {
            return;
        }
        if let Some(name) = node.attribute(None, "name") {
            let qualified = node.attribute(None, "form") == Some("qualified");
            out.push(if qualified {
                self.global_name(name)
            } else {
                ExpandedName::local(name)
            });
        } else if let Some(raw) = node.attribute(None, "ref") {
            out.push(self.resolve_qname(node, raw));
        }
    }

    fn particle(&mut self, source: Source) -> Option<Particle> {
        let node = self.node(source);
        if node.namespace() != Some(XSD_NAMESPACE) {
            return None;
        }
        let occurs = occurs(node);
        match node.local_name() {
            "element" => self.element_particle(source, occurs),
            "sequence" | "choice" | "all" => {
                let items = node
                    .children()
                    .filter_map(|child| self.particle((source.0, child.id())))
                    .collect();
                Some(match node.local_name() {
                    "sequence" => Particle::Sequence { items, occurs },
                    "choice" => Particle::Choice { items, occurs },
                    _ => Particle::All { items, occurs },
                })
            }
            "group" => {
                let raw = node.attribute(None, "ref")?;
                let name = self.resolve_qname(node, raw);
                let particle = self.group(&name)?;
                Some(with_occurs(particle, occurs))
            }
            "any" => Some(Particle::Any { occurs }),
            _ => None,
        }
    }

    fn element_particle(&mut self, source: Source, occurs: Occurs) -> Option<Particle> {
        let node = self.node(source);
        if let Some(raw) = node.attribute(None, "ref") {
            let name = self.resolve_qname(node, raw);
            let Some(&decl) = self.globals.get(&name) else {
                log::warn!("Unresolved element reference {}", name);
                return None;
            };
            self.referenced.insert(decl);
            return Some(Particle::Element { decl, occurs });
        }

        let local = node.attribute(None, "name")?;
        let qualified = match node.attribute(None, "form") {
            Some(form) => form == "qualified",
            None => self.docs[source.0].qualified_elements,
        };
        let name = if qualified {
            self.global_name(local)
        } else {
            ExpandedName::local(local)
        };

        let decl = self.elements.len();
        self.elements.push(ElementDecl {
            name,
            type_id: None,
            is_global: false,
        });
        let type_id = self.element_type(source);
        self.elements[decl].type_id = Some(type_id);
        Some(Particle::Element { decl, occurs })
    }

    fn group(&mut self, name: &ExpandedName) -> Option<Particle> {
        if let Some(particle) = self.groups.get(name) {
            return Some(particle.clone());
        }
        let Some(&source) = self.group_sources.get(name) else {
            log::warn!("Unresolved group reference {}", name);
            return None;
        };
        if !self.groups_in_progress.insert(name.clone()) {
            log::warn!("Circular group reference {}", name);
            return None;
        }
        let node = self.node(source);
        let particle = node
            .children()
            .find_map(|child| self.particle((source.0, child.id())));
        self.groups_in_progress.remove(name);
        if let Some(particle) = &particle {
            self.groups.insert(name.clone(), particle.clone());
        }
        particle
    }
}

fn occurs(node: Element<'_>) -> Occurs {
    let min = node
        .attribute(None, "minOccurs")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(1);
    let max = match node.attribute(None, "maxOccurs").map(str::trim) {
        Some("unbounded") => None,
        Some(v) => Some(v.parse().unwrap_or(1)),
        None => Some(1),
    };
    Occurs { min, max }
}

/// A group reference's own occurrence bounds replace the referenced model
/// group's
fn with_occurs(particle: Particle, occurs: Occurs) -> Particle {
    match particle {
        Particle::Sequence { items, .. } => Particle::Sequence { items, occurs },
        Particle::Choice { items, .. } => Particle::Choice { items, occurs },
        Particle::All { items, .. } => Particle::All { items, occurs },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::test_schemas::{compile as compile_str, PROJECT_NS, ROOT_AB};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_compiles_globals_and_anonymous_types() {
        let schema = compile_str(ROOT_AB);
        let root = schema.global_element(&ExpandedName::local("root")).unwrap();
        assert_eq!(schema.root_elements(), &[root]);
        let content = schema.element_type(root).unwrap().content.clone().unwrap();
        let names: Vec<String> = content
            .element_decls()
            .into_iter()
            .map(|d| schema.element(d).local_name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        match content {
            Particle::Sequence { items, .. } => {
                assert_eq!(items[0].occurs(), Occurs { min: 0, max: Some(1) });
                assert_eq!(items[1].occurs(), Occurs::ANY);
            }
            other => panic!("expected sequence, got {:?}", other),
        }
    }

    #[test]
    fn test_referenced_globals_are_not_roots() {
        let schema = compile_str(PROJECT_NS);
        let roots: Vec<String> = schema
            .root_elements()
            .iter()
            .map(|&id| schema.element(id).expanded_name().to_string())
            .collect();
        assert_eq!(roots, vec!["{urn:project}Project"]);
        assert_eq!(schema.target_namespace(), Some("urn:project"));
    }

    #[test]
    fn test_extension_records_base() {
        let schema = compile_str(PROJECT_NS);
        let name = ExpandedName::new(Some("urn:project"), "ItemGroupType");
        let id = *schema_types(&schema).get(&name).unwrap();
        let def = schema.type_def(id);
        assert_eq!(def.derivation, Derivation::Extension);
        let base = def.base.unwrap();
        assert_eq!(
            schema.type_def(base).name.as_ref().unwrap().local,
            "BaseGroup"
        );
        assert_eq!(schema.type_chain(id).len(), 2);
    }

    #[test]
    fn test_required_attributes_collected() {
        let schema = compile_str(PROJECT_NS);
        let import = schema
            .global_element(&ExpandedName::new(Some("urn:project"), "Import"))
            .unwrap();
        assert_eq!(
            schema.element_type(import).unwrap().required_attributes,
            vec![ExpandedName::local("Project")]
        );
    }

    #[test]
    fn test_recursive_types_terminate() {
        let schema = compile_str(
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="node" type="NodeType"/>
  <xs:complexType name="NodeType">
    <xs:sequence>
      <xs:element name="node" type="NodeType" minOccurs="0" maxOccurs="unbounded"/>
      <xs:group ref="Loop" minOccurs="0"/>
    </xs:sequence>
  </xs:complexType>
  <xs:group name="Loop">
    <xs:sequence><xs:group ref="Loop"/></xs:sequence>
  </xs:group>
</xs:schema>"#,
        );
        let node = schema.global_element(&ExpandedName::local("node")).unwrap();
        let type_id = schema.element(node).type_id.unwrap();
        let content = schema.type_def(type_id).content.clone().unwrap();
        let inner = content.element_decls()[0];
        assert_eq!(schema.element(inner).type_id, Some(type_id));
    }

    #[test]
    fn test_unknown_type_falls_back_to_any_type() {
        let schema = compile_str(
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="root" type="Missing"/>
</xs:schema>"#,
        );
        let root = schema.global_element(&ExpandedName::local("root")).unwrap();
        assert_eq!(schema.element(root).type_id, Some(ANY_TYPE));
    }

    #[test]
    fn test_rejects_non_schema_document() {
        let err = Schema::parse("<root/>", Path::new("/x/root.xsd")).unwrap_err();
        assert!(err.to_string().contains("not an XML Schema"));
        assert!(Schema::parse("<xs:schema", Path::new("/x/root.xsd")).is_err());
    }

    #[test]
    fn test_load_follows_includes() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("main.xsd"),
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:include schemaLocation="types.xsd"/>
  <xs:include schemaLocation="main.xsd"/>
  <xs:element name="root" type="RootType"/>
</xs:schema>"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("types.xsd"),
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:include schemaLocation="main.xsd"/>
  <xs:complexType name="RootType">
    <xs:sequence><xs:element name="leaf" type="xs:string"/></xs:sequence>
  </xs:complexType>
</xs:schema>"#,
        )
        .unwrap();

        let schema = Schema::load(&dir.path().join("main.xsd")).unwrap();
        let root = schema.global_element(&ExpandedName::local("root")).unwrap();
        let def = schema.element_type(root).unwrap();
        assert!(def.is_complex());
        assert_eq!(def.content.as_ref().unwrap().element_decls().len(), 1);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(Schema::load(&dir.path().join("absent.xsd")).is_err());
    }

    #[test]
    fn test_include_outside_schema_dir_ignored() {
        let outer = TempDir::new().unwrap();
        let inner = outer.path().join("schemas");
        fs::create_dir(&inner).unwrap();
        fs::write(
            outer.path().join("evil.xsd"),
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="evil"/>
</xs:schema>"#,
        )
        .unwrap();
        fs::write(
            inner.join("main.xsd"),
            r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:include schemaLocation="../evil.xsd"/>
  <xs:element name="root"/>
</xs:schema>"#,
        )
        .unwrap();

        let schema = Schema::load(&inner.join("main.xsd")).unwrap();
        assert!(schema.global_element(&ExpandedName::local("evil")).is_none());
        assert!(schema.global_element(&ExpandedName::local("root")).is_some());
    }

    fn schema_types(schema: &Schema) -> HashMap<ExpandedName, TypeId> {
        schema
            .types
            .iter()
            .enumerate()
            .filter_map(|(id, def)| def.name.clone().map(|n| (n, id)))
            .collect()
    }
}
