//
// workspace/locators.rs
//
// Strategies that find the schema governing a document
//

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use serde_json::Value;
use tower_lsp::lsp_types::Url;

use super::path_resolve::{
    canonical_dir, canonical_or_raw, contained_file, is_safe_file_stem, is_safe_relative,
    resolve_against,
};
use crate::config::{LocatorConfig, PatternEntry};
use crate::xml::{NamedNode, XmlDocument, XSI_NAMESPACE};

/// What a locator gets to look at
pub struct LocatorInput<'a> {
    pub uri: &'a Url,
    /// Best-effort parse of the document
    pub document: &'a XmlDocument,
    pub workspace_root: Option<&'a Path>,
}

impl LocatorInput<'_> {
    fn document_path(&self) -> Option<PathBuf> {
        self.uri.to_file_path().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaCandidate {
    pub path: PathBuf,
    /// Validate un-namespaced documents as if they used the schema's
    /// target namespace
    pub use_default_namespace: bool,
}

impl SchemaCandidate {
    fn plain(path: PathBuf) -> Self {
        Self {
            path,
            use_default_namespace: false,
        }
    }
}

pub trait SchemaLocator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Propose a schema path for the document, or `None` to let the next
    /// locator try
    fn locate(&self, input: &LocatorInput<'_>) -> Option<SchemaCandidate>;
}

/// Build locators from configuration; relative paths resolve against
/// `root`.
pub fn build_locators(configs: &[LocatorConfig], root: Option<&Path>) -> Vec<Box<dyn SchemaLocator>> {
    configs
        .iter()
        .map(|config| -> Box<dyn SchemaLocator> {
            match config {
                LocatorConfig::RootElement { search_paths } => Box::new(RootElementLocator {
                    search_paths: search_paths
                        .iter()
                        .map(|p| resolve_against(root, p))
                        .collect(),
                }),
                LocatorConfig::LocationHint { map_path } => Box::new(LocationHintLocator {
                    map_path: resolve_against(root, map_path),
                }),
                LocatorConfig::Patterns(entries) => {
                    Box::new(FilenamePatternLocator::new(entries, root))
                }
                LocatorConfig::Unrecognized(raw) => Box::new(UnrecognizedLocator {
                    raw: raw.clone(),
                }),
            }
        })
        .collect()
}

// ============================================================================
// Root element
// ============================================================================

/// `<search-dir>/<root-local-name>.xsd`, first existing match wins
#[derive(Debug)]
pub struct RootElementLocator {
    pub search_paths: Vec<PathBuf>,
}

impl SchemaLocator for RootElementLocator {
    fn name(&self) -> &'static str {
        "rootElement"
    }

    fn locate(&self, input: &LocatorInput<'_>) -> Option<SchemaCandidate> {
        let root = input.document.root();
        let name = root.local_name();
        if !is_safe_file_stem(name) {
            log::warn!("Rejected unsafe root element name {:?} for {}", name, input.uri);
            return None;
        }

        let file_name = format!("{}.xsd", name);
        for search_path in &self.search_paths {
            let Some(dir) = canonical_dir(search_path) else {
                continue;
            };
            if let Some(path) = contained_file(&dir, &dir.join(&file_name)) {
                log::info!("Found schema for {} at {}", name, path.display());
                return Some(SchemaCandidate::plain(path));
            }
        }
        None
    }
}

// ============================================================================
// Location hint
// ============================================================================

/// `xsi:schemaLocation` / `xsi:noNamespaceSchemaLocation` tokens, either
/// direct file references or keys of a JSON schema map
#[derive(Debug)]
pub struct LocationHintLocator {
    pub map_path: PathBuf,
}

impl LocationHintLocator {
    fn load_map(&self) -> Option<(PathBuf, HashMap<String, String>)> {
        let text = match fs::read_to_string(&self.map_path) {
            Ok(text) => text,
            Err(err) => {
                log::trace!("No schema map at {}: {}", self.map_path.display(), err);
                return None;
            }
        };
        let parsed: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                log::error!(
                    "Error processing schema map {}: {}",
                    self.map_path.display(),
                    err
                );
                return None;
            }
        };
        let entries = parsed
            .as_object()?
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect();
        let dir = canonical_dir(self.map_path.parent()?)?;
        Some((dir, entries))
    }

    /// A token naming a schema file directly: a `file:` URL or a relative
    /// path ending in `.xsd`
    fn direct_reference(token: &str, input: &LocatorInput<'_>) -> Option<PathBuf> {
        if token.starts_with("file:") {
            return Url::parse(token).ok()?.to_file_path().ok();
        }
        if token.contains("://") || !token.to_ascii_lowercase().ends_with(".xsd") {
            return None;
        }
        let doc_dir = input.document_path()?.parent()?.to_path_buf();
        Some(doc_dir.join(token))
    }

    /// Direct references stay inside the workspace root, or inside the
    /// document's own directory for documents outside every workspace.
    fn direct_container(input: &LocatorInput<'_>) -> Option<PathBuf> {
        let doc_dir = input.document_path()?.parent()?.to_path_buf();
        let doc_dir = canonical_dir(&doc_dir)?;
        match input.workspace_root.and_then(canonical_dir) {
            Some(root) if doc_dir.starts_with(&root) => Some(root),
            _ => Some(doc_dir),
        }
    }
}

impl SchemaLocator for LocationHintLocator {
    fn name(&self) -> &'static str {
        "locationHint"
    }

    fn locate(&self, input: &LocatorInput<'_>) -> Option<SchemaCandidate> {
        let root = input.document.root();
        let hints: Vec<&str> = [
            root.attribute(Some(XSI_NAMESPACE), "schemaLocation"),
            root.attribute(Some(XSI_NAMESPACE), "noNamespaceSchemaLocation"),
        ]
        .into_iter()
        .flatten()
        .flat_map(str::split_whitespace)
        .collect();
        if hints.is_empty() {
            return None;
        }

        let mut map = None;
        for hint in hints {
            if let Some(direct) = Self::direct_reference(hint, input) {
                let Some(container) = Self::direct_container(input) else {
                    continue;
                };
                if let Some(path) = contained_file(&container, &direct) {
                    log::info!("Schema hint '{}' refers to {}", hint, path.display());
                    return Some(SchemaCandidate::plain(path));
                }
                continue;
            }

            let (map_dir, entries) = &*map.get_or_insert_with(|| {
                self.load_map()
                    .unwrap_or_else(|| (PathBuf::new(), HashMap::new()))
            });
            let Some(value) = entries.get(hint) else {
                continue;
            };
            if !is_safe_relative(value) {
                log::warn!(
                    "Rejected schema map value {:?} for hint '{}': path traversal",
                    value,
                    hint
                );
                continue;
            }
            if let Some(path) = contained_file(map_dir, &map_dir.join(value.as_str())) {
                log::info!("Found schema hint '{}' pointing to {}", hint, path.display());
                return Some(SchemaCandidate::plain(path));
            }
        }
        None
    }
}

// ============================================================================
// File name patterns
// ============================================================================

/// Glob patterns over the document's file name, first match wins
#[derive(Debug)]
pub struct FilenamePatternLocator {
    patterns: Vec<(GlobMatcher, SchemaCandidate)>,
}

impl FilenamePatternLocator {
    pub fn new(entries: &[PatternEntry], root: Option<&Path>) -> Self {
        let patterns = entries
            .iter()
            .filter_map(|entry| match Glob::new(&entry.pattern) {
                Ok(glob) => Some((
                    glob.compile_matcher(),
                    SchemaCandidate {
                        path: resolve_against(root, &entry.path),
                        use_default_namespace: entry.use_default_namespace,
                    },
                )),
                Err(err) => {
                    log::warn!("Ignoring invalid pattern '{}': {}", entry.pattern, err);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    fn file_name(uri: &Url) -> Option<String> {
        match uri.to_file_path() {
            Ok(path) => Some(path.file_name()?.to_string_lossy().into_owned()),
            Err(_) => uri
                .path_segments()?
                .next_back()
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }
}

impl SchemaLocator for FilenamePatternLocator {
    fn name(&self) -> &'static str {
        "patterns"
    }

    fn locate(&self, input: &LocatorInput<'_>) -> Option<SchemaCandidate> {
        let file_name = Self::file_name(input.uri)?;
        let (matcher, candidate) = self
            .patterns
            .iter()
            .find(|(matcher, _)| matcher.is_match(&file_name))?;
        // Canonical so every spelling of a schema path shares one cache entry
        let path = canonical_or_raw(&candidate.path);
        log::info!(
            "Pattern '{}' matched '{}', using schema {}",
            matcher.glob(),
            file_name,
            path.display()
        );
        Some(SchemaCandidate {
            path,
            use_default_namespace: candidate.use_default_namespace,
        })
    }
}

// ============================================================================
// Unrecognized
// ============================================================================

#[derive(Debug)]
pub struct UnrecognizedLocator {
    raw: Value,
}

impl SchemaLocator for UnrecognizedLocator {
    fn name(&self) -> &'static str {
        "unrecognized"
    }

    fn locate(&self, _input: &LocatorInput<'_>) -> Option<SchemaCandidate> {
        log::warn!("Unrecognized locator type {}", self.raw);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_recovering;
    use tempfile::TempDir;

    fn locate_with(
        locator: &dyn SchemaLocator,
        uri: &Url,
        content: &str,
        root: Option<&Path>,
    ) -> Option<SchemaCandidate> {
        let document = parse_recovering(content).unwrap();
        locator.locate(&LocatorInput {
            uri,
            document: &document,
            workspace_root: root,
        })
    }

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_root_element_finds_schema_in_search_paths() {
        let ws = TempDir::new().unwrap();
        write(&ws.path().join("second/root.xsd"), "<x/>");
        let locator = RootElementLocator {
            search_paths: vec![ws.path().join("first"), ws.path().join("second")],
        };
        let uri = Url::from_file_path(ws.path().join("doc.xml")).unwrap();

        let found = locate_with(&locator, &uri, "<p:root xmlns:p='urn:p'/>", None).unwrap();
        assert_eq!(
            found.path,
            ws.path().join("second/root.xsd").canonicalize().unwrap()
        );
        assert!(locate_with(&locator, &uri, "<other/>", None).is_none());
    }

    #[test]
    fn test_root_element_rejects_traversal_names() {
        let ws = TempDir::new().unwrap();
        let locator = RootElementLocator {
            search_paths: vec![ws.path().to_path_buf()],
        };
        let uri = Url::from_file_path(ws.path().join("doc.xml")).unwrap();
        let document = crate::xml::parse_recovering("<a..b/>").unwrap();
        let input = LocatorInput {
            uri: &uri,
            document: &document,
            workspace_root: None,
        };
        assert!(locator.locate(&input).is_none());
    }

    #[test]
    fn test_root_element_symlink_escape_rejected() {
        #[cfg(unix)]
        {
            let outer = TempDir::new().unwrap();
            write(&outer.path().join("secret/root.xsd"), "<x/>");
            let search = outer.path().join("schemas");
            fs::create_dir(&search).unwrap();
            std::os::unix::fs::symlink(
                outer.path().join("secret/root.xsd"),
                search.join("root.xsd"),
            )
            .unwrap();
            let locator = RootElementLocator {
                search_paths: vec![search],
            };
            let uri = Url::from_file_path(outer.path().join("doc.xml")).unwrap();
            assert!(locate_with(&locator, &uri, "<root/>", None).is_none());
        }
    }

    #[test]
    fn test_location_hint_uses_schema_map() {
        let ws = TempDir::new().unwrap();
        write(
            &ws.path().join("schemas/schema_map.json"),
            r#"{ "urn:shop": "shop.xsd", "urn:evil": "../secret.xsd" }"#,
        );
        write(&ws.path().join("schemas/shop.xsd"), "<x/>");
        write(&ws.path().join("secret.xsd"), "<x/>");
        let locator = LocationHintLocator {
            map_path: ws.path().join("schemas/schema_map.json"),
        };
        let uri = Url::from_file_path(ws.path().join("doc.xml")).unwrap();

        let doc = format!(
            r#"<shop xmlns:xsi="{}" xsi:schemaLocation="urn:shop http://example.com/shop.xsd"/>"#,
            XSI_NAMESPACE
        );
        let found = locate_with(&locator, &uri, &doc, Some(ws.path())).unwrap();
        assert!(found.path.ends_with("schemas/shop.xsd"));

        let evil = format!(
            r#"<shop xmlns:xsi="{}" xsi:schemaLocation="urn:evil"/>"#,
            XSI_NAMESPACE
        );
        assert!(locate_with(&locator, &uri, &evil, Some(ws.path())).is_none());
    }

    #[test]
    fn test_location_hint_direct_reference_relative_to_document() {
        let ws = TempDir::new().unwrap();
        write(&ws.path().join("docs/local.xsd"), "<x/>");
        write(&ws.path().join("outside.xsd"), "<x/>");
        let locator = LocationHintLocator {
            map_path: ws.path().join("missing.json"),
        };
        let docs = ws.path().join("docs");
        let uri = Url::from_file_path(docs.join("doc.xml")).unwrap();

        let doc = format!(
            r#"<a xmlns:xsi="{}" xsi:noNamespaceSchemaLocation="local.xsd"/>"#,
            XSI_NAMESPACE
        );
        let found = locate_with(&locator, &uri, &doc, Some(ws.path())).unwrap();
        assert!(found.path.ends_with("docs/local.xsd"));

        // Inside the workspace root is fine, even one level up
        let up = format!(
            r#"<a xmlns:xsi="{}" xsi:noNamespaceSchemaLocation="../outside.xsd"/>"#,
            XSI_NAMESPACE
        );
        assert!(locate_with(&locator, &uri, &up, Some(ws.path())).is_some());
        // Without a workspace root the document directory is the limit
        assert!(locate_with(&locator, &uri, &up, None).is_none());
    }

    #[test]
    fn test_location_hint_without_attribute() {
        let locator = LocationHintLocator {
            map_path: PathBuf::from("/nonexistent/map.json"),
        };
        let uri = Url::parse("file:///ws/doc.xml").unwrap();
        assert!(locate_with(&locator, &uri, "<a/>", None).is_none());
    }

    #[test]
    fn test_patterns_first_match_wins() {
        let locator = FilenamePatternLocator::new(
            &[
                PatternEntry {
                    pattern: "*.csproj".into(),
                    path: PathBuf::from("msbuild.xsd"),
                    use_default_namespace: true,
                },
                PatternEntry {
                    pattern: "*".into(),
                    path: PathBuf::from("/abs/fallback.xsd"),
                    use_default_namespace: false,
                },
            ],
            Some(Path::new("/ws")),
        );
        let csproj = Url::parse("file:///ws/src/App.csproj").unwrap();
        let found = locate_with(&locator, &csproj, "<Project/>", None).unwrap();
        assert_eq!(found.path, PathBuf::from("/ws/msbuild.xsd"));
        assert!(found.use_default_namespace);

        let other = Url::parse("file:///ws/src/notes.xml").unwrap();
        let found = locate_with(&locator, &other, "<a/>", None).unwrap();
        assert_eq!(found.path, PathBuf::from("/abs/fallback.xsd"));
        assert!(!found.use_default_namespace);
    }

    #[test]
    fn test_patterns_canonicalize_existing_schema() {
        let ws = TempDir::new().unwrap();
        write(&ws.path().join("schemas/root.xsd"), "<x/>");
        std::os::unix::fs::symlink(ws.path().join("schemas/root.xsd"), ws.path().join("link.xsd"))
            .unwrap();
        let canonical = ws.path().join("schemas/root.xsd").canonicalize().unwrap();

        let locator = FilenamePatternLocator::new(
            &[
                PatternEntry {
                    pattern: "*.a".into(),
                    path: PathBuf::from("schemas/../schemas/root.xsd"),
                    use_default_namespace: false,
                },
                PatternEntry {
                    pattern: "*.b".into(),
                    path: PathBuf::from("link.xsd"),
                    use_default_namespace: false,
                },
            ],
            Some(ws.path()),
        );
        for name in ["doc.a", "doc.b"] {
            let uri = Url::from_file_path(ws.path().join(name)).unwrap();
            let found = locate_with(&locator, &uri, "<a/>", None).unwrap();
            assert_eq!(found.path, canonical);
        }
    }

    #[test]
    fn test_patterns_match_file_name_only() {
        let locator = FilenamePatternLocator::new(
            &[PatternEntry {
                pattern: "src*".into(),
                path: PathBuf::from("/x.xsd"),
                use_default_namespace: false,
            }],
            None,
        );
        let uri = Url::parse("file:///ws/src/doc.xml").unwrap();
        assert!(locate_with(&locator, &uri, "<a/>", None).is_none());
    }

    #[test]
    fn test_build_locators_preserves_order() {
        let locators = build_locators(
            &[
                LocatorConfig::Patterns(Vec::new()),
                LocatorConfig::Unrecognized(serde_json::json!({"x": 1})),
                LocatorConfig::RootElement {
                    search_paths: vec![PathBuf::from("schemas")],
                },
            ],
            Some(Path::new("/ws")),
        );
        let names: Vec<_> = locators.iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["patterns", "unrecognized", "rootElement"]);
    }
}
