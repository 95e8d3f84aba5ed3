//
// config.rs
//
// Server settings from initialization options and configuration changes
//

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

/// Delay before the trailing validation after an edit
pub const DEFAULT_VALIDATION_DELAY: Duration = Duration::from_millis(4000);
/// Inactivity period after which a document session is dropped
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(180);
/// Maximum number of document sessions held at once
pub const DEFAULT_MAX_SESSIONS: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    /// Schema locators, tried in order
    pub locators: Vec<LocatorConfig>,
    pub validation_delay: Duration,
    pub session_ttl: Duration,
    pub max_sessions: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            locators: Vec::new(),
            validation_delay: DEFAULT_VALIDATION_DELAY,
            session_ttl: DEFAULT_SESSION_TTL,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// One configured schema locator.
///
/// Paths are stored as configured; relative paths are resolved against the
/// workspace root when the workspace builds its locators.
#[derive(Debug, Clone, PartialEq)]
pub enum LocatorConfig {
    /// `{rootElement: true, searchPaths: [dir...]}`
    RootElement { search_paths: Vec<PathBuf> },
    /// `{locationHint: mapFilePath}`
    LocationHint { map_path: PathBuf },
    /// `{patterns: [{pattern, path, useDefaultNamespace?}, ...]}`
    Patterns(Vec<PatternEntry>),
    /// Anything else; skipped with a warning at resolution time
    Unrecognized(Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternEntry {
    /// Glob matched against the document's file name
    pub pattern: String,
    /// Schema file to use on a match
    pub path: PathBuf,
    #[serde(default)]
    pub use_default_namespace: bool,
}

/// Build settings from a JSON settings object.
///
/// Only fields present in `settings` are applied; everything else keeps its
/// default. A `null` or non-object payload yields the defaults.
pub fn parse_settings(settings: &Value) -> ServerSettings {
    let mut parsed = ServerSettings::default();
    if let Some(locators) = parse_locators(settings) {
        parsed.locators = locators;
    }
    if let Some(ms) = settings.get("validationDelayMs").and_then(|v| v.as_u64()) {
        parsed.validation_delay = Duration::from_millis(ms);
    }
    parsed
}

/// The `schemaLocators` list, if `settings` carries one
pub fn parse_locators(settings: &Value) -> Option<Vec<LocatorConfig>> {
    let entries = settings.get("schemaLocators")?;
    let Some(entries) = entries.as_array() else {
        log::warn!("schemaLocators is not a list: {}", entries);
        return Some(Vec::new());
    };
    Some(entries.iter().map(parse_locator).collect())
}

fn parse_locator(entry: &Value) -> LocatorConfig {
    let root_element = entry.get("rootElement").and_then(|v| v.as_bool());
    let search_paths = entry.get("searchPaths").and_then(|v| v.as_array());
    if let (Some(true), Some(paths)) = (root_element, search_paths) {
        return LocatorConfig::RootElement {
            search_paths: paths
                .iter()
                .filter_map(|p| p.as_str())
                .map(PathBuf::from)
                .collect(),
        };
    }

    if let Some(map_path) = entry.get("locationHint").and_then(|v| v.as_str()) {
        if !map_path.is_empty() {
            return LocatorConfig::LocationHint {
                map_path: PathBuf::from(map_path),
            };
        }
    }

    if let Some(patterns) = entry.get("patterns").and_then(|v| v.as_array()) {
        let entries = patterns
            .iter()
            .filter_map(|p| match PatternEntry::deserialize(p) {
                Ok(pattern) => Some(pattern),
                Err(err) => {
                    log::warn!("Skipping malformed pattern entry {}: {}", p, err);
                    None
                }
            })
            .collect();
        return LocatorConfig::Patterns(entries);
    }

    LocatorConfig::Unrecognized(entry.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_without_settings() {
        let settings = parse_settings(&Value::Null);
        assert_eq!(settings, ServerSettings::default());
        assert_eq!(settings.validation_delay, Duration::from_secs(4));
        assert_eq!(settings.session_ttl, Duration::from_secs(180));
        assert_eq!(settings.max_sessions, 128);
    }

    #[test]
    fn test_parses_every_locator_shape() {
        let settings = parse_settings(&json!({
            "schemaLocators": [
                { "rootElement": true, "searchPaths": ["schemas", "/opt/xsd"] },
                { "locationHint": "schemas/schema_map.json" },
                { "patterns": [
                    { "pattern": "*.csproj", "path": "msbuild.xsd", "useDefaultNamespace": true },
                    { "pattern": "pom.xml", "path": "maven.xsd" }
                ]},
                { "somethingElse": 1 }
            ],
            "validationDelayMs": 250
        }));

        assert_eq!(settings.validation_delay, Duration::from_millis(250));
        assert_eq!(
            settings.locators[0],
            LocatorConfig::RootElement {
                search_paths: vec![PathBuf::from("schemas"), PathBuf::from("/opt/xsd")]
            }
        );
        assert_eq!(
            settings.locators[1],
            LocatorConfig::LocationHint {
                map_path: PathBuf::from("schemas/schema_map.json")
            }
        );
        match &settings.locators[2] {
            LocatorConfig::Patterns(entries) => {
                assert_eq!(entries.len(), 2);
                assert!(entries[0].use_default_namespace);
                assert!(!entries[1].use_default_namespace);
                assert_eq!(entries[1].path, PathBuf::from("maven.xsd"));
            }
            other => panic!("expected patterns, got {:?}", other),
        }
        assert!(matches!(settings.locators[3], LocatorConfig::Unrecognized(_)));
    }

    #[test]
    fn test_root_element_requires_flag_and_paths() {
        let locators = parse_locators(&json!({
            "schemaLocators": [
                { "rootElement": false, "searchPaths": ["x"] },
                { "rootElement": true }
            ]
        }))
        .unwrap();
        assert!(locators
            .iter()
            .all(|l| matches!(l, LocatorConfig::Unrecognized(_))));
    }

    #[test]
    fn test_missing_locators_is_none() {
        assert_eq!(parse_locators(&json!({ "other": true })), None);
        assert_eq!(parse_locators(&json!({ "schemaLocators": 3 })), Some(Vec::new()));
    }

    #[test]
    fn test_malformed_pattern_entries_skipped() {
        let locators = parse_locators(&json!({
            "schemaLocators": [{ "patterns": [{ "pattern": "*.xml" }, { "pattern": "a", "path": "b.xsd" }] }]
        }))
        .unwrap();
        assert_eq!(
            locators[0],
            LocatorConfig::Patterns(vec![PatternEntry {
                pattern: "a".into(),
                path: PathBuf::from("b.xsd"),
                use_default_namespace: false,
            }])
        );
    }
}
