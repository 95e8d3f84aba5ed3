//
// content_provider.rs
//
// Access to the persisted content of documents
//
// Open documents are authoritative; the persisted copy is read only when a
// session has to be rebuilt after eviction and when a document is saved.
//

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use tower_lsp::lsp_types::Url;

/// Extensions an XML document is expected to have. Anything else is allowed
/// but logged.
const EXPECTED_EXTENSIONS: &[&str] = &["xml", "xsd", "csproj", "pom", "wsdl", "xsl", "xslt"];

/// Source of persisted document content
pub trait ContentProvider: Send + Sync {
    /// Read the persisted content behind `uri`
    fn read(&self, uri: &Url) -> anyhow::Result<String>;
}

/// Reads documents from the local file system
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskContentProvider;

impl DiskContentProvider {
    /// Resolve `uri` to the canonical path of an existing regular file.
    pub fn validate_uri(uri: &Url) -> anyhow::Result<PathBuf> {
        if uri.scheme() != "file" {
            bail!("Unsupported URI scheme '{}' for {}", uri.scheme(), uri);
        }
        let path = uri
            .to_file_path()
            .map_err(|_| anyhow!("URI does not name a local file: {}", uri))?;
        let resolved = path
            .canonicalize()
            .with_context(|| format!("Cannot resolve {}", path.display()))?;
        if !resolved.is_file() {
            bail!("Not a regular file: {}", resolved.display());
        }

        let extension = resolved
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());
        if let Some(extension) = extension {
            if !EXPECTED_EXTENSIONS.contains(&extension.as_str()) {
                log::warn!(
                    "Unexpected file extension for XML document: {}",
                    resolved.display()
                );
            }
        }
        Ok(resolved)
    }
}

impl ContentProvider for DiskContentProvider {
    fn read(&self, uri: &Url) -> anyhow::Result<String> {
        let path = Self::validate_uri(uri)?;
        fs::read_to_string(&path).with_context(|| format!("Could not read {}", path.display()))
    }
}
