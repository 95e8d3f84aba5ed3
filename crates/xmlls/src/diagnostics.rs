//
// diagnostics.rs
//
// Validation passes and their translation into LSP diagnostics
//

use std::sync::OnceLock;

use regex::Regex;
use tower_lsp::lsp_types::{Diagnostic, DiagnosticSeverity, Position, Range};

use crate::schema::{Schema, ValidationError};
use crate::xml::XmlDocument;

pub const DIAGNOSTIC_SOURCE: &str = "xmlls";

struct MessagePatterns {
    child_position: Regex,
    line_column: Regex,
}

fn patterns() -> &'static MessagePatterns {
    static PATTERNS: OnceLock<MessagePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| MessagePatterns {
        child_position: Regex::new(r"position (\d+)").unwrap(),
        line_column: Regex::new(r": line (\d+), column (\d+)").unwrap(),
    })
}

/// Validate `content` against `schema` and return the diagnostics to
/// publish. An empty result clears earlier diagnostics.
pub fn validate_document(
    schema: &Schema,
    default_namespace: Option<&str>,
    content: &str,
) -> Vec<Diagnostic> {
    match schema.validate(content, default_namespace) {
        Ok(outcome) => {
            if outcome.is_valid() {
                log::info!("Validation against {} found no errors", schema.path().display());
                return Vec::new();
            }
            log::info!("Validation found {} errors", outcome.errors.len());
            outcome
                .errors
                .iter()
                .map(|error| schema_error_to_diagnostic(error, &outcome.document))
                .collect()
        }
        Err(err) => {
            log::info!("Document is not well-formed: {}", err);
            parser_error_to_diagnostic(&err.to_string())
                .into_iter()
                .collect()
        }
    }
}

/// Position a schema violation.
///
/// Defaults to the offending element's line; an unexpected-child error that
/// names a child position is moved to that child when it exists.
pub fn schema_error_to_diagnostic(error: &ValidationError, document: &XmlDocument) -> Diagnostic {
    let mut line = error.line.unwrap_or(1);

    if let (Some(reason), Some(parent)) = (error.reason.as_deref(), error.parent) {
        let index = patterns()
            .child_position
            .captures(reason)
            .and_then(|caps| caps[1].parse::<usize>().ok());
        if let Some(index) = index.filter(|i| *i > 0) {
            match document.element(parent).child(index - 1) {
                Some(child) => line = child.line(),
                None => log::trace!("No child at position {}, keeping line {}", index, line),
            }
        }
    }

    let position = Position::new(line.saturating_sub(1) as u32, 0);
    Diagnostic {
        range: Range {
            start: position,
            end: position,
        },
        severity: Some(DiagnosticSeverity::ERROR),
        source: Some(DIAGNOSTIC_SOURCE.to_string()),
        message: error.reason.clone().unwrap_or_else(|| error.message.clone()),
        ..Default::default()
    }
}

/// Recover a diagnostic from a parser error message ending in
/// `: line L, column C`. Other message shapes produce nothing.
pub fn parser_error_to_diagnostic(message: &str) -> Option<Diagnostic> {
    let Some(caps) = patterns().line_column.captures(message) else {
        log::error!("Unrecognized parser error: {}", message);
        return None;
    };
    let line: usize = caps[1].parse().ok()?;
    let column: usize = caps[2].parse().ok()?;
    let start = caps.get(0).map_or(message.len(), |m| m.start());

    let position = Position::new(
        line.saturating_sub(1) as u32,
        column.saturating_sub(1) as u32,
    );
    Some(Diagnostic {
        range: Range {
            start: position,
            end: position,
        },
        severity: Some(DiagnosticSeverity::ERROR),
        source: Some(DIAGNOSTIC_SOURCE.to_string()),
        message: message[..start].to_string(),
        ..Default::default()
    })
}
