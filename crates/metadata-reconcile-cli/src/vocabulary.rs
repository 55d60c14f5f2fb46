//! Controlled-vocabulary XML: nested `<node label="..">` elements grouped under
//! `<isComposedBy>`. The outermost node names the vocabulary itself and is not
//! a term.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use metadata_reconcile_core::transform::PATH_SEPARATOR;
use metadata_reconcile_core::PathRewrite;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

const NODE: &[u8] = b"node";
const CHILDREN: &[u8] = b"isComposedBy";

/// # Errors
/// Returns an error when the file cannot be read or parsed.
pub fn load_vocabulary(path: &Path) -> Result<Vec<PathRewrite>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read vocabulary {}", path.display()))?;
    let entries = parse_vocabulary(&content)
        .with_context(|| format!("invalid vocabulary {}", path.display()))?;
    tracing::info!(path = %path.display(), terms = entries.len(), "loaded vocabulary");
    Ok(entries)
}

/// One `(leaf, full_path)` entry per non-root term, in document order.
///
/// # Errors
/// Returns an error on malformed XML or a term without a `label`.
pub fn parse_vocabulary(content: &str) -> Result<Vec<PathRewrite>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    // (element name, whether it opened a term)
    let mut elements: Vec<(Vec<u8>, bool)> = Vec::new();
    // Labels of open terms; `None` for the root.
    let mut path: Vec<Option<String>> = Vec::new();
    let mut entries = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let is_term = opens_term(e, &elements);
                if is_term {
                    let label = term(e, &path, &mut entries, reader.buffer_position())?;
                    path.push(label);
                }
                elements.push((e.name().as_ref().to_vec(), is_term));
            }
            Ok(Event::Empty(ref e)) => {
                if opens_term(e, &elements) {
                    term(e, &path, &mut entries, reader.buffer_position())?;
                }
            }
            Ok(Event::End(_)) => {
                if let Some((_, true)) = elements.pop() {
                    path.pop();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => bail!("vocabulary XML parse error: {e}"),
            _ => {}
        }
    }

    Ok(entries)
}

fn opens_term(e: &BytesStart<'_>, elements: &[(Vec<u8>, bool)]) -> bool {
    e.name().as_ref() == NODE
        && match elements.last() {
            None => true,
            Some((parent, _)) => parent.as_slice() == CHILDREN,
        }
}

/// Record the term `e` under the open `path` and return what to push for it.
fn term(
    e: &BytesStart<'_>,
    path: &[Option<String>],
    entries: &mut Vec<PathRewrite>,
    position: impl std::fmt::Display,
) -> Result<Option<String>> {
    if path.is_empty() {
        return Ok(None);
    }

    let mut label = None;
    for attr in e.attributes().flatten() {
        if attr.key.0 == b"label" {
            label = Some(attr.unescape_value()?.trim().to_string());
        }
    }
    let Some(label) = label else {
        bail!("term without a label attribute at byte {position}");
    };

    let full_path = path
        .iter()
        .flatten()
        .map(String::as_str)
        .chain(std::iter::once(label.as_str()))
        .collect::<Vec<_>>()
        .join(PATH_SEPARATOR);
    entries.push(PathRewrite::new(&label, &full_path));
    Ok(Some(label))
}
