use std::path::{Path, PathBuf};

use tracing::warn;

use crate::{error::Result, page_key::PageKey};

const ANSWER_PREFIX: &str = "Page";
const ANSWER_SUFFIX: &str = "_answer.json";

/// One corpus page: an answer file and the text file beside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPage {
    pub key: PageKey,
    /// Extracted page text, `Page<N>.txt`.
    pub source_path: PathBuf,
    /// Ground-truth answer, `Page<N>_answer.json`.
    pub answer_path: PathBuf,
}

/// Parse the page number out of a `Page<N>_answer.json` file name.
///
/// Returns `None` for names that are not answer files at all and
/// `Some(Err(..))` for answer files whose number does not parse. Only the
/// canonical spelling is accepted: `Page01` or `Page+1` would alias
/// `Page1` and give two files the same page key.
fn parse_answer_name(name: &str) -> Option<std::result::Result<u32, String>> {
    let number = name
        .strip_prefix(ANSWER_PREFIX)?
        .strip_suffix(ANSWER_SUFFIX)?;
    Some(
        number
            .parse::<u32>()
            .ok()
            .filter(|&n| n > 0 && n.to_string() == number)
            .ok_or_else(|| number.to_string()),
    )
}

/// Recursively walk `root` and discover every answered page.
///
/// A page's document name is the path of its directory relative to
/// `root`, with `/` separators. Hidden files and directories are skipped,
/// as are answer files sitting directly in `root` and answer files whose
/// page number does not parse. Results are sorted by document, then page.
pub fn discover_pages(root: &Path) -> Result<Vec<DiscoveredPage>> {
    let canonical_root = root.canonicalize()?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, &mut results)?;
    results.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(results)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    results: &mut Vec<DiscoveredPage>,
) -> Result<()> {
    let entries = std::fs::read_dir(current)?;

    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        if name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            walk_dir(root, &path, results)?;
        } else if file_type.is_symlink() {
            let Ok(resolved) = path.canonicalize() else {
                continue;
            };
            if resolved.starts_with(root) && resolved.is_dir() {
                continue;
            }
            if resolved.is_dir() {
                walk_dir(root, &path, results)?;
            } else if resolved.is_file() {
                push_page(root, current, &name, results);
            }
        } else if file_type.is_file() {
            push_page(root, current, &name, results);
        }
    }

    Ok(())
}

fn push_page(
    root: &Path,
    dir: &Path,
    name: &str,
    results: &mut Vec<DiscoveredPage>,
) {
    let Some(parsed) = parse_answer_name(name) else {
        return;
    };
    let answer_path = dir.join(name);
    let page = match parsed {
        Ok(page) => page,
        Err(bad) => {
            warn!(path = %answer_path.display(), number = %bad, "unparsable page number, skipping");
            return;
        }
    };

    let document = dir
        .strip_prefix(root)
        .unwrap_or(dir)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if document.is_empty() {
        warn!(path = %answer_path.display(), "answer file outside a document folder, skipping");
        return;
    }

    results.push(DiscoveredPage {
        key: PageKey::new(document, page),
        source_path: dir.join(format!("{ANSWER_PREFIX}{page}.txt")),
        answer_path,
    });
}
