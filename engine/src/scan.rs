//! Read-only directory size scanner
//!
//! A pure service for the UI's usage charts: aggregate sizes below a root,
//! with the tree detailed down to a bounded depth.

use liboxidisk::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How deep the returned tree goes; sizes below are aggregated.
const DETAIL_DEPTH: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirNode {
    pub name: String,
    /// Total bytes of everything below, following no symlinks
    pub size: u64,
    pub file_count: u64,
    pub children: Vec<DirNode>,
}

pub fn scan_directory(root: &Path) -> EngineResult<DirNode> {
    if !root.is_dir() {
        return Err(EngineError::InvalidInput {
            field: "path".into(),
            reason: format!("{} is not a directory", root.display()),
        });
    }
    Ok(scan(root, DETAIL_DEPTH))
}

fn scan(path: &Path, depth: usize) -> DirNode {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let mut node = DirNode {
        name,
        size: 0,
        file_count: 0,
        children: Vec::new(),
    };

    // Unreadable subtrees count as empty rather than failing the scan.
    let Ok(entries) = std::fs::read_dir(path) else {
        return node;
    };

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            let child = if depth > 0 {
                scan(&entry.path(), depth - 1)
            } else {
                aggregate(&entry.path())
            };
            node.size += child.size;
            node.file_count += child.file_count;
            if depth > 0 {
                node.children.push(child);
            }
        } else if let Ok(meta) = entry.metadata() {
            node.size += meta.len();
            node.file_count += 1;
        }
    }

    node.children.sort_by(|a, b| b.size.cmp(&a.size));
    node
}

/// Totals without building child nodes.
fn aggregate(path: &Path) -> DirNode {
    let mut size = 0;
    let mut file_count = 0;
    for entry in walkdir::WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .flatten()
    {
        if entry.file_type().is_file() {
            size += entry.metadata().map(|m| m.len()).unwrap_or(0);
            file_count += 1;
        }
    }
    DirNode {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        size,
        file_count,
        children: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_counts_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("small")).unwrap();
        std::fs::create_dir(dir.path().join("large")).unwrap();
        std::fs::write(dir.path().join("small/a.txt"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("large/b.bin"), vec![0u8; 10_000]).unwrap();
        std::fs::write(dir.path().join("top.txt"), vec![0u8; 50]).unwrap();

        let tree = scan_directory(dir.path()).unwrap();
        assert_eq!(tree.size, 10_150);
        assert_eq!(tree.file_count, 3);
        assert_eq!(tree.children.len(), 2);
        // Largest first.
        assert_eq!(tree.children[0].name, "large");
    }

    #[test]
    fn test_scan_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x");
        std::fs::write(&file, b"x").unwrap();
        assert!(scan_directory(&file).is_err());
    }

    #[test]
    fn test_deep_tree_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a/b/c/d/e");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join("leaf.bin"), vec![0u8; 42]).unwrap();

        let tree = scan_directory(dir.path()).unwrap();
        assert_eq!(tree.size, 42);
        // Detail stops, totals do not.
        let a = &tree.children[0];
        assert_eq!(a.size, 42);
    }
}
