//! Lazy node discovery

use super::CeresTree;
use crate::node::SeriesNode;
use crate::{CeresError, Result, Timestamp};
use glob::{MatchOptions, Paths, Pattern};
use std::fs;
use std::path::{Path, PathBuf, MAIN_SEPARATOR_STR};
use std::sync::Arc;

/// Nodes matching a glob pattern, produced one at a time.
///
/// Each call to [`CeresTree::find`] starts a fresh scan; an exhausted
/// `Find` cannot be rewound.
pub struct Find<'a> {
    tree: &'a CeresTree,
    paths: Paths,
    from_time: Option<Timestamp>,
    until_time: Option<Timestamp>,
}

impl<'a> Find<'a> {
    pub(super) fn new(
        tree: &'a CeresTree,
        pattern: &str,
        from_time: Option<Timestamp>,
        until_time: Option<Timestamp>,
    ) -> Result<Self> {
        let root = tree.root().to_str().ok_or_else(|| {
            CeresError::InvalidConfiguration(format!(
                "tree root '{}' is not valid UTF-8",
                tree.root().display()
            ))
        })?;
        let full_pattern = format!(
            "{}{}{}",
            Pattern::escape(root),
            MAIN_SEPARATOR_STR,
            pattern.replace('.', MAIN_SEPARATOR_STR)
        );
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: true,
        };

        Ok(Self {
            tree,
            paths: glob::glob_with(&full_pattern, options)?,
            from_time,
            until_time,
        })
    }

    fn matches_interval(&self, node: &SeriesNode) -> Result<bool> {
        if self.from_time.is_none() && self.until_time.is_none() {
            return Ok(true);
        }
        node.has_data_for_interval(self.from_time, self.until_time)
    }
}

impl Iterator for Find<'_> {
    type Item = Result<Arc<SeriesNode>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let path = match self.paths.next()? {
                Ok(path) => path,
                Err(e) => return Some(Err(e.into_error().into())),
            };
            if !SeriesNode::is_node_dir(&path) {
                continue;
            }
            let name = match self.tree.get_node_path(&path) {
                Ok(name) => name,
                Err(e) => return Some(Err(e)),
            };
            let Some(node) = self.tree.get_node(&name) else {
                continue;
            };
            match self.matches_interval(&node) {
                Ok(true) => return Some(Ok(node)),
                Ok(false) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Every node in a tree, depth first in name order
pub struct Walk<'a> {
    tree: &'a CeresTree,
    pending: Vec<PathBuf>,
}

impl<'a> Walk<'a> {
    pub(super) fn new(tree: &'a CeresTree) -> Self {
        Self {
            tree,
            pending: vec![tree.root().to_path_buf()],
        }
    }

    /// Queue the visible subdirectories of `dir`
    fn descend(&mut self, dir: &Path) -> Result<()> {
        let mut children = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if entry.file_type()?.is_dir() {
                children.push(entry.path());
            }
        }
        children.sort_unstable_by(|a, b| b.cmp(a));
        self.pending.extend(children);
        Ok(())
    }
}

impl Iterator for Walk<'_> {
    type Item = Result<Arc<SeriesNode>>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(dir) = self.pending.pop() {
            if let Err(e) = self.descend(&dir) {
                return Some(Err(e));
            }
            if dir == self.tree.root() || !SeriesNode::is_node_dir(&dir) {
                continue;
            }
            let name = match self.tree.get_node_path(&dir) {
                Ok(name) => name,
                Err(e) => return Some(Err(e)),
            };
            if let Some(node) = self.tree.get_node(&name) {
                return Some(Ok(node));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use crate::{CeresTree, NodeMetadata};
    use tempfile::TempDir;

    fn names(nodes: impl Iterator<Item = crate::Result<std::sync::Arc<crate::SeriesNode>>>) -> Vec<String> {
        nodes.map(|n| n.unwrap().name().to_string()).collect()
    }

    fn populated_tree() -> (TempDir, CeresTree) {
        let dir = TempDir::new().unwrap();
        let tree = CeresTree::create_tree(dir.path(), &[]).unwrap();
        for name in ["servers.web1.cpu", "servers.web2.cpu", "servers.web2.mem", "servers.db1.cpu"] {
            tree.create_node(name, &NodeMetadata::new(60)).unwrap();
        }
        (dir, tree)
    }

    #[test]
    fn test_find_pattern() {
        let (_dir, tree) = populated_tree();

        let found = names(tree.find("servers.*.cpu", None, None).unwrap());
        assert_eq!(found, vec!["servers.db1.cpu", "servers.web1.cpu", "servers.web2.cpu"]);

        let found = names(tree.find("servers.web?.*", None, None).unwrap());
        assert_eq!(found.len(), 3);

        // intermediate directories are not nodes
        assert!(names(tree.find("servers.*", None, None).unwrap()).is_empty());
        assert!(names(tree.find("nothing.*", None, None).unwrap()).is_empty());
    }

    #[test]
    fn test_find_with_time_filter() {
        let (_dir, tree) = populated_tree();
        tree.store("servers.web1.cpu", &[(600, Some(1.0)), (660, Some(2.0))]).unwrap();
        tree.store("servers.web2.cpu", &[(6000, Some(1.0))]).unwrap();

        let found = names(tree.find("servers.*.cpu", Some(0), Some(700)).unwrap());
        assert_eq!(found, vec!["servers.web1.cpu"]);

        let found = names(tree.find("servers.*.cpu", Some(5000), None).unwrap());
        assert_eq!(found, vec!["servers.web2.cpu"]);
    }

    #[test]
    fn test_find_is_lazy() {
        let (_dir, tree) = populated_tree();
        let mut found = tree.find("servers.*.*", None, None).unwrap();
        assert_eq!(found.next().unwrap().unwrap().name(), "servers.db1.cpu");
        assert_eq!(found.count(), 3);
    }

    #[test]
    fn test_invalid_pattern() {
        let (_dir, tree) = populated_tree();
        assert!(tree.find("servers.[", None, None).is_err());
    }

    #[test]
    fn test_walk() {
        let (_dir, tree) = populated_tree();
        tree.create_node("servers.web1", &NodeMetadata::new(60)).unwrap();

        let walked = names(tree.walk());
        assert_eq!(
            walked,
            vec![
                "servers.db1.cpu",
                "servers.web1",
                "servers.web1.cpu",
                "servers.web2.cpu",
                "servers.web2.mem",
            ]
        );
    }
}
