//! Ceres tree - the namespace of series nodes
//!
//! Dotted node names map one segment per directory under the tree root:
//! `servers.web1.cpu` lives in `<root>/servers/web1/cpu`. The root is marked
//! by a `.ceres-tree` directory which also holds tree-wide properties, one
//! file per key.

mod find;

pub use find::{Find, Walk};

use crate::node::{NodeMetadata, SeriesNode, SliceCachingBehavior};
use crate::{config, CeresError, Datapoint, Result, TimeSeriesData, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf, MAIN_SEPARATOR_STR};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Whether the tree keeps constructed nodes around
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeCachingBehavior {
    /// Build a fresh node handle on every lookup
    None,
    /// Keep every node handle for the life of the tree
    #[default]
    All,
}

impl FromStr for NodeCachingBehavior {
    type Err = CeresError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "all" => Ok(Self::All),
            other => Err(CeresError::InvalidConfiguration(format!(
                "invalid caching behavior '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for NodeCachingBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::All => "all",
        })
    }
}

/// Tree configuration, applied to every node the tree constructs
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Slice caching policy for new node handles
    pub slice_caching: SliceCachingBehavior,
    /// Node handle caching policy
    pub node_caching: NodeCachingBehavior,
    /// Largest gap in bytes a slice write will NaN-fill
    pub max_slice_gap: u64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            slice_caching: SliceCachingBehavior::default(),
            node_caching: NodeCachingBehavior::default(),
            max_slice_gap: config::MAX_SLICE_GAP,
        }
    }
}

/// A directory tree of series nodes
pub struct CeresTree {
    root: PathBuf,
    config: TreeConfig,
    node_caching: RwLock<NodeCachingBehavior>,
    nodes: RwLock<HashMap<String, Arc<SeriesNode>>>,
}

impl CeresTree {
    /// Open an existing tree with default configuration
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(root, TreeConfig::default())
    }

    /// Open an existing tree
    pub fn open_with_config(root: impl AsRef<Path>, config: TreeConfig) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() || !root.join(config::TREE_MARKER).is_dir() {
            return Err(CeresError::InvalidConfiguration(format!(
                "Invalid root directory '{}'",
                root.display()
            )));
        }
        let root = fs::canonicalize(root)?;

        Ok(Self {
            root,
            node_caching: RwLock::new(config.node_caching),
            config,
            nodes: RwLock::new(HashMap::new()),
        })
    }

    /// Create a tree at `root` (or reuse one), writing the given properties
    pub fn create_tree(root: impl AsRef<Path>, properties: &[(&str, &str)]) -> Result<Self> {
        Self::create_tree_with_config(root, properties, TreeConfig::default())
    }

    /// Create a tree at `root` with explicit configuration
    pub fn create_tree_with_config(
        root: impl AsRef<Path>,
        properties: &[(&str, &str)],
        config: TreeConfig,
    ) -> Result<Self> {
        let marker = root.as_ref().join(config::TREE_MARKER);
        fs::create_dir_all(&marker)?;
        for (key, value) in properties {
            validate_property_key(key)?;
            fs::write(marker.join(key), value)?;
        }

        info!("Created tree: {}", root.as_ref().display());
        Self::open_with_config(root, config)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// All tree properties
    pub fn properties(&self) -> Result<BTreeMap<String, String>> {
        let mut properties = BTreeMap::new();
        for entry in fs::read_dir(self.root.join(config::TREE_MARKER))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let key = entry.file_name().to_string_lossy().into_owned();
            properties.insert(key, fs::read_to_string(entry.path())?);
        }
        Ok(properties)
    }

    /// A single tree property, if set
    pub fn property(&self, key: &str) -> Result<Option<String>> {
        validate_property_key(key)?;
        match fs::read_to_string(self.root.join(config::TREE_MARKER).join(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Directory for a dotted node name. Performs no I/O.
    pub fn get_filesystem_path(&self, name: &str) -> PathBuf {
        self.root.join(name.replace('.', MAIN_SEPARATOR_STR))
    }

    /// Dotted node name for a directory under the root
    pub fn get_node_path(&self, fs_path: impl AsRef<Path>) -> Result<String> {
        let fs_path = fs_path.as_ref();
        let absolute = if fs_path.is_absolute() {
            fs_path.to_path_buf()
        } else {
            std::env::current_dir()?.join(fs_path)
        };
        let absolute = fs::canonicalize(&absolute).unwrap_or(absolute);

        let relative = absolute.strip_prefix(&self.root).map_err(|_| {
            CeresError::InvalidRequest(format!(
                "path '{}' not beneath tree root '{}'",
                fs_path.display(),
                self.root.display()
            ))
        })?;
        let segments: Vec<_> = relative.iter().map(|s| s.to_string_lossy()).collect();
        Ok(segments.join("."))
    }

    /// True if the node's directory exists. Metadata is not checked.
    pub fn has_node(&self, name: &str) -> bool {
        self.get_filesystem_path(name).is_dir()
    }

    pub fn node_caching_behavior(&self) -> NodeCachingBehavior {
        *self.node_caching.read()
    }

    /// Switch node caching; `None` drops every cached node
    pub fn set_node_caching_behavior(&self, behavior: NodeCachingBehavior) {
        *self.node_caching.write() = behavior;
        if behavior == NodeCachingBehavior::None {
            self.nodes.write().clear();
        }
    }

    /// Look up a node, returning `None` if no valid node lives at `name`
    pub fn get_node(&self, name: &str) -> Option<Arc<SeriesNode>> {
        let caching = self.node_caching_behavior();
        if caching == NodeCachingBehavior::All {
            if let Some(node) = self.nodes.read().get(name) {
                return Some(node.clone());
            }
        }

        let fs_path = self.get_filesystem_path(name);
        if !SeriesNode::is_node_dir(&fs_path) {
            return None;
        }
        let node = Arc::new(SeriesNode::new(
            name,
            fs_path,
            self.config.slice_caching,
            self.config.max_slice_gap,
        ));
        if caching == NodeCachingBehavior::All {
            self.nodes
                .write()
                .entry(name.to_string())
                .or_insert_with(|| node.clone());
        }
        Some(node)
    }

    /// Create a node. Parent directories are created as needed.
    pub fn create_node(&self, name: &str, metadata: &NodeMetadata) -> Result<Arc<SeriesNode>> {
        validate_node_name(name)?;
        let node = Arc::new(SeriesNode::create(
            name,
            self.get_filesystem_path(name),
            metadata,
            self.config.slice_caching,
            self.config.max_slice_gap,
        )?);
        if self.node_caching_behavior() == NodeCachingBehavior::All {
            self.nodes.write().insert(name.to_string(), node.clone());
        }
        Ok(node)
    }

    /// Lazily find nodes matching a glob-style dotted pattern.
    ///
    /// With a time range, only nodes holding data in that range are yielded.
    pub fn find(
        &self,
        pattern: &str,
        from_time: Option<Timestamp>,
        until_time: Option<Timestamp>,
    ) -> Result<Find<'_>> {
        Find::new(self, pattern, from_time, until_time)
    }

    /// Lazily visit every node in the tree, depth first
    pub fn walk(&self) -> Walk<'_> {
        Walk::new(self)
    }

    /// Write datapoints to an existing node
    pub fn store(&self, name: &str, datapoints: &[Datapoint]) -> Result<()> {
        let node = self
            .get_node(name)
            .ok_or_else(|| CeresError::NodeNotFound(name.to_string()))?;
        node.write(datapoints)
    }

    /// Read `[from_time, until_time)` from an existing node
    pub fn fetch(&self, name: &str, from_time: Timestamp, until_time: Timestamp) -> Result<TimeSeriesData> {
        let node = self
            .get_node(name)
            .ok_or_else(|| CeresError::NodeNotFound(name.to_string()))?;
        node.read(from_time, until_time)
    }
}

impl fmt::Debug for CeresTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CeresTree")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish()
    }
}

fn validate_node_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.split('.').all(|segment| {
            !segment.is_empty() && !segment.contains(['/', '\\']) && !segment.starts_with('.')
        });
    if !valid {
        return Err(CeresError::InvalidRequest(format!("invalid node name '{}'", name)));
    }
    Ok(())
}

fn validate_property_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('.') || key.contains(['/', '\\']) {
        return Err(CeresError::InvalidConfiguration(format!(
            "invalid tree property '{}'",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_tree() -> (TempDir, CeresTree) {
        let dir = TempDir::new().unwrap();
        let tree = CeresTree::create_tree(dir.path(), &[]).unwrap();
        (dir, tree)
    }

    #[test]
    fn test_open_requires_marker() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            CeresTree::open(dir.path()),
            Err(CeresError::InvalidConfiguration(_))
        ));
        assert!(CeresTree::open(dir.path().join("missing")).is_err());

        CeresTree::create_tree(dir.path(), &[]).unwrap();
        assert!(CeresTree::open(dir.path()).is_ok());
        // idempotent
        assert!(CeresTree::create_tree(dir.path(), &[]).is_ok());
    }

    #[test]
    fn test_tree_properties() {
        let dir = TempDir::new().unwrap();
        let tree = CeresTree::create_tree(dir.path(), &[("owner", "ops"), ("retention", "30d")]).unwrap();

        assert_eq!(tree.property("owner").unwrap().as_deref(), Some("ops"));
        assert_eq!(tree.property("missing").unwrap(), None);
        let properties = tree.properties().unwrap();
        assert_eq!(properties.len(), 2);
        assert_eq!(properties["retention"], "30d");

        assert!(CeresTree::create_tree(dir.path(), &[("../escape", "x")]).is_err());
    }

    #[test]
    fn test_path_mapping_round_trip() {
        let (_dir, tree) = new_tree();
        for name in ["cpu", "servers.web1.cpu", "a.b.c.d.e"] {
            let fs_path = tree.get_filesystem_path(name);
            assert!(fs_path.starts_with(tree.root()));
            assert_eq!(tree.get_node_path(&fs_path).unwrap(), name);
        }
        assert_eq!(
            tree.get_filesystem_path("servers.web1.cpu"),
            tree.root().join("servers").join("web1").join("cpu")
        );
    }

    #[test]
    fn test_node_path_outside_root() {
        let (_dir, tree) = new_tree();
        let other = TempDir::new().unwrap();
        assert!(matches!(
            tree.get_node_path(other.path()),
            Err(CeresError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_create_and_get_node() {
        let (_dir, tree) = new_tree();
        assert!(!tree.has_node("servers.web1.cpu"));
        assert!(tree.get_node("servers.web1.cpu").is_none());

        let created = tree.create_node("servers.web1.cpu", &NodeMetadata::new(10)).unwrap();
        assert!(tree.has_node("servers.web1.cpu"));
        // intermediate directories exist but are not nodes
        assert!(tree.has_node("servers.web1"));
        assert!(tree.get_node("servers.web1").is_none());

        let fetched = tree.get_node("servers.web1.cpu").unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
        assert_eq!(fetched.time_step().unwrap(), 10);

        assert!(tree.create_node("bad..name", &NodeMetadata::default()).is_err());
        assert!(tree.create_node("", &NodeMetadata::default()).is_err());
    }

    #[test]
    fn test_node_caching_behavior() {
        let (_dir, tree) = new_tree();
        tree.create_node("a.b", &NodeMetadata::default()).unwrap();

        tree.set_node_caching_behavior(NodeCachingBehavior::None);
        let first = tree.get_node("a.b").unwrap();
        let second = tree.get_node("a.b").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        tree.set_node_caching_behavior(NodeCachingBehavior::All);
        let first = tree.get_node("a.b").unwrap();
        let second = tree.get_node("a.b").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert_eq!("ALL".parse::<NodeCachingBehavior>().unwrap(), NodeCachingBehavior::All);
        assert!("latest".parse::<NodeCachingBehavior>().is_err());
    }

    #[test]
    fn test_default_slice_caching_applies_to_new_nodes() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig {
            slice_caching: SliceCachingBehavior::Latest,
            ..Default::default()
        };
        let tree = CeresTree::create_tree_with_config(dir.path(), &[], config).unwrap();
        let node = tree.create_node("x", &NodeMetadata::default()).unwrap();
        assert_eq!(node.slice_caching_behavior(), SliceCachingBehavior::Latest);
    }

    #[test]
    fn test_store_and_fetch() {
        let (_dir, tree) = new_tree();
        tree.create_node("servers.web1.cpu", &NodeMetadata::new(60)).unwrap();

        tree.store("servers.web1.cpu", &[(600, Some(1.0)), (660, None), (720, Some(3.0))])
            .unwrap();
        let series = tree.fetch("servers.web1.cpu", 600, 780).unwrap();
        assert_eq!(series.values(), &[Some(1.0), None, Some(3.0)]);

        assert!(matches!(
            tree.store("missing", &[(0, Some(1.0))]),
            Err(CeresError::NodeNotFound(_))
        ));
        assert!(matches!(
            tree.fetch("missing", 0, 60),
            Err(CeresError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_custom_max_slice_gap() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig {
            max_slice_gap: 0,
            ..Default::default()
        };
        let tree = CeresTree::create_tree_with_config(dir.path(), &[], config).unwrap();
        let node = tree.create_node("gappy", &NodeMetadata::new(60)).unwrap();

        node.write(&[(0, Some(1.0))]).unwrap();
        node.write(&[(120, Some(2.0))]).unwrap();
        assert_eq!(node.slice_info().unwrap().len(), 2);
    }
}
