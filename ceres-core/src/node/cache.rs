//! Slice list caching policies

use crate::slice::Slice;
use crate::CeresError;
use std::fmt;
use std::str::FromStr;

/// How much of a node's slice list is kept in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SliceCachingBehavior {
    /// List the node directory on every access (safest, slowest)
    #[default]
    None,
    /// Cache the full slice list until explicitly cleared
    All,
    /// Cache only the newest slice; list older ones only when asked for
    Latest,
}

impl FromStr for SliceCachingBehavior {
    type Err = CeresError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "all" => Ok(Self::All),
            "latest" => Ok(Self::Latest),
            other => Err(CeresError::InvalidConfiguration(format!(
                "invalid caching behavior '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SliceCachingBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::All => "all",
            Self::Latest => "latest",
        };
        f.write_str(name)
    }
}

/// Cached slice state, one variant per policy
#[derive(Debug)]
pub(crate) enum SliceCache {
    None,
    All(Option<Vec<Slice>>),
    Latest(Option<Slice>),
}

/// What the cache already knows when an iteration starts
#[derive(Debug)]
pub(crate) enum Snapshot {
    /// Nothing cached; the directory must be listed
    Unknown,
    /// Newest slice known; older ones still need a listing
    Head(Slice),
    /// Full list known; no listing needed
    Listed(Vec<Slice>),
}

impl SliceCache {
    pub(crate) fn new(behavior: SliceCachingBehavior) -> Self {
        match behavior {
            SliceCachingBehavior::None => Self::None,
            SliceCachingBehavior::All => Self::All(None),
            SliceCachingBehavior::Latest => Self::Latest(None),
        }
    }

    pub(crate) fn behavior(&self) -> SliceCachingBehavior {
        match self {
            Self::None => SliceCachingBehavior::None,
            Self::All(_) => SliceCachingBehavior::All,
            Self::Latest(_) => SliceCachingBehavior::Latest,
        }
    }

    /// Drop whatever is cached, keeping the policy
    pub(crate) fn invalidate(&mut self) {
        match self {
            Self::None => {}
            Self::All(slices) => *slices = None,
            Self::Latest(slice) => *slice = None,
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        match self {
            Self::All(Some(slices)) => Snapshot::Listed(slices.clone()),
            Self::Latest(Some(latest)) => Snapshot::Head(latest.clone()),
            _ => Snapshot::Unknown,
        }
    }

    /// Remember a fresh directory listing (newest first) if the policy
    /// wants it and nothing is cached yet
    pub(crate) fn install(&mut self, listing: &[Slice]) {
        match self {
            Self::None => {}
            Self::All(cached) => {
                if cached.is_none() {
                    *cached = Some(listing.to_vec());
                }
            }
            Self::Latest(cached) => {
                if cached.is_none() {
                    *cached = listing.first().cloned();
                }
            }
        }
    }
}
