//! Membership replay log
//!
//! A tree is rebuilt at startup by replaying the `(action, path)` entries a
//! node recorded while it ran. Storage is the caller's concern; anything that
//! can hand back the entries in order implements [`ReplaySource`].

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    address::NodePath,
    error::FleetResult,
    tree::NodeTree,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayAction {
    Add,
    Remove,
    Clean,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub action: ReplayAction,
    pub path: NodePath,
}

impl ReplayEntry {
    pub fn add(path: NodePath) -> Self {
        Self {
            action: ReplayAction::Add,
            path,
        }
    }

    pub fn remove(path: NodePath) -> Self {
        Self {
            action: ReplayAction::Remove,
            path,
        }
    }
}

/// Ordered supplier of replay entries.
pub trait ReplaySource: Send + Sync {
    fn load(&self) -> FleetResult<Vec<ReplayEntry>>;
}

/// In-memory replay log
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryReplayLog {
    entries: Vec<ReplayEntry>,
}

impl MemoryReplayLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: ReplayEntry) {
        self.entries.push(entry);
    }

    /// Record a `Clean` marker; replay empties the tree at this point.
    pub fn record_clean(&mut self) {
        self.entries.push(ReplayEntry {
            action: ReplayAction::Clean,
            path: NodePath::default(),
        });
    }

    pub fn entries(&self) -> &[ReplayEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> FleetResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> FleetResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl ReplaySource for MemoryReplayLog {
    fn load(&self) -> FleetResult<Vec<ReplayEntry>> {
        Ok(self.entries.clone())
    }
}

impl NodeTree {
    /// Rebuild a tree by replaying `entries` in order.
    ///
    /// `Add` re-adds the last segment of its path, `Remove` removes it and
    /// `Clean` empties the tree. An entry whose path does not parse aborts
    /// the replay.
    pub fn from_replay<I>(entries: I, fan_out: usize) -> FleetResult<Self>
    where
        I: IntoIterator<Item = ReplayEntry>,
    {
        let tree = NodeTree::with_fan_out(fan_out);
        tree.replay(entries)?;
        Ok(tree)
    }

    pub fn from_source(source: &dyn ReplaySource, fan_out: usize) -> FleetResult<Self> {
        Self::from_replay(source.load()?, fan_out)
    }

    /// Apply `entries` on top of the current contents.
    pub fn replay<I>(&self, entries: I) -> FleetResult<()>
    where
        I: IntoIterator<Item = ReplayEntry>,
    {
        let mut applied = 0usize;
        for entry in entries {
            match entry.action {
                ReplayAction::Add => {
                    let address = entry.path.node_info()?;
                    let placed = self.add(address);
                    if placed != entry.path {
                        warn!(
                            recorded = %entry.path,
                            placed = %placed,
                            "Replayed node landed on a different path"
                        );
                    }
                }
                ReplayAction::Remove => {
                    let address = entry.path.node_info()?;
                    self.remove(&address);
                }
                ReplayAction::Clean => self.clear(),
            }
            applied += 1;
        }
        debug!(applied, nodes = self.len(), "Replay finished");
        Ok(())
    }
}
