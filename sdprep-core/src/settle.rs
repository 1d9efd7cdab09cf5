//! Waiting for the kernel to publish partition device nodes.
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Looks up device nodes on the filesystem.
pub trait DeviceNodes: Send + Sync {
    /// `true` if `path` exists and is a block device.
    fn is_block_device(&self, path: &Path) -> bool;
}

/// Polls until every node in `nodes` is a block device.
///
/// Makes up to `attempts` checks spaced `interval` apart. Returns the nodes
/// still missing after the last check, or an empty list on success.
pub async fn wait_for_nodes(
    nodes: &dyn DeviceNodes,
    wanted: &[PathBuf],
    attempts: u32,
    interval: Duration,
) -> Vec<PathBuf> {
    let missing = |wanted: &[PathBuf]| -> Vec<PathBuf> {
        wanted
            .iter()
            .filter(|node| !nodes.is_block_device(node))
            .cloned()
            .collect()
    };

    let mut still_missing = missing(wanted);
    for attempt in 1..attempts.max(1) {
        if still_missing.is_empty() {
            break;
        }
        debug!(attempt, missing = ?still_missing, "partition nodes not ready");
        tokio::time::sleep(interval).await;
        still_missing = missing(wanted);
    }
    still_missing
}
