//! DRM node selection from the `debug {}` config section.

use std::collections::HashSet;
use std::path::Path;

use scanout_config::Config;
use smithay::backend::drm::{DrmNode, NodeType};

/// Resolves a node path from the config to its primary and render nodes.
///
/// Primary node paths are accepted too, with a warning.
pub(super) fn primary_node_from_render_node(path: &Path) -> Option<(DrmNode, DrmNode)> {
    match DrmNode::from_path(path) {
        Ok(node) => {
            if node.ty() == NodeType::Render {
                match node.node_with_type(NodeType::Primary) {
                    Some(Ok(primary_node)) => {
                        return Some((primary_node, node));
                    }
                    Some(Err(err)) => {
                        warn!("error opening primary node for render node {path:?}: {err:?}");
                    }
                    None => {
                        warn!("error opening primary node for render node {path:?}");
                    }
                }
            } else {
                warn!("DRM node {path:?} is not a render node");

                if let Some(Ok(render_node)) = node.node_with_type(NodeType::Render) {
                    return Some((node, render_node));
                }

                warn!("could not get render node for DRM node {path:?}; proceeding anyway");
                return Some((node, node));
            }
        }
        Err(err) => {
            warn!("error opening {path:?} as DRM node: {err:?}");
        }
    }

    None
}

pub(super) fn primary_node_from_config(config: &Config) -> Option<(DrmNode, DrmNode)> {
    let path = config.debug.render_drm_device.as_ref()?;
    debug!("attempting to use DRM device from config: {path:?}");

    primary_node_from_render_node(path)
}

/// Both nodes of every device the config tells us to leave alone.
pub(super) fn ignored_nodes_from_config(config: &Config) -> HashSet<DrmNode> {
    let mut ignored_nodes = HashSet::new();

    for path in &config.debug.ignored_drm_devices {
        if let Some((primary_node, render_node)) = primary_node_from_render_node(path) {
            ignored_nodes.insert(primary_node);
            ignored_nodes.insert(render_node);
        }
    }

    ignored_nodes
}

/// Removes the nodes of the device we drive from `ignored`. Returns whether any were there.
pub(super) fn keep_primary(
    ignored: &mut HashSet<DrmNode>,
    primary_node: DrmNode,
    primary_render_node: DrmNode,
) -> bool {
    let removed = ignored.remove(&primary_node) | ignored.remove(&primary_render_node);
    if removed {
        warn!("ignoring the primary node or render node is not allowed");
    }
    removed
}
