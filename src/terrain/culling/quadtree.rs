//! Index-arena quadtree over cullable objects.
//!
//! Nodes live in a flat `Vec` and reference their children by index, so the
//! tree has no pointer graph to manage and serializes/tests trivially.
//! Subdivision splits the X/Z footprint; the vertical range passes through.

use super::{banded_lod, CullResults, CullingObject};
use super::frustum::Frustum;
use crate::terrain::bounds::TileBounds;
use glam::Vec3;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

const INVALID_NODE: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct CullQuadtreeConfig {
    /// World region covered by the root node.
    pub bounds: TileBounds,
    pub max_depth: u32,
    pub max_objects_per_node: usize,
}

impl Default for CullQuadtreeConfig {
    fn default() -> Self {
        Self {
            bounds: TileBounds::new(
                Vec3::new(-5000.0, -500.0, -5000.0),
                Vec3::new(5000.0, 500.0, 5000.0),
            ),
            max_depth: 8,
            max_objects_per_node: 16,
        }
    }
}

#[derive(Debug)]
struct QuadNode {
    bounds: TileBounds,
    depth: u32,
    children: [u32; 4],
    objects: Vec<u32>,
    is_leaf: bool,
}

impl QuadNode {
    fn new(bounds: TileBounds, depth: u32) -> Self {
        Self {
            bounds,
            depth,
            children: [INVALID_NODE; 4],
            objects: Vec::new(),
            is_leaf: true,
        }
    }
}

/// Snapshot of tree shape for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuadtreeStatistics {
    pub total_objects: u32,
    pub total_nodes: u32,
    pub leaf_nodes: u32,
    pub max_depth_used: u32,
}

pub struct CullQuadtree {
    config: CullQuadtreeConfig,
    nodes: Vec<QuadNode>,
    objects: HashMap<u32, CullingObject>,
}

impl CullQuadtree {
    pub fn new(config: CullQuadtreeConfig) -> Self {
        let root = QuadNode::new(config.bounds, 0);
        Self {
            config,
            nodes: vec![root],
            objects: HashMap::new(),
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Iterate all tracked objects (order unspecified).
    pub fn objects(&self) -> impl Iterator<Item = &CullingObject> {
        self.objects.values()
    }

    /// Insert an object; rejected when its bounds do not intersect the tree
    /// region.
    pub fn insert(&mut self, object: CullingObject) -> bool {
        if !self.config.bounds.intersects(&object.bounds) {
            log::warn!(
                "object {} bounds do not intersect the culling region",
                object.id
            );
            return false;
        }
        let id = object.id;
        self.objects.insert(id, object);
        self.insert_into(0, id)
    }

    pub fn remove(&mut self, object_id: u32) -> bool {
        if self.objects.remove(&object_id).is_none() {
            return false;
        }
        self.remove_from(0, object_id);
        true
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.nodes.clear();
        self.nodes.push(QuadNode::new(self.config.bounds, 0));
    }

    /// Hierarchical frustum culling: nodes wholly outside any plane are
    /// pruned with their entire subtree; surviving leaves run a tighter
    /// per-object sphere test.
    pub fn cull_frustum(&self, frustum: &Frustum) -> CullResults {
        let start = Instant::now();
        let mut results = CullResults::default();
        // An object spanning several leaves must be reported exactly once.
        let mut emitted: HashSet<u32> = HashSet::with_capacity(self.objects.len());

        let mut stack = vec![0u32];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index as usize];

            if !frustum.intersects_bounds(&node.bounds) {
                self.collect_culled(index, &mut emitted, &mut results);
                continue;
            }

            if node.is_leaf {
                for &id in &node.objects {
                    if !emitted.insert(id) {
                        continue;
                    }
                    let Some(object) = self.objects.get(&id) else { continue };
                    if frustum.intersects_sphere(object.bounds.center(), object.bounds.radius()) {
                        results.visible.push(object.clone());
                    } else {
                        results.culled.push(object.clone());
                    }
                }
            } else {
                for &child in &node.children {
                    if child != INVALID_NODE {
                        stack.push(child);
                    }
                }
            }
        }

        results.cull_time_ms = start.elapsed().as_secs_f32() * 1000.0;
        results
    }

    /// Distance-band LOD culling: an object survives only when its own LOD
    /// level matches the band its center falls into.
    pub fn cull_lod(&self, camera_position: Vec3, lod_distances: &[f32; 4]) -> CullResults {
        let start = Instant::now();
        let mut results = CullResults::default();

        for object in self.objects.values() {
            let distance = (object.bounds.center() - camera_position).length();
            let required = banded_lod(distance, lod_distances);
            if object.lod_level == required {
                results.visible.push(object.clone());
            } else {
                results.culled.push(object.clone());
            }
        }

        results.cull_time_ms = start.elapsed().as_secs_f32() * 1000.0;
        results
    }

    pub fn statistics(&self) -> QuadtreeStatistics {
        let mut stats = QuadtreeStatistics {
            total_objects: self.objects.len() as u32,
            total_nodes: self.nodes.len() as u32,
            ..Default::default()
        };
        for node in &self.nodes {
            if node.is_leaf {
                stats.leaf_nodes += 1;
            }
            stats.max_depth_used = stats.max_depth_used.max(node.depth);
        }
        stats
    }

    fn insert_into(&mut self, node_index: u32, id: u32) -> bool {
        let (is_leaf, depth, object_count) = {
            let node = &self.nodes[node_index as usize];
            (node.is_leaf, node.depth, node.objects.len())
        };

        if is_leaf {
            if object_count < self.config.max_objects_per_node || depth >= self.config.max_depth {
                self.nodes[node_index as usize].objects.push(id);
                return true;
            }
            self.subdivide(node_index);
        }

        let children = self.nodes[node_index as usize].children;
        let object_bounds = match self.objects.get(&id) {
            Some(object) => object.bounds,
            None => return false,
        };

        let mut inserted = false;
        for child in children {
            if child != INVALID_NODE
                && self.nodes[child as usize].bounds.intersects(&object_bounds)
                && self.insert_into(child, id)
            {
                inserted = true;
            }
        }
        inserted
    }

    fn remove_from(&mut self, node_index: u32, object_id: u32) {
        let node = &mut self.nodes[node_index as usize];
        if node.is_leaf {
            node.objects.retain(|&id| id != object_id);
            return;
        }
        let children = node.children;
        for child in children {
            if child != INVALID_NODE {
                self.remove_from(child, object_id);
            }
        }
    }

    fn subdivide(&mut self, node_index: u32) {
        let (bounds, depth) = {
            let node = &self.nodes[node_index as usize];
            if !node.is_leaf || node.depth >= self.config.max_depth {
                return;
            }
            (node.bounds, node.depth)
        };

        let center = bounds.center();
        let (min, max) = (bounds.min, bounds.max);
        let quadrants = [
            TileBounds::new(min, Vec3::new(center.x, max.y, center.z)),
            TileBounds::new(
                Vec3::new(center.x, min.y, min.z),
                Vec3::new(max.x, max.y, center.z),
            ),
            TileBounds::new(
                Vec3::new(min.x, min.y, center.z),
                Vec3::new(center.x, max.y, max.z),
            ),
            TileBounds::new(Vec3::new(center.x, min.y, center.z), max),
        ];

        let mut children = [INVALID_NODE; 4];
        for (slot, quadrant) in quadrants.into_iter().enumerate() {
            children[slot] = self.nodes.len() as u32;
            self.nodes.push(QuadNode::new(quadrant, depth + 1));
        }

        let displaced = {
            let node = &mut self.nodes[node_index as usize];
            node.is_leaf = false;
            node.children = children;
            std::mem::take(&mut node.objects)
        };

        for id in displaced {
            self.insert_into(node_index, id);
        }
    }

    fn collect_culled(
        &self,
        node_index: u32,
        emitted: &mut HashSet<u32>,
        results: &mut CullResults,
    ) {
        let mut stack = vec![node_index];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index as usize];
            if node.is_leaf {
                for &id in &node.objects {
                    if emitted.insert(id) {
                        if let Some(object) = self.objects.get(&id) {
                            results.culled.push(object.clone());
                        }
                    }
                }
            } else {
                for &child in &node.children {
                    if child != INVALID_NODE {
                        stack.push(child);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Mat4;

    fn tree() -> CullQuadtree {
        CullQuadtree::new(CullQuadtreeConfig {
            bounds: TileBounds::new(
                Vec3::new(-100.0, -10.0, -100.0),
                Vec3::new(100.0, 10.0, 100.0),
            ),
            max_depth: 4,
            max_objects_per_node: 2,
        })
    }

    fn object(id: u32, x: f32, z: f32) -> CullingObject {
        CullingObject {
            id,
            bounds: TileBounds::new(Vec3::new(x, 0.0, z), Vec3::new(x + 5.0, 1.0, z + 5.0)),
            lod_level: 0,
        }
    }

    #[test]
    fn insert_subdivides_past_node_capacity() {
        let mut tree = tree();
        for i in 0..8 {
            assert!(tree.insert(object(i, -90.0 + i as f32 * 20.0, -90.0)));
        }
        let stats = tree.statistics();
        assert_eq!(stats.total_objects, 8);
        assert!(stats.total_nodes > 1);
        assert!(stats.max_depth_used >= 1);
    }

    #[test]
    fn outside_region_is_rejected() {
        let mut tree = tree();
        assert!(!tree.insert(object(0, 500.0, 500.0)));
        assert_eq!(tree.object_count(), 0);
    }

    #[test]
    fn remove_deletes_everywhere() {
        let mut tree = tree();
        // Straddles the center, so it lands in several quadrants once the
        // tree subdivides.
        let spanning = CullingObject {
            id: 42,
            bounds: TileBounds::new(Vec3::new(-10.0, 0.0, -10.0), Vec3::new(10.0, 1.0, 10.0)),
            lod_level: 0,
        };
        tree.insert(spanning);
        for i in 0..8 {
            tree.insert(object(i, -90.0 + i as f32 * 20.0, 50.0));
        }
        assert!(tree.remove(42));
        assert!(!tree.remove(42));

        let view = Mat4::look_at_rh(Vec3::new(0.0, 50.0, 0.1), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(90f32.to_radians(), 1.0, 0.1, 1000.0);
        let results = tree.cull_frustum(&Frustum::from_view_projection(proj * view));
        assert!(results.visible.iter().all(|o| o.id != 42));
        assert!(results.culled.iter().all(|o| o.id != 42));
    }

    #[test]
    fn culling_partitions_all_objects_once() {
        let mut tree = tree();
        for i in 0..20 {
            tree.insert(object(i, -95.0 + (i % 10) as f32 * 19.0, -95.0 + (i / 10) as f32 * 50.0));
        }
        let view = Mat4::look_at_rh(Vec3::new(0.0, 5.0, 120.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(45f32.to_radians(), 1.0, 0.1, 500.0);
        let results = tree.cull_frustum(&Frustum::from_view_projection(proj * view));
        assert_eq!(results.visible.len() + results.culled.len(), 20);
    }

    #[test]
    fn lod_culling_keeps_matching_band_only() {
        let mut tree = tree();
        let mut near = object(0, 1.0, 1.0);
        near.lod_level = 0;
        let mut near_but_coarse = object(1, 1.0, 20.0);
        near_but_coarse.lod_level = 3;
        tree.insert(near);
        tree.insert(near_but_coarse);

        let results = tree.cull_lod(Vec3::ZERO, &[500.0, 1000.0, 2500.0, 5000.0]);
        assert_eq!(results.visible.len(), 1);
        assert_eq!(results.visible[0].id, 0);
        assert_eq!(results.culled[0].id, 1);
    }
}
