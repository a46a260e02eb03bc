//! Ping-pong render targets for cached nodes, plus the active viewport.

use std::collections::HashMap;

use crate::backend::GpuBackend;
use crate::coords::{Projection, Viewport};
use crate::error::RenderResult;
use crate::scene::NodeId;
use crate::texture::{TextureId, TextureRegistry};

#[derive(Debug, Default, Clone, Copy)]
struct TargetPair {
    targets: [Option<TextureId>; 2],
    last: Option<usize>,
}

#[derive(Debug)]
pub struct RenderTargetManager {
    pairs: HashMap<NodeId, TargetPair>,
    viewport: Viewport,
    projection: Projection,
    flipped: Projection,
}

impl RenderTargetManager {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            pairs: HashMap::new(),
            viewport,
            projection: Projection::regular(viewport),
            flipped: Projection::flipped(viewport),
        }
    }

    #[inline]
    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Projection for the visible surface and for filter input renders.
    #[inline]
    pub fn projection(&self) -> Projection {
        self.projection
    }

    /// Projection that leaves render target contents upright.
    #[inline]
    pub fn flipped_projection(&self) -> Projection {
        self.flipped
    }

    /// Sets the viewport on the backend and derives both projections.
    pub fn update_viewport<B: GpuBackend>(&mut self, backend: &mut B, viewport: Viewport) {
        self.viewport = viewport;
        self.projection = Projection::regular(viewport);
        self.flipped = Projection::flipped(viewport);
        backend.set_viewport(viewport);
    }

    /// The target of `node`'s pair that was not handed out last, sized to
    /// `width`x`height`.
    ///
    /// The first call allocates A, the next B, then they alternate. On failure the pair
    /// is left exactly as it was.
    pub fn get_target<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        registry: &mut TextureRegistry,
        node: NodeId,
        width: u32,
        height: u32,
    ) -> RenderResult<TextureId> {
        let mut pair = self.pairs.get(&node).copied().unwrap_or_default();
        let index = match pair.last {
            Some(last) => 1 - last,
            None => 0,
        };

        let id = match pair.targets[index] {
            Some(id) => {
                registry.resize_target(backend, id, width, height)?;
                id
            }
            None => {
                let id = registry.create_target(backend, node, index as u8, width, height)?;
                log::debug!("allocated render target {index} for {node:?} ({width}x{height})");
                pair.targets[index] = Some(id);
                id
            }
        };

        pair.last = Some(index);
        self.pairs.insert(node, pair);
        Ok(id)
    }

    /// Target handed out most recently for `node`.
    pub fn last_target(&self, node: NodeId) -> Option<TextureId> {
        let pair = self.pairs.get(&node)?;
        pair.last.and_then(|i| pair.targets[i])
    }

    /// Number of allocated targets for `node` (0, 1 or 2).
    pub fn allocated(&self, node: NodeId) -> usize {
        self.pairs
            .get(&node)
            .map_or(0, |p| p.targets.iter().flatten().count())
    }

    pub fn has_node(&self, node: NodeId) -> bool {
        self.pairs.contains_key(&node)
    }

    /// Deletes both targets of `node`.
    pub fn release<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        registry: &mut TextureRegistry,
        node: NodeId,
    ) -> bool {
        let Some(pair) = self.pairs.remove(&node) else {
            return false;
        };
        for id in pair.targets.into_iter().flatten() {
            registry.release(backend, id);
        }
        true
    }

    pub fn release_all<B: GpuBackend>(&mut self, backend: &mut B, registry: &mut TextureRegistry) {
        let nodes: Vec<NodeId> = self.pairs.keys().copied().collect();
        for node in nodes {
            self.release(backend, registry, node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::error::RenderError;

    fn setup() -> (SoftwareBackend, TextureRegistry, RenderTargetManager) {
        (
            SoftwareBackend::new(8, 8),
            TextureRegistry::new(2, 16, false),
            RenderTargetManager::new(Viewport::new(8, 8)),
        )
    }

    #[test]
    fn targets_alternate_between_a_and_b() {
        let (mut be, mut reg, mut targets) = setup();
        let node = NodeId(7);
        let a = targets.get_target(&mut be, &mut reg, node, 4, 4).unwrap();
        let b = targets.get_target(&mut be, &mut reg, node, 4, 4).unwrap();
        let a2 = targets.get_target(&mut be, &mut reg, node, 4, 4).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a2);
        assert_eq!(targets.allocated(node), 2);
        assert_eq!(targets.last_target(node), Some(a));
    }

    #[test]
    fn existing_target_is_resized_in_place() {
        let (mut be, mut reg, mut targets) = setup();
        let node = NodeId(1);
        let a = targets.get_target(&mut be, &mut reg, node, 4, 4).unwrap();
        targets.get_target(&mut be, &mut reg, node, 4, 4).unwrap();
        let created = be.stats().textures_created;

        let again = targets.get_target(&mut be, &mut reg, node, 16, 8).unwrap();
        assert_eq!(again, a);
        assert_eq!(be.stats().textures_created, created);
        let t = reg.get(a).unwrap();
        assert_eq!((t.width, t.height), (16, 8));
    }

    #[test]
    fn failed_allocation_leaves_pair_untouched() {
        let (mut be, mut reg, mut targets) = setup();
        let node = NodeId(2);
        let a = targets.get_target(&mut be, &mut reg, node, 4, 4).unwrap();
        be.set_texture_budget(Some(be.live_textures()));

        let err = targets.get_target(&mut be, &mut reg, node, 4, 4).unwrap_err();
        assert!(matches!(err, RenderError::ResourceExhaustion(_)));
        assert_eq!(targets.allocated(node), 1);
        assert_eq!(targets.last_target(node), Some(a));
    }

    #[test]
    fn release_deletes_both_targets() {
        let (mut be, mut reg, mut targets) = setup();
        let node = NodeId(3);
        targets.get_target(&mut be, &mut reg, node, 4, 4).unwrap();
        targets.get_target(&mut be, &mut reg, node, 4, 4).unwrap();
        assert!(targets.release(&mut be, &mut reg, node));
        assert_eq!(targets.allocated(node), 0);
        assert_eq!(be.live_textures(), 0);
        assert_eq!(be.live_framebuffers(), 0);
    }

    #[test]
    fn viewport_update_derives_both_projections() {
        let (mut be, _, mut targets) = setup();
        targets.update_viewport(&mut be, Viewport::new(200, 100));
        assert_eq!(be.viewport(), Viewport::new(200, 100));
        let p = targets.projection().0;
        let f = targets.flipped_projection().0;
        assert_eq!(p[0], 0.01);
        assert_eq!(p[5], -0.02);
        assert_eq!(f[5], 0.02);
        assert_eq!(f[13], -1.0);
    }
}
