//! Texture residency: registration, slot assignment, purge and release.

use std::collections::HashMap;

use crate::backend::{self, FramebufferHandle, GpuBackend, TextureHandle};
use crate::error::{RenderError, RenderResult};
use crate::scene::{ImageSource, NodeId, SourceId};

/// Registry-assigned texture identity. Stable for the texture's lifetime.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TextureId(u64);

/// What a texture was created for.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TextureKey {
    /// Uploaded from a pixel source.
    Source(SourceId),
    /// Render target `index` (0 or 1) of a cached node.
    Target(NodeId, u8),
}

#[derive(Debug)]
pub struct Texture {
    pub handle: TextureHandle,
    pub width: u32,
    pub height: u32,
    /// Slot currently holding this texture.
    pub slot: Option<usize>,
    pub last_draw_frame: u64,
    /// Batch this texture was last drawn in.
    pub last_batch: Option<u64>,
    /// Every source sharing this texture.
    pub sources: Vec<SourceId>,
    pub framebuffer: Option<FramebufferHandle>,
    pub key: TextureKey,
    /// Created as a placeholder; pixels arrive once the source is ready.
    pub pending_upload: bool,
    uploaded_version: u64,
    source: Option<ImageSource>,
}

impl Texture {
    pub fn is_target(&self) -> bool {
        matches!(self.key, TextureKey::Target(..))
    }
}

/// Texture slots of the batch program.
///
/// An empty slot binds the 1x1 placeholder. Protection flags cover every hardware
/// unit so a lock survives slot count changes.
#[derive(Debug, Clone)]
pub struct SlotTable {
    occupants: Vec<Option<TextureId>>,
    protected: Vec<bool>,
    last_insert: usize,
}

impl SlotTable {
    pub fn new(count: usize, max_units: usize) -> Self {
        let count = count.max(1);
        Self {
            occupants: vec![None; count],
            protected: vec![false; max_units.max(count)],
            last_insert: count - 1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.occupants.len()
    }

    pub fn occupant(&self, slot: usize) -> Option<TextureId> {
        self.occupants.get(slot).copied().flatten()
    }

    pub fn is_protected(&self, slot: usize) -> bool {
        self.protected.get(slot).copied().unwrap_or(false)
    }

    /// First slot in round-robin order from the last insert that `usable` accepts.
    fn scan(&self, mut usable: impl FnMut(usize, Option<TextureId>) -> bool) -> Option<usize> {
        let count = self.occupants.len();
        let start = (self.last_insert + 1) % count;
        (0..count)
            .map(|i| (start + i) % count)
            .find(|&slot| !self.is_protected(slot) && usable(slot, self.occupants[slot]))
    }
}

/// Deduplicating owner of every GPU texture the renderer creates.
#[derive(Debug)]
pub struct TextureRegistry {
    textures: HashMap<TextureId, Texture>,
    by_source: HashMap<SourceId, TextureId>,
    slots: SlotTable,
    base: Option<TextureHandle>,
    next_id: u64,
    premultiply: bool,
}

impl TextureRegistry {
    pub fn new(slot_count: usize, max_units: usize, premultiply: bool) -> Self {
        Self {
            textures: HashMap::new(),
            by_source: HashMap::new(),
            slots: SlotTable::new(slot_count, max_units),
            base: None,
            next_id: 1,
            premultiply,
        }
    }

    /// Creates the 1x1 transparent placeholder bound by empty slots.
    pub fn init_base<B: GpuBackend>(&mut self, backend: &mut B) -> RenderResult<()> {
        if self.base.is_none() {
            let handle = backend.create_texture(1, 1)?;
            backend.upload_texture(handle, &image::RgbaImage::new(1, 1), false)?;
            self.base = Some(handle);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    pub fn get(&self, id: TextureId) -> Option<&Texture> {
        self.textures.get(&id)
    }

    pub fn lookup(&self, source: SourceId) -> Option<TextureId> {
        self.by_source.get(&source).copied()
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    fn allocate_id(&mut self) -> TextureId {
        let id = TextureId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Texture for `source`, creating it on first sight.
    ///
    /// A source that is not ready gets a 1x1 placeholder and uploads on a later
    /// `refresh`.
    pub fn register<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        source: &ImageSource,
        frame_id: u64,
    ) -> RenderResult<TextureId> {
        if let Some(id) = self.lookup(source.id()) {
            return Ok(id);
        }

        let (width, height) = source.size().unwrap_or((1, 1));
        let handle = backend.create_texture(width, height)?;
        let id = self.allocate_id();
        self.textures.insert(
            id,
            Texture {
                handle,
                width,
                height,
                slot: None,
                last_draw_frame: frame_id,
                last_batch: None,
                sources: vec![source.id()],
                framebuffer: None,
                key: TextureKey::Source(source.id()),
                pending_upload: true,
                uploaded_version: 0,
                source: Some(source.clone()),
            },
        );
        self.by_source.insert(source.id(), id);

        if source.is_ready() {
            if let Err(e) = self.upload(backend, id) {
                self.release(backend, id);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Makes `alias` draw from the texture of `existing`.
    pub fn share<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        existing: &ImageSource,
        alias: &ImageSource,
        frame_id: u64,
    ) -> RenderResult<TextureId> {
        let id = self.register(backend, existing, frame_id)?;
        if let Some(previous) = self.by_source.insert(alias.id(), id) {
            if previous != id {
                self.detach_source(backend, previous, alias.id());
            }
        }
        if let Some(texture) = self.textures.get_mut(&id) {
            if !texture.sources.contains(&alias.id()) {
                texture.sources.push(alias.id());
            }
        }
        Ok(id)
    }

    fn detach_source<B: GpuBackend>(&mut self, backend: &mut B, id: TextureId, source: SourceId) {
        let orphaned = match self.textures.get_mut(&id) {
            Some(texture) => {
                texture.sources.retain(|s| *s != source);
                texture.sources.is_empty()
            }
            None => false,
        };
        if orphaned {
            self.release(backend, id);
        }
    }

    /// True when the source has pixels the texture does not hold yet.
    pub fn needs_upload(&self, id: TextureId) -> bool {
        self.textures.get(&id).is_some_and(|t| {
            t.source
                .as_ref()
                .is_some_and(|s| s.is_ready() && s.version() != t.uploaded_version)
        })
    }

    /// Uploads the current source pixels, resizing the texture to match.
    pub fn upload<B: GpuBackend>(&mut self, backend: &mut B, id: TextureId) -> RenderResult<()> {
        let premultiply = self.premultiply;
        let Some(texture) = self.textures.get_mut(&id) else {
            return Err(RenderError::backend(format!("upload of unknown {id:?}")));
        };
        let Some(source) = texture.source.as_ref() else {
            return Ok(());
        };
        let Some(image) = source.image() else {
            return Ok(());
        };

        if premultiply {
            backend.upload_texture(texture.handle, &backend::premultiplied(&image), source.is_restricted())?;
        } else {
            backend.upload_texture(texture.handle, &image, source.is_restricted())?;
        }
        texture.width = image.width();
        texture.height = image.height();
        texture.uploaded_version = source.version();
        texture.pending_upload = false;
        Ok(())
    }

    /// Slot for `id`, assigning one round-robin if it has none.
    ///
    /// A slot is free when its occupant was not drawn in `batch_id` and it is not
    /// protected. `None` means the batch must be flushed first.
    pub fn bind(&mut self, id: TextureId, batch_id: u64) -> Option<usize> {
        let texture = self.textures.get(&id)?;
        if let Some(slot) = texture.slot {
            return Some(slot);
        }

        let textures = &self.textures;
        let slot = self.slots.scan(|_, occupant| match occupant {
            None => true,
            Some(other) => textures
                .get(&other)
                .is_none_or(|t| t.last_batch != Some(batch_id)),
        })?;

        if let Some(evicted) = self.slots.occupants[slot].replace(id) {
            if let Some(t) = self.textures.get_mut(&evicted) {
                t.slot = None;
            }
        }
        self.slots.last_insert = slot;
        if let Some(t) = self.textures.get_mut(&id) {
            t.slot = Some(slot);
        }
        Some(slot)
    }

    pub fn mark_used(&mut self, id: TextureId, frame_id: u64, batch_id: u64) {
        if let Some(t) = self.textures.get_mut(&id) {
            t.last_draw_frame = frame_id;
            t.last_batch = Some(batch_id);
        }
    }

    /// Handles to bind, one per slot.
    pub fn slot_handles(&self) -> Vec<TextureHandle> {
        let base = self.base.unwrap_or(TextureHandle(0));
        self.slots
            .occupants
            .iter()
            .map(|occ| {
                occ.and_then(|id| self.textures.get(&id))
                    .map_or(base, |t| t.handle)
            })
            .collect()
    }

    /// Slots whose texels are premultiplied while card programs expect straight alpha.
    ///
    /// Render targets always hold premultiplied color, since cards are blended into a
    /// transparent clear. Uploaded sources are premultiplied only when the registry
    /// premultiplies them, and then every card program divides by alpha anyway.
    pub fn premultiplied_slots(&self) -> Vec<bool> {
        self.slots
            .occupants
            .iter()
            .map(|occ| {
                !self.premultiply
                    && occ
                        .and_then(|id| self.textures.get(&id))
                        .is_some_and(Texture::is_target)
            })
            .collect()
    }

    pub fn protect(&mut self, slot: usize, lock: bool) {
        if slot >= self.slots.protected.len() {
            self.slots.protected.resize(slot + 1, false);
        }
        self.slots.protected[slot] = lock;
    }

    /// Changes the number of slots. Textures in dropped slots lose residency.
    pub fn set_slot_count(&mut self, count: usize) {
        let count = count.max(1);
        for occupant in self.slots.occupants.iter().skip(count).flatten() {
            if let Some(t) = self.textures.get_mut(occupant) {
                t.slot = None;
            }
        }
        self.slots.occupants.resize(count, None);
        if self.slots.protected.len() < count {
            self.slots.protected.resize(count, false);
        }
        self.slots.last_insert = self.slots.last_insert.min(count - 1);
    }

    /// Restores slot assignments saved with `slots().clone()`.
    pub fn restore_slots(&mut self, saved: SlotTable) {
        for t in self.textures.values_mut() {
            t.slot = None;
        }
        self.slots = saved;
        for (slot, occupant) in self.slots.occupants.iter_mut().enumerate() {
            match occupant.and_then(|id| self.textures.get_mut(&id)) {
                Some(t) => t.slot = Some(slot),
                None => *occupant = None,
            }
        }
    }

    /// Releases source textures stale for more than `max_age` frames.
    ///
    /// Render targets, protected textures and textures drawn this frame are kept.
    pub fn purge<B: GpuBackend>(&mut self, backend: &mut B, max_age: u64, frame_id: u64) -> usize {
        let stale: Vec<TextureId> = self
            .textures
            .iter()
            .filter(|(_, t)| {
                !t.is_target()
                    && t.last_draw_frame != frame_id
                    && !t.slot.is_some_and(|s| self.slots.is_protected(s))
                    && frame_id.saturating_sub(t.last_draw_frame) > max_age
            })
            .map(|(&id, _)| id)
            .collect();

        for &id in &stale {
            self.release(backend, id);
        }
        if !stale.is_empty() {
            log::debug!("purged {} texture(s) older than {max_age} frames", stale.len());
        }
        stale.len()
    }

    /// Releases the texture drawn for `source`, if any.
    pub fn release_source<B: GpuBackend>(&mut self, backend: &mut B, source: SourceId) -> bool {
        match self.lookup(source) {
            Some(id) => {
                self.release(backend, id);
                true
            }
            None => false,
        }
    }

    /// Deletes GPU resources for `id`. A slot still holding it falls back to the
    /// placeholder.
    pub fn release<B: GpuBackend>(&mut self, backend: &mut B, id: TextureId) {
        let Some(texture) = self.textures.remove(&id) else {
            return;
        };
        if let Some(slot) = texture.slot {
            if self.slots.occupants.get(slot) == Some(&Some(id)) {
                self.slots.occupants[slot] = None;
            }
        }
        self.by_source.retain(|_, t| *t != id);
        if let Some(fb) = texture.framebuffer {
            backend.delete_framebuffer(fb);
        }
        backend.delete_texture(texture.handle);
    }

    /// Creates a texture + framebuffer pair. Nothing is kept if either fails.
    pub fn create_target<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        node: NodeId,
        index: u8,
        width: u32,
        height: u32,
    ) -> RenderResult<TextureId> {
        let handle = backend.create_texture(width, height)?;
        let framebuffer = match backend.create_framebuffer(handle) {
            Ok(fb) => fb,
            Err(e) => {
                backend.delete_texture(handle);
                return Err(e);
            }
        };

        let id = self.allocate_id();
        self.textures.insert(
            id,
            Texture {
                handle,
                width,
                height,
                slot: None,
                last_draw_frame: 0,
                last_batch: None,
                sources: Vec::new(),
                framebuffer: Some(framebuffer),
                key: TextureKey::Target(node, index),
                pending_upload: false,
                uploaded_version: 0,
                source: None,
            },
        );
        Ok(id)
    }

    /// Resizes a render target in place.
    pub fn resize_target<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        id: TextureId,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        let texture = self
            .textures
            .get_mut(&id)
            .ok_or_else(|| RenderError::backend(format!("resize of unknown {id:?}")))?;
        if (texture.width, texture.height) != (width, height) {
            backend.resize_texture(texture.handle, width, height)?;
            texture.width = width;
            texture.height = height;
        }
        Ok(())
    }

    pub fn release_all<B: GpuBackend>(&mut self, backend: &mut B) {
        let ids: Vec<TextureId> = self.textures.keys().copied().collect();
        for id in ids {
            self.release(backend, id);
        }
        if let Some(base) = self.base.take() {
            backend.delete_texture(base);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use image::{Rgba, RgbaImage};

    fn solid(w: u32, h: u32) -> ImageSource {
        ImageSource::new(RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255])))
    }

    fn setup(slots: usize) -> (SoftwareBackend, TextureRegistry) {
        let mut backend = SoftwareBackend::new(8, 8);
        let mut registry = TextureRegistry::new(slots, 16, false);
        registry.init_base(&mut backend).unwrap();
        (backend, registry)
    }

    // ── registration ──────────────────────────────────────────────────────

    #[test]
    fn register_dedups_by_source() {
        let (mut be, mut reg) = setup(4);
        let sheet = solid(4, 4);
        let a = reg.register(&mut be, &sheet, 0).unwrap();
        let b = reg.register(&mut be, &sheet.clone(), 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn pending_source_uploads_once_ready() {
        let (mut be, mut reg) = setup(4);
        let src = ImageSource::pending();
        let id = reg.register(&mut be, &src, 0).unwrap();
        assert!(reg.get(id).unwrap().pending_upload);
        assert!(!reg.needs_upload(id));

        src.set_image(RgbaImage::new(3, 2));
        assert!(reg.needs_upload(id));
        reg.upload(&mut be, id).unwrap();
        let t = reg.get(id).unwrap();
        assert!(!t.pending_upload);
        assert_eq!((t.width, t.height), (3, 2));
    }

    #[test]
    fn shared_alias_draws_from_existing_texture() {
        let (mut be, mut reg) = setup(4);
        let sheet = solid(4, 4);
        let alias = ImageSource::pending();
        let id = reg.share(&mut be, &sheet, &alias, 0).unwrap();
        assert_eq!(reg.lookup(alias.id()), Some(id));
        assert_eq!(reg.get(id).unwrap().sources.len(), 2);
    }

    // ── slots ─────────────────────────────────────────────────────────────

    #[test]
    fn bind_round_robins_and_refuses_textures_of_current_batch() {
        let (mut be, mut reg) = setup(2);
        let ids: Vec<_> = (0..3)
            .map(|_| reg.register(&mut be, &solid(1, 1), 0).unwrap())
            .collect();

        assert_eq!(reg.bind(ids[0], 0), Some(0));
        reg.mark_used(ids[0], 0, 0);
        assert_eq!(reg.bind(ids[1], 0), Some(1));
        reg.mark_used(ids[1], 0, 0);
        assert_eq!(reg.bind(ids[2], 0), None);

        // Next batch: slot 0 is reused and its old occupant loses residency.
        assert_eq!(reg.bind(ids[2], 1), Some(0));
        assert_eq!(reg.get(ids[0]).unwrap().slot, None);
    }

    #[test]
    fn protected_slots_are_skipped() {
        let (mut be, mut reg) = setup(2);
        reg.protect(0, true);
        let a = reg.register(&mut be, &solid(1, 1), 0).unwrap();
        let b = reg.register(&mut be, &solid(1, 1), 0).unwrap();
        assert_eq!(reg.bind(a, 0), Some(1));
        reg.mark_used(a, 0, 0);
        assert_eq!(reg.bind(b, 0), None);
        assert_eq!(reg.bind(b, 1), Some(1));
    }

    #[test]
    fn release_repoints_slot_to_placeholder() {
        let (mut be, mut reg) = setup(2);
        let src = solid(2, 2);
        let id = reg.register(&mut be, &src, 0).unwrap();
        reg.bind(id, 0);
        let handle = reg.get(id).unwrap().handle;
        assert_eq!(reg.slot_handles()[0], handle);

        assert!(reg.release_source(&mut be, src.id()));
        assert_ne!(reg.slot_handles()[0], handle);
        assert!(be.texture_image(reg.slot_handles()[0]).is_some());
        assert!(be.texture_image(handle).is_none());
    }

    #[test]
    fn shrinking_slot_count_drops_residency() {
        let (mut be, mut reg) = setup(4);
        let ids: Vec<_> = (0..4)
            .map(|_| reg.register(&mut be, &solid(1, 1), 0).unwrap())
            .collect();
        for &id in &ids {
            reg.bind(id, 0);
        }
        reg.set_slot_count(2);
        assert_eq!(reg.slots().len(), 2);
        assert_eq!(reg.get(ids[3]).unwrap().slot, None);
        assert!(reg.get(ids[0]).unwrap().slot.is_some());
    }

    // ── purge ─────────────────────────────────────────────────────────────

    #[test]
    fn purge_removes_only_textures_older_than_max_age() {
        let (mut be, mut reg) = setup(4);
        let old = reg.register(&mut be, &solid(1, 1), 0).unwrap();
        let edge = reg.register(&mut be, &solid(1, 1), 0).unwrap();
        reg.mark_used(old, 1, 0);
        reg.mark_used(edge, 5, 0);

        assert_eq!(reg.purge(&mut be, 5, 10), 1);
        assert!(reg.get(old).is_none());
        assert!(reg.get(edge).is_some());
    }

    #[test]
    fn purge_keeps_targets_and_protected() {
        let (mut be, mut reg) = setup(4);
        let target = reg.create_target(&mut be, NodeId(1), 0, 4, 4).unwrap();
        let locked = reg.register(&mut be, &solid(1, 1), 0).unwrap();
        reg.bind(locked, 0);
        let slot = reg.get(locked).unwrap().slot.unwrap();
        reg.protect(slot, true);

        assert_eq!(reg.purge(&mut be, 0, 100), 0);
        assert!(reg.get(target).is_some());
        assert!(reg.get(locked).is_some());
    }

    // ── targets ───────────────────────────────────────────────────────────

    #[test]
    fn failed_target_allocation_leaves_nothing_behind() {
        let (mut be, mut reg) = setup(4);
        be.set_texture_budget(Some(be.live_textures()));
        let err = reg.create_target(&mut be, NodeId(1), 0, 4, 4).unwrap_err();
        assert!(matches!(err, RenderError::ResourceExhaustion(_)));
        assert!(reg.is_empty());
    }

    #[test]
    fn only_targets_are_flagged_premultiplied() {
        let (mut be, mut reg) = setup(2);
        let src = reg.register(&mut be, &solid(1, 1), 0).unwrap();
        let target = reg.create_target(&mut be, NodeId(1), 0, 4, 4).unwrap();
        reg.bind(src, 0).unwrap();
        reg.bind(target, 0).unwrap();
        assert_eq!(reg.premultiplied_slots(), [false, true]);

        // Premultiplying registries divide every slot in the program instead.
        let mut reg = TextureRegistry::new(2, 16, true);
        reg.init_base(&mut be).unwrap();
        let target = reg.create_target(&mut be, NodeId(1), 0, 4, 4).unwrap();
        reg.bind(target, 0).unwrap();
        assert_eq!(reg.premultiplied_slots(), [false, false]);
    }
}
