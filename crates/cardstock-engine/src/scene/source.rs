use std::cell::{Ref, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use image::RgbaImage;

/// Identity of a pixel source. Clones of an `ImageSource` share it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SourceId(u64);

impl SourceId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SourceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct SourceState {
    image: Option<RgbaImage>,
    version: u64,
    restricted: bool,
}

/// Shared handle to CPU-side pixels, the renderer's view of a decoded image.
///
/// A source may be pending (not yet decoded). Pending sources are skipped when drawn
/// and upload automatically once `set_image` is called. Every pixel change bumps the
/// version so resident textures re-upload on their next bind.
#[derive(Debug, Clone)]
pub struct ImageSource {
    id: SourceId,
    state: Rc<RefCell<SourceState>>,
}

impl ImageSource {
    pub fn new(image: RgbaImage) -> Self {
        Self::with_state(Some(image))
    }

    /// A source whose pixels are not available yet.
    pub fn pending() -> Self {
        Self::with_state(None)
    }

    fn with_state(image: Option<RgbaImage>) -> Self {
        Self {
            id: SourceId::next(),
            state: Rc::new(RefCell::new(SourceState {
                image,
                version: 1,
                restricted: false,
            })),
        }
    }

    /// Marks pixels as coming from a restricted origin; targets they are drawn into
    /// refuse readback.
    pub fn restricted(self) -> Self {
        self.state.borrow_mut().restricted = true;
        self
    }

    #[inline]
    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn is_ready(&self) -> bool {
        self.state.borrow().image.is_some()
    }

    pub fn is_restricted(&self) -> bool {
        self.state.borrow().restricted
    }

    pub fn version(&self) -> u64 {
        self.state.borrow().version
    }

    pub fn size(&self) -> Option<(u32, u32)> {
        self.state.borrow().image.as_ref().map(|img| img.dimensions())
    }

    /// Replaces the pixels (or delivers them for a pending source).
    pub fn set_image(&self, image: RgbaImage) {
        let mut state = self.state.borrow_mut();
        state.image = Some(image);
        state.version += 1;
    }

    /// Flags the pixels as changed in place.
    pub fn invalidate(&self) {
        self.state.borrow_mut().version += 1;
    }

    /// Copy of the current pixels.
    pub fn snapshot(&self) -> Option<RgbaImage> {
        self.state.borrow().image.clone()
    }

    pub fn with_image_mut<R>(&self, f: impl FnOnce(&mut RgbaImage) -> R) -> Option<R> {
        let mut state = self.state.borrow_mut();
        let out = state.image.as_mut().map(f);
        if out.is_some() {
            state.version += 1;
        }
        out
    }

    pub(crate) fn image(&self) -> Option<Ref<'_, RgbaImage>> {
        Ref::filter_map(self.state.borrow(), |s| s.image.as_ref()).ok()
    }
}
