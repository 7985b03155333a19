/// Maximum shapes a cache tracks before degrading to megamorphic.
pub const POLY_LIMIT: usize = 8;

/// Per-call-site cache for constant-key map reads.
///
/// Records the map shapes seen at the site and the slot index the key was
/// found at for each. Purely an accelerator: a miss falls back to probing
/// the map, and correctness never depends on cache contents.
#[derive(Debug)]
pub enum InlineCache {
    /// Never executed.
    Uninit,
    /// One shape observed.
    Mono { shape: u64, slot: usize },
    /// Up to [`POLY_LIMIT`] shapes observed.
    Poly(Vec<(u64, usize)>),
    /// Too many shapes; always probe.
    Mega,
}

impl InlineCache {
    pub fn new() -> InlineCache {
        InlineCache::Uninit
    }

    /// Cached slot for this shape, if any.
    pub fn lookup(&self, shape: u64) -> Option<usize> {
        match self {
            InlineCache::Mono { shape: s, slot } if *s == shape => Some(*slot),
            InlineCache::Poly(entries) => entries
                .iter()
                .find(|(s, _)| *s == shape)
                .map(|(_, slot)| *slot),
            _ => None,
        }
    }

    /// Record a probe result. The ninth distinct shape degrades the site
    /// to megamorphic for good.
    pub fn update(&mut self, shape: u64, slot: usize) {
        match self {
            InlineCache::Uninit => *self = InlineCache::Mono { shape, slot },
            InlineCache::Mono { shape: s, slot: old } => {
                if *s == shape {
                    *old = slot;
                } else {
                    *self = InlineCache::Poly(vec![(*s, *old), (shape, slot)]);
                }
            }
            InlineCache::Poly(entries) => {
                if let Some(e) = entries.iter_mut().find(|(s, _)| *s == shape) {
                    e.1 = slot;
                } else if entries.len() < POLY_LIMIT {
                    entries.push((shape, slot));
                } else {
                    *self = InlineCache::Mega;
                }
            }
            InlineCache::Mega => {}
        }
    }

    pub fn is_megamorphic(&self) -> bool {
        matches!(self, InlineCache::Mega)
    }
}

impl Default for InlineCache {
    fn default() -> Self {
        Self::new()
    }
}
