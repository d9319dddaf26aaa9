use std::fmt::Debug;

pub type FrameId = u32;

/// Eviction policy over the frames of the page cache.
///
/// A frame is a candidate only between `unpin` (or `release`) and the next
/// `pin` or `evict` of it.
pub trait Replacer: Send + Sync + Debug {
    /// Choose the next victim, or `None` when every frame is pinned.
    fn evict(&mut self) -> Option<FrameId>;

    fn pin(&mut self, frame_id: FrameId);

    fn unpin(&mut self, frame_id: FrameId);

    /// Hand back a frame that no longer caches a page. It is reused before
    /// any frame that still does.
    fn release(&mut self, frame_id: FrameId);

    /// Number of frames that can be evicted right now.
    fn size(&self) -> usize;
}
