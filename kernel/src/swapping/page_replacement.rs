use crate::mem::FrameId;

/// What a replacement policy learns when it looks at a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Pinned by someone else or holding nothing evictable.
    Busy,
    /// Recently used. The check has already cleared the accessed bit.
    Referenced,
    /// Unreferenced and now pinned by the caller.
    Victim,
}

pub trait PageReplacementPolicy: Send {
    /// Picks a frame to evict out of `frames`, asking `inspect` about
    /// candidates. Returns `None` if no victim turned up.
    fn select_victim(
        &mut self,
        frames: usize,
        inspect: &mut dyn FnMut(FrameId) -> Verdict,
    ) -> Option<FrameId>;
}

/// Second-chance eviction: a frame survives the hand once per access.
#[derive(Debug, Default)]
pub struct ClockEviction {
    hand: usize,
}

impl ClockEviction {
    /// Full sweeps over the table before giving up.
    pub const MAX_PASSES: usize = 2;

    pub const fn new() -> Self {
        Self { hand: 0 }
    }

    pub fn hand(&self) -> usize {
        self.hand
    }
}

impl PageReplacementPolicy for ClockEviction {
    fn select_victim(
        &mut self,
        frames: usize,
        inspect: &mut dyn FnMut(FrameId) -> Verdict,
    ) -> Option<FrameId> {
        if frames == 0 {
            return None;
        }
        for _ in 0..Self::MAX_PASSES * frames {
            let frame = self.hand % frames;
            self.hand = (frame + 1) % frames;
            if inspect(frame) == Verdict::Victim {
                return Some(frame);
            }
        }
        None
    }
}
