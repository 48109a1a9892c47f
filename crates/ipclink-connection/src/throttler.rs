/// Most messages a single pass may dispatch, at level 0.
pub(crate) const MAX_BATCH_SIZE: usize = 600;

const MAX_LEVEL: usize = 9;

/// Adaptive cap on how many incoming messages one run loop pass dispatches.
///
/// The cap shrinks while a backlog above [`MAX_BATCH_SIZE`] persists and
/// recovers once it drains.
#[derive(Debug, Default, Clone)]
pub(crate) struct Throttler {
    level: usize,
}

impl Throttler {
    pub(crate) fn batch_size(&self) -> usize {
        MAX_BATCH_SIZE / (self.level + 1)
    }

    /// Plan a pass that has already taken its first message, with
    /// `remaining` still queued. Returns how many messages the pass
    /// dispatches in total, the first included.
    pub(crate) fn plan(&mut self, remaining: usize) -> usize {
        let count = remaining.min(self.batch_size());
        if remaining > MAX_BATCH_SIZE {
            self.level = (self.level + 1).min(MAX_LEVEL);
        } else {
            self.level = self.level.saturating_sub(1);
        }
        count.max(1)
    }

    #[cfg(test)]
    fn level(&self) -> usize {
        self.level
    }
}
