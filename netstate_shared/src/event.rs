//! One-shot effect events.
//!
//! Simulation code emits effects (sounds, particles) into an [`EffectQueue`];
//! presentation code drains them once per frame. While a tick is replayed for
//! reconciliation the queue is suppressed, so an effect fires only for the
//! original execution of a tick.

/// Typed effect queue.
#[derive(Debug)]
pub struct EffectQueue<E> {
    events: Vec<E>,
    suppressed: bool,
}

impl<E> Default for EffectQueue<E> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            suppressed: false,
        }
    }
}

impl<E> EffectQueue<E> {
    /// Pushes an event unless the queue is suppressed.
    pub fn emit(&mut self, e: E) {
        if !self.suppressed {
            self.events.push(e);
        }
    }

    pub fn set_suppressed(&mut self, suppressed: bool) {
        self.suppressed = suppressed;
    }

    /// Drains all queued events.
    pub fn drain(&mut self) -> Vec<E> {
        std::mem::take(&mut self.events)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppressed_queue_drops_events() {
        let mut q = EffectQueue::default();
        q.emit(1);
        q.set_suppressed(true);
        q.emit(2);
        q.set_suppressed(false);
        q.emit(3);
        assert_eq!(q.drain(), vec![1, 3]);
        assert!(q.is_empty());
    }
}
