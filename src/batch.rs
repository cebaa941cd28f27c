// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Stacking and metadata cadence
//!
//! ```text
//! Idle(0) -> Accumulating(1..stack-1) -> Flush(stack) -> Idle
//! ```
//!
//! With `stack == 1` every record flushes immediately and the schema is
//! re-announced every `period` flushes. With a larger stack each flush is
//! one metadata epoch and always carries the schema.

/// Observable controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    /// Records buffered, below the stack size
    Accumulating(usize),
}

/// Records released by the controller
#[derive(Debug, Clone, PartialEq)]
pub struct Flush<T> {
    /// Records in arrival order
    pub entries: Vec<T>,
    /// Header and dict must be published with this flush
    pub announce_metadata: bool,
}

/// Outcome of pushing one record
#[derive(Debug, Clone, PartialEq)]
pub enum BatchDecision<T> {
    /// Record buffered; `pending` records are waiting
    Buffered { pending: usize },
    /// Stack complete
    Flush(Flush<T>),
}

/// Per-sensor batch controller
#[derive(Debug, Clone)]
pub struct BatchController<T> {
    stack: usize,
    period: u32,
    buffer: Vec<T>,
    meta_count: u32,
}

impl<T> BatchController<T> {
    /// Create a controller. A stack or period of 0 behaves as 1.
    pub fn new(stack: usize, period: u32) -> Self {
        let stack = stack.max(1);
        Self {
            stack,
            period: period.max(1),
            buffer: Vec::with_capacity(stack),
            meta_count: 0,
        }
    }

    pub fn push(&mut self, record: T) -> BatchDecision<T> {
        if self.stack == 1 {
            let announce_metadata = self.tick_metadata();
            return BatchDecision::Flush(Flush {
                entries: vec![record],
                announce_metadata,
            });
        }

        self.buffer.push(record);
        if self.buffer.len() < self.stack {
            return BatchDecision::Buffered {
                pending: self.buffer.len(),
            };
        }
        BatchDecision::Flush(Flush {
            entries: std::mem::replace(&mut self.buffer, Vec::with_capacity(self.stack)),
            announce_metadata: true,
        })
    }

    fn tick_metadata(&mut self) -> bool {
        let announce = self.meta_count == 0;
        self.meta_count += 1;
        if self.meta_count >= self.period {
            self.meta_count = 0;
        }
        announce
    }

    /// Release a partial batch, e.g. on shutdown
    pub fn drain(&mut self) -> Option<Flush<T>> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(Flush {
            entries: std::mem::take(&mut self.buffer),
            announce_metadata: true,
        })
    }

    /// Drop a partial batch, returning how many records were lost
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    /// Start a new metadata epoch; the next flush announces the schema
    pub fn reset_epoch(&mut self) {
        self.meta_count = 0;
    }

    pub fn state(&self) -> BatchState {
        match self.buffer.len() {
            0 => BatchState::Idle,
            n => BatchState::Accumulating(n),
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn stack(&self) -> usize {
        self.stack
    }

    pub fn metadata_period(&self) -> u32 {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flushes(decision: BatchDecision<u32>) -> Option<Flush<u32>> {
        match decision {
            BatchDecision::Flush(f) => Some(f),
            BatchDecision::Buffered { .. } => None,
        }
    }

    #[test]
    fn test_stack_one_flushes_every_record() {
        let mut batch = BatchController::new(1, 10);
        let announced: Vec<bool> = (0..25)
            .map(|i| flushes(batch.push(i)).unwrap().announce_metadata)
            .collect();
        let expected: Vec<usize> = vec![0, 10, 20];
        let got: Vec<usize> = announced
            .iter()
            .enumerate()
            .filter(|(_, a)| **a)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(got, expected);
        assert_eq!(batch.state(), BatchState::Idle);
    }

    #[test]
    fn test_stack_accumulates() {
        let mut batch = BatchController::new(3, 10);
        assert_eq!(batch.push(1), BatchDecision::Buffered { pending: 1 });
        assert_eq!(batch.state(), BatchState::Accumulating(1));
        assert_eq!(batch.push(2), BatchDecision::Buffered { pending: 2 });
        let flush = flushes(batch.push(3)).unwrap();
        assert_eq!(flush.entries, vec![1, 2, 3]);
        assert!(flush.announce_metadata);
        assert_eq!(batch.state(), BatchState::Idle);

        batch.push(4);
        batch.push(5);
        assert!(flushes(batch.push(6)).unwrap().announce_metadata);
    }

    #[test]
    fn test_drain_and_discard() {
        let mut batch = BatchController::new(5, 10);
        batch.push(1);
        batch.push(2);
        let flush = batch.drain().unwrap();
        assert_eq!(flush.entries, vec![1, 2]);
        assert!(batch.drain().is_none());

        batch.push(3);
        assert_eq!(batch.discard(), 1);
        assert_eq!(batch.state(), BatchState::Idle);
    }

    #[test]
    fn test_reset_epoch() {
        let mut batch = BatchController::new(1, 10);
        assert!(flushes(batch.push(0)).unwrap().announce_metadata);
        assert!(!flushes(batch.push(1)).unwrap().announce_metadata);
        batch.reset_epoch();
        assert!(flushes(batch.push(2)).unwrap().announce_metadata);
    }

    #[test]
    fn test_zero_settings_clamped() {
        let mut batch = BatchController::new(0, 0);
        assert_eq!(batch.stack(), 1);
        assert!(flushes(batch.push(0)).unwrap().announce_metadata);
        assert!(flushes(batch.push(1)).unwrap().announce_metadata);
    }
}
