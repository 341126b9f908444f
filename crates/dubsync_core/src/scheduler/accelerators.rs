//! Accelerator memory accounting.

use super::errors::{SchedulerError, SchedulerResult};

/// Per-accelerator memory budget with round-robin placement.
///
/// Not synchronized itself; the scheduler keeps it inside its state lock.
#[derive(Debug, Clone)]
pub struct AcceleratorPool {
    capacity_mb: Vec<u64>,
    in_use_mb: Vec<u64>,
    next: usize,
}

impl AcceleratorPool {
    pub fn new(capacity_mb: Vec<u64>) -> SchedulerResult<Self> {
        if capacity_mb.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "at least one accelerator is required".to_string(),
            ));
        }
        Ok(Self {
            in_use_mb: vec![0; capacity_mb.len()],
            capacity_mb,
            next: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.capacity_mb.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capacity_mb.is_empty()
    }

    pub fn largest_mb(&self) -> u64 {
        self.capacity_mb.iter().copied().max().unwrap_or(0)
    }

    pub fn free_mb(&self, index: usize) -> u64 {
        match (self.capacity_mb.get(index), self.in_use_mb.get(index)) {
            (Some(cap), Some(used)) => cap.saturating_sub(*used),
            _ => 0,
        }
    }

    /// `(in_use, capacity)` per accelerator.
    pub fn usage(&self) -> Vec<(u64, u64)> {
        self.in_use_mb
            .iter()
            .copied()
            .zip(self.capacity_mb.iter().copied())
            .collect()
    }

    /// Reserve `memory_mb` on the next accelerator with room.
    ///
    /// Scanning starts after the last device used, so consecutive jobs
    /// spread across devices. Returns `Capacity` instead of overcommitting.
    pub fn reserve(&mut self, memory_mb: u64) -> SchedulerResult<usize> {
        let count = self.len();
        for step in 0..count {
            let index = (self.next + step) % count;
            if self.free_mb(index) >= memory_mb {
                self.in_use_mb[index] += memory_mb;
                self.next = (index + 1) % count;
                return Ok(index);
            }
        }
        Err(SchedulerError::Capacity {
            needed_mb: memory_mb,
        })
    }

    /// Return memory reserved by `reserve`.
    pub fn release(&mut self, index: usize, memory_mb: u64) {
        if let Some(used) = self.in_use_mb.get_mut(index) {
            *used = used.saturating_sub(memory_mb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_rotate_across_devices() {
        let mut pool = AcceleratorPool::new(vec![4096, 4096, 4096]).unwrap();
        let placed: Vec<usize> = (0..4).map(|_| pool.reserve(1024).unwrap()).collect();
        assert_eq!(placed, vec![0, 1, 2, 0]);
        assert_eq!(pool.usage()[0], (2048, 4096));
    }

    #[test]
    fn full_devices_are_skipped_then_capacity_error() {
        let mut pool = AcceleratorPool::new(vec![1024, 2048]).unwrap();
        assert_eq!(pool.reserve(1024).unwrap(), 0);
        assert_eq!(pool.reserve(1024).unwrap(), 1);
        assert_eq!(pool.reserve(1024).unwrap(), 1);
        assert_eq!(
            pool.reserve(1024),
            Err(SchedulerError::Capacity { needed_mb: 1024 })
        );

        pool.release(0, 1024);
        assert_eq!(pool.reserve(1024).unwrap(), 0);
    }

    #[test]
    fn release_never_underflows() {
        let mut pool = AcceleratorPool::new(vec![512]).unwrap();
        pool.release(0, 100);
        pool.release(7, 100);
        assert_eq!(pool.free_mb(0), 512);
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(matches!(
            AcceleratorPool::new(vec![]),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }
}
