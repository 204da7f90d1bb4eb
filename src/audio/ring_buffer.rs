//! Bounded buffer of the most recent mono samples.
//!
//! The capture callback pushes into it and the analyzer copies the newest
//! window out on each tick. Oldest samples are dropped once full.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

pub type SharedRing = Arc<Mutex<SampleRing>>;

#[derive(Debug)]
pub struct SampleRing {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn shared(capacity: usize) -> SharedRing {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    /// Lock a shared ring, clearing poison left by a panicked writer
    ///
    /// A push interrupted mid-way leaves at worst one torn window.
    pub fn lock(ring: &SharedRing) -> MutexGuard<'_, SampleRing> {
        ring.lock().unwrap_or_else(|poisoned| {
            ring.clear_poison();
            poisoned.into_inner()
        })
    }

    pub fn push_slice(&mut self, data: &[f32]) {
        let data = &data[data.len().saturating_sub(self.capacity)..];
        let overflow = (self.samples.len() + data.len()).saturating_sub(self.capacity);
        self.samples.drain(..overflow);
        self.samples.extend(data.iter().copied());
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Copy out the buffered samples, oldest first
    pub fn snapshot(&self) -> Vec<f32> {
        self.samples.iter().copied().collect()
    }
}
