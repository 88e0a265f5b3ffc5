//! Sparse byte-dimension vector used for node representations and summaries.
//!
//! Entries are kept sorted by dimension so every reduction sums in the same
//! order; scoring stays bit-for-bit deterministic across runs.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    entries: SmallVec<[(u8, f32); 8]>,
}

impl SparseVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unit mass spread evenly over the payload bytes.
    pub fn from_payload(payload: &[u8]) -> Self {
        let mut v = Self::new();
        if payload.is_empty() {
            return v;
        }
        let share = 1.0 / payload.len() as f32;
        for b in payload {
            v.add(*b, share);
        }
        v
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, dim: u8) -> f32 {
        match self.entries.binary_search_by_key(&dim, |(d, _)| *d) {
            Ok(i) => self.entries[i].1,
            Err(_) => 0.0,
        }
    }

    pub fn add(&mut self, dim: u8, value: f32) {
        if value == 0.0 || !value.is_finite() {
            return;
        }
        match self.entries.binary_search_by_key(&dim, |(d, _)| *d) {
            Ok(i) => self.entries[i].1 += value,
            Err(i) => self.entries.insert(i, (dim, value)),
        }
    }

    /// `self += scale * other`
    pub fn add_scaled(&mut self, other: &SparseVector, scale: f32) {
        for (d, v) in other.iter() {
            self.add(d, v * scale);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, f32)> + '_ {
        self.entries.iter().copied()
    }

    pub fn dot(&self, other: &SparseVector) -> f32 {
        let (mut i, mut j, mut acc) = (0, 0, 0.0f32);
        while i < self.entries.len() && j < other.entries.len() {
            let (da, va) = self.entries[i];
            let (db, vb) = other.entries[j];
            match da.cmp(&db) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    acc += va * vb;
                    i += 1;
                    j += 1;
                }
            }
        }
        acc
    }

    pub fn norm(&self) -> f32 {
        self.entries.iter().map(|(_, v)| v * v).sum::<f32>().sqrt()
    }

    pub fn normalize(&mut self) {
        let n = self.norm();
        if n > 0.0 {
            for (_, v) in self.entries.iter_mut() {
                *v /= n;
            }
        }
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Cosine similarity; zero when either side is empty.
    pub fn cosine(&self, other: &SparseVector) -> f32 {
        let denom = self.norm() * other.norm();
        if denom <= 0.0 {
            return 0.0;
        }
        (self.dot(other) / denom).clamp(-1.0, 1.0)
    }

    /// Move toward `other` by `rate` in `[0, 1]` (running-mean update).
    pub fn blend_toward(&mut self, other: &SparseVector, rate: f32) {
        let rate = rate.clamp(0.0, 1.0);
        let mut out = SparseVector::new();
        out.add_scaled(self, 1.0 - rate);
        out.add_scaled(other, rate);
        *self = out;
    }
}
