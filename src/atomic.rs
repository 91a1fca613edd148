use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Sparse mass representation of one factor matrix: an ordered multiset of
/// atoms, each a positive mass at a `u64` position. Positions map to matrix
/// cells by integer division with the bin width, so every cell owns an equal
/// slice of the addressable range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AtomicDomain {
    atoms: BTreeMap<u64, f64>,
    num_bins: u64,
    bin_width: u64,
}

impl AtomicDomain {
    pub fn new(num_bins: u64) -> Self {
        assert!(num_bins > 0);
        AtomicDomain {
            atoms: BTreeMap::new(),
            num_bins,
            bin_width: u64::MAX / num_bins,
        }
    }

    /// Total addressable length. Atom positions are uniform over `0..len()`.
    pub fn len(&self) -> u64 {
        self.bin_width * self.num_bins
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn num_atoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn num_bins(&self) -> u64 {
        self.num_bins
    }

    pub fn bin_of(&self, pos: u64) -> u64 {
        pos / self.bin_width
    }

    /// Uniform unoccupied position. Collisions are vanishingly rare at `u64`
    /// scale, so retrying on an occupied draw keeps the draw uniform.
    pub fn random_free_position<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        loop {
            let pos = rng.random_range(0..self.len());
            if !self.atoms.contains_key(&pos) {
                return pos;
            }
        }
    }

    /// Uniformly chosen existing atom. Panics on an empty domain.
    pub fn random_atom<R: Rng + ?Sized>(&self, rng: &mut R) -> (u64, f64) {
        let idx = rng.random_range(0..self.atoms.len());
        let (pos, mass) = self
            .atoms
            .iter()
            .nth(idx)
            .expect("atom index within bounds");
        (*pos, *mass)
    }

    pub fn insert(&mut self, pos: u64, mass: f64) {
        let prev = self.atoms.insert(pos, mass);
        debug_assert!(prev.is_none(), "position already occupied");
    }

    pub fn remove(&mut self, pos: u64) -> f64 {
        self.atoms.remove(&pos).expect("atom at removed position")
    }

    pub fn move_atom(&mut self, from: u64, to: u64) {
        let mass = self.remove(from);
        self.insert(to, mass);
    }

    /// Inclusive position bounds an atom at `pos` may move within: strictly
    /// between its neighboring atoms, or up to the domain edges where no
    /// neighbor exists.
    pub fn neighborhood(&self, pos: u64) -> (u64, u64) {
        let left = self.atoms.range(..pos).next_back().map(|(p, _)| *p);
        let right = self.atoms.range(pos + 1..).next().map(|(p, _)| *p);
        let lo = left.map_or(0, |p| p + 1);
        let hi = right.map_or(self.len() - 1, |p| p - 1);
        (lo, hi)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, f64)> + '_ {
        self.atoms.iter().map(|(p, m)| (*p, *m))
    }
}
