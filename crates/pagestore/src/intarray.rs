//! Sorted integer array used for per-storage page lists.

/// Ascending, duplicate-free `u32` array with value-ordered insert and
/// remove plus a "first element ≥ v" lookup.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntArray {
    values: Vec<u32>,
}

impl IntArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// # Panics
    ///
    /// Panics if `i` is out of bounds.
    pub fn get(&self, i: usize) -> u32 {
        self.values[i]
    }

    /// Insert keeping order; returns false if the value is already present.
    pub fn add(&mut self, v: u32) -> bool {
        match self.values.binary_search(&v) {
            Ok(_) => false,
            Err(i) => {
                self.values.insert(i, v);
                true
            }
        }
    }

    /// Remove by value; returns false if absent.
    pub fn remove_value(&mut self, v: u32) -> bool {
        match self.values.binary_search(&v) {
            Ok(i) => {
                self.values.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, v: u32) -> bool {
        self.values.binary_search(&v).is_ok()
    }

    /// Index of the first element ≥ `v`, or `None` if all are smaller.
    pub fn first_index_at_least(&self, v: u32) -> Option<usize> {
        let i = self.values.partition_point(|&x| x < v);
        (i < self.values.len()).then_some(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.values.iter().copied()
    }
}
