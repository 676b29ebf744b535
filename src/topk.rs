//! Top-K selection
//!
//! **Problem**: ranking a whole result set to show its best K records is
//! O(N log N). A bounded heap does it in O(N log K).
//!
//! Ties are broken by original position, so top-K agrees with the stable
//! sort used for full result pages.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Sort order for Top-K selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Ascending order (smallest K values)
    #[serde(alias = "asc")]
    Ascending,
    /// Descending order (largest K values)
    #[default]
    #[serde(alias = "desc")]
    Descending,
}

impl SortOrder {
    /// Compare two values under this order (`Less` = ranks first).
    /// NaN ranks after every number in both orders.
    #[must_use]
    pub fn compare(self, a: f64, b: f64) -> Ordering {
        match (a.is_nan(), b.is_nan()) {
            (false, false) => match self {
                Self::Ascending => a.total_cmp(&b),
                Self::Descending => b.total_cmp(&a),
            },
            (a_nan, b_nan) => a_nan.cmp(&b_nan),
        }
    }
}

// Heap item for descending order: the heap top is the weakest kept entry
// (smallest value, then latest index).
#[derive(Debug)]
struct MinHeapItem {
    value: f64,
    index: usize,
}

impl PartialEq for MinHeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MinHeapItem {}

impl Ord for MinHeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .value
            .total_cmp(&self.value)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for MinHeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Heap item for ascending order: the heap top is the largest value, then
// latest index.
#[derive(Debug)]
struct MaxHeapItem {
    value: f64,
    index: usize,
}

impl PartialEq for MaxHeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MaxHeapItem {}

impl Ord for MaxHeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .total_cmp(&other.value)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for MaxHeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Select the positions of the top K values.
///
/// Input is `(position, value)` pairs; NaN values are skipped. Output is
/// best-first, ties in ascending position order.
///
/// Time complexity: O(N log K). Space complexity: O(K).
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `k` is zero.
///
/// # Examples
///
/// ```rust
/// use rubric_engine::topk::{top_k_indices, SortOrder};
///
/// # fn main() -> rubric_engine::Result<()> {
/// let scores = [1.0, 5.0, 3.0, 5.0, 2.0];
/// let top = top_k_indices(scores.iter().copied().enumerate(), 3, SortOrder::Descending)?;
/// assert_eq!(top, vec![1, 3, 2]);
/// # Ok(())
/// # }
/// ```
pub fn top_k_indices<I>(values: I, k: usize, order: SortOrder) -> crate::Result<Vec<usize>>
where
    I: IntoIterator<Item = (usize, f64)>,
{
    if k == 0 {
        return Err(Error::InvalidInput("k must be greater than 0".to_string()));
    }

    let values = values.into_iter().filter(|(_, v)| !v.is_nan());
    match order {
        SortOrder::Descending => {
            let mut heap: BinaryHeap<MinHeapItem> = BinaryHeap::with_capacity(k);
            for (index, value) in values {
                let item = MinHeapItem { value, index };
                if heap.len() < k {
                    heap.push(item);
                } else if let Some(top) = heap.peek() {
                    if item < *top {
                        heap.pop();
                        heap.push(item);
                    }
                }
            }
            Ok(heap.into_sorted_vec().into_iter().map(|i| i.index).collect())
        }
        SortOrder::Ascending => {
            let mut heap: BinaryHeap<MaxHeapItem> = BinaryHeap::with_capacity(k);
            for (index, value) in values {
                let item = MaxHeapItem { value, index };
                if heap.len() < k {
                    heap.push(item);
                } else if let Some(top) = heap.peek() {
                    if item < *top {
                        heap.pop();
                        heap.push(item);
                    }
                }
            }
            Ok(heap.into_sorted_vec().into_iter().map(|i| i.index).collect())
        }
    }
}
