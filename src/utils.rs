use crate::error::{ModelError, ModelResult};
use std::ops::Range;

/// Helper function for evaluating the dot product between two vectors.
/// This implementation expect f64 slices and does not use any kind
/// of SSE operations. The slices are expected to have the same length.
///
/// ## Example
///
/// ```
/// let a = vec![1.0, 2.0, 3.0];
/// let b = vec![1.0, 1.0, 1.0];
///
/// let dot = gridblocks::utils::dot_product(&a, &b);
/// assert_eq!(dot, 6.0);
/// ```
pub fn dot_product(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(a.len(), b.len());
    let mut product = 0.0;
    for i in 0..a.len() {
        product += a[i] * b[i];
    }
    product
}

/// Rejects any index of `subset` that is not below `extent`.
pub fn validate_subset(
    subset: &[usize],
    extent: usize,
    what: &'static str,
) -> ModelResult<()> {
    match subset.iter().find(|i| **i >= extent) {
        Some(index) => Err(ModelError::OutOfRangeIndex {
            what,
            index: *index,
            extent,
        }),
        None => Ok(()),
    }
}

/// Rejects a range that ends past `extent`.
pub fn validate_range(
    range: &Range<usize>,
    extent: usize,
    what: &'static str,
) -> ModelResult<()> {
    if range.end > extent {
        return Err(ModelError::OutOfRangeIndex {
            what,
            index: range.end - 1,
            extent,
        });
    }
    Ok(())
}

/// Makes sure at least `needed` values were supplied.
pub fn validate_values(
    values: &[f64],
    needed: usize,
    what: &'static str,
) -> ModelResult<()> {
    if values.len() < needed {
        return Err(ModelError::shape(what, needed, values.len()));
    }
    Ok(())
}

/// Expands `values` to `size` entries, broadcasting a single value.
///
/// ## Example
///
/// ```
/// let v = gridblocks::utils::broadcast(&[2.0], 3, "kappa").unwrap();
/// assert_eq!(v, vec![2.0, 2.0, 2.0]);
/// ```
pub fn broadcast<T: Clone>(
    values: &[T],
    size: usize,
    what: &str,
) -> ModelResult<Vec<T>> {
    match values.len() {
        n if n == size => Ok(values.to_vec()),
        1 => Ok(vec![values[0].clone(); size]),
        n => Err(ModelError::shape(what, size, n)),
    }
}

/// Inverse of the broadcasts applied on read: the `len` values whose
/// consecutive repetition gives back `values`, when there are any.
pub fn compact(values: &[f64], len: usize) -> Option<Vec<f64>> {
    if len == values.len() {
        return Some(values.to_vec());
    }
    if len == 0 || values.is_empty() || values.len() % len != 0 {
        return None;
    }
    let run = values.len() / len;
    values
        .chunks(run)
        .all(|chunk| chunk.iter().all(|v| *v == chunk[0]))
        .then(|| values.chunks(run).map(|chunk| chunk[0]).collect())
}
