//! Decides whether the page view changed enough to deserve a fresh summary.

use std::collections::HashSet;
use tracing::debug;

use crate::types::ElementDescriptor;

fn fingerprints(elements: &[ElementDescriptor]) -> HashSet<String> {
    elements.iter().map(ElementDescriptor::fingerprint).collect()
}

/// Jaccard similarity of the two views' fingerprint sets. Two empty views are
/// identical.
pub fn similarity(previous: &[ElementDescriptor], current: &[ElementDescriptor]) -> f64 {
    let a = fingerprints(previous);
    let b = fingerprints(current);
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    let intersection = a.intersection(&b).count();
    intersection as f64 / union as f64
}

/// `true` when there is no previous view or the similarity drops below
/// `threshold`.
pub fn changed(
    previous: Option<&[ElementDescriptor]>,
    current: &[ElementDescriptor],
    threshold: f64,
) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    let score = similarity(previous, current);
    debug!(similarity = score, threshold, "compared page views");
    score < threshold
}
