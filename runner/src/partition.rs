use std::ops::Range;

/// split `[0, total)` into `parts` contiguous ranges whose lengths differ by at most one
///
/// The first `total % parts` ranges receive the extra element. The result only depends on
/// the inputs, so a node maps to the same simulations across restarts.
pub fn partition(total: usize, parts: usize) -> Vec<Range<usize>> {
    if parts == 0 {
        return Vec::new();
    }

    let base = total / parts;
    let extra = total % parts;
    let mut start = 0;

    (0..parts)
        .map(|part| {
            let len = base + usize::from(part < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

/// range owned by a single node, `None` if the node does not exist
pub fn node_range(total: usize, parts: usize, node: usize) -> Option<Range<usize>> {
    partition(total, parts).into_iter().nth(node)
}
