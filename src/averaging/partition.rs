//! Capacity-proportional partitioning of a flat tensor buffer

use std::ops::Range;

/// Split `total` elements into one contiguous span per member
///
/// Spans are proportional to capacity using the largest-remainder method,
/// so they always sum to `total`. Members with zero (or invalid) capacity
/// get an empty span. Returns `None` when no member has capacity.
pub fn load_balance(total: usize, capacities: &[f64]) -> Option<Vec<usize>> {
    let clean: Vec<f64> = capacities
        .iter()
        .map(|c| if c.is_finite() && *c > 0.0 { *c } else { 0.0 })
        .collect();
    let sum: f64 = clean.iter().sum();
    if sum <= 0.0 {
        return None;
    }

    let quotas: Vec<f64> = clean.iter().map(|c| total as f64 * c / sum).collect();
    let mut spans: Vec<usize> = quotas.iter().map(|q| q.floor() as usize).collect();

    // Rounding can push a quota over an integer boundary
    let mut assigned: usize = spans.iter().sum();
    while assigned > total {
        if let Some(largest) = (0..spans.len()).max_by_key(|&i| spans[i]) {
            spans[largest] -= 1;
        }
        assigned -= 1;
    }
    let leftover = total - assigned;

    // Hand out the remainder by largest fractional part, lowest index first on ties
    let mut order: Vec<usize> = (0..clean.len()).filter(|&i| clean[i] > 0.0).collect();
    order.sort_by(|&a, &b| {
        let fa = quotas[a] - quotas[a].floor();
        let fb = quotas[b] - quotas[b].floor();
        fb.partial_cmp(&fa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    for &i in order.iter().cycle().take(leftover) {
        spans[i] += 1;
    }

    Some(spans)
}

/// Cut member spans into parts of at most `max_part_size` elements
///
/// Returns `(member_index, range)` in buffer order. Empty spans yield no parts.
pub fn split_parts(spans: &[usize], max_part_size: usize) -> Vec<(usize, Range<usize>)> {
    let max_part_size = max_part_size.max(1);
    let mut parts = Vec::new();
    let mut offset = 0;

    for (member, &span) in spans.iter().enumerate() {
        let end = offset + span;
        let mut start = offset;
        while start < end {
            let stop = (start + max_part_size).min(end);
            parts.push((member, start..stop));
            start = stop;
        }
        offset = end;
    }

    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proportional_spans() {
        assert_eq!(load_balance(100, &[1.0, 1.0, 2.0]).unwrap(), vec![25, 25, 50]);
        assert_eq!(load_balance(10, &[1.0, 1.0, 1.0]).unwrap(), vec![4, 3, 3]);
    }

    #[test]
    fn test_spans_sum_to_total() {
        for total in [0, 1, 7, 999, 65_537] {
            let spans = load_balance(total, &[0.3, 2.7, 1.1, 0.9]).unwrap();
            assert_eq!(spans.iter().sum::<usize>(), total);
        }
    }

    #[test]
    fn test_zero_capacity_owns_nothing() {
        let spans = load_balance(9, &[0.0, 1.0, 2.0]).unwrap();
        assert_eq!(spans, vec![0, 3, 6]);

        let spans = load_balance(1, &[0.0, 1.0]).unwrap();
        assert_eq!(spans, vec![0, 1]);
    }

    #[test]
    fn test_single_element_goes_to_first_eligible() {
        assert_eq!(load_balance(1, &[1.0, 1.0, 1.0]).unwrap(), vec![1, 0, 0]);
    }

    #[test]
    fn test_no_capacity() {
        assert!(load_balance(10, &[0.0, 0.0]).is_none());
        assert!(load_balance(10, &[f64::NAN, -1.0]).is_none());
        assert!(load_balance(10, &[]).is_none());
    }

    #[test]
    fn test_split_parts_respects_max() {
        let parts = split_parts(&[5, 0, 3], 2);
        assert_eq!(
            parts,
            vec![(0, 0..2), (0, 2..4), (0, 4..5), (2, 5..7), (2, 7..8)]
        );
    }

    #[test]
    fn test_split_parts_covers_buffer() {
        let spans = load_balance(1000, &[1.0, 3.0, 0.0, 2.0]).unwrap();
        let parts = split_parts(&spans, 64);
        let mut next = 0;
        for (_, range) in &parts {
            assert_eq!(range.start, next);
            assert!(range.len() <= 64);
            next = range.end;
        }
        assert_eq!(next, 1000);
    }
}
