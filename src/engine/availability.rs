use crate::model::*;

// ── Interval algebra ──────────────────────────────────────────────

/// Free sub-intervals of `window` once every busy span is removed.
/// `busy` may be unsorted, overlapping, or reach outside the window.
pub fn free_spans(window: &Span, busy: &[Span]) -> Vec<Span> {
    let mut clamped: Vec<Span> = busy
        .iter()
        .filter(|b| b.overlaps(window))
        .map(|b| Span::new(b.start.max(window.start), b.end.min(window.end)))
        .collect();
    clamped.sort_by_key(|s| s.start);
    let merged = merge_overlapping(&clamped);
    subtract_intervals(&[*window], &merged)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Remove sorted, disjoint `to_remove` from sorted, disjoint `base`.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
