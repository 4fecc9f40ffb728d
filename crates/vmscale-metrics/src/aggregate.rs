use vmscale_core::AggregationMethod;

/// Reduce samples to one value. `None` when there is nothing to reduce.
pub fn aggregate(method: AggregationMethod, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let value = match method {
        AggregationMethod::Mean => values.iter().sum::<f64>() / values.len() as f64,
        AggregationMethod::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregationMethod::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggregationMethod::Median => {
            let mut sorted = values.to_vec();
            sorted.sort_by(f64::total_cmp);
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 0 {
                (sorted[mid - 1] + sorted[mid]) / 2.0
            } else {
                sorted[mid]
            }
        }
    };
    Some(value)
}
