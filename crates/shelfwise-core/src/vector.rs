//! Embedding vector helpers.
//!
//! Product embeddings live in a pgvector column on the primary. The mirror
//! keeps the same values as text (`[0.1,0.2,...]`, the pgvector output
//! format, which is also a JSON array), so similarity there is computed in
//! Rust with the same metric the primary uses (`<->`, Euclidean distance).

/// Format a vector in pgvector text form.
///
/// ```rust
/// use shelfwise_core::vector::format_vector;
///
/// assert_eq!(format_vector(&[1.0, -0.5]), "[1,-0.5]");
/// ```
pub fn format_vector(vec: &[f32]) -> String {
    let parts: Vec<String> = vec.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(","))
}

/// Parse pgvector text form. `None` for anything that is not a non-empty
/// bracketed list of numbers.
pub fn parse_vector(text: &str) -> Option<Vec<f32>> {
    let inner = text.trim().strip_prefix('[')?.strip_suffix(']')?;
    if inner.trim().is_empty() {
        return None;
    }
    inner
        .split(',')
        .map(|v| v.trim().parse::<f32>().ok())
        .collect()
}

/// Euclidean distance. `None` when the lengths differ or either is empty.
pub fn l2_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    Some(sum.sqrt())
}

/// Indices of `candidates` ordered by distance to `query`, nearest first,
/// keeping at most `k`. Candidates without a comparable vector are left out;
/// equal distances keep input order.
pub fn nearest(query: &[f32], candidates: &[Option<Vec<f32>>], k: usize) -> Vec<usize> {
    let mut scored: Vec<(usize, f32)> = candidates
        .iter()
        .enumerate()
        .filter_map(|(i, c)| {
            c.as_deref()
                .and_then(|v| l2_distance(query, v))
                .map(|d| (i, d))
        })
        .collect();
    scored.sort_by(|a, b| a.1.total_cmp(&b.1));
    scored.into_iter().take(k).map(|(i, _)| i).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pgvector_text() {
        assert_eq!(parse_vector("[1,0.5,-2]"), Some(vec![1.0, 0.5, -2.0]));
        assert_eq!(parse_vector(" [ 1 , 2 ] "), Some(vec![1.0, 2.0]));
        assert_eq!(parse_vector("[]"), None);
        assert_eq!(parse_vector("[1,x]"), None);
        assert_eq!(parse_vector("1,2"), None);
    }

    #[test]
    fn test_format_parses_back() {
        let v = vec![0.25f32, -1.0, 3.5];
        assert_eq!(parse_vector(&format_vector(&v)), Some(v));
    }

    #[test]
    fn test_l2_distance() {
        assert_eq!(l2_distance(&[0.0, 0.0], &[3.0, 4.0]), Some(5.0));
        assert_eq!(l2_distance(&[1.0], &[1.0, 2.0]), None);
        assert_eq!(l2_distance(&[], &[]), None);
    }

    #[test]
    fn test_nearest_orders_and_skips() {
        let candidates = vec![
            Some(vec![0.0, 0.0, 1.0]),
            None,
            Some(vec![1.0, 0.0, 0.0]),
            Some(vec![1.0, 0.0]),
            Some(vec![0.9, 0.1, 0.0]),
        ];
        assert_eq!(nearest(&[1.0, 0.0, 0.0], &candidates, 2), vec![2, 4]);
        assert_eq!(nearest(&[1.0, 0.0, 0.0], &candidates, 10), vec![2, 4, 0]);
    }
}
