use anyhow::{bail, Result};

/// Object classes reported by the classification kernel.
pub const LABELS: [&str; 5] = ["none", "car", "truck", "pedestrian", "bicycle"];

/// Pick the class with the highest score. Ties go to the lower class index.
pub fn classify(scores: &[u8]) -> Result<u8> {
    if scores.len() != LABELS.len() {
        bail!(
            "expected {} class scores, got {}",
            LABELS.len(),
            scores.len()
        );
    }
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate() {
        if s > scores[best] {
            best = i;
        }
    }
    Ok(best as u8)
}

pub fn label_name(label: u8) -> &'static str {
    LABELS.get(label as usize).copied().unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmax() {
        assert_eq!(classify(&[1, 9, 3, 9, 0]).unwrap(), 1);
        assert_eq!(classify(&[0, 0, 0, 0, 200]).unwrap(), 4);
        assert_eq!(label_name(3), "pedestrian");
        assert_eq!(label_name(42), "unknown");
    }

    #[test]
    fn test_wrong_frame_size() {
        assert!(classify(&[1, 2, 3]).is_err());
    }
}
