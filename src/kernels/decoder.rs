use anyhow::{bail, Result};

/// Rate-1/3 repetition code: each message byte is sent three times.
pub const CODE_RATE_INVERSE: usize = 3;

pub fn encode(message: &[u8]) -> Vec<u8> {
    message
        .iter()
        .flat_map(|&b| [b; CODE_RATE_INVERSE])
        .collect()
}

/// Bitwise majority vote over each group of three received bytes.
pub fn decode(received: &[u8]) -> Result<Vec<u8>> {
    if received.len() % CODE_RATE_INVERSE != 0 {
        bail!(
            "encoded length {} is not a multiple of {}",
            received.len(),
            CODE_RATE_INVERSE
        );
    }
    Ok(received
        .chunks_exact(CODE_RATE_INVERSE)
        .map(|c| (c[0] & c[1]) | (c[0] & c[2]) | (c[1] & c[2]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_corrupted_copy_is_corrected() {
        let mut frame = encode(b"ERA");
        frame[1] ^= 0b1010_0101;
        frame[8] = 0;
        assert_eq!(decode(&frame).unwrap(), b"ERA".to_vec());
    }

    #[test]
    fn test_two_corrupted_copies_win() {
        let mut frame = encode(&[0x0f]);
        frame[0] = 0xf0;
        frame[2] = 0xf0;
        assert_eq!(decode(&frame).unwrap(), vec![0xf0]);
    }

    #[test]
    fn test_truncated_frame() {
        assert!(decode(&[1, 2]).is_err());
        assert_eq!(decode(&[]).unwrap(), Vec::<u8>::new());
    }
}
