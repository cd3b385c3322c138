//! Strain distribution patterns
//!
//! A SNP typed in the founders of a cross is summarized by which founders
//! carry the alternate allele: bit f of the pattern is set when founder f
//! has allele 1.

use anyhow::{anyhow, Result};

/// Pattern integer for one SNP from founder alleles (0 or 1 per founder).
pub fn calc_sdp(alleles: &[u8]) -> Result<u32> {
    if alleles.is_empty() {
        return Err(anyhow!("No founder alleles"));
    }
    if alleles.len() > 32 {
        return Err(anyhow!(
            "At most 32 founders supported, got {}",
            alleles.len()
        ));
    }

    let mut sdp = 0u32;
    for (f, &a) in alleles.iter().enumerate() {
        match a {
            0 => {}
            1 => sdp |= 1 << f,
            other => return Err(anyhow!("Founder allele must be 0 or 1, got {}", other)),
        }
    }
    Ok(sdp)
}

/// Founder alleles from a pattern integer.
pub fn invert_sdp(sdp: u32, n_founders: usize) -> Result<Vec<u8>> {
    if n_founders == 0 || n_founders > 32 {
        return Err(anyhow!(
            "Number of founders must be between 1 and 32, got {}",
            n_founders
        ));
    }
    if n_founders < 32 && sdp >= (1u32 << n_founders) {
        return Err(anyhow!(
            "Pattern {} does not fit in {} founders",
            sdp,
            n_founders
        ));
    }
    Ok((0..n_founders).map(|f| ((sdp >> f) & 1) as u8).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_sdp() {
        assert_eq!(calc_sdp(&[0, 1]).unwrap(), 2);
        assert_eq!(calc_sdp(&[1, 0, 1, 1]).unwrap(), 13);
        assert!(calc_sdp(&[0, 2]).is_err());
    }

    #[test]
    fn test_invert_sdp() {
        assert_eq!(invert_sdp(13, 4).unwrap(), vec![1, 0, 1, 1]);
        assert!(invert_sdp(16, 4).is_err());
        for sdp in 0..8 {
            assert_eq!(calc_sdp(&invert_sdp(sdp, 3).unwrap()).unwrap(), sdp);
        }
    }
}
