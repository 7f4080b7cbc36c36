//! Host-side copies of the 256-entry tables produced by the stages.

use itertools::Itertools;
use ndarray::Array1;

use crate::{Error, Result};

/// Number of intensity levels, and the length of every table.
pub const BINS: usize = 256;

fn checked_table<T: Copy>(name: &str, values: &[T]) -> Result<Array1<T>> {
    if values.len() != BINS {
        return Err(Error::device(format!(
            "{name} read back {} entries, expected {BINS}",
            values.len()
        )));
    }
    Ok(Array1::from_vec(values.to_vec()))
}

fn is_non_decreasing<T: PartialOrd>(values: &Array1<T>) -> bool {
    values.iter().tuple_windows().all(|(a, b)| a <= b)
}

/// Pixel count per intensity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    counts: Array1<u32>,
}

impl Histogram {
    pub fn from_counts(counts: &[u32]) -> Result<Self> {
        Ok(Self {
            counts: checked_table("histogram", counts)?,
        })
    }

    pub fn get(&self, intensity: u8) -> u32 {
        self.counts[intensity as usize]
    }

    pub fn counts(&self) -> &Array1<u32> {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }

    /// Number of intensities that occur at least once.
    pub fn used(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }
}

/// Inclusive running total of a [`Histogram`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CumulativeHistogram {
    values: Array1<u32>,
}

impl CumulativeHistogram {
    pub fn from_values(values: &[u32]) -> Result<Self> {
        Ok(Self {
            values: checked_table("cumulative histogram", values)?,
        })
    }

    pub fn get(&self, intensity: u8) -> u32 {
        self.values[intensity as usize]
    }

    pub fn values(&self) -> &Array1<u32> {
        &self.values
    }

    /// Cumulative count at the lowest populated intensity.
    pub fn cdf_min(&self) -> Option<u32> {
        self.values.iter().copied().find(|&v| v > 0)
    }

    pub fn total(&self) -> u32 {
        self.values[BINS - 1]
    }

    pub fn is_monotonic(&self) -> bool {
        is_non_decreasing(&self.values)
    }

    /// Whether every entry is the prefix sum of `histogram` up to and including it.
    pub fn matches(&self, histogram: &Histogram) -> bool {
        let mut running = 0u64;
        self.values
            .iter()
            .zip(histogram.counts().iter())
            .all(|(&c, &h)| {
                running += h as u64;
                running == c as u64
            })
    }
}

/// Intensity remapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lut {
    entries: Array1<u8>,
}

impl Lut {
    /// Build from the device representation (one `u32` per entry), rejecting entries above 255.
    pub fn from_words(words: &[u32]) -> Result<Self> {
        let entries = words
            .iter()
            .enumerate()
            .map(|(i, &w)| {
                u8::try_from(w)
                    .map_err(|_| Error::device(format!("LUT entry {i} out of range: {w}")))
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(Self {
            entries: checked_table("LUT", &entries)?,
        })
    }

    pub fn apply(&self, intensity: u8) -> u8 {
        self.entries[intensity as usize]
    }

    pub fn entries(&self) -> &Array1<u8> {
        &self.entries
    }

    pub fn is_identity(&self) -> bool {
        self.entries.iter().enumerate().all(|(i, &v)| i == v as usize)
    }

    pub fn is_monotonic(&self) -> bool {
        is_non_decreasing(&self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram_of(pixels: &[u8]) -> Histogram {
        let mut counts = [0u32; BINS];
        pixels.iter().for_each(|&p| counts[p as usize] += 1);
        Histogram::from_counts(&counts).unwrap()
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        assert!(Histogram::from_counts(&[0; 255]).is_err());
        assert!(CumulativeHistogram::from_values(&[0; 257]).is_err());
        assert!(Lut::from_words(&[0; 3]).is_err());
    }

    #[test]
    fn test_lut_entry_above_255_is_rejected() {
        let mut words: Vec<u32> = (0..256).collect();
        words[7] = 256;
        assert!(matches!(Lut::from_words(&words), Err(Error::Device(_))));
    }

    #[test]
    fn test_histogram_totals() {
        let hist = histogram_of(&[3, 3, 7, 255]);
        assert_eq!(hist.total(), 4);
        assert_eq!(hist.used(), 3);
        assert_eq!(hist.get(3), 2);
        assert_eq!(hist.get(4), 0);
    }

    #[test]
    fn test_cumulative_checks() {
        let hist = histogram_of(&[0, 0, 255, 255]);
        let mut values = [2u32; BINS];
        values[255] = 4;
        let cum = CumulativeHistogram::from_values(&values).unwrap();
        assert!(cum.is_monotonic());
        assert!(cum.matches(&hist));
        assert_eq!(cum.cdf_min(), Some(2));
        assert_eq!(cum.total(), 4);

        values[10] = 1;
        let broken = CumulativeHistogram::from_values(&values).unwrap();
        assert!(!broken.is_monotonic());
        assert!(!broken.matches(&hist));
    }

    #[test]
    fn test_cdf_min_skips_leading_zeros() {
        let mut values = [0u32; BINS];
        values[100..].iter_mut().for_each(|v| *v = 9);
        let cum = CumulativeHistogram::from_values(&values).unwrap();
        assert_eq!(cum.cdf_min(), Some(9));
    }

    #[test]
    fn test_identity_lut() {
        let words: Vec<u32> = (0..256).collect();
        let lut = Lut::from_words(&words).unwrap();
        assert!(lut.is_identity());
        assert!(lut.is_monotonic());
        assert_eq!(lut.apply(42), 42);

        let mut words: Vec<u32> = (0..256).collect();
        words.swap(1, 2);
        let lut = Lut::from_words(&words).unwrap();
        assert!(!lut.is_identity());
        assert!(!lut.is_monotonic());
    }
}
