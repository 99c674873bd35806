//! Bucket configuration and calibration
//!
//! Users describe the sizes they intend to allocate as a free-form list of
//! `(size, capacity)` records. [`calibrate`] normalizes that list into the
//! strict shape the slab needs: consecutive power-of-two block sizes with
//! no gaps, starting at the power of two covering the smallest request.

use crate::utils::next_power_of_two;

/// Default growth multiplier applied when a bucket runs out of blocks
pub const DEFAULT_GROWTH_FACTOR: u32 = 2;

/// One bucket description: a value size and how many slots to provision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockConfig {
    /// Size in bytes of every slot in the bucket
    pub block_size: usize,
    /// Slot count of the bucket's eagerly constructed first block
    pub initial_capacity: u32,
    /// Slot count used when a bucket with no initial capacity must grow
    pub contingency_capacity: u32,
    /// Capacity multiplier for each appended block
    pub growth_factor: u32,
}

impl BlockConfig {
    /// Bucket with default contingency and growth
    pub fn new(block_size: usize, initial_capacity: u32) -> Self {
        Self {
            block_size,
            initial_capacity,
            contingency_capacity: 0,
            growth_factor: DEFAULT_GROWTH_FACTOR,
        }
    }

    /// Bucket with every knob explicit
    pub fn with_growth(
        block_size: usize,
        initial_capacity: u32,
        contingency_capacity: u32,
        growth_factor: u32,
    ) -> Self {
        Self {
            block_size,
            initial_capacity,
            contingency_capacity,
            growth_factor,
        }
    }
}

/// Normalizes `configs` into strictly consecutive power-of-two bucket sizes.
///
/// The input is stably sorted by size. Starting from the power of two
/// covering the smallest entry, each doubling step either merges every
/// input at or below it (capacities summed, growth factor rounded up to a
/// power of two) or emits a zero-capacity gap filler that will grow on
/// demand with `contingency_capacity` slots.
///
/// An empty input calibrates to an empty output.
pub fn calibrate(contingency_capacity: u32, configs: &[BlockConfig]) -> Vec<BlockConfig> {
    let mut sorted = configs.to_vec();
    sorted.sort_by_key(|config| config.block_size);
    let Some(first) = sorted.first() else {
        return Vec::new();
    };
    let mut desired_size = next_power_of_two(first.block_size);
    let mut result = Vec::new();
    let mut group_start = 0;
    while group_start < sorted.len() {
        let group_end = sorted[group_start..]
            .iter()
            .position(|config| desired_size < config.block_size)
            .map_or(sorted.len(), |offset| group_start + offset);
        if group_end == group_start {
            // no configuration covers this size; reserve an on-demand bucket
            result.push(BlockConfig::with_growth(
                desired_size,
                0,
                contingency_capacity,
                DEFAULT_GROWTH_FACTOR,
            ));
        } else {
            let total_capacity = sorted[group_start..group_end]
                .iter()
                .map(|config| config.initial_capacity)
                .sum();
            result.push(BlockConfig::with_growth(
                desired_size,
                total_capacity,
                contingency_capacity,
                next_power_of_two(sorted[group_start].growth_factor as usize) as u32,
            ));
            group_start = group_end;
        }
        desired_size *= 2;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_calibrates_to_empty() {
        assert!(calibrate(2, &[]).is_empty());
    }

    #[test]
    fn fills_gaps_with_contingency_buckets() {
        let result = calibrate(2, &[BlockConfig::new(16, 16), BlockConfig::new(64, 4)]);
        assert_eq!(
            result,
            vec![
                BlockConfig::with_growth(16, 16, 2, 2),
                BlockConfig::with_growth(32, 0, 2, 2),
                BlockConfig::with_growth(64, 4, 2, 2),
            ]
        );
    }

    #[test]
    fn reorders_and_merges_into_power_of_two_groups() {
        let result = calibrate(
            2,
            &[
                BlockConfig::new(32, 4),
                BlockConfig::new(24, 8),
                BlockConfig::new(16, 16),
            ],
        );
        assert_eq!(
            result,
            vec![
                BlockConfig::with_growth(16, 16, 2, 2),
                BlockConfig::with_growth(32, 12, 2, 2),
            ]
        );
    }

    #[test]
    fn smallest_size_rounds_up_to_power_of_two() {
        let result = calibrate(1, &[BlockConfig::new(24, 8)]);
        assert_eq!(result, vec![BlockConfig::with_growth(32, 8, 1, 2)]);
    }

    #[test]
    fn growth_factor_gets_power_of_two_ceiling() {
        let result = calibrate(1, &[BlockConfig::with_growth(16, 4, 0, 3)]);
        assert_eq!(result, vec![BlockConfig::with_growth(16, 4, 1, 4)]);
    }

    #[test]
    fn sizes_are_strictly_consecutive_powers_of_two() {
        let result = calibrate(
            4,
            &[
                BlockConfig::new(3, 1),
                BlockConfig::new(100, 2),
                BlockConfig::new(17, 5),
            ],
        );
        let mut expected = next_power_of_two(3);
        for config in &result {
            assert_eq!(config.block_size, expected);
            expected *= 2;
        }
        assert!(result.last().expect("nonempty").block_size >= 100usize.next_power_of_two() / 2);
    }
}
