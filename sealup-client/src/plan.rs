//! Splitting a payload into numbered parts

use sealup_core::PartNumber;
use std::ops::Range;

use crate::{Result, UploadError};

/// Contiguous byte range uploaded as one part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpan {
    pub part_number: PartNumber,
    pub offset: usize,
    pub len: usize,
}

impl PartSpan {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Part layout of a payload
#[derive(Debug, Clone)]
pub struct PartPlan {
    total_len: usize,
    part_size: usize,
    spans: Vec<PartSpan>,
}

impl PartPlan {
    /// Plan `total_len` bytes in parts of `part_size`
    ///
    /// The part size grows when needed so the plan stays within the
    /// 10,000 part limit.
    pub fn new(total_len: usize, part_size: usize) -> Result<Self> {
        if part_size == 0 {
            return Err(UploadError::InvalidPart("part size must be positive".to_string()));
        }
        if total_len == 0 {
            return Err(UploadError::InvalidPart("payload is empty".to_string()));
        }

        let part_size = part_size.max(total_len.div_ceil(PartNumber::MAX as usize));
        let count = total_len.div_ceil(part_size);

        let mut spans = Vec::with_capacity(count);
        for i in 0..count {
            let offset = i * part_size;
            spans.push(PartSpan {
                part_number: PartNumber::new(i as u32 + 1)?,
                offset,
                len: part_size.min(total_len - offset),
            });
        }

        Ok(PartPlan {
            total_len,
            part_size,
            spans,
        })
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Effective part size; the last part may be shorter
    pub fn part_size(&self) -> usize {
        self.part_size
    }

    pub fn part_count(&self) -> u32 {
        self.spans.len() as u32
    }

    pub fn parts(&self) -> &[PartSpan] {
        &self.spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exact_and_ragged_split() {
        let plan = PartPlan::new(30, 10).unwrap();
        assert_eq!(plan.part_count(), 3);
        assert!(plan.parts().iter().all(|s| s.len == 10));

        let plan = PartPlan::new(25, 10).unwrap();
        assert_eq!(plan.part_count(), 3);
        assert_eq!(plan.parts()[2].range(), 20..25);
    }

    #[test]
    fn test_small_payload_is_one_part() {
        let plan = PartPlan::new(5, 10).unwrap();
        assert_eq!(plan.part_count(), 1);
        assert_eq!(plan.parts()[0].part_number.get(), 1);
        assert_eq!(plan.parts()[0].len, 5);
    }

    #[test]
    fn test_part_size_grows_to_respect_limit() {
        let plan = PartPlan::new(100_000, 1).unwrap();
        assert_eq!(plan.part_count(), 10_000);
        assert_eq!(plan.part_size(), 10);

        let plan = PartPlan::new(100_001, 1).unwrap();
        assert!(plan.part_count() <= 10_000);
    }

    #[test]
    fn test_rejects_empty_input() {
        assert!(matches!(PartPlan::new(0, 10), Err(UploadError::InvalidPart(_))));
        assert!(matches!(PartPlan::new(10, 0), Err(UploadError::InvalidPart(_))));
    }

    proptest! {
        #[test]
        fn spans_tile_the_payload(total in 1usize..200_000, part_size in 1usize..50_000) {
            let plan = PartPlan::new(total, part_size).unwrap();
            let spans = plan.parts();

            prop_assert!(spans.len() <= PartNumber::MAX as usize);
            prop_assert_eq!(spans[0].offset, 0);
            prop_assert_eq!(spans.last().unwrap().range().end, total);

            for (i, pair) in spans.windows(2).enumerate() {
                prop_assert_eq!(pair[0].range().end, pair[1].offset);
                prop_assert_eq!(pair[0].len, plan.part_size());
                prop_assert_eq!(pair[1].part_number.get(), i as u32 + 2);
            }
            prop_assert!(spans.iter().all(|s| s.len > 0));
        }
    }
}
