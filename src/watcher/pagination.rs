//! Block range pagination.
//!
//! Splits an inclusive range `[current, last]` into contiguous pages of at
//! most `page_size` blocks. Continuous polling and backfill use the same math.

use serde::Serialize;

/// Inclusive block range `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn blocks(&self) -> std::ops::RangeInclusive<u64> {
        self.from..=self.to
    }
}

/// Number of pages covering `[current, last]`.
///
/// Callers guarantee `last >= current` and `page_size >= 1`.
pub fn total_pages(current: u64, last: u64, page_size: u64) -> u64 {
    debug_assert!(last >= current && page_size >= 1);
    (last - current) / page_size + 1
}

/// Page `index` of `[current, last]`, the last page clipped to `last`.
pub fn page(current: u64, index: u64, page_size: u64, last: u64) -> BlockRange {
    let from = current + index * page_size;
    let to = from.saturating_add(page_size - 1).min(last);
    BlockRange { from, to }
}

/// Iterator over every page of `[current, last]`, in order.
pub fn pages(current: u64, last: u64, page_size: u64) -> impl Iterator<Item = BlockRange> {
    let page_size = page_size.max(1);
    let count = if last < current {
        0
    } else {
        total_pages(current, last, page_size)
    };
    (0..count).map(move |index| page(current, index, page_size, last))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 150 blocks in pages of 50: three pages, the third being [200, 249].
    #[test]
    fn test_total_pages_and_boundaries() {
        assert_eq!(total_pages(100, 249, 50), 3);
        assert_eq!(total_pages(100, 250, 50), 4);
        assert_eq!(total_pages(10, 10, 50), 1);

        assert_eq!(page(100, 0, 50, 249), BlockRange { from: 100, to: 149 });
        assert_eq!(page(100, 2, 50, 249), BlockRange { from: 200, to: 249 });
    }

    #[test]
    fn test_last_page_is_clipped() {
        let all: Vec<_> = pages(0, 9, 4).collect();
        assert_eq!(
            all,
            vec![
                BlockRange { from: 0, to: 3 },
                BlockRange { from: 4, to: 7 },
                BlockRange { from: 8, to: 9 },
            ]
        );
    }

    #[test]
    fn test_pages_cover_range_exactly() {
        for current in [0u64, 1, 7, 100] {
            for span in [0u64, 1, 2, 49, 50, 51, 149] {
                for page_size in [1u64, 2, 3, 50, 1000] {
                    let last = current + span;
                    let all: Vec<_> = pages(current, last, page_size).collect();

                    assert_eq!(all.len() as u64, total_pages(current, last, page_size));
                    assert_eq!(all.first().unwrap().from, current);
                    assert_eq!(all.last().unwrap().to, last);
                    for pair in all.windows(2) {
                        assert_eq!(pair[0].to + 1, pair[1].from);
                    }
                    assert!(all.iter().all(|p| p.block_count() <= page_size && p.from <= p.to));
                }
            }
        }
    }

    #[test]
    fn test_empty_when_last_before_current() {
        assert_eq!(pages(10, 9, 5).count(), 0);
    }
}
