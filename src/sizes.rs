//! The thumbnail ladder: fixed widths a thumbnail can be requested at.

/// Ascending rungs, in pixels of width.
pub const LADDER: [u32; 7] = [200, 400, 800, 1200, 1800, 2400, 4000];

/// Largest rung.
pub const MAX_RUNG: u32 = LADDER[LADDER.len() - 1];

/// Sizes to generate for an original of width `width`: every rung not above
/// it, plus `width` itself when it sits between rungs (or below the first).
pub fn ladder_for(width: u32) -> Vec<u32> {
    if width == 0 {
        return Vec::new();
    }

    let mut sizes: Vec<u32> = LADDER.iter().copied().filter(|&s| s <= width).collect();
    if width <= MAX_RUNG && !LADDER.contains(&width) {
        sizes.push(width);
    }
    sizes
}

/// Whether a thumbnail of `size` may be requested for an original of `width`.
pub fn is_valid_size(size: u32, width: u32) -> bool {
    if size == 0 {
        return false;
    }
    (LADDER.contains(&size) && size <= width) || (size == width && width <= MAX_RUNG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_between_rungs() {
        assert_eq!(
            ladder_for(3724),
            vec![200, 400, 800, 1200, 1800, 2400, 3724]
        );
    }

    #[test]
    fn test_ladder_above_largest() {
        assert_eq!(
            ladder_for(4123),
            vec![200, 400, 800, 1200, 1800, 2400, 4000]
        );
    }

    #[test]
    fn test_ladder_small_and_exact() {
        assert_eq!(ladder_for(300), vec![200, 300]);
        assert_eq!(ladder_for(150), vec![150]);
        assert_eq!(ladder_for(800), vec![200, 400, 800]);
        assert!(ladder_for(0).is_empty());
    }

    #[test]
    fn test_valid_size_matches_ladder() {
        for width in [0, 150, 300, 800, 3724, 4000, 4123, 9000] {
            let ladder = ladder_for(width);
            for size in [100, 150, 200, 300, 400, 800, 3724, 4000, 4123, 9000] {
                assert_eq!(
                    is_valid_size(size, width),
                    ladder.contains(&size),
                    "size {} width {}",
                    size,
                    width
                );
            }
        }
    }
}
