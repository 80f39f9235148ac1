use image::{DynamicImage, GenericImageView};
use std::collections::HashMap;

/// Edge length the raster is reduced to before bucketing.
const SAMPLE_EDGE: u32 = 64;

/// Dominant color as `#rrggbb`: pixels are bucketed at 4 bits per channel
/// and the most populated bucket's mean is returned. Mostly transparent
/// pixels are ignored.
pub fn dominant_color(img: &DynamicImage) -> String {
    let sample = if img.width() > SAMPLE_EDGE || img.height() > SAMPLE_EDGE {
        img.thumbnail(SAMPLE_EDGE, SAMPLE_EDGE).to_rgba8()
    } else {
        img.to_rgba8()
    };

    let mut buckets: HashMap<(u8, u8, u8), (u64, u64, u64, u64)> = HashMap::new();
    for pixel in sample.pixels() {
        let [r, g, b, a] = pixel.0;
        if a < 128 {
            continue;
        }
        let entry = buckets.entry((r >> 4, g >> 4, b >> 4)).or_insert((0, 0, 0, 0));
        entry.0 += r as u64;
        entry.1 += g as u64;
        entry.2 += b as u64;
        entry.3 += 1;
    }

    let best = buckets
        .into_iter()
        .max_by(|a, b| a.1 .3.cmp(&b.1 .3).then_with(|| b.0.cmp(&a.0)));

    match best {
        Some((_, (r, g, b, n))) if n > 0 => {
            format!("#{:02x}{:02x}{:02x}", r / n, g / n, b / n)
        }
        _ => "#000000".to_string(),
    }
}
