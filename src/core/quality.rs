use image::{GrayImage, RgbImage};

/// Face area giving a full size score, in pixels.
const REFERENCE_FACE_AREA: f32 = 100.0 * 100.0;
/// Laplacian-variance calibration constant for a crisp face crop.
const SHARPNESS_NORM: f32 = 500.0;

const EQUALIZE_TILES: u32 = 4;
const SHARPEN_BLEND: f32 = 0.3;

/// Quality score in 0..1 for a face crop: 0.4 size + 0.4 sharpness + 0.2
/// brightness-centering. Oblique and distant faces score low and get a
/// relaxed match tolerance downstream.
pub fn assess(crop: &RgbImage) -> f32 {
    if crop.width() == 0 || crop.height() == 0 {
        return 0.0;
    }

    let gray = to_luma(crop);

    let area = (crop.width() * crop.height()) as f32;
    let size_score = (area / REFERENCE_FACE_AREA).min(1.0);

    let sharpness_score = (laplacian_variance(&gray) / SHARPNESS_NORM).min(1.0);

    let mean = mean_luma(&gray);
    let brightness_score = 1.0 - ((mean - 128.0).abs() / 128.0).min(1.0);

    size_score * 0.4 + sharpness_score * 0.4 + brightness_score * 0.2
}

/// Preprocess a face crop before encoding: tile-based luma equalization
/// followed by a light sharpen blended 70/30 with the equalized image.
/// Compensates for oblique angles and uneven lighting.
pub fn enhance_for_encoding(crop: &RgbImage) -> RgbImage {
    if crop.width() < 2 || crop.height() < 2 {
        return crop.clone();
    }
    let equalized = equalize_tiles(crop);
    let sharpened = sharpen(&equalized);
    blend(&equalized, &sharpened, 1.0 - SHARPEN_BLEND)
}

fn to_luma(img: &RgbImage) -> GrayImage {
    let mut gray = GrayImage::new(img.width(), img.height());
    for (x, y, pixel) in img.enumerate_pixels() {
        let luma =
            0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32;
        gray.put_pixel(x, y, image::Luma([luma.round().min(255.0) as u8]));
    }
    gray
}

fn mean_luma(gray: &GrayImage) -> f32 {
    let sum: u64 = gray.pixels().map(|p| p[0] as u64).sum();
    let count = (gray.width() * gray.height()).max(1) as f32;
    sum as f32 / count
}

/// Variance of a 4-neighbor Laplacian response over the interior pixels.
fn laplacian_variance(gray: &GrayImage) -> f32 {
    let (w, h) = (gray.width(), gray.height());
    if w < 3 || h < 3 {
        return 0.0;
    }

    let mut responses = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = gray.get_pixel(x, y)[0] as f32;
            let up = gray.get_pixel(x, y - 1)[0] as f32;
            let down = gray.get_pixel(x, y + 1)[0] as f32;
            let left = gray.get_pixel(x - 1, y)[0] as f32;
            let right = gray.get_pixel(x + 1, y)[0] as f32;
            responses.push(up + down + left + right - 4.0 * center);
        }
    }

    let count = responses.len() as f32;
    let mean = responses.iter().sum::<f32>() / count;
    responses.iter().map(|r| (r - mean) * (r - mean)).sum::<f32>() / count
}

/// Per-tile histogram equalization of the luma channel, with the resulting
/// gain applied to all three color channels.
fn equalize_tiles(img: &RgbImage) -> RgbImage {
    let (w, h) = (img.width(), img.height());
    let gray = to_luma(img);
    let mut out = img.clone();

    let tile_w = (w / EQUALIZE_TILES).max(1);
    let tile_h = (h / EQUALIZE_TILES).max(1);

    for ty in 0..EQUALIZE_TILES {
        for tx in 0..EQUALIZE_TILES {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            if x0 >= w || y0 >= h {
                continue;
            }
            // Last row/column of tiles absorbs the remainder.
            let x1 = if tx == EQUALIZE_TILES - 1 { w } else { (x0 + tile_w).min(w) };
            let y1 = if ty == EQUALIZE_TILES - 1 { h } else { (y0 + tile_h).min(h) };

            let mut histogram = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    histogram[gray.get_pixel(x, y)[0] as usize] += 1;
                }
            }

            let total = ((x1 - x0) * (y1 - y0)) as f32;
            let mut cdf = [0f32; 256];
            let mut cumulative = 0u32;
            for (level, count) in histogram.iter().enumerate() {
                cumulative += count;
                cdf[level] = cumulative as f32 / total;
            }

            for y in y0..y1 {
                for x in x0..x1 {
                    let luma = gray.get_pixel(x, y)[0];
                    if luma == 0 {
                        continue;
                    }
                    let target = cdf[luma as usize] * 255.0;
                    let gain = target / luma as f32;
                    let pixel = img.get_pixel(x, y);
                    out.put_pixel(
                        x,
                        y,
                        image::Rgb([
                            (pixel[0] as f32 * gain).min(255.0) as u8,
                            (pixel[1] as f32 * gain).min(255.0) as u8,
                            (pixel[2] as f32 * gain).min(255.0) as u8,
                        ]),
                    );
                }
            }
        }
    }

    out
}

/// 3x3 sharpen, edges passed through unchanged.
fn sharpen(img: &RgbImage) -> RgbImage {
    let (w, h) = (img.width(), img.height());
    let mut out = img.clone();

    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            let mut acc = [0f32; 3];
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    let weight = if dx == 0 && dy == 0 { 9.0 } else { -1.0 };
                    let p = img.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32);
                    for c in 0..3 {
                        acc[c] += weight * p[c] as f32;
                    }
                }
            }
            out.put_pixel(
                x,
                y,
                image::Rgb([
                    acc[0].clamp(0.0, 255.0) as u8,
                    acc[1].clamp(0.0, 255.0) as u8,
                    acc[2].clamp(0.0, 255.0) as u8,
                ]),
            );
        }
    }

    out
}

fn blend(a: &RgbImage, b: &RgbImage, weight_a: f32) -> RgbImage {
    let weight_b = 1.0 - weight_a;
    let mut out = a.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let pb = b.get_pixel(x, y);
        for c in 0..3 {
            pixel[c] = (pixel[c] as f32 * weight_a + pb[c] as f32 * weight_b)
                .clamp(0.0, 255.0) as u8;
        }
    }
    out
}
