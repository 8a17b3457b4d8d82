//! Frame type and pixel conditioning: YUYV unpacking, dark detection, CLAHE.

use image::GrayImage;

/// Fraction of near-black pixels above which a frame is discarded.
pub const DARK_FRAME_FRACTION: f32 = 0.95;
const DARK_PIXEL_LEVEL: u8 = 32;

/// A captured grayscale frame.
#[derive(Clone)]
pub struct Frame {
    /// Row-major luminance, `width * height` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Mean luminance in 0.0–255.0.
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    pub fn is_dark(&self) -> bool {
        is_dark_frame(&self.data, DARK_FRAME_FRACTION)
    }

    /// View as an `image` buffer for the encoding pipeline.
    pub fn to_image(&self) -> Result<GrayImage, FrameError> {
        let expected = self.width as usize * self.height as usize;
        if self.data.len() != expected {
            return Err(FrameError::InvalidLength { expected, actual: self.data.len() });
        }
        GrayImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or(FrameError::InvalidLength { expected, actual: self.data.len() })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Unpack YUYV 4:2:2 (`[Y0, U, Y1, V]` per pixel pair) to its luma plane.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: yuyv.len() });
    }
    Ok(yuyv[..expected].chunks_exact(2).map(|px| px[0]).collect())
}

/// Keep the high byte of each little-endian 16-bit sample.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if y16.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: y16.len() });
    }
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// True when more than `threshold_pct` of pixels are near black. Empty
/// buffers count as dark.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < DARK_PIXEL_LEVEL).count();
    dark as f32 / gray.len() as f32 > threshold_pct
}

/// Clipped, normalized cumulative histogram for one tile.
fn tile_lut(gray: &[u8], stride: usize, x0: usize, y0: usize, tile_w: usize, tile_h: usize, clip_limit: f32) -> [f32; 256] {
    let mut hist = [0u32; 256];
    for row in gray[y0 * stride..].chunks(stride).take(tile_h) {
        for &p in &row[x0..x0 + tile_w] {
            hist[p as usize] += 1;
        }
    }

    let pixels = (tile_w * tile_h) as u32;
    let clip = ((clip_limit * pixels as f32) as u32).max(1);
    let excess: u32 = hist.iter().map(|&h| h.saturating_sub(clip)).sum();
    let (share, remainder) = (excess / 256, (excess % 256) as usize);
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin = (*bin).min(clip) + share + u32::from(i < remainder);
    }

    let mut lut = [0f32; 256];
    let mut running = 0u32;
    for (slot, &count) in lut.iter_mut().zip(hist.iter()) {
        running += count;
        *slot = running as f32;
    }

    let floor = lut.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let span = pixels as f32 - floor;
    if span > 0.0 {
        for v in lut.iter_mut() {
            *v = ((*v - floor) / span * 255.0).clamp(0.0, 255.0);
        }
    }
    lut
}

/// Contrast-limited adaptive histogram equalization, in place.
///
/// Splits the frame into a `tiles`×`tiles` grid, equalizes each tile with a
/// clipped histogram, and blends the four nearest tile mappings bilinearly.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let (w, h, t) = (width as usize, height as usize, tiles as usize);
    if w == 0 || h == 0 || t == 0 || gray.len() < w * h {
        return;
    }
    let (tile_w, tile_h) = (w / t, h / t);
    if tile_w == 0 || tile_h == 0 {
        return;
    }

    let luts: Vec<[f32; 256]> = (0..t * t)
        .map(|i| tile_lut(gray, w, (i % t) * tile_w, (i / t) * tile_h, tile_w, tile_h, clip_limit))
        .collect();

    let last = (t - 1) as f32;
    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, last);
        let (r0, dy) = (fy as usize, fy.fract());
        let r1 = (r0 + 1).min(t - 1);

        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, last);
            let (c0, dx) = (fx as usize, fx.fract());
            let c1 = (c0 + 1).min(t - 1);

            let p = gray[y * w + x] as usize;
            let top = luts[r0 * t + c0][p] * (1.0 - dx) + luts[r0 * t + c1][p] * dx;
            let bottom = luts[r1 * t + c0][p] * (1.0 - dx) + luts[r1 * t + c1][p] * dx;
            gray[y * w + x] = (top * (1.0 - dy) + bottom * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: Vec<u8>, width: u32, height: u32) -> Frame {
        Frame { data, width, height, timestamp: std::time::Instant::now(), sequence: 0 }
    }

    #[test]
    fn test_yuyv_to_grayscale() {
        let yuyv = vec![100, 128, 200, 128];
        assert_eq!(yuyv_to_grayscale(&yuyv, 2, 1).unwrap(), vec![100, 200]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_grayscale(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        let y16 = vec![0x34, 0x12, 0xff, 0xab];
        assert_eq!(y16_to_grayscale(&y16, 2, 1).unwrap(), vec![0x12, 0xab]);
    }

    #[test]
    fn test_dark_frame_thresholds() {
        assert!(is_dark_frame(&vec![0u8; 1000], DARK_FRAME_FRACTION));
        assert!(!is_dark_frame(&vec![128u8; 1000], DARK_FRAME_FRACTION));
        assert!(is_dark_frame(&[], DARK_FRAME_FRACTION));

        let mut mostly_dark = vec![10u8; 960];
        mostly_dark.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&mostly_dark, DARK_FRAME_FRACTION));

        let mut borderline = vec![10u8; 940];
        borderline.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&borderline, DARK_FRAME_FRACTION));
    }

    #[test]
    fn test_clahe_increases_contrast() {
        let (w, h) = (16u32, 16u32);
        let mut gray: Vec<u8> = (0..(w * h) as usize).map(|i| 100 + (i % 11) as u8).collect();

        let before = stddev(&gray);
        clahe_enhance(&mut gray, w, h, 2, 0.02);
        let after = stddev(&gray);
        assert!(after > before, "orig={before:.2}, new={after:.2}");
    }

    #[test]
    fn test_clahe_ignores_degenerate_grid() {
        let mut gray = vec![7u8; 4];
        clahe_enhance(&mut gray, 2, 2, 8, 0.02);
        assert_eq!(gray, vec![7u8; 4]);
    }

    #[test]
    fn test_to_image_checks_length() {
        assert!(frame(vec![0; 6], 3, 2).to_image().is_ok());
        assert!(frame(vec![0; 5], 3, 2).to_image().is_err());
    }

    #[test]
    fn test_avg_brightness() {
        assert_eq!(frame(vec![], 0, 0).avg_brightness(), 0.0);
        assert!((frame(vec![0, 255], 2, 1).avg_brightness() - 127.5).abs() < 1e-6);
    }

    fn stddev(data: &[u8]) -> f32 {
        let n = data.len() as f32;
        let mean = data.iter().map(|&b| b as f32).sum::<f32>() / n;
        (data.iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n).sqrt()
    }
}
