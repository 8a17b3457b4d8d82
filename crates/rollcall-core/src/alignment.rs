//! Face alignment via a 4-DOF similarity transform.
//!
//! Maps five detected landmarks onto the canonical ArcFace template with a
//! closed-form least-squares fit, then resamples a 112×112 crop.

use image::{GrayImage, Luma};

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// `x' = a·x − b·y + tx`, `y' = b·x + a·y + ty`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    pub const IDENTITY: SimilarityTransform = SimilarityTransform { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    /// Least-squares fit of `src` onto `dst`.
    ///
    /// Falls back to the identity when every source point coincides.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let mut spread = 0.0f32;
        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - msx, sy - msy);
            let (dx, dy) = (dx - mdx, dy - mdy);
            spread += sx * sx + sy * sy;
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
        }

        if spread < 1e-12 {
            return Self::IDENTITY;
        }

        let a = dot / spread;
        let b = cross / spread;
        Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Inverse transform, or `None` for a degenerate (zero-scale) mapping.
    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        // Inverse translation: −R⁻¹·t
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Bilinear sample with black outside the frame.
fn sample_bilinear(frame: &GrayImage, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let pixel = |px: f32, py: f32| -> f32 {
        if px < 0.0 || py < 0.0 || px >= frame.width() as f32 || py >= frame.height() as f32 {
            0.0
        } else {
            frame.get_pixel(px as u32, py as u32)[0] as f32
        }
    };

    let top = pixel(x0, y0) * (1.0 - fx) + pixel(x0 + 1.0, y0) * fx;
    let bottom = pixel(x0, y0 + 1.0) * (1.0 - fx) + pixel(x0 + 1.0, y0 + 1.0) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Resample `frame` into an `out_size`×`out_size` crop through `transform`
/// (source → output coordinates).
pub fn warp(frame: &GrayImage, transform: &SimilarityTransform, out_size: u32) -> GrayImage {
    let Some(back) = transform.inverse() else {
        return GrayImage::new(out_size, out_size);
    };

    GrayImage::from_fn(out_size, out_size, |ox, oy| {
        let (sx, sy) = back.apply((ox as f32, oy as f32));
        Luma([sample_bilinear(frame, sx, sy).round().clamp(0.0, 255.0) as u8])
    })
}

/// Align a detected face to a canonical 112×112 crop for ArcFace.
pub fn align_face(frame: &GrayImage, landmarks: &[(f32, f32); 5]) -> GrayImage {
    let transform = SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS_112);
    warp(frame, &transform, ALIGNED_SIZE)
}
