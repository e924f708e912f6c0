use std::collections::VecDeque;

use crate::params::RigidTransform;
use crate::types::Point;

/// Trait for accessing pixel intensities from an image.
pub trait ImageAccess {
    /// Get the grayscale intensity at (x, y). Returns 0 for out-of-bounds pixels.
    fn get_pixel(&self, x: i32, y: i32) -> u8;

    /// Image dimensions.
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

/// An owned grayscale frame.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayImage {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl GrayImage {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self {
            data,
            width,
            height,
        }
    }

    pub fn from_fn<F>(width: u32, height: u32, f: F) -> Self
    where
        F: Fn(u32, u32) -> u8,
    {
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { data, width, height }
    }

    /// Raw row-major pixel buffer.
    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }
}

impl From<image::GrayImage> for GrayImage {
    fn from(img: image::GrayImage) -> Self {
        let (width, height) = img.dimensions();
        Self::new(img.into_raw(), width, height)
    }
}

impl ImageAccess for GrayImage {
    fn get_pixel(&self, x: i32, y: i32) -> u8 {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0;
        }
        self.data[(y as u32 * self.width + x as u32) as usize]
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

/// Sample a pixel with bilinear interpolation for sub-pixel accuracy.
#[inline]
pub fn sample_bilinear<I: ImageAccess + ?Sized>(image: &I, x: f64, y: f64) -> f64 {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let x1 = x0 + 1;
    let y1 = y0 + 1;

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = image.get_pixel(x0, y0) as f64;
    let p10 = image.get_pixel(x1, y0) as f64;
    let p01 = image.get_pixel(x0, y1) as f64;
    let p11 = image.get_pixel(x1, y1) as f64;

    let top = p00 * (1.0 - fx) + p10 * fx;
    let bottom = p01 * (1.0 - fx) + p11 * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Resamples an image in the canonical (model) frame.
///
/// Canonical point `c` is read from the image at `transform.apply(c)`, so
/// a grid sampled here is unrotated and unscaled whatever the face pose.
pub struct Rectifier<'a, I: ImageAccess + ?Sized> {
    image: &'a I,
    transform: RigidTransform,
}

impl<'a, I: ImageAccess + ?Sized> Rectifier<'a, I> {
    pub fn new(image: &'a I, transform: RigidTransform) -> Self {
        Self { image, transform }
    }

    pub fn sample(&self, canonical: Point) -> f64 {
        let p = self.transform.apply(canonical);
        sample_bilinear(self.image, p.x, p.y)
    }

    /// Row-major `cols × rows` grid starting at `origin` with the given
    /// canonical step between neighbouring samples.
    pub fn grid(&self, origin: Point, step: Point, cols: usize, rows: usize) -> Vec<f64> {
        let mut out = Vec::with_capacity(cols * rows);
        for r in 0..rows {
            for c in 0..cols {
                let canonical = Point::new(origin.x + c as f64 * step.x, origin.y + r as f64 * step.y);
                out.push(self.sample(canonical));
            }
        }
        out
    }
}

/// A stream of frames feeding the tracker.
///
/// A live source returns its most recent frame on every call; a recorded
/// source advances by one frame per call. `None` ends the stream.
pub trait FrameSource {
    fn next_frame(&mut self) -> Option<GrayImage>;
}

/// Recorded frames played back in order.
#[derive(Debug, Default)]
pub struct FrameSequence {
    frames: VecDeque<GrayImage>,
}

impl FrameSequence {
    pub fn new(frames: Vec<GrayImage>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for FrameSequence {
    fn next_frame(&mut self) -> Option<GrayImage> {
        self.frames.pop_front()
    }
}
