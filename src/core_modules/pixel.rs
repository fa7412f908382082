// THEORY:
// The `pixel` module holds the single-pixel vocabulary of the engine: the color
// triple every verdict carries and the intensity transform every statistic is
// computed on. Nothing here looks at neighbors or history.
//
// Intensity is the Rec. 601 luma of an RGB sample, rounded to a byte. Every
// grayscale image in the engine is produced by `intensity_image`, so the
// static background, the live frame and the calibration samples always share
// the same transform.

use image::{GrayImage, Luma, RgbImage};

pub type Channel = u8;
pub type Luminance = f64;

/// An RGB color triple, as reported for an occupied region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Color {
    pub red: Channel,
    pub green: Channel,
    pub blue: Channel,
}

impl Color {
    pub const fn new(red: Channel, green: Channel, blue: Channel) -> Self {
        Self { red, green, blue }
    }

    /// Rec. 601 luma on the 0..255 scale.
    pub fn luminance(&self) -> Luminance {
        luminance(self.red, self.green, self.blue)
    }

    /// Squared Euclidean distance in RGB space.
    pub fn distance_squared(&self, other: &Color) -> u32 {
        let dr = self.red as i32 - other.red as i32;
        let dg = self.green as i32 - other.green as i32;
        let db = self.blue as i32 - other.blue as i32;
        (dr * dr + dg * dg + db * db) as u32
    }

    pub fn channels(&self) -> [Channel; 3] {
        [self.red, self.green, self.blue]
    }
}

impl From<[Channel; 3]> for Color {
    fn from(channels: [Channel; 3]) -> Self {
        Self::new(channels[0], channels[1], channels[2])
    }
}

impl From<image::Rgb<u8>> for Color {
    fn from(pixel: image::Rgb<u8>) -> Self {
        Self::from(pixel.0)
    }
}

#[inline]
pub fn luminance(red: Channel, green: Channel, blue: Channel) -> Luminance {
    0.299_f64 * red as f64 + 0.587_f64 * green as f64 + 0.114_f64 * blue as f64
}

/// Converts an RGB frame into its intensity image.
pub fn intensity_image(frame: &RgbImage) -> GrayImage {
    let (width, height) = frame.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let [r, g, b] = frame.get_pixel(x, y).0;
        Luma([luminance(r, g, b).round().clamp(0.0, 255.0) as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn luminance_of_extremes() {
        assert_eq!(Color::new(0, 0, 0).luminance(), 0.0);
        assert!((Color::new(255, 255, 255).luminance() - 255.0).abs() < 1e-9);
    }

    #[test]
    fn intensity_image_matches_luma_weights() {
        let mut frame = RgbImage::new(2, 1);
        frame.put_pixel(0, 0, Rgb([255, 255, 255]));
        frame.put_pixel(1, 0, Rgb([100, 0, 0]));
        let gray = intensity_image(&frame);
        assert_eq!(gray.get_pixel(0, 0).0[0], 255);
        // 0.299 * 100 = 29.9
        assert_eq!(gray.get_pixel(1, 0).0[0], 30);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = Color::new(10, 20, 30);
        let b = Color::new(13, 16, 30);
        assert_eq!(a.distance_squared(&b), 25);
        assert_eq!(b.distance_squared(&a), 25);
        assert_eq!(a.distance_squared(&a), 0);
    }

    #[test]
    fn channels_are_in_rgb_order() {
        let color = Color::new(200, 30, 7);
        assert_eq!(color.channels(), [200, 30, 7]);
        assert_eq!(Color::from(color.channels()), color);
    }
}
