// THEORY:
// The `Region` is the spatial unit of the occupancy engine, in the same way a
// `Chunk` is the spatial unit of a motion grid: a fixed area of the frame that
// is sliced out of every incoming image and analysed on its own.
//
// Key architectural principles:
// 1.  **Built once, immutable**: geometry is validated when the region is
//     built. A region that exists is always usable; detection never fails
//     because of bad geometry.
// 2.  **Mask + bounding box**: every region carries a binary mask rendered in
//     its own bounding-box coordinates. Rectangles have a trivially full mask;
//     polygons are filled into a box padded by a small margin so that rounding
//     never clips their edges.
// 3.  **Extraction does not mask**: `extract` returns the crop and the mask
//     side by side. Applying the mask before any reduction is the job of the
//     statistics that consume the pair.

use crate::core_modules::pixel::Channel;
use crate::error::{OccupancyError, OccupancyResult};
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma, Pixel};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;
use tracing::warn;

/// Padding, in pixels, added around a polygon's vertex extent.
pub const POLYGON_MASK_MARGIN: u32 = 2;

pub const MASK_ON: Channel = 255;

/// The shape of a monitored area, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Rectangle { x: i32, y: i32, width: i32, height: i32 },
    /// Ordered vertices; the polygon is implicitly closed.
    Polygon(Vec<(f64, f64)>),
}

impl Geometry {
    pub fn rectangle(x: i32, y: i32, width: i32, height: i32) -> Self {
        Geometry::Rectangle { x, y, width, height }
    }

    pub fn polygon<P: Into<(f64, f64)>>(points: impl IntoIterator<Item = P>) -> Self {
        Geometry::Polygon(points.into_iter().map(Into::into).collect())
    }
}

/// An axis-aligned box in frame coordinates. `x`/`y` go negative only when a
/// polygon's margin reaches past the frame's top or left edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn right(&self) -> i64 {
        self.x + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y + self.height as i64
    }

    pub fn fits_within(&self, frame_width: u32, frame_height: u32) -> bool {
        self.x >= 0
            && self.y >= 0
            && self.right() <= frame_width as i64
            && self.bottom() <= frame_height as i64
    }

    /// The part of this box that lies inside a frame of the given size.
    fn clipped_to(&self, frame_width: u32, frame_height: u32) -> BoundingBox {
        let x0 = self.x.max(0);
        let y0 = self.y.max(0);
        let x1 = self.right().min(frame_width as i64);
        let y1 = self.bottom().min(frame_height as i64);
        BoundingBox {
            x: x0,
            y: y0,
            width: (x1 - x0).max(0) as u32,
            height: (y1 - y0).max(0) as u32,
        }
    }
}

/// A validated monitored area with its precomputed mask.
#[derive(Debug, Clone)]
pub struct Region {
    /// Position of the region in the engine's region list.
    pub index: usize,
    geometry: Geometry,
    /// Tight box around the geometry; must lie inside every frame.
    extent: BoundingBox,
    /// `extent` plus the mask margin; the mask's footprint.
    bbox: BoundingBox,
    mask: GrayImage,
    area: u32,
}

impl Region {
    pub fn build(index: usize, geometry: Geometry) -> OccupancyResult<Self> {
        match geometry {
            Geometry::Rectangle { x, y, width, height } => {
                if width <= 0 || height <= 0 {
                    return Err(OccupancyError::InvalidGeometry(format!(
                        "rectangle {index} has non-positive size {width}x{height}"
                    )));
                }
                if x < 0 || y < 0 {
                    return Err(OccupancyError::InvalidGeometry(format!(
                        "rectangle {index} has a negative origin ({x}, {y})"
                    )));
                }
                let bbox = BoundingBox {
                    x: x as i64,
                    y: y as i64,
                    width: width.unsigned_abs(),
                    height: height.unsigned_abs(),
                };
                let area = bbox.width.checked_mul(bbox.height).ok_or_else(|| {
                    OccupancyError::InvalidGeometry(format!(
                        "rectangle {index} of {width}x{height} pixels is too large"
                    ))
                })?;
                let mask = GrayImage::from_pixel(bbox.width, bbox.height, Luma([MASK_ON]));
                Ok(Self {
                    index,
                    area,
                    geometry,
                    extent: bbox,
                    bbox,
                    mask,
                })
            }
            Geometry::Polygon(points) => Self::build_polygon(index, points),
        }
    }

    fn build_polygon(index: usize, mut points: Vec<(f64, f64)>) -> OccupancyResult<Self> {
        if points.len() > 1 && points.first() == points.last() {
            points.pop();
        }
        if points.len() < 3 {
            return Err(OccupancyError::InvalidGeometry(format!(
                "polygon {index} has {} vertices, at least 3 are required",
                points.len()
            )));
        }
        if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(OccupancyError::InvalidGeometry(format!(
                "polygon {index} has a non-finite vertex"
            )));
        }
        if shoelace_area(&points).abs() < f64::EPSILON {
            return Err(OccupancyError::InvalidGeometry(format!(
                "polygon {index} encloses zero area"
            )));
        }

        let rounded = points
            .iter()
            .map(|(x, y)| -> OccupancyResult<(i32, i32)> {
                Ok((pixel_coordinate(index, *x)?, pixel_coordinate(index, *y)?))
            })
            .collect::<OccupancyResult<Vec<_>>>()?;
        let min_x = rounded.iter().map(|p| p.0).min().unwrap_or(0);
        let min_y = rounded.iter().map(|p| p.1).min().unwrap_or(0);
        let max_x = rounded.iter().map(|p| p.0).max().unwrap_or(0);
        let max_y = rounded.iter().map(|p| p.1).max().unwrap_or(0);

        let too_large = || {
            OccupancyError::InvalidGeometry(format!("polygon {index} is too large to rasterise"))
        };
        let span = |min: i32, max: i32| -> OccupancyResult<u32> {
            let length = u32::try_from(max as i64 - min as i64 + 1).map_err(|_| too_large())?;
            length.checked_add(2 * POLYGON_MASK_MARGIN).ok_or_else(too_large)?;
            Ok(length)
        };
        let extent = BoundingBox {
            x: min_x as i64,
            y: min_y as i64,
            width: span(min_x, max_x)?,
            height: span(min_y, max_y)?,
        };
        let margin = POLYGON_MASK_MARGIN as i64;
        let bbox = BoundingBox {
            x: extent.x - margin,
            y: extent.y - margin,
            width: extent.width + 2 * POLYGON_MASK_MARGIN,
            height: extent.height + 2 * POLYGON_MASK_MARGIN,
        };
        bbox.width.checked_mul(bbox.height).ok_or_else(too_large)?;

        // Vertices in mask-local coordinates, without repeats.
        let mut local: Vec<Point<i32>> = Vec::with_capacity(rounded.len());
        for (x, y) in &rounded {
            let p = Point::new(
                i32::try_from(*x as i64 - bbox.x).map_err(|_| too_large())?,
                i32::try_from(*y as i64 - bbox.y).map_err(|_| too_large())?,
            );
            if local.last() != Some(&p) {
                local.push(p);
            }
        }
        while local.len() > 1 && local.first() == local.last() {
            local.pop();
        }
        if local.len() < 3 {
            return Err(OccupancyError::InvalidGeometry(format!(
                "polygon {index} collapses below one pixel when rasterised"
            )));
        }

        let mut mask = GrayImage::new(bbox.width, bbox.height);
        draw_polygon_mut(&mut mask, &local, Luma([MASK_ON]));
        let area = mask_area(&mask);
        if area == 0 {
            return Err(OccupancyError::InvalidGeometry(format!(
                "polygon {index} covers no pixels"
            )));
        }

        Ok(Self {
            index,
            geometry: Geometry::Polygon(points),
            extent,
            bbox,
            mask,
            area,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn mask_and_bbox(&self) -> (&GrayImage, BoundingBox) {
        (&self.mask, self.bbox)
    }

    /// The tight box around the geometry, without the polygon margin.
    pub fn extent(&self) -> BoundingBox {
        self.extent
    }

    /// Number of pixels inside the mask.
    pub fn area(&self) -> u32 {
        self.area
    }

    /// Fails with `RegionOutOfBounds` unless the geometry fits in the frame.
    pub fn check_bounds(&self, frame_width: u32, frame_height: u32) -> OccupancyResult<()> {
        if self.extent.fits_within(frame_width, frame_height) {
            Ok(())
        } else {
            Err(OccupancyError::RegionOutOfBounds {
                region: self.index,
                x: self.extent.x,
                y: self.extent.y,
                width: self.extent.width,
                height: self.extent.height,
                frame_width,
                frame_height,
            })
        }
    }

    /// Crops `image` to the region's bounding box and pairs it with the mask.
    ///
    /// Pixels outside the mask are left as they are in the crop. Margin that
    /// reaches past the frame edge is trimmed from both crop and mask; the
    /// geometry itself must lie inside the frame.
    pub fn extract<P>(
        &self,
        image: &ImageBuffer<P, Vec<P::Subpixel>>,
    ) -> OccupancyResult<(ImageBuffer<P, Vec<P::Subpixel>>, GrayImage)>
    where
        P: Pixel + 'static,
    {
        let (frame_width, frame_height) = image.dimensions();
        self.check_bounds(frame_width, frame_height)?;

        let window = self.bbox.clipped_to(frame_width, frame_height);
        let crop = imageops::crop_imm(
            image,
            window.x as u32,
            window.y as u32,
            window.width,
            window.height,
        )
        .to_image();

        let mask = if window == self.bbox {
            self.mask.clone()
        } else {
            imageops::crop_imm(
                &self.mask,
                (window.x - self.bbox.x) as u32,
                (window.y - self.bbox.y) as u32,
                window.width,
                window.height,
            )
            .to_image()
        };

        let mask = fit_mask(&mask, crop.width(), crop.height());
        Ok((crop, mask))
    }
}

/// Returns `mask` at the requested size, resampling nearest-neighbor when the
/// sizes differ. Resampling is reported since it means the mask and the pixel
/// data were derived from different resolutions.
pub fn fit_mask(mask: &GrayImage, width: u32, height: u32) -> GrayImage {
    if mask.dimensions() == (width, height) {
        return mask.clone();
    }
    warn!(
        mask_width = mask.width(),
        mask_height = mask.height(),
        width,
        height,
        "mask size differs from pixel data, resampling nearest-neighbor"
    );
    imageops::resize(mask, width, height, FilterType::Nearest)
}

/// Rounds a vertex coordinate to a pixel. Coordinates must be non-negative
/// and small enough for mask-local arithmetic.
fn pixel_coordinate(index: usize, value: f64) -> OccupancyResult<i32> {
    let rounded = value.round();
    if rounded < 0.0 {
        return Err(OccupancyError::InvalidGeometry(format!(
            "polygon {index} has a negative vertex coordinate {value}"
        )));
    }
    if rounded > (i32::MAX as u32 - 2 * POLYGON_MASK_MARGIN) as f64 {
        return Err(OccupancyError::InvalidGeometry(format!(
            "polygon {index} has a vertex coordinate {value} beyond any frame"
        )));
    }
    Ok(rounded as i32)
}

/// Number of non-zero mask pixels.
pub fn mask_area(mask: &GrayImage) -> u32 {
    mask.pixels().filter(|p| p.0[0] > 0).count() as u32
}

fn shoelace_area(points: &[(f64, f64)]) -> f64 {
    let n = points.len();
    let twice: f64 = (0..n)
        .map(|i| {
            let (x0, y0) = points[i];
            let (x1, y1) = points[(i + 1) % n];
            x0 * y1 - x1 * y0
        })
        .sum();
    twice / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn rectangle_mask_is_full() {
        let region = Region::build(0, Geometry::rectangle(10, 20, 30, 40)).unwrap();
        let (mask, bbox) = region.mask_and_bbox();
        assert_eq!(bbox, BoundingBox { x: 10, y: 20, width: 30, height: 40 });
        assert_eq!(mask.dimensions(), (30, 40));
        assert_eq!(region.area(), 1200);
        assert!(mask.pixels().all(|p| p.0[0] == MASK_ON));
    }

    #[test]
    fn rectangle_rejects_non_positive_size() {
        for (w, h) in [(0, 10), (10, 0), (-5, 10)] {
            let err = Region::build(3, Geometry::rectangle(0, 0, w, h)).unwrap_err();
            assert!(matches!(err, OccupancyError::InvalidGeometry(_)));
        }
    }

    #[test]
    fn polygon_needs_three_vertices() {
        let err = Region::build(0, Geometry::polygon([(0.0, 0.0), (10.0, 0.0)])).unwrap_err();
        assert!(matches!(err, OccupancyError::InvalidGeometry(_)));
    }

    #[test]
    fn collinear_polygon_is_degenerate() {
        let err = Region::build(0, Geometry::polygon([(0.0, 0.0), (5.0, 5.0), (10.0, 10.0)]))
            .unwrap_err();
        assert!(matches!(err, OccupancyError::InvalidGeometry(_)));
    }

    #[test]
    fn closing_vertex_is_ignored() {
        let square = [(10.0, 10.0), (20.0, 10.0), (20.0, 20.0), (10.0, 20.0), (10.0, 10.0)];
        let region = Region::build(0, Geometry::polygon(square)).unwrap();
        match region.geometry() {
            Geometry::Polygon(points) => assert_eq!(points.len(), 4),
            other => panic!("unexpected geometry {other:?}"),
        }
    }

    #[test]
    fn polygon_bbox_has_margin_and_mask_covers_interior() {
        let square = [(10.0, 10.0), (20.0, 10.0), (20.0, 20.0), (10.0, 20.0)];
        let region = Region::build(1, Geometry::polygon(square)).unwrap();
        let (mask, bbox) = region.mask_and_bbox();
        let margin = POLYGON_MASK_MARGIN as i64;
        assert_eq!(bbox.x, 10 - margin);
        assert_eq!(bbox.y, 10 - margin);
        assert_eq!(mask.dimensions(), (bbox.width, bbox.height));
        // The margin ring stays empty, the polygon body is filled.
        assert_eq!(mask.get_pixel(0, 0).0[0], 0);
        let center = (15 - bbox.x) as u32;
        assert_eq!(mask.get_pixel(center, center).0[0], MASK_ON);
        assert!(region.area() >= 10 * 10 && region.area() <= 11 * 11);
    }

    #[test]
    fn triangle_mask_is_smaller_than_its_box() {
        let triangle = [(0.0, 0.0), (40.0, 0.0), (0.0, 40.0)];
        let region = Region::build(0, Geometry::polygon(triangle)).unwrap();
        let extent = region.extent();
        assert!(region.area() < extent.width * extent.height);
        assert!(region.area() > extent.width * extent.height / 3);
    }

    #[test]
    fn extract_crops_without_masking() {
        let mut frame = RgbImage::from_pixel(50, 50, Rgb([7, 7, 7]));
        frame.put_pixel(12, 12, Rgb([200, 100, 50]));
        let region = Region::build(0, Geometry::rectangle(10, 10, 5, 5)).unwrap();
        let (crop, mask) = region.extract(&frame).unwrap();
        assert_eq!(crop.dimensions(), (5, 5));
        assert_eq!(mask.dimensions(), (5, 5));
        assert_eq!(crop.get_pixel(2, 2).0, [200, 100, 50]);
        assert_eq!(crop.get_pixel(0, 0).0, [7, 7, 7]);
    }

    #[test]
    fn extract_out_of_bounds_fails_loudly() {
        let frame = RgbImage::new(40, 40);
        let region = Region::build(4, Geometry::rectangle(30, 30, 20, 20)).unwrap();
        let err = region.extract(&frame).unwrap_err();
        assert!(matches!(err, OccupancyError::RegionOutOfBounds { region: 4, .. }));

    }

    #[test]
    fn negative_coordinates_are_rejected_at_build() {
        let err = Region::build(5, Geometry::rectangle(-1, 0, 5, 5)).unwrap_err();
        assert!(matches!(err, OccupancyError::InvalidGeometry(_)));

        let err = Region::build(6, Geometry::polygon([(-10.0, -10.0), (20.0, 0.0), (0.0, 20.0)])).unwrap_err();
        assert!(matches!(err, OccupancyError::InvalidGeometry(_)));

        // Rounds to zero, so it is still a valid pixel.
        assert!(Region::build(7, Geometry::polygon([(-0.4, 0.0), (20.0, 0.0), (0.0, 20.0)])).is_ok());
    }

    #[test]
    fn oversized_geometry_is_rejected_instead_of_truncated() {
        let huge = Geometry::polygon([(0.0, 0.0), (4_294_967_306.0, 0.0), (0.0, 10.0)]);
        let err = Region::build(0, huge).unwrap_err();
        assert!(matches!(err, OccupancyError::InvalidGeometry(_)));

        let wide = Geometry::polygon([(0.0, 0.0), (2_147_483_000.0, 0.0), (0.0, 10.0)]);
        assert!(matches!(Region::build(1, wide), Err(OccupancyError::InvalidGeometry(_))));

        let err = Region::build(2, Geometry::rectangle(0, 0, 100_000, 100_000)).unwrap_err();
        assert!(matches!(err, OccupancyError::InvalidGeometry(_)));
    }

    #[test]
    fn margin_past_the_edge_is_trimmed() {
        let frame = RgbImage::new(30, 30);
        let square = [(0.0, 0.0), (29.0, 0.0), (29.0, 29.0), (0.0, 29.0)];
        let region = Region::build(0, Geometry::polygon(square)).unwrap();
        let (crop, mask) = region.extract(&frame).unwrap();
        assert_eq!(crop.dimensions(), (30, 30));
        assert_eq!(mask.dimensions(), (30, 30));
        assert_eq!(mask_area(&mask), region.area());
    }

    #[test]
    fn fit_mask_resamples_nearest() {
        let mask = GrayImage::from_pixel(4, 4, Luma([MASK_ON]));
        let same = fit_mask(&mask, 4, 4);
        assert_eq!(same, mask);
        let larger = fit_mask(&mask, 8, 6);
        assert_eq!(larger.dimensions(), (8, 6));
        assert!(larger.pixels().all(|p| p.0[0] == MASK_ON));
    }
}
