use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use std::collections::HashMap;

use crate::models::{Component, Point};

/// Find 8-connected components of non-zero pixels in a binary mask.
///
/// Components smaller than `min_area` pixels, or larger than `max_area`
/// when it is non-zero, are discarded. The result is ordered by label, which
/// follows the raster position of each component's first pixel.
pub fn find_components(mask: &GrayImage, min_area: u32, max_area: u32) -> Vec<Component> {
    let labeled = connected_components(mask, Connectivity::Eight, Luma([0u8]));

    let mut regions: HashMap<u32, Component> = HashMap::new();

    for (x, y, label) in labeled.enumerate_pixels() {
        let label_val = label[0];
        if label_val == 0 {
            continue; // background
        }

        let point = Point::new(x as i32, y as i32);
        regions
            .entry(label_val)
            .and_modify(|c| {
                c.min_x = c.min_x.min(x);
                c.min_y = c.min_y.min(y);
                c.max_x = c.max_x.max(x);
                c.max_y = c.max_y.max(y);
                c.pixels.push(point);
            })
            .or_insert_with(|| Component {
                label: label_val,
                min_x: x,
                min_y: y,
                max_x: x,
                max_y: y,
                pixels: vec![point],
            });
    }

    let mut components: Vec<Component> = regions
        .into_values()
        .filter(|c| c.area() >= min_area && (max_area == 0 || c.area() <= max_area))
        .collect();
    components.sort_by_key(|c| c.label);
    components
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_with_squares(squares: &[(u32, u32, u32)]) -> GrayImage {
        GrayImage::from_fn(100, 100, |x, y| {
            let hit = squares
                .iter()
                .any(|&(sx, sy, size)| x >= sx && x < sx + size && y >= sy && y < sy + size);
            Luma([if hit { 255 } else { 0 }])
        })
    }

    #[test]
    fn finds_separate_blobs_with_exact_pixel_counts() {
        let mask = mask_with_squares(&[(5, 5, 10), (50, 50, 4)]);
        let components = find_components(&mask, 0, 0);
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].area(), 100);
        assert_eq!(components[0].max_x - components[0].min_x, 9);
        assert_eq!(components[1].area(), 16);
        assert_eq!((components[1].min_x, components[1].min_y), (50, 50));
    }

    #[test]
    fn applies_area_bounds() {
        let mask = mask_with_squares(&[(5, 5, 10), (50, 50, 4), (70, 70, 2)]);
        assert_eq!(find_components(&mask, 10, 0).len(), 2);
        assert_eq!(find_components(&mask, 10, 50).len(), 1);
        assert_eq!(find_components(&mask, 0, 0).len(), 3);
    }

    #[test]
    fn diagonal_neighbours_join() {
        let mut mask = GrayImage::new(10, 10);
        mask.put_pixel(2, 2, Luma([255]));
        mask.put_pixel(3, 3, Luma([255]));
        assert_eq!(find_components(&mask, 0, 0).len(), 1);
    }
}
