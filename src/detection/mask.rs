//! Detection masks: single-channel PNGs, non-zero where something was detected.

use std::path::Path;

use anyhow::Context;
use image::{GrayImage, Luma};

use crate::models::{AreaOfInterest, Point};

/// Render the detected pixels of every AOI into a mask of the given size.
pub fn render_mask(width: u32, height: u32, aois: &[AreaOfInterest]) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    for p in aois.iter().flat_map(|aoi| aoi.detected_pixels.iter()) {
        if p.x >= 0 && p.y >= 0 && (p.x as u32) < width && (p.y as u32) < height {
            mask.put_pixel(p.x as u32, p.y as u32, Luma([255]));
        }
    }
    mask
}

pub fn store_mask(mask: &GrayImage, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create mask directory {:?}", parent))?;
    }
    mask.save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("Failed to save mask {:?}", path))?;
    Ok(())
}

pub fn load_mask(path: &Path) -> anyhow::Result<GrayImage> {
    let img = image::open(path).with_context(|| format!("Failed to open mask {:?}", path))?;
    Ok(img.to_luma8())
}

/// Recover the detected pixels that fall inside an AOI's disk.
pub fn pixels_in_disk(mask: &GrayImage, aoi: &AreaOfInterest) -> Vec<Point> {
    let r = aoi.radius.max(0);
    let x0 = (aoi.center.x - r).max(0);
    let y0 = (aoi.center.y - r).max(0);
    let x1 = (aoi.center.x + r).min(mask.width() as i32 - 1);
    let y1 = (aoi.center.y + r).min(mask.height() as i32 - 1);

    let mut pixels = Vec::new();
    for y in y0..=y1 {
        for x in x0..=x1 {
            let p = Point::new(x, y);
            if aoi.contains(&p) && mask.get_pixel(x as u32, y as u32)[0] > 0 {
                pixels.push(p);
            }
        }
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_mask_recovers_detected_pixels() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let mut aoi = AreaOfInterest::new(Point::new(10, 10), 5, 4.0);
        aoi.detected_pixels = vec![
            Point::new(9, 9),
            Point::new(10, 9),
            Point::new(9, 10),
            Point::new(10, 10),
        ];
        let mask = render_mask(32, 32, std::slice::from_ref(&aoi));
        let path = dir.path().join("nested").join("a.mask.png");
        store_mask(&mask, &path)?;

        let loaded = load_mask(&path)?;
        assert_eq!(loaded.dimensions(), (32, 32));
        assert_eq!(pixels_in_disk(&loaded, &aoi), aoi.detected_pixels);
        Ok(())
    }
}
