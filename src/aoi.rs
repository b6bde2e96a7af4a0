//! Turning binary detection masks into areas of interest.

use image::GrayImage;

use crate::config::ExtractionParams;
use crate::detection::contours::find_components;
use crate::models::{AreaOfInterest, Component, Point};

/// Output of one extraction pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub aois: Vec<AreaOfInterest>,
    /// Qualifying components before merging and capping.
    pub base_contour_count: usize,
}

impl Extraction {
    /// True when the raw count alone is above the configured cap.
    pub fn exceeds(&self, max_aois: usize) -> bool {
        max_aois > 0 && self.base_contour_count > max_aois
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AoiExtractor {
    params: ExtractionParams,
}

impl AoiExtractor {
    pub fn new(params: ExtractionParams) -> Self {
        Self { params }
    }

    pub fn max_aois(&self) -> usize {
        self.params.max_aois
    }

    pub fn extract(&self, mask: &GrayImage) -> Extraction {
        let components = find_components(mask, self.params.min_area, self.params.max_area);
        self.from_components(components)
    }

    /// Build AOIs from components that already passed the area filter.
    pub fn from_components(&self, components: Vec<Component>) -> Extraction {
        let base_contour_count = components.len();
        let aois = components
            .into_iter()
            .map(|c| aoi_from_pixels(c.pixels))
            .collect();
        self.finish(aois, base_contour_count)
    }

    fn finish(&self, mut aois: Vec<AreaOfInterest>, base_contour_count: usize) -> Extraction {
        if self.params.combine_aois {
            aois = merge_aois(aois, self.params.aoi_radius);
        }
        if self.params.max_aois > 0 && aois.len() > self.params.max_aois {
            aois.sort_by(|a, b| b.area.total_cmp(&a.area));
            aois.truncate(self.params.max_aois);
        }
        Extraction {
            aois,
            base_contour_count,
        }
    }
}

/// An AOI centred on the centroid of `pixels` whose disk covers all of them.
pub fn aoi_from_pixels(mut pixels: Vec<Point>) -> AreaOfInterest {
    pixels.sort_by_key(|p| (p.y, p.x));
    let center = centroid(&pixels).unwrap_or(Point::new(0, 0));
    let radius = enclosing_radius(&center, &pixels);
    let mut aoi = AreaOfInterest::new(center, radius, pixels.len() as f64);
    aoi.detected_pixels = pixels;
    aoi
}

pub fn centroid(pixels: &[Point]) -> Option<Point> {
    if pixels.is_empty() {
        return None;
    }
    let n = pixels.len() as f64;
    let sx: f64 = pixels.iter().map(|p| p.x as f64).sum();
    let sy: f64 = pixels.iter().map(|p| p.y as f64).sum();
    Some(Point::new((sx / n).round() as i32, (sy / n).round() as i32))
}

/// Smallest integer radius around `center` that covers every pixel and is at
/// least half the pixels' bounding-box diagonal.
pub fn enclosing_radius(center: &Point, pixels: &[Point]) -> i32 {
    if pixels.is_empty() {
        return 0;
    }
    let mut farthest = 0f64;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (i32::MAX, i32::MAX, i32::MIN, i32::MIN);
    for p in pixels {
        farthest = farthest.max(center.distance(p));
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    let w = (max_x - min_x) as f64;
    let h = (max_y - min_y) as f64;
    let half_diagonal = (w * w + h * h).sqrt() / 2.0;
    farthest.max(half_diagonal).ceil() as i32
}

/// Repeatedly merge AOIs whose centers lie within `distance` of each other
/// until no such pair remains.
pub fn merge_aois(mut aois: Vec<AreaOfInterest>, distance: u32) -> Vec<AreaOfInterest> {
    let distance = distance as f64;
    loop {
        let n = aois.len();
        let mut parent: Vec<usize> = (0..n).collect();
        let mut merged_any = false;

        for i in 0..n {
            for j in (i + 1)..n {
                if aois[i].center.distance(&aois[j].center) <= distance {
                    let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                    if ri != rj {
                        parent[ri.max(rj)] = ri.min(rj);
                        merged_any = true;
                    }
                }
            }
        }
        if !merged_any {
            return aois;
        }

        let mut groups: Vec<Vec<AreaOfInterest>> = Vec::new();
        let mut slot_of_root: Vec<Option<usize>> = vec![None; n];
        for (i, aoi) in aois.into_iter().enumerate() {
            let root = find(&mut parent, i);
            match slot_of_root[root] {
                Some(slot) => groups[slot].push(aoi),
                None => {
                    slot_of_root[root] = Some(groups.len());
                    groups.push(vec![aoi]);
                }
            }
        }
        aois = groups.into_iter().map(combine).collect();
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn combine(mut members: Vec<AreaOfInterest>) -> AreaOfInterest {
    if members.len() == 1 {
        return members.remove(0);
    }

    let area: f64 = members.iter().map(|m| m.area).sum();
    let flagged = members.iter().any(|m| m.flagged);
    let mut pixels: Vec<Point> = members
        .iter()
        .flat_map(|m| m.detected_pixels.iter().copied())
        .collect();
    pixels.sort_by_key(|p| (p.y, p.x));
    pixels.dedup();

    let center = centroid(&pixels).unwrap_or_else(|| weighted_center(&members));
    let covers_members = members
        .iter()
        .map(|m| (center.distance(&m.center) + m.radius as f64).ceil() as i32)
        .max()
        .unwrap_or(0);
    let radius = enclosing_radius(&center, &pixels).max(covers_members);

    let mut aoi = AreaOfInterest::new(center, radius, area);
    aoi.detected_pixels = pixels;
    aoi.flagged = flagged;
    aoi
}

fn weighted_center(members: &[AreaOfInterest]) -> Point {
    let weights: Vec<f64> = members.iter().map(|m| m.area.max(1.0)).collect();
    let total: f64 = weights.iter().sum();
    let x: f64 = members.iter().zip(&weights).map(|(m, w)| m.center.x as f64 * w).sum();
    let y: f64 = members.iter().zip(&weights).map(|(m, w)| m.center.y as f64 * w).sum();
    Point::new((x / total).round() as i32, (y / total).round() as i32)
}
