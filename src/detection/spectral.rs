//! Background statistics over the three color channels.

pub type Vec3 = [f64; 3];
pub type Mat3 = [[f64; 3]; 3];

/// Mean and covariance of a set of RGB samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackgroundModel {
    pub mean: Vec3,
    pub covariance: Mat3,
    pub inverse: Mat3,
}

impl BackgroundModel {
    pub fn fit(pixels: &[[u8; 3]]) -> Option<Self> {
        let mut n = 0usize;
        let mut sums = [0f64; 3];
        for px in pixels {
            for c in 0..3 {
                sums[c] += px[c] as f64;
            }
            n += 1;
        }
        if n < 2 {
            return None;
        }
        let mean = sums.map(|s| s / n as f64);

        let mut covariance = [[0f64; 3]; 3];
        for px in pixels {
            let d = [px[0] as f64 - mean[0], px[1] as f64 - mean[1], px[2] as f64 - mean[2]];
            for i in 0..3 {
                for j in i..3 {
                    covariance[i][j] += d[i] * d[j];
                }
            }
        }
        for i in 0..3 {
            for j in i..3 {
                covariance[i][j] /= (n - 1) as f64;
                covariance[j][i] = covariance[i][j];
            }
        }

        Some(Self {
            mean,
            covariance,
            inverse: regularized_inverse(&covariance),
        })
    }

    /// Squared Mahalanobis distance of `x` from the mean.
    pub fn mahalanobis_sq(&self, x: &Vec3) -> f64 {
        let d = sub(x, &self.mean);
        dot(&d, &mat_vec(&self.inverse, &d))
    }
}

pub fn sub(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn dot(a: &Vec3, b: &Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn mat_vec(m: &Mat3, v: &Vec3) -> Vec3 {
    [dot(&m[0], v), dot(&m[1], v), dot(&m[2], v)]
}

pub fn to_vec3(px: &[u8; 3]) -> Vec3 {
    [px[0] as f64, px[1] as f64, px[2] as f64]
}

fn determinant(m: &Mat3) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

pub fn invert(m: &Mat3) -> Option<Mat3> {
    let det = determinant(m);
    if !det.is_finite() || det.abs() < 1e-9 {
        return None;
    }
    let mut inv = [[0f64; 3]; 3];
    inv[0][0] = (m[1][1] * m[2][2] - m[1][2] * m[2][1]) / det;
    inv[0][1] = (m[0][2] * m[2][1] - m[0][1] * m[2][2]) / det;
    inv[0][2] = (m[0][1] * m[1][2] - m[0][2] * m[1][1]) / det;
    inv[1][0] = (m[1][2] * m[2][0] - m[1][0] * m[2][2]) / det;
    inv[1][1] = (m[0][0] * m[2][2] - m[0][2] * m[2][0]) / det;
    inv[1][2] = (m[0][2] * m[1][0] - m[0][0] * m[1][2]) / det;
    inv[2][0] = (m[1][0] * m[2][1] - m[1][1] * m[2][0]) / det;
    inv[2][1] = (m[0][1] * m[2][0] - m[0][0] * m[2][1]) / det;
    inv[2][2] = (m[0][0] * m[1][1] - m[0][1] * m[1][0]) / det;
    Some(inv)
}

/// Invert a covariance matrix, loading the diagonal until it is invertible.
/// Flat image regions otherwise have no inverse at all.
pub fn regularized_inverse(m: &Mat3) -> Mat3 {
    let mut ridge = 0.0;
    loop {
        let mut loaded = *m;
        for (i, row) in loaded.iter_mut().enumerate() {
            row[i] += ridge;
        }
        if let Some(inv) = invert(&loaded) {
            return inv;
        }
        ridge = if ridge == 0.0 { 1e-3 } else { ridge * 10.0 };
        if ridge > 1e6 {
            return [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        }
    }
}
