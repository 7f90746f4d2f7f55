//! ECEF/geodetic/ENU geometry shared by the registry, the Delaunay network,
//! and the VRS engine. WGS84 constants and conversions are small enough to
//! hand-write rather than pull in a surface-distance crate that does not
//! model 3-D ECEF tangent frames.

use serde::{Deserialize, Serialize};

pub const WGS84_A: f64 = 6378137.0;
pub const WGS84_F: f64 = 1.0 / 298.257223563;
pub const WGS84_E2: f64 = WGS84_F * (2.0 - WGS84_F);

/// Earth-centered, earth-fixed Cartesian position (meters).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Ecef {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Ecef {
    pub const ZERO: Ecef = Ecef { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }

    pub fn sub(&self, other: &Ecef) -> [f64; 3] {
        [self.x - other.x, self.y - other.y, self.z - other.z]
    }

    pub fn dist(&self, other: &Ecef) -> f64 {
        let d = self.sub(other);
        (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt()
    }

    /// Geodetic latitude/longitude/height (radians, radians, meters).
    pub fn to_geodetic(&self) -> Geodetic {
        let (x, y, z) = (self.x, self.y, self.z);
        let e2 = WGS84_E2;
        let a = WGS84_A;
        let r2 = x * x + y * y;
        let r = r2.sqrt();
        let v0 = a;
        let mut lat = z.atan2(r * (1.0 - e2));
        let mut v = v0;
        for _ in 0..5 {
            let sin_lat = lat.sin();
            v = a / (1.0 - e2 * sin_lat * sin_lat).sqrt();
            lat = (z + e2 * v * sin_lat).atan2(r);
        }
        let lon = y.atan2(x);
        let height = if r > 1e-12 {
            r / lat.cos() - v
        } else {
            z.abs() - a * (1.0 - e2).sqrt()
        };
        Geodetic { lat, lon, height }
    }

    /// Rotation matrix columns (E, N, U) expressed in ECEF, at this position.
    pub fn enu_basis(&self) -> EnuBasis {
        let g = self.to_geodetic();
        let (sin_lat, cos_lat) = g.lat.sin_cos();
        let (sin_lon, cos_lon) = g.lon.sin_cos();
        EnuBasis {
            e: [-sin_lon, cos_lon, 0.0],
            n: [-sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat],
            u: [cos_lat * cos_lon, cos_lat * sin_lon, sin_lat],
        }
    }

    /// `other - self` expressed in this position's local ENU frame.
    pub fn enu_vector_to(&self, other: &Ecef) -> Enu {
        let d = other.sub(self);
        let basis = self.enu_basis();
        Enu {
            e: dot(&basis.e, &d),
            n: dot(&basis.n, &d),
            u: dot(&basis.u, &d),
        }
    }
}

fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Geodetic {
    pub lat: f64,
    pub lon: f64,
    pub height: f64,
}

impl Geodetic {
    pub fn to_ecef(&self) -> Ecef {
        let sin_lat = self.lat.sin();
        let cos_lat = self.lat.cos();
        let sin_lon = self.lon.sin();
        let cos_lon = self.lon.cos();
        let v = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
        Ecef {
            x: (v + self.height) * cos_lat * cos_lon,
            y: (v + self.height) * cos_lat * sin_lon,
            z: (v * (1.0 - WGS84_E2) + self.height) * sin_lat,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnuBasis {
    pub e: [f64; 3],
    pub n: [f64; 3],
    pub u: [f64; 3],
}

/// Local east/north/up tangent-plane displacement (meters).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Enu {
    pub e: f64,
    pub n: f64,
    pub u: f64,
}

impl Enu {
    pub fn horizontal_len(&self) -> f64 {
        (self.e * self.e + self.n * self.n).sqrt()
    }
}

/// Projects a set of ECEF positions onto a common local east/north plane
/// whose origin is their centroid, as used by the Delaunay network builder
/// (§4.5: "projected to local tangent plane... origin is the centroid").
pub struct CentroidProjector {
    origin: Ecef,
    basis: EnuBasis,
}

impl CentroidProjector {
    pub fn new(positions: &[Ecef]) -> Self {
        let n = positions.len().max(1) as f64;
        let mut sum = Ecef::ZERO;
        for p in positions {
            sum.x += p.x;
            sum.y += p.y;
            sum.z += p.z;
        }
        let origin = Ecef::new(sum.x / n, sum.y / n, sum.z / n);
        let basis = origin.enu_basis();
        Self { origin, basis }
    }

    /// 2-D (east, north) projection used as input to the triangulation.
    pub fn project(&self, p: &Ecef) -> [f64; 2] {
        let d = p.sub(&self.origin);
        [dot(&self.basis.e, &d), dot(&self.basis.n, &d)]
    }
}
