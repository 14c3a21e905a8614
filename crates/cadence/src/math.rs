use std::f32::consts::{PI, TAU};
use std::ops::{Add, Mul, Sub};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };
    pub const ONE: Self = Self { x: 1.0, y: 1.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn lerp(self, target: Self, t: f32) -> Self {
        Self {
            x: lerp(self.x, target.x, t),
            y: lerp(self.y, target.y, t),
        }
    }

    pub fn component_mul(self, other: Self) -> Self {
        Self {
            x: self.x * other.x,
            y: self.y * other.y,
        }
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}

impl Add for Vec2 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };
    pub const ONE: Self = Self {
        x: 1.0,
        y: 1.0,
        z: 1.0,
    };
    pub const Z: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 1.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn lerp(self, target: Self, t: f32) -> Self {
        Self {
            x: lerp(self.x, target.x, t),
            y: lerp(self.y, target.y, t),
            z: lerp(self.z, target.z, t),
        }
    }

    pub fn component_mul(self, other: Self) -> Self {
        Self::new(self.x * other.x, self.y * other.y, self.z * other.z)
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Zero-length input stays zero.
    pub fn normalize_or_zero(self) -> Self {
        let len = self.length();
        if len <= f32::EPSILON {
            return Self::ZERO;
        }
        self * (1.0 / len)
    }
}

impl Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Exact at both endpoints: `t == 0` yields `a`, `t == 1` yields `b`.
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a * (1.0 - t) + b * t
}

/// Wraps an angle difference into `[-PI, PI)`.
pub fn wrap_angle(radians: f32) -> f32 {
    (radians + PI).rem_euclid(TAU) - PI
}

/// Blends two angles along the shortest arc.
///
/// The result is not normalized: starting at `3.0` and heading to `-3.0`
/// passes through `PI` rather than `0`. At `t == 1` the exact target is
/// returned so callers observe the stored angle rather than an equivalent
/// one offset by a full turn.
pub fn lerp_angle(a: f32, b: f32, t: f32) -> f32 {
    if t == 1.0 {
        return b;
    }
    a + wrap_angle(b - a) * t
}

/// Column-major 3x3 matrix for 2D affine transforms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat3 {
    pub cols: [[f32; 3]; 3],
}

impl Mat3 {
    pub const IDENTITY: Self = Self {
        cols: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    };

    /// Translation * rotation * scale.
    pub fn from_trs(translation: Vec2, rotation: f32, scale: Vec2) -> Self {
        let (sin, cos) = rotation.sin_cos();
        Self {
            cols: [
                [cos * scale.x, sin * scale.x, 0.0],
                [-sin * scale.y, cos * scale.y, 0.0],
                [translation.x, translation.y, 1.0],
            ],
        }
    }

    pub fn transform_point(&self, point: Vec2) -> Vec2 {
        let c = &self.cols;
        Vec2 {
            x: c[0][0] * point.x + c[1][0] * point.y + c[2][0],
            y: c[0][1] * point.x + c[1][1] * point.y + c[2][1],
        }
    }
}

impl Default for Mat3 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Column-major 4x4 matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat4 {
    pub cols: [[f32; 4]; 4],
}

impl Mat4 {
    pub const IDENTITY: Self = Self {
        cols: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    /// Translation * axis-angle rotation * scale. A zero axis means no rotation.
    pub fn from_trs(translation: Vec3, axis: Vec3, angle: f32, scale: Vec3) -> Self {
        let r = rotation_columns(axis.normalize_or_zero(), angle);
        Self {
            cols: [
                [r[0][0] * scale.x, r[0][1] * scale.x, r[0][2] * scale.x, 0.0],
                [r[1][0] * scale.y, r[1][1] * scale.y, r[1][2] * scale.y, 0.0],
                [r[2][0] * scale.z, r[2][1] * scale.z, r[2][2] * scale.z, 0.0],
                [translation.x, translation.y, translation.z, 1.0],
            ],
        }
    }

    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        let c = &self.cols;
        Vec3 {
            x: c[0][0] * point.x + c[1][0] * point.y + c[2][0] * point.z + c[3][0],
            y: c[0][1] * point.x + c[1][1] * point.y + c[2][1] * point.z + c[3][1],
            z: c[0][2] * point.x + c[1][2] * point.y + c[2][2] * point.z + c[3][2],
        }
    }
}

impl Default for Mat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

// Rodrigues' rotation formula, returned as columns.
fn rotation_columns(axis: Vec3, angle: f32) -> [[f32; 3]; 3] {
    if axis == Vec3::ZERO {
        return [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    }
    let (sin, cos) = angle.sin_cos();
    let k = 1.0 - cos;
    let Vec3 { x, y, z } = axis;
    [
        [cos + x * x * k, y * x * k + z * sin, z * x * k - y * sin],
        [x * y * k - z * sin, cos + y * y * k, z * y * k + x * sin],
        [x * z * k + y * sin, y * z * k - x * sin, cos + z * z * k],
    ]
}
