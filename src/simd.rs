//! 4-wide `Vector3` batch type used by the batched constraint relaxation.
//!
//! [`Vec3x4`] stores 4 `Vector3<f64>` values in a structure-of-arrays (`SoA`) layout.
//! Constraint batches gather node positions into lanes, relax all 4 constraints at
//! once, then scatter the results back. Lanes in a batch never share a node, so the
//! scatter order does not matter.

use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Four scalars, one per lane.
pub type F64x4 = [f64; 4];

/// A batch of 4 `Vector3<f64>` values stored in `SoA` (Structure of Arrays) layout.
///
/// # Memory Layout
///
/// ```text
/// xs: [x0, x1, x2, x3]
/// ys: [y0, y1, y2, y3]
/// zs: [z0, z1, z2, z3]
/// ```
///
/// # Example
///
/// ```
/// use fe_softbody::Vec3x4;
/// use nalgebra::Vector3;
///
/// let positions = vec![
///     Vector3::new(1.0, 2.0, 3.0),
///     Vector3::new(4.0, 5.0, 6.0),
///     Vector3::new(7.0, 8.0, 9.0),
/// ];
///
/// // Lanes may repeat an index when a batch is padded.
/// let batch = Vec3x4::gather(&positions, [0, 2, 1, 1]);
/// assert_eq!(batch.get(1), Vector3::new(7.0, 8.0, 9.0));
/// assert_eq!(batch.norm_squared()[0], 14.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(C, align(32))]
pub struct Vec3x4 {
    /// X components of all 4 vectors.
    pub xs: F64x4,
    /// Y components of all 4 vectors.
    pub ys: F64x4,
    /// Z components of all 4 vectors.
    pub zs: F64x4,
}

impl Default for Vec3x4 {
    fn default() -> Self {
        Self::zeros()
    }
}

/// Lane-wise product of two scalar quadruples.
#[must_use]
#[inline]
pub fn mul4(a: F64x4, b: F64x4) -> F64x4 {
    [a[0] * b[0], a[1] * b[1], a[2] * b[2], a[3] * b[3]]
}

/// Lane-wise sum of two scalar quadruples.
#[must_use]
#[inline]
pub fn add4(a: F64x4, b: F64x4) -> F64x4 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2], a[3] + b[3]]
}

/// Lane-wise difference of two scalar quadruples.
#[must_use]
#[inline]
pub fn sub4(a: F64x4, b: F64x4) -> F64x4 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2], a[3] - b[3]]
}

/// Apply `f` to every lane.
#[must_use]
#[inline]
pub fn map4(a: F64x4, f: impl Fn(f64) -> f64) -> F64x4 {
    [f(a[0]), f(a[1]), f(a[2]), f(a[3])]
}

impl Vec3x4 {
    /// Create a batch of 4 zero vectors.
    #[must_use]
    #[inline]
    pub const fn zeros() -> Self {
        Self {
            xs: [0.0; 4],
            ys: [0.0; 4],
            zs: [0.0; 4],
        }
    }

    /// Create from 4 individual vectors.
    #[must_use]
    #[inline]
    pub fn from_vectors(vectors: [Vector3<f64>; 4]) -> Self {
        Self {
            xs: [vectors[0].x, vectors[1].x, vectors[2].x, vectors[3].x],
            ys: [vectors[0].y, vectors[1].y, vectors[2].y, vectors[3].y],
            zs: [vectors[0].z, vectors[1].z, vectors[2].z, vectors[3].z],
        }
    }

    /// Load the positions of 4 nodes into lanes.
    #[must_use]
    #[inline]
    pub fn gather(positions: &[Vector3<f64>], nodes: [usize; 4]) -> Self {
        Self::from_vectors([
            positions[nodes[0]],
            positions[nodes[1]],
            positions[nodes[2]],
            positions[nodes[3]],
        ])
    }

    /// Store lanes back into the positions of 4 nodes.
    ///
    /// Duplicated lanes carry identical values, so writing them twice is harmless.
    #[inline]
    pub fn scatter(&self, positions: &mut [Vector3<f64>], nodes: [usize; 4]) {
        for (lane, &node) in nodes.iter().enumerate() {
            positions[node] = self.get(lane);
        }
    }

    /// Create by broadcasting a single vector to all 4 lanes.
    #[must_use]
    #[inline]
    pub fn splat(v: Vector3<f64>) -> Self {
        Self {
            xs: [v.x; 4],
            ys: [v.y; 4],
            zs: [v.z; 4],
        }
    }

    /// Extract the vector at a given lane.
    #[must_use]
    #[inline]
    pub fn get(&self, index: usize) -> Vector3<f64> {
        debug_assert!(index < 4);
        Vector3::new(self.xs[index], self.ys[index], self.zs[index])
    }

    /// Convert to an array of 4 vectors.
    #[must_use]
    #[inline]
    pub fn to_vectors(&self) -> [Vector3<f64>; 4] {
        [self.get(0), self.get(1), self.get(2), self.get(3)]
    }

    /// Pairwise dot products between this batch and another.
    #[must_use]
    #[inline]
    pub fn dot_pairwise(&self, other: &Self) -> F64x4 {
        let mut result = [0.0; 4];

        for i in 0..4 {
            result[i] = self.xs[i] * other.xs[i];
        }
        for i in 0..4 {
            result[i] += self.ys[i] * other.ys[i];
        }
        for i in 0..4 {
            result[i] += self.zs[i] * other.zs[i];
        }

        result
    }

    /// Squared norm of each vector.
    #[must_use]
    #[inline]
    pub fn norm_squared(&self) -> F64x4 {
        self.dot_pairwise(self)
    }

    /// Norm of each vector.
    #[must_use]
    #[inline]
    pub fn norm(&self) -> F64x4 {
        map4(self.norm_squared(), f64::sqrt)
    }

    /// Add two batches element-wise.
    #[must_use]
    #[inline]
    pub fn add(&self, other: &Self) -> Self {
        Self {
            xs: add4(self.xs, other.xs),
            ys: add4(self.ys, other.ys),
            zs: add4(self.zs, other.zs),
        }
    }

    /// Subtract two batches element-wise.
    #[must_use]
    #[inline]
    pub fn sub(&self, other: &Self) -> Self {
        Self {
            xs: sub4(self.xs, other.xs),
            ys: sub4(self.ys, other.ys),
            zs: sub4(self.zs, other.zs),
        }
    }

    /// Multiply each vector by a scalar.
    #[must_use]
    #[inline]
    pub fn scale(&self, scalar: f64) -> Self {
        self.scale_each([scalar; 4])
    }

    /// Multiply each vector by its lane's scalar.
    #[must_use]
    #[inline]
    pub fn scale_each(&self, scalars: F64x4) -> Self {
        Self {
            xs: mul4(self.xs, scalars),
            ys: mul4(self.ys, scalars),
            zs: mul4(self.zs, scalars),
        }
    }

    /// Negate all vectors.
    #[must_use]
    #[inline]
    pub fn neg(&self) -> Self {
        Self {
            xs: [-self.xs[0], -self.xs[1], -self.xs[2], -self.xs[3]],
            ys: [-self.ys[0], -self.ys[1], -self.ys[2], -self.ys[3]],
            zs: [-self.zs[0], -self.zs[1], -self.zs[2], -self.zs[3]],
        }
    }

    /// Pairwise cross products.
    #[must_use]
    #[inline]
    pub fn cross_pairwise(&self, other: &Self) -> Self {
        Self {
            xs: sub4(mul4(self.ys, other.zs), mul4(self.zs, other.ys)),
            ys: sub4(mul4(self.zs, other.xs), mul4(self.xs, other.zs)),
            zs: sub4(mul4(self.xs, other.ys), mul4(self.ys, other.xs)),
        }
    }

    /// Normalize each vector, substituting `fallback` for near-zero lanes.
    #[must_use]
    #[inline]
    pub fn normalize_or(&self, fallback: &Vector3<f64>) -> Self {
        let norms = self.norm();
        let mut out = *self;
        for i in 0..4 {
            if norms[i] > 1e-10 {
                let inv = 1.0 / norms[i];
                out.xs[i] *= inv;
                out.ys[i] *= inv;
                out.zs[i] *= inv;
            } else {
                out.xs[i] = fallback.x;
                out.ys[i] = fallback.y;
                out.zs[i] = fallback.z;
            }
        }
        out
    }

    /// Fused multiply-add per lane: `self * a + b`.
    #[must_use]
    #[inline]
    pub fn mul_add_each(&self, a: F64x4, b: &Self) -> Self {
        Self {
            xs: std::array::from_fn(|i| self.xs[i].mul_add(a[i], b.xs[i])),
            ys: std::array::from_fn(|i| self.ys[i].mul_add(a[i], b.ys[i])),
            zs: std::array::from_fn(|i| self.zs[i].mul_add(a[i], b.zs[i])),
        }
    }
}

impl std::ops::Add for Vec3x4 {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self::add(&self, &rhs)
    }
}

impl std::ops::AddAssign for Vec3x4 {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = Self::add(self, &rhs);
    }
}

impl std::ops::Sub for Vec3x4 {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self::sub(&self, &rhs)
    }
}

impl std::ops::SubAssign for Vec3x4 {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = Self::sub(self, &rhs);
    }
}

impl std::ops::Neg for Vec3x4 {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Self::neg(&self)
    }
}

impl std::ops::Mul<f64> for Vec3x4 {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: f64) -> Self {
        self.scale(rhs)
    }
}

impl std::ops::Mul<F64x4> for Vec3x4 {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: F64x4) -> Self {
        self.scale_each(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_gather_scatter() {
        let mut positions: Vec<Vector3<f64>> =
            (0..5).map(|i| Vector3::new(f64::from(i), 0.0, 0.0)).collect();
        let batch = Vec3x4::gather(&positions, [4, 3, 2, 2]);
        assert_relative_eq!(batch.xs[0], 4.0);
        assert_relative_eq!(batch.xs[3], 2.0);

        let moved = batch + Vec3x4::splat(Vector3::new(0.0, 1.0, 0.0));
        moved.scatter(&mut positions, [4, 3, 2, 2]);
        assert_relative_eq!(positions[4].y, 1.0);
        assert_relative_eq!(positions[2].y, 1.0);
        assert_relative_eq!(positions[0].y, 0.0);
    }

    #[test]
    fn test_cross_and_dot() {
        let a = Vec3x4::splat(Vector3::x());
        let b = Vec3x4::splat(Vector3::y());
        let c = a.cross_pairwise(&b);
        assert_relative_eq!(c.get(2), Vector3::z());
        assert_eq!(a.dot_pairwise(&b), [0.0; 4]);
    }

    #[test]
    fn test_normalize_or() {
        let v = Vec3x4::from_vectors([
            Vector3::new(3.0, 4.0, 0.0),
            Vector3::zeros(),
            Vector3::new(0.0, 0.0, 2.0),
            Vector3::new(0.0, 5.0, 0.0),
        ]);
        let n = v.normalize_or(&Vector3::x());
        assert_relative_eq!(n.get(0), Vector3::new(0.6, 0.8, 0.0));
        assert_relative_eq!(n.get(1), Vector3::x());
        assert_relative_eq!(n.get(2), Vector3::z());
    }

    #[test]
    fn test_mul_add_each() {
        let a = Vec3x4::splat(Vector3::new(1.0, 2.0, 3.0));
        let b = Vec3x4::splat(Vector3::new(1.0, 1.0, 1.0));
        let r = a.mul_add_each([2.0, 0.0, 1.0, -1.0], &b);
        assert_relative_eq!(r.get(0), Vector3::new(3.0, 5.0, 7.0));
        assert_relative_eq!(r.get(1), Vector3::new(1.0, 1.0, 1.0));
        assert_relative_eq!(r.get(3), Vector3::new(0.0, -1.0, -2.0));
    }
}
