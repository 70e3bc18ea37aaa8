//! Local frames and rotation helpers shared by the shape-matching elements.
//!
//! Quads and tris are relaxed by finding a best-fit rotation of their rest shape onto
//! the deformed corners. The helpers here build the element's local frame, represent
//! planar rotations by their (cos, sin) pair, and solve the small-angle 3D case
//! through a weighted covariance matrix.

use nalgebra::{Matrix3, UnitQuaternion, Vector2, Vector3};

use crate::types::Transform;

/// Smallest weight accepted when normalizing a planar rotation.
const ROTATION_EPSILON: f64 = f64::EPSILON;

/// A unit vector perpendicular to `v`.
#[must_use]
pub fn perpendicular(v: &Vector3<f64>) -> Vector3<f64> {
    if v.x == 0.0 {
        Vector3::x()
    } else if v.y == 0.0 {
        Vector3::y()
    } else if v.z == 0.0 {
        Vector3::z()
    } else {
        Vector3::new(-v.y, v.x, 0.0).normalize()
    }
}

/// Normalize `v`, or return `fallback` when `v` is too short.
#[must_use]
pub fn normalize_or(v: &Vector3<f64>, fallback: Vector3<f64>) -> Vector3<f64> {
    let len = v.norm();
    if len > 1e-10 { v / len } else { fallback }
}

/// 2D cross product (z of the 3D cross).
#[must_use]
#[inline]
pub fn cross_z(a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
    a.x * b.y - a.y * b.x
}

/// A planar rotation built from weighted (cos, sin) sums.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rotation2D {
    /// Cosine of the angle.
    pub cos: f64,
    /// Sine of the angle.
    pub sin: f64,
}

impl Rotation2D {
    /// Normalize weighted sums into a rotation; near-zero weights give the identity.
    #[must_use]
    pub fn new(weighted_cos: f64, weighted_sin: f64) -> Self {
        let weight = weighted_cos.hypot(weighted_sin);
        if weight > ROTATION_EPSILON {
            Self {
                cos: weighted_cos / weight,
                sin: weighted_sin / weight,
            }
        } else {
            Self { cos: 1.0, sin: 0.0 }
        }
    }

    /// Rotate a 2D vector.
    #[must_use]
    #[inline]
    pub fn apply(&self, d: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            d.x * self.cos - d.y * self.sin,
            d.y * self.cos + d.x * self.sin,
        )
    }
}

/// Frame of a triangle: X along the first edge, Y in the triangle plane.
#[derive(Debug, Clone, Copy)]
pub struct TriBasis {
    /// Unit X axis.
    pub axis_x: Vector3<f64>,
    /// Unit Y axis.
    pub axis_y: Vector3<f64>,
    /// Length of the first edge.
    pub v1x: f64,
    /// Second edge in local coordinates.
    pub v2: Vector2<f64>,
}

impl TriBasis {
    /// Build from the two edges leaving corner 0.
    #[must_use]
    pub fn new(edge1: &Vector3<f64>, edge2: &Vector3<f64>) -> Self {
        let v1x = edge1.norm();
        let axis_x = if v1x > 1e-10 {
            edge1 / v1x
        } else {
            Vector3::x()
        };
        let v2x = edge2.dot(&axis_x);
        let ortho = edge2 - axis_x * v2x;
        let v2y = ortho.norm();
        let axis_y = if v2y > 1e-10 {
            ortho / v2y
        } else {
            perpendicular(&axis_x)
        };
        Self {
            axis_x,
            axis_y,
            v1x,
            v2: Vector2::new(v2x, v2y),
        }
    }

    /// Local XY to world offset.
    #[must_use]
    #[inline]
    pub fn local_xy_to_world(&self, local: &Vector2<f64>) -> Vector3<f64> {
        self.axis_x * local.x + self.axis_y * local.y
    }
}

/// Orthonormal frame built from two tentative axes.
#[derive(Debug, Clone, Copy)]
pub struct Basis {
    /// X axis.
    pub x: Vector3<f64>,
    /// Y axis, orthogonalized against X.
    pub y: Vector3<f64>,
    /// Z = X cross Y.
    pub z: Vector3<f64>,
}

impl Basis {
    /// Gram-Schmidt on the tentative axes, with unit-axis fallbacks.
    #[must_use]
    pub fn new(tentative_x: &Vector3<f64>, tentative_y: &Vector3<f64>) -> Self {
        let x = normalize_or(tentative_x, Vector3::x());
        let y = normalize_or(&(tentative_y - x * tentative_y.dot(&x)), Vector3::y());
        let z = x.cross(&y);
        Self { x, y, z }
    }

    /// World offset to local coordinates.
    #[must_use]
    #[inline]
    pub fn world_to_local(&self, p: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(p.dot(&self.x), p.dot(&self.y), p.dot(&self.z))
    }

    /// World offset to local YZ coordinates.
    #[must_use]
    #[inline]
    pub fn world_to_local_yz(&self, p: &Vector3<f64>) -> Vector2<f64> {
        Vector2::new(p.dot(&self.y), p.dot(&self.z))
    }

    /// Local coordinates to world offset.
    #[must_use]
    #[inline]
    pub fn local_to_world(&self, local: &Vector3<f64>) -> Vector3<f64> {
        self.x * local.x + self.y * local.y + self.z * local.z
    }
}

/// Accumulates `sum m (|x|^2 I - x x^T)`, the left side of the small-angle Wahba solve.
#[derive(Debug, Clone, Copy)]
pub struct WahbaCovariance(pub Matrix3<f64>);

impl Default for WahbaCovariance {
    fn default() -> Self {
        Self(Matrix3::zeros())
    }
}

impl WahbaCovariance {
    /// Add a weighted point relative to the center of mass.
    pub fn add(&mut self, m: f64, x: &Vector3<f64>) {
        self.0 += (Matrix3::identity() * x.norm_squared() - x * x.transpose()) * m;
    }

    /// Solve `C w = rhs`; a singular or indefinite `C` yields zero.
    #[must_use]
    pub fn solve(&self, rhs: &Vector3<f64>) -> Vector3<f64> {
        match self.0.cholesky() {
            Some(chol) => {
                let w = chol.solve(rhs);
                if w.iter().all(|c| c.is_finite()) {
                    w
                } else {
                    Vector3::zeros()
                }
            }
            None => Vector3::zeros(),
        }
    }
}

/// Small-angle rotation `d -> d + w x d`.
#[derive(Debug, Clone, Copy)]
pub struct SinRotation(pub Vector3<f64>);

impl SinRotation {
    /// Apply to a vector.
    #[must_use]
    #[inline]
    pub fn apply(&self, d: &Vector3<f64>) -> Vector3<f64> {
        d + self.0.cross(d)
    }
}

/// Best small rotation taking each rest offset `r_i` onto its deformed offset `x_i`.
#[must_use]
pub fn wahba_rotation(masses: &[f64], xs: &[Vector3<f64>], rs: &[Vector3<f64>]) -> SinRotation {
    let mut cov = WahbaCovariance::default();
    let mut rhs = Vector3::zeros();
    for ((&m, x), r) in masses.iter().zip(xs).zip(rs) {
        cov.add(m, x);
        rhs -= x.cross(r) * m;
    }
    SinRotation(cov.solve(&rhs))
}

/// Rotate `tm` by the shortest arc taking its X axis onto `direction`, placed at `origin`.
#[must_use]
pub fn align_x(tm: &Transform, direction: &Vector3<f64>, origin: &Vector3<f64>) -> Transform {
    let axis_x = tm.rotation * Vector3::x();
    let rotation = match UnitQuaternion::rotation_between(&axis_x, direction) {
        Some(delta) => delta * tm.rotation,
        None if direction.norm_squared() > 1e-20 && axis_x.dot(direction) < 0.0 => {
            let flip = UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(perpendicular(&axis_x)),
                std::f64::consts::PI,
            );
            flip * tm.rotation
        }
        None => tm.rotation,
    };
    Transform::from_parts((*origin).into(), rotation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rotation2d_normalizes() {
        let r = Rotation2D::new(0.0, 2.0);
        assert_relative_eq!(r.sin, 1.0);
        let v = r.apply(&Vector2::new(1.0, 0.0));
        assert_relative_eq!(v, Vector2::new(0.0, 1.0), epsilon = 1e-12);

        let identity = Rotation2D::new(0.0, 0.0);
        assert_eq!(identity, Rotation2D { cos: 1.0, sin: 0.0 });
    }

    #[test]
    fn test_tri_basis() {
        let b = TriBasis::new(&Vector3::new(2.0, 0.0, 0.0), &Vector3::new(1.0, 3.0, 0.0));
        assert_relative_eq!(b.v1x, 2.0);
        assert_relative_eq!(b.v2, Vector2::new(1.0, 3.0));
        assert_relative_eq!(
            b.local_xy_to_world(&Vector2::new(1.0, 3.0)),
            Vector3::new(1.0, 3.0, 0.0)
        );
    }

    #[test]
    fn test_basis_round_trip() {
        let b = Basis::new(&Vector3::new(0.0, 2.0, 0.0), &Vector3::new(1.0, 1.0, 0.0));
        let p = Vector3::new(0.3, -1.2, 4.0);
        assert_relative_eq!(b.local_to_world(&b.world_to_local(&p)), p, epsilon = 1e-12);
        assert_relative_eq!(b.z.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_basis_falls_back() {
        let b = Basis::new(&Vector3::zeros(), &Vector3::zeros());
        assert_relative_eq!(b.x, Vector3::x());
        assert_relative_eq!(b.y, Vector3::y());
    }

    #[test]
    fn test_wahba_identity_when_matching() {
        let xs = [Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0), Vector3::new(-1.0, -1.0, 0.0)];
        let rot = wahba_rotation(&[1.0, 1.0, 1.0], &xs, &xs);
        assert_relative_eq!(rot.0, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_wahba_singular_is_zero() {
        let cov = WahbaCovariance::default();
        assert_eq!(cov.solve(&Vector3::new(1.0, 2.0, 3.0)), Vector3::zeros());
    }

    #[test]
    fn test_align_x() {
        let tm = Transform::identity();
        let aligned = align_x(&tm, &Vector3::new(0.0, 3.0, 0.0), &Vector3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(aligned.rotation * Vector3::x(), Vector3::y(), epsilon = 1e-12);
        assert_relative_eq!(aligned.translation.vector, Vector3::new(1.0, 2.0, 3.0));

        let flipped = align_x(&tm, &Vector3::new(-1.0, 0.0, 0.0), &Vector3::zeros());
        assert_relative_eq!(flipped.rotation * Vector3::x(), -Vector3::x(), epsilon = 1e-12);
    }

    #[test]
    fn test_perpendicular() {
        for v in [Vector3::new(1.0, 2.0, 3.0), Vector3::z(), Vector3::new(0.0, 1.0, 1.0)] {
            assert_relative_eq!(perpendicular(&v).dot(&v), 0.0, epsilon = 1e-12);
        }
    }
}
