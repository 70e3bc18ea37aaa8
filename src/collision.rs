//! Point-versus-primitive projection used by rigid and world collision.
//!
//! Every routine moves a single node position out of a primitive. Sticky variants also
//! report how strongly the node should stick to the primitive's parent nodes; values
//! above [`GLUE_THRESHOLD`] glue the node for the next prediction.

use nalgebra::Vector3;

use crate::basis::perpendicular;
use crate::types::Aabb;

/// Margin beyond the surface within which sticky primitives still attract nodes.
pub const STICKY_DISTANCE: f64 = 2.0;

/// Minimum stickiness that glues a node.
pub const GLUE_THRESHOLD: f64 = 0.01;

/// Nodes closer than this (squared) to a sphere center are pushed straight up.
const COINCIDENT_DIST_SQ: f64 = 0.01;

/// A tapered capsule only behaves as a capsule when the small end sticks out this far.
const MIN_STICKOUT: f64 = 0.5;

/// Share of the node radius that collides with the first sphere of a tapered capsule.
const NODE_CORE_RATIO: f64 = 0.5;

/// Squared distance within which a point's plane projection counts as inside a triangle.
const TRIANGLE_INTERIOR_TOLERANCE_SQ: f64 = 1e-12;

/// Below this distance from a capsule axis the push direction is arbitrary.
const MIN_LINE_DIST: f64 = 1e-4;

/// Push `p` out of the sphere at `center`. Returns whether `p` moved.
///
/// A point at the center cannot be pushed along a meaningful direction, so it is
/// lifted to the top of the sphere.
pub fn project_out_of_sphere(p: &mut Vector3<f64>, center: &Vector3<f64>, radius: f64) -> bool {
    let d = *p - center;
    let dist_sq = d.norm_squared();
    if dist_sq < COINCIDENT_DIST_SQ {
        p.z = center.z + radius;
        true
    } else if dist_sq < radius * radius {
        *p = center + d * (radius / dist_sq.sqrt());
        true
    } else {
        false
    }
}

/// Sticky sphere projection; returns the stickiness the node picks up.
///
/// Full `stickiness` when the node was inside, a linear falloff over
/// [`STICKY_DISTANCE`] beyond the surface, and 0 past that.
pub fn project_out_of_sphere_sticky(
    p: &mut Vector3<f64>,
    center: &Vector3<f64>,
    radius: f64,
    stickiness: f64,
) -> f64 {
    if project_out_of_sphere(p, center, radius) {
        return stickiness;
    }
    let dist_sq = (*p - center).norm_squared();
    let reach = radius + STICKY_DISTANCE;
    if dist_sq < reach * reach {
        (stickiness * (reach - dist_sq.sqrt())).min(stickiness)
    } else {
        0.0
    }
}

/// Sphere touched by a point, within a tapered capsule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapsuleContact {
    /// Center of the touched sphere.
    pub center: Vector3<f64>,
    /// Radius of the touched sphere, without the node radius.
    pub radius: f64,
    /// Position along the axis: 0 at the first sphere, 1 at the second.
    pub blend: f64,
    /// Whether the point touches the first end sphere, where nodes only collide with
    /// their core radius.
    pub core: bool,
}

impl CapsuleContact {
    /// Radius a node of `node_radius` collides with at this contact.
    #[must_use]
    pub fn node_radius(&self, node_radius: f64) -> f64 {
        if self.core {
            node_radius * NODE_CORE_RATIO
        } else {
            node_radius
        }
    }
}

/// A capsule whose radius varies linearly between two end spheres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaperedCapsule {
    /// End sphere centers.
    pub centers: [Vector3<f64>; 2],
    /// End sphere radii.
    pub radii: [f64; 2],
}

impl TaperedCapsule {
    /// Capsule between two end spheres.
    #[must_use]
    pub const fn new(centers: [Vector3<f64>; 2], radii: [f64; 2]) -> Self {
        Self { centers, radii }
    }

    /// Whether the first end sphere barely sticks out of the second.
    ///
    /// Capsules are authored with the smaller sphere first; a degenerate capsule
    /// collides as its second sphere alone.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        let dist = (self.centers[1] - self.centers[0]).norm();
        dist - (self.radii[1] - self.radii[0]) <= MIN_STICKOUT
    }

    /// Bounding box of both end spheres, grown by `margin`.
    #[must_use]
    pub fn aabb(&self, margin: f64) -> Aabb {
        let mut aabb = Aabb::from_sphere(&self.centers[0], self.radii[0]);
        aabb.add_sphere(&self.centers[1], self.radii[1]);
        aabb.expanded(margin)
    }

    /// The sphere of the capsule surface that `p` projects onto.
    ///
    /// The projection follows the cone slope, so points beside the conical part map to
    /// the blended sphere whose surface is tangent there.
    #[must_use]
    pub fn contact(&self, p: &Vector3<f64>) -> CapsuleContact {
        let [c0, c1] = self.centers;
        let [r0, r1] = self.radii;
        let axis = c1 - c0;
        let dist = axis.norm();
        if dist <= f64::EPSILON {
            return CapsuleContact {
                center: c1,
                radius: r1,
                blend: 1.0,
                core: false,
            };
        }
        let axis = axis / dist;
        let slope = (r1 - r0) / dist;
        let d = p - c0;
        let proj = d.dot(&axis);
        let line_dist = (d - axis * proj).norm();
        let affine = proj + line_dist * slope;
        if affine <= 0.0 {
            CapsuleContact {
                center: c0,
                radius: r0,
                blend: 0.0,
                core: true,
            }
        } else if affine > dist {
            CapsuleContact {
                center: c1,
                radius: r1,
                blend: 1.0,
                core: false,
            }
        } else {
            let blend = affine / dist;
            CapsuleContact {
                center: c0 * (1.0 - blend) + c1 * blend,
                radius: r0 * (1.0 - blend) + r1 * blend,
                blend,
                core: false,
            }
        }
    }

    /// Push `p`, a node of radius `node_radius`, out of the capsule. Returns whether it moved.
    pub fn project(&self, p: &mut Vector3<f64>, node_radius: f64) -> bool {
        let contact = self.contact(p);
        project_out_of_sphere(p, &contact.center, contact.radius + contact.node_radius(node_radius))
    }

    /// Sticky projection; returns the stickiness picked up and the contact blend.
    pub fn project_sticky(
        &self,
        p: &mut Vector3<f64>,
        node_radius: f64,
        stickiness: f64,
    ) -> (f64, f64) {
        let contact = self.contact(p);
        let picked = project_out_of_sphere_sticky(
            p,
            &contact.center,
            contact.radius + contact.node_radius(node_radius),
            stickiness,
        );
        (picked, contact.blend)
    }
}

/// Push `p` out of a uniform capsule of `radius` around the segment `c0`-`c1`.
///
/// Returns whether `p` moved.
pub fn project_out_of_capsule(
    p: &mut Vector3<f64>,
    c0: &Vector3<f64>,
    c1: &Vector3<f64>,
    radius: f64,
) -> bool {
    let axis = c1 - c0;
    let dist = axis.norm();
    if dist <= f64::EPSILON {
        return project_out_of_sphere(p, c0, radius);
    }
    let axis = axis / dist;
    let d = *p - c0;
    let proj = d.dot(&axis);
    if proj <= 0.0 {
        return project_out_of_sphere(p, c0, radius);
    }
    if proj > dist {
        return project_out_of_sphere(p, c1, radius);
    }
    let ortho = d - axis * proj;
    let line_dist = ortho.norm();
    let push = radius - line_dist;
    if push <= 0.0 {
        return false;
    }
    if line_dist > MIN_LINE_DIST {
        *p += ortho * (push / line_dist);
    } else {
        *p += perpendicular(&axis) * radius;
    }
    true
}

/// Closest point to `p` on the triangle `v0`, `v1`, `v2`.
///
/// Classifies `p` against the vertex, edge and face regions of the triangle.
#[must_use]
pub fn closest_point_on_triangle(
    v0: &Vector3<f64>,
    v1: &Vector3<f64>,
    v2: &Vector3<f64>,
    p: &Vector3<f64>,
) -> Vector3<f64> {
    let ab = v1 - v0;
    let ac = v2 - v0;

    let ap = p - v0;
    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return *v0;
    }

    let bp = p - v1;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return *v1;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let denom = d1 - d3;
        let v = if denom.abs() > f64::EPSILON { d1 / denom } else { 0.5 };
        return v0 + ab * v;
    }

    let cp = p - v2;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return *v2;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let denom = d2 - d6;
        let w = if denom.abs() > f64::EPSILON { d2 / denom } else { 0.5 };
        return v0 + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && d4 - d3 >= 0.0 && d5 - d6 >= 0.0 {
        let num = d4 - d3;
        let denom = num + (d5 - d6);
        let w = if denom.abs() > f64::EPSILON { num / denom } else { 0.5 };
        return v1 + (v2 - v1) * w;
    }

    let denom = va + vb + vc;
    if denom.abs() <= f64::EPSILON {
        return *v0;
    }
    let v = vb / denom;
    let w = vc / denom;
    v0 + ab * v + ac * w
}

/// Unit normal of a counter-clockwise triangle, or `None` if it has no area.
fn triangle_normal(tri: &[Vector3<f64>; 3]) -> Option<Vector3<f64>> {
    let n = (tri[1] - tri[0]).cross(&(tri[2] - tri[0]));
    let area = n.norm();
    (area > f64::EPSILON).then(|| n / area)
}

/// Push `p` out of the front side of a one-sided triangle, treating `p` as a sphere
/// of `radius`. Returns whether `p` moved.
///
/// The front side is the one the counter-clockwise normal points to. A point whose
/// projection falls inside the triangle is pushed to `radius` in front of the plane,
/// even from slightly behind it; a point beside the triangle is pushed along the
/// normal until its closest point is `radius` away. Points behind the triangle and
/// beside it are left alone.
pub fn project_out_of_triangle(
    p: &mut Vector3<f64>,
    tri: &[Vector3<f64>; 3],
    radius: f64,
) -> bool {
    let Some(normal) = triangle_normal(tri) else {
        return false;
    };
    let dist_normal = normal.dot(&(*p - tri[0]));
    if dist_normal.abs() >= radius {
        return false;
    }
    let closest = closest_point_on_triangle(&tri[0], &tri[1], &tri[2], p);
    let on_plane = *p - normal * dist_normal;
    if (on_plane - closest).norm_squared() <= TRIANGLE_INTERIOR_TOLERANCE_SQ {
        *p += normal * (radius - dist_normal);
        return true;
    }
    if dist_normal <= 0.0 {
        return false;
    }
    let dist = (*p - closest).norm();
    if dist >= radius {
        return false;
    }
    *p += normal * (radius - dist);
    true
}

/// Push `p`, a sphere of `radius`, out of the convex hull bounded by `faces`.
///
/// Faces wind counter-clockwise seen from outside. Inside the hull, `p` leaves through
/// the face it penetrates least; outside, it is pushed away from its closest point on
/// the surface. Returns whether `p` moved.
pub fn project_out_of_hull(
    p: &mut Vector3<f64>,
    faces: &[[Vector3<f64>; 3]],
    radius: f64,
) -> bool {
    let mut inside = true;
    let mut exit: Option<(f64, Vector3<f64>)> = None;
    let mut nearest: Option<(f64, Vector3<f64>, Vector3<f64>)> = None;

    for face in faces {
        let Some(normal) = triangle_normal(face) else {
            continue;
        };
        let dist_normal = normal.dot(&(*p - face[0]));
        if dist_normal > 0.0 {
            inside = false;
        }
        if exit.is_none_or(|(best, _)| dist_normal > best) {
            exit = Some((dist_normal, normal));
        }
        let closest = closest_point_on_triangle(&face[0], &face[1], &face[2], p);
        let dist_sq = (*p - closest).norm_squared();
        if nearest.is_none_or(|(best, _, _)| dist_sq < best) {
            nearest = Some((dist_sq, closest, normal));
        }
    }

    let (Some((exit_dist, exit_normal)), Some((dist_sq, closest, normal))) = (exit, nearest) else {
        return false;
    };
    if inside {
        *p += exit_normal * (radius - exit_dist);
        return true;
    }
    if dist_sq >= radius * radius {
        return false;
    }
    let dist = dist_sq.sqrt();
    *p = if dist > MIN_LINE_DIST {
        closest + (*p - closest) * (radius / dist)
    } else {
        closest + normal * radius
    };
    true
}
