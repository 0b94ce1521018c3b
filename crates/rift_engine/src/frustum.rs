use glam::{IVec2, IVec3, Vec2, Vec3};
use rift_shared::coords::Axis;

/// Rectangular opening one cell thick along `depth_axis`. `min`/`max` bound
/// the opening on the two remaining axes (`u_axis`, `v_axis`) in continuous
/// coordinates.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aperture {
    pub depth_axis: Axis,
    pub depth: i32,
    pub u_axis: Axis,
    pub v_axis: Axis,
    pub min: Vec2,
    pub max: Vec2,
}

impl Aperture {
    /// Aperture spanning the cells `lower..=upper`, which must be flat along
    /// `depth_axis`.
    pub fn from_cells(depth_axis: Axis, lower: IVec3, upper: IVec3) -> Self {
        let (u_axis, v_axis) = depth_axis.others();
        Self {
            depth_axis,
            depth: depth_axis.of(lower),
            u_axis,
            v_axis,
            min: Vec2::new(u_axis.of(lower) as f32, v_axis.of(lower) as f32),
            max: Vec2::new(
                (u_axis.of(upper) + 1) as f32,
                (v_axis.of(upper) + 1) as f32,
            ),
        }
    }

    fn point(&self, depth: f32, uv: Vec2) -> Vec3 {
        let mut p = Vec3::ZERO;
        self.depth_axis.set_f32(&mut p, depth);
        self.u_axis.set_f32(&mut p, uv.x);
        self.v_axis.set_f32(&mut p, uv.y);
        p
    }

    fn cell(&self, depth: i32, u: i32, v: i32) -> IVec3 {
        let mut c = IVec3::ZERO;
        self.depth_axis.set(&mut c, depth);
        self.u_axis.set(&mut c, u);
        self.v_axis.set(&mut c, v);
        c
    }

    fn uv(&self, p: Vec3) -> Vec2 {
        Vec2::new(self.u_axis.of_f32(p), self.v_axis.of_f32(p))
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct Plane {
    normal: Vec3,
    anchor: Vec3,
}

impl Plane {
    fn signed(&self, p: Vec3) -> f32 {
        self.normal.dot(p - self.anchor)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct Cone {
    sides: [Plane; 4],
    near: Plane,
    /// +1 when the viewer looks along +depth, -1 otherwise.
    dir: i32,
    /// Visible window on the aperture's back face.
    window_min: Vec2,
    window_max: Vec2,
    back_depth: f32,
}

/// The region visible from `origin` through an aperture: four side planes
/// through the eye and the aperture's front face as the near plane. Every
/// plane's normal points outward; a non-positive dot product is inside.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ViewFrustum {
    origin: Vec3,
    aperture: Aperture,
    cone: Option<Cone>,
}

impl ViewFrustum {
    pub fn new(origin: Vec3, aperture: Aperture) -> Self {
        Self {
            origin,
            aperture,
            cone: build_cone(origin, &aperture),
        }
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    pub fn aperture(&self) -> &Aperture {
        &self.aperture
    }

    /// Degenerate frustums see nothing.
    pub fn is_empty(&self) -> bool {
        self.cone.is_none()
    }

    pub fn contains(&self, point: Vec3) -> bool {
        let Some(cone) = &self.cone else {
            return false;
        };
        cone.near.signed(point) < 0.0 && self.inside_sides(cone, point)
    }

    /// Containment ignoring the near plane: anything between the viewer and
    /// the aperture inside the visible solid angle also counts.
    pub fn contains_side_planes_only(&self, point: Vec3) -> bool {
        match &self.cone {
            Some(cone) => self.inside_sides(cone, point),
            None => false,
        }
    }

    fn inside_sides(&self, cone: &Cone, point: Vec3) -> bool {
        cone.sides.iter().all(|plane| plane.signed(point) <= 0.0)
    }

    /// Scan-converts the frustum layer by layer, starting at the aperture's own
    /// layer and walking away from the viewer while the layer's near face is
    /// closer than `max_depth` along the depth axis. Cells are clamped to the
    /// vertical range `min_y..max_y`.
    pub fn cells(&self, max_depth: f32, min_y: i32, max_y: i32) -> FrustumCells<'_> {
        FrustumCells {
            frustum: self,
            max_depth,
            min_y,
            max_y,
            next_layer: self.aperture.depth,
            bounds: None,
            cursor: IVec2::ZERO,
            done: self.cone.is_none(),
        }
    }

    pub fn for_each_cell<F>(&self, max_depth: f32, min_y: i32, max_y: i32, mut callback: F)
    where
        F: FnMut(IVec3),
    {
        for cell in self.cells(max_depth, min_y, max_y) {
            callback(cell);
        }
    }

    /// Cross-section of the visible cone `distance` away from the eye along
    /// the depth axis.
    fn section(&self, cone: &Cone, distance: f32) -> (Vec2, Vec2) {
        let eye_depth = self.aperture.depth_axis.of_f32(self.origin);
        let eye_uv = self.aperture.uv(self.origin);
        let back_distance = (cone.back_depth - eye_depth).abs();
        let scale = distance / back_distance;
        (
            eye_uv + (cone.window_min - eye_uv) * scale,
            eye_uv + (cone.window_max - eye_uv) * scale,
        )
    }

    /// Inclusive cell bounds on (u, v) for one layer: the union of the cone's
    /// sections at the layer's near and far faces.
    fn layer_bounds(
        &self,
        cone: &Cone,
        layer: i32,
        max_depth: f32,
        min_y: i32,
        max_y: i32,
    ) -> LayerBounds {
        let eye_depth = self.aperture.depth_axis.of_f32(self.origin);
        let (near_face, far_face) = if cone.dir > 0 {
            (layer as f32, (layer + 1) as f32)
        } else {
            ((layer + 1) as f32, layer as f32)
        };
        let near_distance = (near_face - eye_depth).abs();
        if near_distance >= max_depth {
            return LayerBounds::Exhausted;
        }

        let (near_min, near_max) = self.section(cone, near_distance);
        let (far_min, far_max) = self.section(cone, (far_face - eye_depth).abs());
        let lo = near_min.min(far_min);
        let hi = near_max.max(far_max);

        let mut lo_cell = IVec2::new(lo.x.floor() as i32, lo.y.floor() as i32);
        let mut hi_cell = IVec2::new(hi.x.ceil() as i32 - 1, hi.y.ceil() as i32 - 1);
        if self.aperture.u_axis == Axis::Y {
            lo_cell.x = lo_cell.x.max(min_y);
            hi_cell.x = hi_cell.x.min(max_y - 1);
        }
        if self.aperture.v_axis == Axis::Y {
            lo_cell.y = lo_cell.y.max(min_y);
            hi_cell.y = hi_cell.y.min(max_y - 1);
        }
        if self.aperture.depth_axis == Axis::Y && (layer < min_y || layer >= max_y) {
            return LayerBounds::Empty;
        }

        if lo_cell.x > hi_cell.x || lo_cell.y > hi_cell.y {
            LayerBounds::Empty
        } else {
            LayerBounds::Cells(lo_cell, hi_cell)
        }
    }
}

enum LayerBounds {
    Cells(IVec2, IVec2),
    Empty,
    Exhausted,
}

fn build_cone(origin: Vec3, aperture: &Aperture) -> Option<Cone> {
    let depth = aperture.depth as f32;
    let eye_depth = aperture.depth_axis.of_f32(origin);
    // Viewer inside the aperture slab: no meaningful sightline.
    if eye_depth >= depth && eye_depth <= depth + 1.0 {
        return None;
    }

    let dir = if eye_depth < depth { 1 } else { -1 };
    let (front_depth, back_depth) = if dir > 0 {
        (depth, depth + 1.0)
    } else {
        (depth + 1.0, depth)
    };

    let scale = (back_depth - eye_depth).abs() / (front_depth - eye_depth).abs();
    let eye_uv = aperture.uv(origin);
    let projected_min = eye_uv + (aperture.min - eye_uv) * scale;
    let projected_max = eye_uv + (aperture.max - eye_uv) * scale;
    let window_min = aperture.min.max(projected_min);
    let window_max = aperture.max.min(projected_max);
    // Corners crossed: grazing view, nothing passes through both faces.
    if window_max.x <= window_min.x || window_max.y <= window_min.y {
        return None;
    }

    let corners = [
        aperture.point(back_depth, window_min),
        aperture.point(back_depth, Vec2::new(window_max.x, window_min.y)),
        aperture.point(back_depth, window_max),
        aperture.point(back_depth, Vec2::new(window_min.x, window_max.y)),
    ];
    let center = aperture.point(back_depth, (window_min + window_max) * 0.5);
    let inward = center - origin;

    let mut sides = [Plane {
        normal: Vec3::ZERO,
        anchor: origin,
    }; 4];
    for (i, plane) in sides.iter_mut().enumerate() {
        let a = corners[i] - origin;
        let b = corners[(i + 1) % 4] - origin;
        let mut normal = a.cross(b);
        if normal.dot(inward) > 0.0 {
            normal = -normal;
        }
        plane.normal = normal;
    }

    let near = Plane {
        normal: aperture.depth_axis.unit().as_vec3() * -(dir as f32),
        anchor: aperture.point(front_depth, aperture.min),
    };

    Some(Cone {
        sides,
        near,
        dir,
        window_min,
        window_max,
        back_depth,
    })
}

pub struct FrustumCells<'a> {
    frustum: &'a ViewFrustum,
    max_depth: f32,
    min_y: i32,
    max_y: i32,
    next_layer: i32,
    bounds: Option<(i32, IVec2, IVec2)>,
    cursor: IVec2,
    done: bool,
}

impl Iterator for FrustumCells<'_> {
    type Item = IVec3;

    fn next(&mut self) -> Option<IVec3> {
        loop {
            if let Some((layer, lo, hi)) = self.bounds {
                if self.cursor.y <= hi.y {
                    let cell = self
                        .frustum
                        .aperture
                        .cell(layer, self.cursor.x, self.cursor.y);
                    self.cursor.x += 1;
                    if self.cursor.x > hi.x {
                        self.cursor.x = lo.x;
                        self.cursor.y += 1;
                    }
                    return Some(cell);
                }
                self.bounds = None;
            }

            if self.done {
                return None;
            }
            let cone = self.frustum.cone.as_ref()?;
            let layer = self.next_layer;
            self.next_layer += cone.dir;
            match self
                .frustum
                .layer_bounds(cone, layer, self.max_depth, self.min_y, self.max_y)
            {
                LayerBounds::Cells(lo, hi) => {
                    self.bounds = Some((layer, lo, hi));
                    self.cursor = lo;
                }
                LayerBounds::Empty => {}
                LayerBounds::Exhausted => self.done = true,
            }
        }
    }
}
