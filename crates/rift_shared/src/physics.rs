use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct AABB {
    pub min: Vec3,
    pub max: Vec3,
}

impl AABB {
    pub fn from_center(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    /// Box spanning whole cells `lower..=upper`.
    pub fn from_cells(lower: IVec3, upper: IVec3) -> Self {
        Self {
            min: lower.min(upper).as_vec3(),
            max: (lower.max(upper) + IVec3::ONE).as_vec3(),
        }
    }

    pub fn expand(&self, amount: f32) -> Self {
        Self {
            min: self.min - Vec3::splat(amount),
            max: self.max + Vec3::splat(amount),
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn intersects(&self, other: &AABB) -> bool {
        self.min.x < other.max.x
            && self.max.x > other.min.x
            && self.min.y < other.max.y
            && self.max.y > other.min.y
            && self.min.z < other.max.z
            && self.max.z > other.min.z
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    pub fn between(from: Vec3, to: Vec3) -> (Self, f32) {
        let delta = to - from;
        let length = delta.length();
        let direction = if length > f32::EPSILON {
            delta / length
        } else {
            Vec3::ZERO
        };
        (
            Self {
                origin: from,
                direction,
            },
            length,
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Face {
    PosX,
    NegX,
    PosY,
    NegY,
    PosZ,
    NegZ,
}

impl Face {
    pub fn normal_ivec3(&self) -> IVec3 {
        match self {
            Face::PosX => IVec3::X,
            Face::NegX => IVec3::NEG_X,
            Face::PosY => IVec3::Y,
            Face::NegY => IVec3::NEG_Y,
            Face::PosZ => IVec3::Z,
            Face::NegZ => IVec3::NEG_Z,
        }
    }

    /// Face through which a ray stepping `step` along `axis` enters the next cell.
    fn entered(axis: usize, step: i32) -> Face {
        match (axis, step > 0) {
            (0, true) => Face::NegX,
            (0, false) => Face::PosX,
            (1, true) => Face::NegY,
            (1, false) => Face::PosY,
            (_, true) => Face::NegZ,
            (_, false) => Face::PosZ,
        }
    }
}

/// Amanatides-Woo traversal of the cells a ray passes through.
#[derive(Debug, Copy, Clone)]
pub struct RaycastIter {
    current: IVec3,
    step: IVec3,
    t_max: Vec3,
    t_delta: Vec3,
    max_distance: f32,
    started: bool,
    finished: bool,
    last_face: Face,
}

impl RaycastIter {
    fn new(ray: &Ray, max_distance: f32) -> Self {
        let origin = ray.origin.to_array();
        let direction = ray.direction.to_array();
        let current = ray.origin.floor().as_ivec3();
        let cell = current.to_array();

        let mut step = [0i32; 3];
        let mut t_max = [f32::INFINITY; 3];
        let mut t_delta = [f32::INFINITY; 3];
        for axis in 0..3 {
            let d = direction[axis];
            if d == 0.0 {
                continue;
            }
            step[axis] = if d > 0.0 { 1 } else { -1 };
            let boundary = if d > 0.0 {
                cell[axis] as f32 + 1.0
            } else {
                cell[axis] as f32
            };
            t_max[axis] = (boundary - origin[axis]) / d;
            t_delta[axis] = 1.0 / d.abs();
        }

        Self {
            current,
            step: IVec3::from_array(step),
            t_max: Vec3::from_array(t_max),
            t_delta: Vec3::from_array(t_delta),
            max_distance: max_distance.max(0.0),
            started: false,
            finished: false,
            last_face: Face::NegY,
        }
    }
}

impl Iterator for RaycastIter {
    type Item = (IVec3, Face);

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if !self.started {
            self.started = true;
            return Some((self.current, self.last_face));
        }

        let axis = if self.t_max.x <= self.t_max.y && self.t_max.x <= self.t_max.z {
            0
        } else if self.t_max.y <= self.t_max.z {
            1
        } else {
            2
        };
        let distance = self.t_max[axis];

        if !distance.is_finite() || distance > self.max_distance {
            self.finished = true;
            return None;
        }

        self.current[axis] += self.step[axis];
        self.t_max[axis] += self.t_delta[axis];
        self.last_face = Face::entered(axis, self.step[axis]);

        Some((self.current, self.last_face))
    }
}

pub fn raycast_blocks(ray: &Ray, max_distance: f32) -> impl Iterator<Item = (IVec3, Face)> {
    RaycastIter::new(ray, max_distance)
}
