//! Two-deep pose history for smooth presentation between simulation ticks.
//!
//! A [`TemporalState`] keeps the pose as of the previous tick and the pose
//! being built by the current tick. Simulation code calls
//! [`TemporalState::snapshot`] once at the start of its tick and then mutates
//! the current pose; presentation code asks for
//! [`TemporalState::interpolate`] with the blend fraction reported by the
//! owning scheduler.
//!
//! Mutations only ever touch `current`. `previous` changes only through
//! `snapshot`.

use std::fmt::Debug;

use crate::math::{lerp_angle, Mat3, Mat4, Vec2, Vec3};

/// A value that can be blended between two simulation ticks.
pub trait Pose: Copy + Debug + PartialEq {
    type Matrix: Copy + Debug;

    fn identity() -> Self;

    /// Blends from `self` (previous) toward `target` (current).
    ///
    /// `alpha` is expected in `[0, 1]` and is not clamped here.
    fn blend(&self, target: &Self, alpha: f32) -> Self;

    fn to_matrix(&self) -> Self::Matrix;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose2D {
    pub position: Vec2,
    pub rotation: f32,
    pub scale: Vec2,
}

impl Default for Pose2D {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose for Pose2D {
    type Matrix = Mat3;

    fn identity() -> Self {
        Self {
            position: Vec2::ZERO,
            rotation: 0.0,
            scale: Vec2::ONE,
        }
    }

    fn blend(&self, target: &Self, alpha: f32) -> Self {
        Self {
            position: self.position.lerp(target.position, alpha),
            rotation: blend_rotation(self.rotation, target.rotation, alpha),
            scale: self.scale.lerp(target.scale, alpha),
        }
    }

    fn to_matrix(&self) -> Mat3 {
        Mat3::from_trs(self.position, self.rotation, self.scale)
    }
}

/// 3D pose with a single axis-angle rotation.
///
/// Only the angle is blended. The axis is taken from the current pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose3D {
    pub position: Vec3,
    pub axis: Vec3,
    pub rotation: f32,
    pub scale: Vec3,
}

impl Default for Pose3D {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose for Pose3D {
    type Matrix = Mat4;

    fn identity() -> Self {
        Self {
            position: Vec3::ZERO,
            axis: Vec3::Z,
            rotation: 0.0,
            scale: Vec3::ONE,
        }
    }

    fn blend(&self, target: &Self, alpha: f32) -> Self {
        Self {
            position: self.position.lerp(target.position, alpha),
            axis: target.axis,
            rotation: blend_rotation(self.rotation, target.rotation, alpha),
            scale: self.scale.lerp(target.scale, alpha),
        }
    }

    fn to_matrix(&self) -> Mat4 {
        Mat4::from_trs(self.position, self.axis, self.rotation, self.scale)
    }
}

fn blend_rotation(previous: f32, current: f32, alpha: f32) -> f32 {
    if alpha == 0.0 {
        return previous;
    }
    lerp_angle(previous, current, alpha)
}

#[derive(Debug, Clone)]
pub struct TemporalState<P: Pose> {
    previous: P,
    current: P,
    matrix: Option<P::Matrix>,
}

pub type Transform2D = TemporalState<Pose2D>;
pub type Transform3D = TemporalState<Pose3D>;

impl<P: Pose> Default for TemporalState<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Pose> TemporalState<P> {
    pub fn new() -> Self {
        Self::from_pose(P::identity())
    }

    /// Starts with `previous == current == pose`.
    pub fn from_pose(pose: P) -> Self {
        Self {
            previous: pose,
            current: pose,
            matrix: None,
        }
    }

    pub fn current(&self) -> &P {
        &self.current
    }

    pub fn previous(&self) -> &P {
        &self.previous
    }

    /// Copies `current` into `previous`. Safe to call any number of times.
    pub fn snapshot(&mut self) {
        self.previous = self.current;
    }

    pub fn interpolate(&self, alpha: f32) -> P {
        self.previous.blend(&self.current, alpha)
    }

    pub fn interpolated_matrix(&self, alpha: f32) -> P::Matrix {
        self.interpolate(alpha).to_matrix()
    }

    /// Matrix of the current pose, rebuilt only after a mutation.
    pub fn matrix(&mut self) -> P::Matrix {
        match self.matrix {
            Some(matrix) => matrix,
            None => {
                let matrix = self.current.to_matrix();
                self.matrix = Some(matrix);
                matrix
            }
        }
    }

    pub fn is_matrix_stale(&self) -> bool {
        self.matrix.is_none()
    }

    /// Applies an arbitrary edit to the current pose.
    pub fn mutate(&mut self, edit: impl FnOnce(&mut P)) {
        edit(&mut self.current);
        self.matrix = None;
    }

    pub fn set_current(&mut self, pose: P) {
        self.mutate(|current| *current = pose);
    }
}

impl TemporalState<Pose2D> {
    pub fn translate_by(&mut self, delta: Vec2) {
        self.mutate(|pose| pose.position = pose.position + delta);
    }

    pub fn rotate_by(&mut self, radians: f32) {
        self.mutate(|pose| pose.rotation += radians);
    }

    pub fn scale_by(&mut self, factor: Vec2) {
        self.mutate(|pose| pose.scale = pose.scale.component_mul(factor));
    }

    pub fn set_position(&mut self, position: Vec2) {
        self.mutate(|pose| pose.position = position);
    }

    pub fn set_rotation(&mut self, radians: f32) {
        self.mutate(|pose| pose.rotation = radians);
    }

    pub fn set_scale(&mut self, scale: Vec2) {
        self.mutate(|pose| pose.scale = scale);
    }

    pub fn transform_point(&mut self, point: Vec2) -> Vec2 {
        self.matrix().transform_point(point)
    }
}

impl TemporalState<Pose3D> {
    pub fn translate_by(&mut self, delta: Vec3) {
        self.mutate(|pose| pose.position = pose.position + delta);
    }

    pub fn rotate_by(&mut self, radians: f32) {
        self.mutate(|pose| pose.rotation += radians);
    }

    pub fn scale_by(&mut self, factor: Vec3) {
        self.mutate(|pose| pose.scale = pose.scale.component_mul(factor));
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.mutate(|pose| pose.position = position);
    }

    /// Stored normalized; a zero vector disables rotation.
    pub fn set_rotation_axis(&mut self, axis: Vec3) {
        self.mutate(|pose| pose.axis = axis.normalize_or_zero());
    }

    pub fn set_rotation(&mut self, radians: f32) {
        self.mutate(|pose| pose.rotation = radians);
    }

    pub fn set_scale(&mut self, scale: Vec3) {
        self.mutate(|pose| pose.scale = scale);
    }

    pub fn transform_point(&mut self, point: Vec3) -> Vec3 {
        self.matrix().transform_point(point)
    }
}
