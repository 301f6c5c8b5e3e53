use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock, Weak};

/// Camera parameters used for culling and level-of-detail decisions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraState {
    /// Camera position in world space.
    pub eye: Vec3,
    /// Point the camera is looking at.
    pub target: Vec3,
    /// Vertical field of view in radians.
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            eye: Vec3::new(0.0, 10.0, 10.0),
            target: Vec3::ZERO,
            fov: 60.0_f32.to_radians(),
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl CameraState {
    pub fn look_at(eye: Vec3, target: Vec3) -> Self {
        Self {
            eye,
            target,
            ..Self::default()
        }
    }

    /// Normalized view direction. Falls back to -Z when eye and target coincide.
    pub fn forward(&self) -> Vec3 {
        (self.target - self.eye).try_normalize().unwrap_or(Vec3::NEG_Z)
    }

    /// Half-angle of the cone enclosing the view frustum.
    pub fn half_cone_angle(&self) -> f32 {
        let half_v = self.fov * 0.5;
        let half_h = (half_v.tan() * self.aspect.max(1.0)).atan();
        half_v.max(half_h)
    }
}

/// Shared, caller-owned camera.
///
/// The owner moves the camera; models and the scheduler only read it through
/// a [`WeakCamera`], so dropping the last handle releases it.
#[derive(Debug, Clone, Default)]
pub struct CameraHandle(Arc<RwLock<CameraState>>);

impl CameraHandle {
    pub fn new(state: CameraState) -> Self {
        Self(Arc::new(RwLock::new(state)))
    }

    /// Snapshot of the current camera parameters.
    pub fn get(&self) -> CameraState {
        match self.0.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, state: CameraState) {
        match self.0.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    pub fn set_look_at(&self, eye: Vec3, target: Vec3) {
        let mut state = self.get();
        state.eye = eye;
        state.target = target;
        self.set(state);
    }

    pub fn downgrade(&self) -> WeakCamera {
        WeakCamera(Arc::downgrade(&self.0))
    }
}

/// Non-owning reference to a [`CameraHandle`].
#[derive(Debug, Clone, Default)]
pub struct WeakCamera(Weak<RwLock<CameraState>>);

impl WeakCamera {
    pub fn upgrade(&self) -> Option<CameraHandle> {
        self.0.upgrade().map(CameraHandle)
    }

    /// Current parameters, or `None` once the camera has been dropped.
    pub fn state(&self) -> Option<CameraState> {
        self.upgrade().map(|handle| handle.get())
    }
}
