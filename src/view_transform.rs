// View and projection composition for the splat compositor.
//
// The host scene graph is in millimeters with an OpenGL-style camera basis
// (+y up, camera looks down -z); splat data and the sorting thread use the
// Colmap convention (+y down, camera looks down +z). The flip between the
// two lives in exactly one place, AXIS_CONVENTION, so no other component
// needs to know about it.

use glam::{Mat4, Vec2, Vec3, Vec4};

/// Scene millimeters to view meters.
pub const MM_TO_M: f32 = 1.0e-3;

/// Camera-local basis flip from the OpenGL convention to Colmap: negates the
/// camera's y and z axes. Right-multiplied onto the camera-to-world matrix.
pub const AXIS_CONVENTION: Mat4 = Mat4::from_cols(
    Vec4::new(1.0, 0.0, 0.0, 0.0),
    Vec4::new(0.0, -1.0, 0.0, 0.0),
    Vec4::new(0.0, 0.0, -1.0, 0.0),
    Vec4::new(0.0, 0.0, 0.0, 1.0),
);

/// Camera-to-ground transform in meters and Colmap basis: camera pose taken
/// relative to the ground plane, translation scaled mm→m, the floor offset
/// added on y, then the axis convention applied.
fn camera_to_ground_m(camera_world: Mat4, ground_world: Mat4, floor_offset: f32) -> Mat4 {
    let mut cam = ground_world.inverse() * camera_world;
    cam.w_axis.x *= MM_TO_M;
    cam.w_axis.y = cam.w_axis.y * MM_TO_M + floor_offset * MM_TO_M;
    cam.w_axis.z *= MM_TO_M;
    cam * AXIS_CONVENTION
}

/// View matrix fed to the renderer and (as view-projection) to the sorting
/// thread. Maps ground-space meters to Colmap camera space; splat positions
/// reach ground-space meters by the `scale_factor` uniform in the shader.
pub fn compose_view(camera_world: Mat4, ground_world: Mat4, floor_offset: f32) -> Mat4 {
    camera_to_ground_m(camera_world, ground_world, floor_offset).inverse()
}

/// Perspective projection matching the Colmap camera basis: +z forward,
/// y row negated so +y-down camera space lands upright in NDC. Depth range
/// 0..1. `near`/`far` are in millimeters like every other host input.
pub fn compose_projection(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    let mut proj = Mat4::perspective_lh(fov_y, aspect, near * MM_TO_M, far * MM_TO_M);
    proj.y_axis.y = -proj.y_axis.y;
    proj
}

/// Pixel focal lengths for the covariance projection Jacobian.
pub fn focal_lengths(fov_y: f32, viewport: Vec2) -> Vec2 {
    let fy = 0.5 * viewport.y / (fov_y * 0.5).tan();
    Vec2::new(fy, fy)
}

/// Inverse of the pick-pass encoding: given the cursor position in 0..1
/// screen coordinates (v down from the top), the camera-space depth read
/// back from the pick target, and the same host inputs the view was composed
/// from, reconstructs the hit position in scene millimeters.
pub fn unproject_pick(
    uv: Vec2,
    depth_m: f32,
    camera_world: Mat4,
    ground_world: Mat4,
    floor_offset: f32,
    fov_y: f32,
    aspect: f32,
) -> Vec3 {
    let tan_half = (fov_y * 0.5).tan();
    let point_cam = Vec3::new(
        (2.0 * uv.x - 1.0) * tan_half * aspect * depth_m,
        (2.0 * uv.y - 1.0) * tan_half * depth_m,
        depth_m,
    );
    let cam = camera_to_ground_m(camera_world, ground_world, floor_offset);
    let mut ground_m = cam.transform_point3(point_cam);
    ground_m.y -= floor_offset * MM_TO_M;
    ground_world.transform_point3(ground_m / MM_TO_M)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gl_forward_becomes_positive_view_depth() {
        let view = compose_view(Mat4::IDENTITY, Mat4::IDENTITY, 0.0);
        // A point 5 m in front of a GL camera sits at -z in scene meters,
        // i.e. -5000 mm scaled by the shader's scale factor.
        let p = view.transform_point3(Vec3::new(0.0, 0.0, -5.0));
        assert!((p.z - 5.0).abs() < 1e-4);
        assert!(p.x.abs() < 1e-4 && p.y.abs() < 1e-4);
    }

    #[test]
    fn floor_offset_and_scale_are_applied_once() {
        let camera = Mat4::from_translation(Vec3::new(0.0, 1600.0, 0.0));
        let view = compose_view(camera, Mat4::IDENTITY, 250.0);
        // Camera sits at y = 1.6 m + 0.25 m in ground meters; the origin is
        // therefore 1.85 m below it, which is +y in Colmap camera space.
        let p = view.transform_point3(Vec3::ZERO);
        assert!((p.y - 1.85).abs() < 1e-4, "got {p:?}");
    }

    #[test]
    fn projection_flips_y_and_keeps_z_forward() {
        let proj = compose_projection(std::f32::consts::FRAC_PI_2, 1.0, 100.0, 100_000.0);
        let clip = proj * Vec4::new(0.0, 1.0, 2.0, 1.0);
        // +y (down) in camera space lands in the lower half of NDC.
        assert!(clip.y / clip.w < 0.0);
        assert!(clip.w > 0.0);
    }

    #[test]
    fn unproject_inverts_the_projection_at_the_picked_pixel() {
        let fov_y = 1.0;
        let aspect = 16.0 / 9.0;
        let camera = Mat4::from_rotation_y(0.4) * Mat4::from_translation(Vec3::new(300.0, 1500.0, -200.0));
        let ground = Mat4::from_translation(Vec3::new(50.0, 0.0, 75.0));
        let floor_offset = 120.0;
        let scene_point = Vec3::new(400.0, 900.0, -3000.0);

        // Forward path: scene mm -> ground m -> camera space -> screen uv.
        let view = compose_view(camera, ground, floor_offset);
        let mut ground_m = ground.inverse().transform_point3(scene_point) * MM_TO_M;
        ground_m.y += floor_offset * MM_TO_M;
        let cam_space = view.transform_point3(ground_m);
        assert!(cam_space.z > 0.0, "test point must be in front of the camera");
        let tan_half = (fov_y * 0.5_f32).tan();
        let uv = Vec2::new(
            0.5 * (cam_space.x / (cam_space.z * tan_half * aspect) + 1.0),
            0.5 * (cam_space.y / (cam_space.z * tan_half) + 1.0),
        );

        let reconstructed =
            unproject_pick(uv, cam_space.z, camera, ground, floor_offset, fov_y, aspect);
        assert!(
            (reconstructed - scene_point).length() < 0.5,
            "reconstructed {reconstructed:?} vs {scene_point:?}"
        );
    }
}
