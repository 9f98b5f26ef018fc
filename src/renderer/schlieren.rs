//! Schlieren variant: terminated-ray handling that measures deflection.
//!
//! A schlieren render sends rays through a refracting medium and images
//! how far each ray lands from where it would have landed undeflected.
//! When a ray retires at the global boundary, its exit ray is projected
//! onto the image plane and compared with the plane point its pixel
//! originally aimed through; the distance becomes a grayscale pixel
//! contribution.

use crate::camera::CameraBasis;
use crate::comm::Pixel;
use crate::rays::{RayList, TermFlags};

/// Turn terminated rays into deflection measurements against the image
/// plane.
pub(crate) fn deflection_pixels(
    list: &RayList,
    terminated: &[usize],
    basis: &CameraBasis,
) -> Vec<Pixel> {
    let plane_w = -basis.center.dot(basis.dir);
    let mut out = Vec::with_capacity(terminated.len());

    for &i in terminated {
        // Only rays that made it out the far side carry a measurement
        if !list.term(i).contains(TermFlags::EXTERNAL_BOUNDARY) {
            continue;
        }

        let exit_point = list.origin(i) + list.dir(i) * list.t(i);
        let exit_dir = list.dir(i);

        let denom = exit_dir.dot(basis.dir);
        if denom.abs() < 1e-12 {
            // Exit ray runs parallel to the image plane
            continue;
        }
        let t = -(exit_point.dot(basis.dir) + plane_w) / denom;
        let landed = exit_point + exit_dir * t;

        // Where the pixel's pristine ray pierced the plane
        let (x, y) = list.pixel(i);
        let fx = (x as f32 - basis.off_x) / basis.pixel_scaling;
        let fy = (y as f32 - basis.off_y) / basis.pixel_scaling;
        let aimed = basis.center + basis.right * fx + basis.up * fy;

        let deflection = (landed - aimed).length();
        out.push(Pixel {
            x,
            y,
            r: deflection,
            g: deflection,
            b: deflection,
            o: 1.0,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use crate::rays::{RayListKind, RayType};
    use glam::Vec3;

    fn ortho_camera() -> Camera {
        Camera {
            eye: Vec3::new(0.0, 0.0, 3.0),
            view_dir: Vec3::new(0.0, 0.0, -1.0),
            view_up: Vec3::Y,
            aov: 0.0,
            width: 9,
            height: 9,
            annotation: String::new(),
        }
    }

    #[test]
    fn undeflected_ray_measures_zero() {
        let cam = ortho_camera();
        let basis = cam.basis();
        let (origin, dir) = Camera::ray_for_pixel(&basis, 4, 4);

        let mut l = RayList::new(1, 2, 3, 1, 1, RayListKind::Primary);
        l.set_origin(0, origin);
        l.set_dir(0, dir);
        l.set_pixel(0, 4, 4);
        l.set_t(0, 6.0);
        l.set_ray_type(0, RayType::Primary);
        l.set_term(0, TermFlags::EXTERNAL_BOUNDARY);

        let px = deflection_pixels(&l, &[0], &basis);
        assert_eq!(px.len(), 1);
        assert!(px[0].r.abs() < 1e-5);
    }

    #[test]
    fn sideways_shift_measures_its_magnitude() {
        let cam = ortho_camera();
        let basis = cam.basis();
        let (origin, dir) = Camera::ray_for_pixel(&basis, 4, 4);

        let mut l = RayList::new(1, 2, 3, 1, 1, RayListKind::Primary);
        // The medium displaced the ray 0.25 units along +x
        l.set_origin(0, origin + Vec3::new(0.25, 0.0, 0.0));
        l.set_dir(0, dir);
        l.set_pixel(0, 4, 4);
        l.set_t(0, 6.0);
        l.set_ray_type(0, RayType::Primary);
        l.set_term(0, TermFlags::EXTERNAL_BOUNDARY);

        let px = deflection_pixels(&l, &[0], &basis);
        assert_eq!(px.len(), 1);
        assert!((px[0].r - 0.25).abs() < 1e-5);
    }

    #[test]
    fn boundary_terminations_without_exit_are_skipped() {
        let cam = ortho_camera();
        let basis = cam.basis();
        let mut l = RayList::new(1, 2, 3, 1, 1, RayListKind::Primary);
        l.set_dir(0, Vec3::NEG_Z);
        l.set_term(0, TermFlags::OPAQUE);
        let px = deflection_pixels(&l, &[0], &basis);
        assert!(px.is_empty());
    }
}
