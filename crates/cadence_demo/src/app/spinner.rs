use std::f32::consts::TAU;

use cadence::{Mat3, TickContext, Transform2D, Vec2, WorkError, WorkResult, WorkStatus};

const QUAD_HALF_SIZE_PX: f32 = 48.0;
const ORBIT_RADIUS_PX: f32 = 120.0;
const SPIN_RADIANS_PER_SECOND: f32 = TAU / 2.0;
const ORBIT_RADIANS_PER_SECOND: f32 = TAU / 6.0;
const QUAD_COLOR: [u8; 4] = [220, 220, 240, 255];

/// Simulation-side state for a quad that spins while orbiting the origin.
#[derive(Debug, Clone)]
pub(crate) struct Spinner {
    pub(crate) transform: Transform2D,
    orbit_phase: f32,
}

impl Spinner {
    pub(crate) fn new() -> Self {
        let mut transform = Transform2D::new();
        transform.set_position(Vec2::new(ORBIT_RADIUS_PX, 0.0));
        transform.snapshot();
        Self {
            transform,
            orbit_phase: 0.0,
        }
    }

    /// One simulation step. Always snapshots before mutating.
    pub(crate) fn tick(&mut self, ctx: &TickContext) -> WorkResult {
        let dt = ctx.dt_seconds();
        if !dt.is_finite() {
            return Err(WorkError::msg("non-finite tick interval"));
        }
        self.transform.snapshot();
        self.transform.rotate_by(SPIN_RADIANS_PER_SECOND * dt);
        self.orbit_phase = (self.orbit_phase + ORBIT_RADIANS_PER_SECOND * dt).rem_euclid(TAU);
        let (sin, cos) = self.orbit_phase.sin_cos();
        self.transform
            .set_position(Vec2::new(cos * ORBIT_RADIUS_PX, sin * ORBIT_RADIUS_PX));
        Ok(WorkStatus::Continue)
    }
}

/// Draws the spinner quad transformed by `model`, origin at the frame center.
/// Model space is in pixels with y pointing up.
pub(crate) fn draw_quad(frame: &mut [u8], width: u32, height: u32, model: &Mat3) {
    let corners = [
        Vec2::new(-QUAD_HALF_SIZE_PX, -QUAD_HALF_SIZE_PX),
        Vec2::new(QUAD_HALF_SIZE_PX, -QUAD_HALF_SIZE_PX),
        Vec2::new(QUAD_HALF_SIZE_PX, QUAD_HALF_SIZE_PX),
        Vec2::new(-QUAD_HALF_SIZE_PX, QUAD_HALF_SIZE_PX),
    ]
    .map(|corner| to_screen(model.transform_point(corner), width, height));
    fill_convex_quad(frame, width, height, &corners, QUAD_COLOR);
}

fn to_screen(point: Vec2, width: u32, height: u32) -> Vec2 {
    Vec2::new(width as f32 * 0.5 + point.x, height as f32 * 0.5 - point.y)
}

fn fill_convex_quad(
    frame: &mut [u8],
    width: u32,
    height: u32,
    corners: &[Vec2; 4],
    color: [u8; 4],
) {
    if width == 0 || height == 0 {
        return;
    }
    let min_x = corners.iter().map(|c| c.x).fold(f32::INFINITY, f32::min);
    let max_x = corners.iter().map(|c| c.x).fold(f32::NEG_INFINITY, f32::max);
    let min_y = corners.iter().map(|c| c.y).fold(f32::INFINITY, f32::min);
    let max_y = corners.iter().map(|c| c.y).fold(f32::NEG_INFINITY, f32::max);

    let x0 = min_x.floor().max(0.0) as u32;
    let y0 = min_y.floor().max(0.0) as u32;
    let x1 = (max_x.ceil().max(0.0) as u32).min(width);
    let y1 = (max_y.ceil().max(0.0) as u32).min(height);

    for y in y0..y1 {
        for x in x0..x1 {
            let sample = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
            if !contains(corners, sample) {
                continue;
            }
            let index = ((y * width + x) * 4) as usize;
            if let Some(pixel) = frame.get_mut(index..index + 4) {
                pixel.copy_from_slice(&color);
            }
        }
    }
}

/// Winding-independent inside test for a convex polygon.
fn contains(corners: &[Vec2; 4], point: Vec2) -> bool {
    let mut sign = 0.0_f32;
    for i in 0..corners.len() {
        let a = corners[i];
        let b = corners[(i + 1) % corners.len()];
        let edge = b - a;
        let to_point = point - a;
        let cross = edge.x * to_point.y - edge.y * to_point.x;
        if cross == 0.0 {
            continue;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn tick_ctx(tick: u64, hz: u64) -> TickContext {
        TickContext {
            tick,
            now: Instant::now(),
            interval: Duration::from_secs(1) / hz as u32,
        }
    }

    #[test]
    fn tick_snapshots_before_moving() {
        let mut spinner = Spinner::new();
        let before = *spinner.transform.current();
        spinner.tick(&tick_ctx(0, 60)).expect("tick");

        assert_eq!(*spinner.transform.previous(), before);
        assert!(spinner.transform.current().rotation > before.rotation);
    }

    #[test]
    fn orbit_stays_on_radius() {
        let mut spinner = Spinner::new();
        for tick in 0..90 {
            spinner.tick(&tick_ctx(tick, 60)).expect("tick");
        }
        let radius = spinner.transform.current().position.length();
        assert!((radius - ORBIT_RADIUS_PX).abs() < 0.01);
    }

    #[test]
    fn contains_accepts_either_winding() {
        let square = [
            Vec2::new(0.0, 0.0),
            Vec2::new(4.0, 0.0),
            Vec2::new(4.0, 4.0),
            Vec2::new(0.0, 4.0),
        ];
        let mut reversed = square;
        reversed.reverse();

        for corners in [square, reversed] {
            assert!(contains(&corners, Vec2::new(2.0, 2.0)));
            assert!(!contains(&corners, Vec2::new(5.0, 2.0)));
        }
    }

    #[test]
    fn draw_quad_fills_center_and_leaves_corners() {
        let (width, height) = (200, 200);
        let mut frame = vec![0u8; (width * height * 4) as usize];
        draw_quad(&mut frame, width, height, &Mat3::IDENTITY);

        let pixel = |x: u32, y: u32| {
            let index = ((y * width + x) * 4) as usize;
            [frame[index], frame[index + 1], frame[index + 2], frame[index + 3]]
        };
        assert_eq!(pixel(100, 100), QUAD_COLOR);
        assert_eq!(pixel(0, 0), [0, 0, 0, 0]);
        assert_eq!(pixel(199, 199), [0, 0, 0, 0]);
    }

    #[test]
    fn draw_quad_clips_offscreen_geometry() {
        let (width, height) = (32, 32);
        let mut frame = vec![0u8; (width * height * 4) as usize];
        let model = Mat3::from_trs(Vec2::new(1000.0, 1000.0), 0.3, Vec2::ONE);
        draw_quad(&mut frame, width, height, &model);
        assert!(frame.iter().all(|byte| *byte == 0));
    }
}
