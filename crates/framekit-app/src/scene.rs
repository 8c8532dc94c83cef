//! Scene data for the hello sample: one textured, rotating triangle.

use bytemuck::{Pod, Zeroable};
use framekit_gpu::FrameOutcome;
use glam::{Mat4, Vec3};

/// Vertex layout consumed by the triangle shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 4],
    pub uv: [f32; 2],
}

/// Equilateral triangle centred on the origin, wound clockwise.
pub const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [-0.5, -0.288, 0.0, 1.0],
        uv: [0.0, 0.0],
    },
    Vertex {
        position: [0.5, -0.288, 0.0, 1.0],
        uv: [1.0, 0.0],
    },
    Vertex {
        position: [0.0, 0.577, 0.0, 1.0],
        uv: [0.5, 1.0],
    },
];

/// Render pass clear colour.
pub const CLEAR_COLOR: [f32; 4] = [0.0, 0.70, 0.67, 1.0];

/// Side of the generated checkerboard texture, in pixels.
pub const TEXTURE_SIZE: u32 = 256;

/// Radians added to the rotation every frame.
pub const ROTATION_STEP: f32 = 0.02;

const CELL: u32 = 64;
const BRIGHT: [u8; 4] = [100, 80, 70, 255];
const DIM: [u8; 4] = [30, 24, 21, 255];

/// Whether texel `(x, y)` lies in a bright checkerboard cell.
pub fn is_bright_cell(x: u32, y: u32) -> bool {
    let period = CELL * 2;
    (x % period < CELL) == (y % period < CELL)
}

/// RGBA8 checkerboard of `width` x `height` texels.
///
/// Texels are stored column-major: texel `(x, y)` starts at byte
/// `(x * height + y) * 4`.
pub fn checkerboard(width: u32, height: u32) -> Vec<u8> {
    let mut pixels = vec![0_u8; width as usize * height as usize * 4];
    for x in 0..width {
        for y in 0..height {
            let start = (x as usize * height as usize + y as usize) * 4;
            let texel = if is_bright_cell(x, y) { BRIGHT } else { DIM };
            pixels[start..start + 4].copy_from_slice(&texel);
        }
    }
    pixels
}

/// Per-frame uniform block matching `FrameUniforms` in the vertex shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrameUniforms {
    pub mvp: [[f32; 4]; 4],
}

/// Orthographic projection that keeps the triangle undistorted.
///
/// The longer window side spans `[-aspect, aspect]`, the shorter `[-1, 1]`.
pub fn view_projection(width: u32, height: u32) -> Mat4 {
    let (long, short) = if width >= height {
        (width, height)
    } else {
        (height, width)
    };
    let aspect = long as f32 / short.max(1) as f32;
    Mat4::orthographic_rh_gl(-aspect, aspect, -1.0, 1.0, -1.0, 1.0)
}

/// Rotation state, advanced once per presented frame.
#[derive(Debug, Clone, Copy)]
pub struct Spinner {
    view_projection: Mat4,
    angle: f32,
}

impl Spinner {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            view_projection: view_projection(width, height),
            angle: 0.0,
        }
    }

    /// Current angle in radians.
    pub fn angle(&self) -> f32 {
        self.angle
    }

    /// Uniforms for the next frame. The angle only moves on [`Self::settle`].
    pub fn upcoming(&self) -> FrameUniforms {
        let mvp =
            self.view_projection * Mat4::from_axis_angle(Vec3::Z, self.angle + ROTATION_STEP);
        FrameUniforms {
            mvp: mvp.to_cols_array_2d(),
        }
    }

    /// Commit the upcoming angle if the frame reached the screen.
    pub fn settle(&mut self, outcome: &FrameOutcome) {
        if let FrameOutcome::Presented { .. } = outcome {
            self.angle += ROTATION_STEP;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec4;

    #[test]
    fn checkerboard_cells() {
        let pixels = checkerboard(TEXTURE_SIZE, TEXTURE_SIZE);
        assert_eq!(pixels.len(), 256 * 256 * 4);

        let texel = |x: usize, y: usize| {
            let start = (x * TEXTURE_SIZE as usize + y) * 4;
            [
                pixels[start],
                pixels[start + 1],
                pixels[start + 2],
                pixels[start + 3],
            ]
        };

        assert_eq!(texel(0, 0), BRIGHT);
        assert_eq!(texel(63, 63), BRIGHT);
        assert_eq!(texel(64, 0), DIM);
        assert_eq!(texel(0, 64), DIM);
        assert_eq!(texel(64, 64), BRIGHT);
        assert_eq!(texel(128, 0), BRIGHT);
        assert_eq!(texel(255, 128), DIM);
    }

    #[test]
    fn dim_cells_are_thirty_percent() {
        for (dim, bright) in DIM.iter().zip(BRIGHT).take(3) {
            assert_eq!(u32::from(*dim), u32::from(bright) * 3 / 10);
        }
    }

    const PRESENTED: FrameOutcome = FrameOutcome::Presented {
        slot: 0,
        image_index: 0,
        status: framekit_gpu::PresentStatus::Optimal,
    };

    #[test]
    fn spinner_advances_by_step() {
        let mut spinner = Spinner::new(800, 800);
        spinner.settle(&PRESENTED);
        spinner.settle(&PRESENTED);
        assert_relative_eq!(spinner.angle(), 2.0 * ROTATION_STEP);
    }

    #[test]
    fn skipped_frames_do_not_rotate() {
        let mut spinner = Spinner::new(800, 800);
        let before = spinner.upcoming().mvp;
        spinner.settle(&FrameOutcome::Skipped { slot: 0 });
        assert_relative_eq!(spinner.angle(), 0.0);
        assert_eq!(spinner.upcoming().mvp, before);

        spinner.settle(&PRESENTED);
        assert_relative_eq!(spinner.angle(), ROTATION_STEP);
    }

    #[test]
    fn square_window_rotates_without_scaling() {
        let spinner = Spinner::new(512, 512);
        let uniforms = spinner.upcoming();
        let mvp = Mat4::from_cols_array_2d(&uniforms.mvp);

        let p = mvp * Vec4::new(1.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(p.x, ROTATION_STEP.cos(), epsilon = 1e-6);
        assert_relative_eq!(p.y, ROTATION_STEP.sin(), epsilon = 1e-6);
        assert_relative_eq!(p.w, 1.0);
    }

    #[test]
    fn wide_window_squeezes_horizontally() {
        let vp = view_projection(1600, 800);
        let p = vp * Vec4::new(2.0, 1.0, 0.0, 1.0);
        assert_relative_eq!(p.x, 1.0, epsilon = 1e-6);
        assert_relative_eq!(p.y, 1.0, epsilon = 1e-6);

        // The aspect ratio is always long side over short side.
        let tall = view_projection(800, 1600);
        assert_relative_eq!(tall.x_axis.x, vp.x_axis.x);
    }

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 64);
    }
}
