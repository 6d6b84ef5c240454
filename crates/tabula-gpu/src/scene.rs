//! Geometry and shader text for the demo scene: one coloured triangle per worker.

pub const TRIANGLE_WGSL: &str = r#"
struct VSOut {
    @builtin(position) position: vec4<f32>,
    @location(0) color: vec3<f32>,
};

@vertex
fn vs_main(@location(0) in_pos: vec3<f32>, @location(1) in_color: vec3<f32>) -> VSOut {
    var out: VSOut;
    out.position = vec4<f32>(in_pos, 1.0);
    out.color = in_color;
    return out;
}

@fragment
fn fs_main(@location(0) in_color: vec3<f32>) -> @location(0) vec4<f32> {
    return vec4<f32>(in_color, 1.0);
}
"#;

pub const EMPTY_COMPUTE_WGSL: &str = "@compute @workgroup_size(64) fn main() {}";

pub const COLORS: [f32; 9] = [
    1.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, //
    0.0, 0.0, 1.0,
];

pub const INDICES: [u16; 3] = [0, 1, 2];

/// Dispatch size each benchmark dispatch records.
pub const WORKLOAD_DISPATCH: (u32, u32, u32) = (1, 2, 3);

/// A triangle centred horizontally on `center_x`.
pub fn triangle_positions(center_x: f32) -> [f32; 9] {
    [
        0.3 + center_x, -0.3, 0.0, //
        -0.3 + center_x, -0.3, 0.0, //
        center_x, 0.3, 0.0,
    ]
}

/// `bytes` zero-padded to a multiple of four.
pub fn padded(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.resize((bytes.len() + 3) & !3, 0);
    out
}
