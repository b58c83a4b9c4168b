//! WGSL compute-shader templates.
//!
//! Shader source is generated from the closed op registry: each enum op
//! contributes a fixed expression fragment, spliced into one of the
//! templates below. Because the registry is an enum, only a fixed set of
//! kernels can ever be generated — arbitrary host functions cannot reach
//! the GPU layer. The generated source text itself is the pipeline-cache
//! key, so each distinct kernel compiles once per device.
//!
//! Template selection: operands are uploaded contiguous, so a zip whose
//! shapes already match uses the *aligned* template and indexes the flat
//! buffers directly (unary maps always do); a broadcasting zip uses the
//! *broadcast* template, which decodes each output ordinal against packed
//! shape/stride metadata. That metadata is an array, and the WGSL
//! uniform address space imposes 16-byte array-element alignment, so it is
//! bound as a read-only storage buffer instead; scalar-only parameters
//! (element counts, dims) travel in uniform buffers.
//!
//! Reduction runs one 256-thread workgroup per output cell: threads stride
//! over the reduced axis, then a shared-memory tree fold halves the active
//! thread count each step, and thread 0 writes the cell — the host never
//! finishes a reduction. Matmul uses 16x16 tiles staged through workgroup
//! shared memory; each thread writes exactly one output element, and the
//! workgroup's `z` coordinate is decoded into per-operand batch offsets
//! (stride 0 for a broadcast batch).
//!
//! Everything computes in `f32`; hosts hold `f64` and must tolerate the
//! precision gap.

use super::{MapOp, ReduceOp, ZipOp};

/// Threads per workgroup for the elementwise templates.
pub const ELEMENTWISE_WORKGROUP: u32 = 64;
/// Threads per workgroup for the reduction template.
pub const REDUCE_WORKGROUP: u32 = 256;
/// Square tile edge for the matmul template.
pub const MATMUL_TILE: u32 = 16;

impl MapOp {
    /// WGSL expression computing the op from `x: f32`.
    pub(crate) fn wgsl_expr(self) -> &'static str {
        match self {
            MapOp::Id => "x",
            MapOp::Neg => "-x",
            MapOp::Inv => "1.0 / x",
            MapOp::Log => "log(x)",
            MapOp::Exp => "exp(x)",
            MapOp::Sigmoid => "1.0 / (1.0 + exp(-x))",
            MapOp::Relu => "max(x, 0.0)",
        }
    }
}

impl ZipOp {
    /// WGSL expression computing the op from `x: f32` and `y: f32`.
    pub(crate) fn wgsl_expr(self) -> &'static str {
        match self {
            ZipOp::Add => "x + y",
            ZipOp::Mul => "x * y",
            ZipOp::Lt => "select(0.0, 1.0, x < y)",
            ZipOp::Eq => "select(0.0, 1.0, x == y)",
            ZipOp::LogBack => "y / x",
            ZipOp::InvBack => "-y / (x * x)",
            ZipOp::ReluBack => "select(0.0, y, x > 0.0)",
            ZipOp::SigmoidBack => "x * (1.0 - x) * y",
        }
    }
}

impl ReduceOp {
    /// WGSL literal for the fold's starting value.
    pub(crate) fn wgsl_identity(self) -> &'static str {
        match self {
            ReduceOp::Sum => "0.0",
            ReduceOp::Prod => "1.0",
        }
    }

    /// WGSL expression folding `v: f32` into `acc: f32`.
    pub(crate) fn wgsl_combine(self) -> &'static str {
        match self {
            ReduceOp::Sum => "acc + v",
            ReduceOp::Prod => "acc * v",
        }
    }
}

/// Aligned unary map: one thread per element, flat indexing.
pub(crate) fn map_aligned(op: MapOp) -> String {
    format!(
        r#"struct Params {{
    n: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> input_a: array<f32>;
@group(0) @binding(2) var<storage, read_write> output: array<f32>;

@compute @workgroup_size({wg})
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.x;
    if (i >= params.n) {{
        return;
    }}
    let x = input_a[i];
    output[i] = {expr};
}}
"#,
        wg = ELEMENTWISE_WORKGROUP,
        expr = op.wgsl_expr(),
    )
}

/// Aligned binary zip: one thread per element, flat indexing.
pub(crate) fn zip_aligned(op: ZipOp) -> String {
    format!(
        r#"struct Params {{
    n: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> input_a: array<f32>;
@group(0) @binding(2) var<storage, read> input_b: array<f32>;
@group(0) @binding(3) var<storage, read_write> output: array<f32>;

@compute @workgroup_size({wg})
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.x;
    if (i >= params.n) {{
        return;
    }}
    let x = input_a[i];
    let y = input_b[i];
    output[i] = {expr};
}}
"#,
        wg = ELEMENTWISE_WORKGROUP,
        expr = op.wgsl_expr(),
    )
}

/// Broadcast binary zip: metadata is
/// `[out_shape | out_strides | a_strides | b_strides]`, each `ndim` long,
/// with 0 marking a broadcast input dimension.
pub(crate) fn zip_broadcast(op: ZipOp) -> String {
    format!(
        r#"struct Params {{
    n: u32,
    ndim: u32,
    pad0: u32,
    pad1: u32,
}}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> meta: array<u32>;
@group(0) @binding(2) var<storage, read> input_a: array<f32>;
@group(0) @binding(3) var<storage, read> input_b: array<f32>;
@group(0) @binding(4) var<storage, read_write> output: array<f32>;

@compute @workgroup_size({wg})
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.x;
    if (i >= params.n) {{
        return;
    }}
    var pos_a = 0u;
    var pos_b = 0u;
    for (var d = 0u; d < params.ndim; d = d + 1u) {{
        let idx = (i / meta[params.ndim + d]) % meta[d];
        pos_a = pos_a + idx * meta[2u * params.ndim + d];
        pos_b = pos_b + idx * meta[3u * params.ndim + d];
    }}
    let x = input_a[pos_a];
    let y = input_b[pos_b];
    output[i] = {expr};
}}
"#,
        wg = ELEMENTWISE_WORKGROUP,
        expr = op.wgsl_expr(),
    )
}

/// Axis reduction: one workgroup per output cell, shared-memory tree fold.
///
/// The input is addressed as `[outer, reduce, inner]` with the reduced axis
/// in the middle; `inner` is the input stride of the reduced axis.
pub(crate) fn reduce_workgroup(op: ReduceOp) -> String {
    format!(
        r#"const WORKGROUP_SIZE: u32 = {wg}u;

struct Params {{
    outer: u32,
    reduce_size: u32,
    inner: u32,
    n_out: u32,
}}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> input_a: array<f32>;
@group(0) @binding(2) var<storage, read_write> output: array<f32>;

var<workgroup> scratch: array<f32, {wg}>;

@compute @workgroup_size({wg})
fn main(
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {{
    let out_idx = wid.x;
    let outer_idx = out_idx / params.inner;
    let inner_idx = out_idx % params.inner;
    let base = outer_idx * params.reduce_size * params.inner + inner_idx;

    var acc = {identity};
    var j = lid.x;
    loop {{
        if (j >= params.reduce_size) {{
            break;
        }}
        let v = input_a[base + j * params.inner];
        acc = {combine};
        j = j + WORKGROUP_SIZE;
    }}
    scratch[lid.x] = acc;
    workgroupBarrier();

    var active = WORKGROUP_SIZE / 2u;
    loop {{
        if (active == 0u) {{
            break;
        }}
        if (lid.x < active) {{
            acc = scratch[lid.x];
            let v = scratch[lid.x + active];
            scratch[lid.x] = {combine};
        }}
        workgroupBarrier();
        active = active / 2u;
    }}

    if (lid.x == 0u) {{
        output[out_idx] = scratch[0u];
    }}
}}
"#,
        wg = REDUCE_WORKGROUP,
        identity = op.wgsl_identity(),
        combine = op.wgsl_combine(),
    )
}

/// Tiled batched matmul: `A[..., m, k] x B[..., k, n] -> [..., m, n]`.
///
/// Each workgroup computes one 16x16 output tile of one batch. Both
/// operands are staged tile-by-tile through workgroup shared memory with a
/// barrier between the load and the partial dot products, so global memory
/// is read once per tile. A batch stride of 0 broadcasts that operand over
/// the batch.
pub(crate) fn matmul_tiled() -> String {
    format!(
        r#"const TILE: u32 = {tile}u;

struct Params {{
    m: u32,
    k: u32,
    n: u32,
    batch: u32,
    a_batch_stride: u32,
    b_batch_stride: u32,
    pad0: u32,
    pad1: u32,
}}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> input_a: array<f32>;
@group(0) @binding(2) var<storage, read> input_b: array<f32>;
@group(0) @binding(3) var<storage, read_write> output: array<f32>;

var<workgroup> tile_a: array<array<f32, {tile}>, {tile}>;
var<workgroup> tile_b: array<array<f32, {tile}>, {tile}>;

@compute @workgroup_size({tile}, {tile}, 1)
fn main(
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {{
    let batch = wid.z;
    let row = wid.y * TILE + lid.y;
    let col = wid.x * TILE + lid.x;
    let a_base = batch * params.a_batch_stride;
    let b_base = batch * params.b_batch_stride;

    var acc = 0.0;
    let tiles = (params.k + TILE - 1u) / TILE;
    for (var t = 0u; t < tiles; t = t + 1u) {{
        let a_col = t * TILE + lid.x;
        if (row < params.m && a_col < params.k) {{
            tile_a[lid.y][lid.x] = input_a[a_base + row * params.k + a_col];
        }} else {{
            tile_a[lid.y][lid.x] = 0.0;
        }}
        let b_row = t * TILE + lid.y;
        if (b_row < params.k && col < params.n) {{
            tile_b[lid.y][lid.x] = input_b[b_base + b_row * params.n + col];
        }} else {{
            tile_b[lid.y][lid.x] = 0.0;
        }}
        workgroupBarrier();

        for (var kk = 0u; kk < TILE; kk = kk + 1u) {{
            acc = acc + tile_a[lid.y][kk] * tile_b[kk][lid.x];
        }}
        workgroupBarrier();
    }}

    if (row < params.m && col < params.n) {{
        output[batch * params.m * params.n + row * params.n + col] = acc;
    }}
}}
"#,
        tile = MATMUL_TILE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_generated_shader_has_a_main_entry() {
        let sources = [
            map_aligned(MapOp::Sigmoid),
            zip_aligned(ZipOp::Add),
            zip_broadcast(ZipOp::Mul),
            reduce_workgroup(ReduceOp::Sum),
            matmul_tiled(),
        ];
        for src in sources {
            assert!(src.contains("fn main"));
            assert!(src.len() < 65536);
        }
    }

    #[test]
    fn distinct_ops_generate_distinct_sources() {
        assert_ne!(zip_aligned(ZipOp::Add), zip_aligned(ZipOp::Mul));
        assert_ne!(
            reduce_workgroup(ReduceOp::Sum),
            reduce_workgroup(ReduceOp::Prod)
        );
    }
}
