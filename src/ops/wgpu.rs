//! GPU compute backend using WGPU.
//!
//! Executes the four kernel verbs as WGSL compute shaders. A [`GpuContext`]
//! bundles the device, its queue, and a pipeline cache keyed by shader
//! source text, so each generated kernel compiles exactly once per device.
//! Shader source is validated before compilation.
//!
//! Every call uploads its operands (converted to contiguous `f32` in
//! logical order), encodes one compute pass, and blocks on a staged
//! readback before returning — successive GPU calls never overlap, and the
//! caller sees a completed `f64` tensor. Kernel entry points return
//! `Option`: `None` reports any GPU-side failure, and the dispatch layer
//! falls back to the naive backend for that call. Shape validation happens
//! up front with the same panics as the CPU backends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use briny::prelude::*;
use wgpu::util::DeviceExt;

use super::{MapOp, ReduceOp, ZipOp, cpu::MatmulDims, shaders};
use crate::storage::{self, TensorData};

/// Basic wrapper for common GPU errors.
#[derive(Debug)]
pub enum GpuError {
    /// An error in requesting the adapter.
    Adapter(wgpu::RequestAdapterError),
    /// An error in requesting the GPU (device).
    Device(wgpu::RequestDeviceError),
    /// Generated shader source failed validation.
    Validation(ValidationError),
    /// The readback staging buffer could not be interpreted.
    Readback(&'static str),
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuError::Adapter(e) => write!(f, "adapter error: {e}"),
            GpuError::Device(e) => write!(f, "device error: {e}"),
            GpuError::Validation(_) => write!(f, "shader source failed validation"),
            GpuError::Readback(msg) => write!(f, "readback error: {msg}"),
        }
    }
}

impl std::error::Error for GpuError {}

impl From<ValidationError> for GpuError {
    fn from(e: ValidationError) -> Self {
        GpuError::Validation(e)
    }
}

/// Secure wrapper for generated WGSL source.
pub struct WgslSource<'a>(pub &'a str);

impl<'a> Validate for WgslSource<'a> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;

        if src.len() > 65536 {
            return Err(ValidationError);
        }

        if !src.contains("fn main") {
            return Err(ValidationError);
        }

        if src.contains("import") || src.contains("#include") {
            return Err(ValidationError);
        }

        let forbidden = ["asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }

        Ok(())
    }
}

/// Validates generated WGSL and compiles it into a shader module.
pub fn load_shader(
    device: &wgpu::Device,
    label: &str,
    source: &str,
) -> Result<wgpu::ShaderModule, GpuError> {
    WgslSource(source).validate()?;

    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
}

/// The GPU device, its queue, and the pipeline cache.
///
/// Owned by the runtime; created lazily on the first GPU kernel call and
/// dropped by `Runtime::shutdown`.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: Mutex<HashMap<String, Arc<wgpu::ComputePipeline>>>,
}

impl GpuContext {
    /// Selects the default adapter and creates a device and queue.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(GpuError::Adapter)?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: None,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(GpuError::Device)?;

        Ok(Self {
            device,
            queue,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    /// Fetches the compute pipeline for a shader source, compiling and
    /// caching it on first use. The source text is the cache key.
    fn pipeline(&self, label: &str, source: &str) -> Result<Arc<wgpu::ComputePipeline>, GpuError> {
        let mut cache = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pipeline) = cache.get(source) {
            return Ok(Arc::clone(pipeline));
        }

        let module = load_shader(&self.device, label, source)?;
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None,
                module: &module,
                entry_point: Some("main"),
                cache: None,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            });
        let pipeline = Arc::new(pipeline);
        cache.insert(source.to_string(), Arc::clone(&pipeline));
        Ok(pipeline)
    }

    fn uniform_buffer(&self, label: &str, words: &[u32]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: as_bytes(words),
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    fn storage_buffer_u32(&self, label: &str, words: &[u32]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: as_bytes(words),
                usage: wgpu::BufferUsages::STORAGE,
            })
    }

    fn storage_buffer_f32(&self, label: &str, data: &[f32]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: as_bytes(data),
                usage: wgpu::BufferUsages::STORAGE,
            })
    }

    /// Binds the buffers in order, encodes one compute pass over
    /// `workgroups`, and reads `out_len` floats back from `output`.
    fn run(
        &self,
        label: &str,
        source: &str,
        buffers: &[&wgpu::Buffer],
        output: &wgpu::Buffer,
        workgroups: (u32, u32, u32),
        out_len: usize,
    ) -> Result<Vec<f32>, GpuError> {
        let pipeline = self.pipeline(label, source)?;
        let layout = pipeline.get_bind_group_layout(0);
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, buffer)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &layout,
            entries: &entries,
        });

        let byte_len = (out_len * 4) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: byte_len,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups.0, workgroups.1, workgroups.2);
        }
        encoder.copy_buffer_to_buffer(output, 0, &staging, 0, byte_len);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        slice.map_async(wgpu::MapMode::Read, |result| {
            assert!(result.is_ok());
        });
        let _ = self.device.poll(wgpu::PollType::Wait);

        let view = slice.get_mapped_range();
        let out = bytes_to_f32_slice(&view)
            .map_err(GpuError::Readback)?
            .to_vec();
        drop(view);
        staging.unmap();

        Ok(out)
    }

    fn output_buffer(&self, label: &str, len: usize) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (len.max(1) * 4) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }
}

fn as_bytes<T: Copy>(data: &[T]) -> &[u8] {
    let len = std::mem::size_of_val(data);
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, len) }
}

fn bytes_to_f32_slice(data: &[u8]) -> Result<&[f32], &'static str> {
    use std::mem::{align_of, size_of};

    if data.as_ptr() as usize % align_of::<f32>() != 0 {
        return Err("unaligned buffer");
    }

    if data.len() % size_of::<f32>() != 0 {
        return Err("buffer length is not a multiple of f32");
    }

    let len = data.len() / size_of::<f32>();
    let f32_data = data.as_ptr() as *const f32;
    unsafe { Ok(std::slice::from_raw_parts(f32_data, len)) }
}

fn to_f32(t: &TensorData) -> Vec<f32> {
    t.to_vec().into_iter().map(|v| v as f32).collect()
}

fn to_f64_tensor(shape: Vec<usize>, data: Vec<f32>) -> TensorData {
    TensorData::new(shape, data.into_iter().map(f64::from).collect())
}

/// Right-aligned broadcast strides of `shape` against `out_shape`, with 0
/// marking broadcast dimensions. The uploaded operands are contiguous, so
/// canonical strides apply.
fn broadcast_strides_u32(shape: &[usize], out_shape: &[usize]) -> Vec<u32> {
    let offset = out_shape.len() - shape.len();
    let strides = storage::contiguous_strides(shape);
    let mut out = vec![0u32; out_shape.len()];
    for d in 0..shape.len() {
        out[offset + d] = if shape[d] == 1 { 0 } else { strides[d] as u32 };
    }
    out
}

fn elementwise_groups(n: usize) -> (u32, u32, u32) {
    ((n as u32).div_ceil(shaders::ELEMENTWISE_WORKGROUP), 1, 1)
}

/// Unary map on the GPU. `None` reports failure; the dispatch layer then
/// runs the naive kernel.
pub fn map(gpu: &GpuContext, op: MapOp, a: &TensorData) -> Option<TensorData> {
    let out_shape = a.shape().to_vec();
    let n = a.size();
    let a_host = to_f32(a);

    // After the contiguous upload the operand always matches the output
    // shape, so the aligned template applies.
    let source = shaders::map_aligned(op);
    let params = gpu.uniform_buffer("map_params", &[n as u32, 0, 0, 0]);
    let a_buf = gpu.storage_buffer_f32("map_a", &a_host);
    let out_buf = gpu.output_buffer("map_out", n);

    let out = gpu
        .run(
            "map",
            &source,
            &[&params, &a_buf, &out_buf],
            &out_buf,
            elementwise_groups(n),
            n,
        )
        .ok()?;
    Some(to_f64_tensor(out_shape, out))
}

/// Binary zip on the GPU, choosing the aligned or broadcast template per
/// call.
pub fn zip(gpu: &GpuContext, op: ZipOp, a: &TensorData, b: &TensorData) -> Option<TensorData> {
    let out_shape = storage::shape_broadcast(a.shape(), b.shape());
    let n: usize = out_shape.iter().product();
    let a_host = to_f32(a);
    let b_host = to_f32(b);
    let a_buf = gpu.storage_buffer_f32("zip_a", &a_host);
    let b_buf = gpu.storage_buffer_f32("zip_b", &b_host);
    let out_buf = gpu.output_buffer("zip_out", n);

    let out = if a.shape() == b.shape() {
        let source = shaders::zip_aligned(op);
        let params = gpu.uniform_buffer("zip_params", &[n as u32, 0, 0, 0]);
        gpu.run(
            "zip",
            &source,
            &[&params, &a_buf, &b_buf, &out_buf],
            &out_buf,
            elementwise_groups(n),
            n,
        )
        .ok()?
    } else {
        let ndim = out_shape.len();
        let mut meta: Vec<u32> = Vec::with_capacity(4 * ndim);
        meta.extend(out_shape.iter().map(|&d| d as u32));
        meta.extend(
            storage::contiguous_strides(&out_shape)
                .iter()
                .map(|&s| s as u32),
        );
        meta.extend(broadcast_strides_u32(a.shape(), &out_shape));
        meta.extend(broadcast_strides_u32(b.shape(), &out_shape));

        let source = shaders::zip_broadcast(op);
        let params = gpu.uniform_buffer("zip_params", &[n as u32, ndim as u32, 0, 0]);
        let meta_buf = gpu.storage_buffer_u32("zip_meta", &meta);
        gpu.run(
            "zip_broadcast",
            &source,
            &[&params, &meta_buf, &a_buf, &b_buf, &out_buf],
            &out_buf,
            elementwise_groups(n),
            n,
        )
        .ok()?
    };
    Some(to_f64_tensor(out_shape, out))
}

/// Axis reduction on the GPU: one workgroup fully folds one output cell.
pub fn reduce(gpu: &GpuContext, op: ReduceOp, a: &TensorData, dim: usize) -> Option<TensorData> {
    assert!(
        dim < a.dims(),
        "reduce dimension {dim} out of range for shape {:?}",
        a.shape()
    );
    let mut out_shape = a.shape().to_vec();
    out_shape[dim] = 1;
    let n_out: usize = out_shape.iter().product();
    let reduce_size = a.shape()[dim];
    // The upload is contiguous, so the input decomposes as
    // [outer, reduce, inner] around the reduced axis.
    let inner: usize = a.shape()[dim + 1..].iter().product();
    let outer: usize = a.shape()[..dim].iter().product();
    if n_out > 65535 {
        // One workgroup per output cell; past the per-dimension dispatch
        // limit the naive backend takes over.
        return None;
    }

    let a_host = to_f32(a);
    let source = shaders::reduce_workgroup(op);
    let params = gpu.uniform_buffer(
        "reduce_params",
        &[outer as u32, reduce_size as u32, inner as u32, n_out as u32],
    );
    let a_buf = gpu.storage_buffer_f32("reduce_a", &a_host);
    let out_buf = gpu.output_buffer("reduce_out", n_out);

    let out = gpu
        .run(
            "reduce",
            &source,
            &[&params, &a_buf, &out_buf],
            &out_buf,
            (n_out as u32, 1, 1),
            n_out,
        )
        .ok()?;
    Some(to_f64_tensor(out_shape, out))
}

/// Batched tiled matmul on the GPU.
pub fn matmul(gpu: &GpuContext, a: &TensorData, b: &TensorData) -> Option<TensorData> {
    let dims = MatmulDims::of(a, b);
    let (m, k, n, batch) = (dims.m, dims.k, dims.n, dims.batch);
    let out_len = batch * m * n;

    let a_host = to_f32(a);
    let b_host = to_f32(b);
    // Contiguous uploads: a broadcast batch has stride 0, a real batch
    // strides by one matrix.
    let a_batch_stride = if a.dims() == 3 && a.shape()[0] > 1 { m * k } else { 0 };
    let b_batch_stride = if b.dims() == 3 && b.shape()[0] > 1 { k * n } else { 0 };

    let source = shaders::matmul_tiled();
    let params = gpu.uniform_buffer(
        "matmul_params",
        &[
            m as u32,
            k as u32,
            n as u32,
            batch as u32,
            a_batch_stride as u32,
            b_batch_stride as u32,
            0,
            0,
        ],
    );
    let a_buf = gpu.storage_buffer_f32("matmul_a", &a_host);
    let b_buf = gpu.storage_buffer_f32("matmul_b", &b_host);
    let out_buf = gpu.output_buffer("matmul_out", out_len);

    let groups = (
        (n as u32).div_ceil(shaders::MATMUL_TILE),
        (m as u32).div_ceil(shaders::MATMUL_TILE),
        batch as u32,
    );
    let out = gpu
        .run(
            "matmul",
            &source,
            &[&params, &a_buf, &b_buf, &out_buf],
            &out_buf,
            groups,
            out_len,
        )
        .ok()?;
    Some(to_f64_tensor(dims.out_shape, out))
}
