// gpu/engine.rs — the consistency check engine.
//
// Owns the compiled kernel, the four device buffers, and the parameter
// uniform; exposes resize / set_tolerance / execute. One engine issues all
// of its commands into the queue of the `GpuDevice` it is handed; different
// engines are entirely independent as long as they do not share a context's
// buffers (they cannot — buffers are owned here and never shared).
//
// STATE MACHINE
// ──────────────
//   no buffers ──resize──▶ buffers + bound args ──resize──▶ (new generation)
//
//   resize is idempotent for unchanged geometry. A geometry change drops
//   the previous buffer generation while the replacement is allocated; the
//   first allocation failure aborts the remaining steps WITHOUT rolling
//   back the buffers that already succeeded. The resulting partial set is
//   observable through the allocation report in the error and through the
//   allocation counter. Tolerance updates are orthogonal: in runtime mode
//   they rewrite argument 0 in place, in macro mode they are rejected (the
//   value is compiled into the program).
//
// SYNCHRONIZATION
// ────────────────
//   Input uploads are staged writes and the kernel launch is asynchronous;
//   the single `poll(Wait)` before the output maps are consumed is the
//   engine's sole blocking point per execute call. There is no cancellation
//   or timeout: once enqueued, device work either completes or blocks the
//   read-back indefinitely.

use std::sync::mpsc;

use log::{debug, warn};

use crate::check;
use crate::check::DEFAULT_INVALID_DISPARITY;
use crate::error::{AllocationReport, Error};
use crate::gpu::device::GpuDevice;
use crate::gpu::program::{
    BuildOptions, CompiledKernel, KernelSource, MacroConstants, DEFAULT_ENTRY_POINT,
};
use crate::image::DisparityImage;

/// Default 1-D workgroup size: a multiple of every common subgroup width.
pub const DEFAULT_WORKGROUP_SIZE: u32 = 64;

/// How tolerance, width, and element count reach the kernel. Fixed at
/// engine construction; the two variants select different argument layouts,
/// never a runtime string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// Scalars live in a parameter uniform at binding 0, ahead of the four
    /// buffers. Tolerance can be rewritten in place.
    RuntimeParams,
    /// Scalars are compiled into the kernel source; only the four buffers
    /// are bound. Changing tolerance requires a new engine; changing
    /// geometry triggers a fresh compile.
    CompiledConstants,
}

/// Engine construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub mode: BindMode,
    pub tolerance: u16,
    pub invalid_value: u16,
    pub workgroup_size: u32,
}

impl EngineConfig {
    pub fn runtime(tolerance: u16) -> Self {
        EngineConfig {
            mode: BindMode::RuntimeParams,
            tolerance,
            invalid_value: DEFAULT_INVALID_DISPARITY,
            workgroup_size: DEFAULT_WORKGROUP_SIZE,
        }
    }

    pub fn compiled(tolerance: u16) -> Self {
        EngineConfig {
            mode: BindMode::CompiledConstants,
            ..Self::runtime(tolerance)
        }
    }
}

/// Parameter uniform layout; must match the `Params` struct the runtime
/// mode template declares. Padded to 16 bytes.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct CheckParams {
    tol: u32,
    width: u32,
    elems: u32,
    _pad: u32,
}

/// One generation of the four working buffers. Slots fill left to right
/// during reallocation; a partially filled set is the observable result of
/// an aborted resize.
struct BufferSet {
    left_in: Option<wgpu::Buffer>,
    right_in: Option<wgpu::Buffer>,
    left_out: Option<wgpu::Buffer>,
    right_out: Option<wgpu::Buffer>,
    /// Payload size in bytes: exactly `2 * width * height`. The device
    /// allocation is padded up to copy alignment; this is the logical size
    /// the geometry invariant is stated over.
    logical_bytes: u64,
}

impl BufferSet {
    fn empty() -> Self {
        BufferSet {
            left_in: None,
            right_in: None,
            left_out: None,
            right_out: None,
            logical_bytes: 0,
        }
    }

    fn from_slots(slots: [Option<wgpu::Buffer>; 4], logical_bytes: u64) -> Self {
        let [left_in, right_in, left_out, right_out] = slots;
        BufferSet {
            left_in,
            right_in,
            left_out,
            right_out,
            logical_bytes,
        }
    }

    fn report(&self) -> AllocationReport {
        AllocationReport {
            left_in: self.left_in.is_some(),
            right_in: self.right_in.is_some(),
            left_out: self.left_out.is_some(),
            right_out: self.right_out.is_some(),
        }
    }

    fn complete(&self) -> Option<[&wgpu::Buffer; 4]> {
        Some([
            self.left_in.as_ref()?,
            self.right_in.as_ref()?,
            self.left_out.as_ref()?,
            self.right_out.as_ref()?,
        ])
    }
}

/// Byte size of each working buffer for a geometry: one u16 per pixel.
/// Computed in u64 so the maximum 16-bit geometry cannot wrap.
pub fn buffer_bytes(width: u16, height: u16) -> u64 {
    2 * u64::from(width) * u64::from(height)
}

/// Total work-item count for a launch: `items` rounded up to the next
/// multiple of the workgroup size, so the dispatch conforms to workgroup
/// divisibility rules. The kernel guards the tail items. Returned as u64:
/// rounding up near-maximal item counts can exceed u32.
pub fn global_work_size(items: u32, workgroup_size: u32) -> u64 {
    let wg = u64::from(workgroup_size.max(1));
    let items = u64::from(items);
    (items + wg - 1) / wg * wg
}

/// Shape a workgroup count into a dispatch that respects the per-dimension
/// limit: all groups in x when they fit, otherwise a full x row repeated
/// over y (the kernel recovers the flat index from the launch shape and
/// guards the overshoot). `None` when even two dimensions cannot hold the
/// launch.
fn dispatch_extent(groups: u64, max_per_dim: u32) -> Option<(u32, u32)> {
    let max = u64::from(max_per_dim);
    let x = groups.min(max).max(1);
    let y = (groups + x - 1) / x;
    if y > max {
        return None;
    }
    Some((x as u32, y as u32))
}

/// Round `value` up to the next multiple of `alignment`.
fn align_to(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

const INPUT_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_DST);
// Outputs are cleared before each launch (clear_buffer needs COPY_DST) and
// copied out afterwards.
const OUTPUT_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

/// GPU consistency check engine. See the module docs for the state machine
/// and synchronization contract.
pub struct GpuConsistencyCheck {
    kernel: CompiledKernel,
    mode: BindMode,
    tolerance: u16,
    invalid_value: u16,
    width: u16,
    height: u16,
    buffers: BufferSet,
    /// Parameter uniform, argument 0 in runtime mode. Absent in macro mode.
    params: Option<wgpu::Buffer>,
    bind_group: Option<wgpu::BindGroup>,
    /// Device buffer allocation probe; every create_buffer for the four
    /// working buffers increments it. Lets tests observe resize idempotence.
    allocations: u64,
}

impl GpuConsistencyCheck {
    /// Build the kernel for `config` and allocate buffers for the initial
    /// geometry. Construct with a zero geometry to defer allocation to the
    /// first `execute`.
    pub fn new(
        gpu: &GpuDevice,
        source: KernelSource,
        config: EngineConfig,
        width: u16,
        height: u16,
    ) -> Result<Self, Error> {
        let workgroup_size = sanitize_workgroup(config.workgroup_size);
        let options = match config.mode {
            BindMode::RuntimeParams => BuildOptions::new(config.invalid_value),
            BindMode::CompiledConstants => BuildOptions::with_macros(
                config.invalid_value,
                config.tolerance,
                width,
                height,
            ),
        };
        let kernel =
            CompiledKernel::build(gpu, source, options, DEFAULT_ENTRY_POINT, workgroup_size)?;

        let params = match config.mode {
            BindMode::RuntimeParams => Some(gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("check params"),
                size: std::mem::size_of::<CheckParams>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })),
            BindMode::CompiledConstants => None,
        };

        let mut engine = GpuConsistencyCheck {
            kernel,
            mode: config.mode,
            tolerance: config.tolerance,
            invalid_value: config.invalid_value,
            width: 0,
            height: 0,
            buffers: BufferSet::empty(),
            params,
            bind_group: None,
            allocations: 0,
        };
        engine.resize(gpu, width, height)?;
        Ok(engine)
    }

    // --- Accessors ---

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn tolerance(&self) -> u16 {
        self.tolerance
    }

    pub fn mode(&self) -> BindMode {
        self.mode
    }

    pub fn workgroup_size(&self) -> u32 {
        self.kernel.workgroup_size()
    }

    /// Logical byte size of each working buffer (`2 * width * height`).
    pub fn logical_buffer_bytes(&self) -> u64 {
        self.buffers.logical_bytes
    }

    /// Total working-buffer allocations performed so far.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    // --- Operations ---

    /// (Re-)allocate the four working buffers for a new geometry and rebind
    /// the kernel arguments. No-op when the geometry is unchanged.
    ///
    /// On failure `width()`/`height()` keep their previous values but the
    /// buffer set may be partially replaced — weak atomicity, see the
    /// module docs and [`AllocationReport`].
    pub fn resize(&mut self, gpu: &GpuDevice, width: u16, height: u16) -> Result<(), Error> {
        if width == self.width && height == self.height {
            return Ok(());
        }
        let logical = buffer_bytes(width, height);
        let padded = align_to(logical, wgpu::COPY_BUFFER_ALIGNMENT);
        debug!(
            "resize {}x{} -> {width}x{height} ({logical} bytes per buffer)",
            self.width, self.height
        );

        // The previous generation is released as the new one replaces it.
        self.bind_group = None;
        let mut slots: [Option<wgpu::Buffer>; 4] = [None, None, None, None];
        if logical > 0 {
            let labels = ["left_in", "right_in", "left_out", "right_out"];
            for (i, label) in labels.into_iter().enumerate() {
                let usage = if i < 2 { INPUT_USAGE } else { OUTPUT_USAGE };
                match self.allocate(gpu, label, padded, usage) {
                    Ok(buffer) => slots[i] = Some(buffer),
                    Err(log) => {
                        // Keep what succeeded; the caller sees exactly which
                        // slots were replaced.
                        let partial = BufferSet::from_slots(slots, logical);
                        let report = partial.report();
                        self.buffers = partial;
                        return Err(Error::Allocation {
                            device: gpu.adapter_info.name.clone(),
                            report,
                            log,
                        });
                    }
                }
            }
        }

        // Macro mode bakes the geometry into the program: a geometry change
        // is a fresh compile, never an in-place patch.
        if self.mode == BindMode::CompiledConstants {
            let baked = MacroConstants {
                tolerance: self.tolerance,
                width,
                height,
            };
            if self.kernel.options().macros != Some(baked) {
                let options =
                    BuildOptions::with_macros(self.invalid_value, self.tolerance, width, height);
                self.kernel = self.kernel.rebuild(gpu, options, self.kernel.workgroup_size())?;
            }
        }

        self.buffers = BufferSet::from_slots(slots, logical);
        self.rebind(gpu, width, height)?;
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Update the comparison tolerance. No-op if unchanged.
    ///
    /// Runtime mode rewrites the parameter uniform (argument 0) in place;
    /// buffers and the other bindings are untouched. Macro mode fails with
    /// [`Error::ToleranceIsCompiled`] — the value is part of the program.
    pub fn set_tolerance(&mut self, gpu: &GpuDevice, tolerance: u16) -> Result<(), Error> {
        if tolerance == self.tolerance {
            return Ok(());
        }
        match self.mode {
            BindMode::CompiledConstants => Err(Error::ToleranceIsCompiled {
                compiled: self.tolerance,
            }),
            BindMode::RuntimeParams => {
                self.tolerance = tolerance;
                self.write_params(gpu, self.width, self.height);
                Ok(())
            }
        }
    }

    /// Run the consistency check on the device.
    ///
    /// Validates geometry, lazily (re)allocates buffers via [`resize`],
    /// uploads both inputs, launches the kernel over the rounded-up item
    /// count, and reads both outputs back. Returns once the blocking
    /// read-back has drained everything enqueued by this call.
    ///
    /// `workgroup_override` respecializes the pipeline when it differs from
    /// the current workgroup size; zero is substituted with 1 and a warning.
    ///
    /// # Panics
    /// Panics if an image dimension exceeds the 16-bit geometry range; the
    /// device path addresses pixels through u16 coordinates.
    ///
    /// [`resize`]: GpuConsistencyCheck::resize
    pub fn execute(
        &mut self,
        gpu: &GpuDevice,
        left_in: &DisparityImage,
        right_in: &DisparityImage,
        left_out: &mut DisparityImage,
        right_out: &mut DisparityImage,
        workgroup_override: Option<u32>,
    ) -> Result<(), Error> {
        check::validate_dimensions(left_in, right_in, left_out, right_out)?;
        assert!(
            left_in.width() <= usize::from(u16::MAX) && left_in.height() <= usize::from(u16::MAX),
            "geometry exceeds the 16-bit range"
        );
        let width = left_in.width() as u16;
        let height = left_in.height() as u16;
        self.resize(gpu, width, height)?;

        let elems = u32::from(width) * u32::from(height);
        if elems == 0 {
            return Ok(());
        }

        let workgroup_size = match workgroup_override {
            Some(0) => {
                warn!("workgroup size 0 requested; substituting 1");
                1
            }
            Some(n) => n,
            None => self.kernel.workgroup_size(),
        };
        if workgroup_size != self.kernel.workgroup_size() {
            debug!("respecializing kernel for workgroup size {workgroup_size}");
            self.kernel = self
                .kernel
                .rebuild(gpu, *self.kernel.options(), workgroup_size)?;
            // The bind group is tied to the old pipeline's layout.
            self.rebind(gpu, width, height)?;
        }

        let [dev_left_in, dev_right_in, dev_left_out, dev_right_out] = self
            .buffers
            .complete()
            .ok_or_else(|| Error::Dispatch {
                log: "device buffers missing after resize".to_string(),
            })?;
        let bind_group = self.bind_group.as_ref().ok_or_else(|| Error::ArgumentBind {
            log: "kernel arguments are unbound".to_string(),
        })?;
        let padded = align_to(self.buffers.logical_bytes, wgpu::COPY_BUFFER_ALIGNMENT);

        // Large launches exceed the per-dimension workgroup limit and must
        // spread over two dimensions; the kernel flattens the shape back.
        let groups = global_work_size(elems, workgroup_size) / u64::from(workgroup_size);
        let (groups_x, groups_y) = dispatch_extent(groups, gpu.max_workgroups_per_dimension())
            .ok_or_else(|| Error::Dispatch {
                log: format!(
                    "{elems} items at workgroup size {workgroup_size} exceed the \
                     device dispatch limits"
                ),
            })?;

        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);

        // Host -> device: staged writes, non-blocking on the host side.
        gpu.queue
            .write_buffer(dev_left_in, 0, &pack_rows(left_in, padded as usize));
        gpu.queue
            .write_buffer(dev_right_in, 0, &pack_rows(right_in, padded as usize));
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("consistency check dispatch"),
            });
        // The kernel merges 16-bit halves into output words with atomicOr;
        // the words must start from zero.
        encoder.clear_buffer(dev_left_out, 0, None);
        encoder.clear_buffer(dev_right_out, 0, None);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(DEFAULT_ENTRY_POINT),
                timestamp_writes: None,
            });
            pass.set_pipeline(self.kernel.pipeline());
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }

        let staging_left = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("left_out staging"),
            size: padded,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let staging_right = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("right_out staging"),
            size: padded,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(dev_left_out, 0, &staging_left, 0, padded);
        encoder.copy_buffer_to_buffer(dev_right_out, 0, &staging_right, 0, padded);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        if let Some(e) = pollster::block_on(gpu.device.pop_error_scope()) {
            // Work enqueued before the failing step is not rolled back.
            return Err(Error::Dispatch { log: e.to_string() });
        }

        // Device -> host: left_out is requested asynchronously; waiting on
        // right_out is the single blocking point that guarantees all four
        // prior operations completed before execute returns.
        let left_slice = staging_left.slice(..);
        let (left_tx, left_rx) = mpsc::channel();
        left_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = left_tx.send(result);
        });
        let right_slice = staging_right.slice(..);
        let (right_tx, right_rx) = mpsc::channel();
        right_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = right_tx.send(result);
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        recv_map(&right_rx, "right_out")?;
        recv_map(&left_rx, "left_out")?;

        unpack_rows(&left_slice.get_mapped_range(), left_out);
        unpack_rows(&right_slice.get_mapped_range(), right_out);
        staging_left.unmap();
        staging_right.unmap();
        Ok(())
    }

    // --- Internals ---

    /// Allocate one working buffer, checking the allocation's status.
    /// Exhaustion reports as out-of-memory; a size above the device's
    /// buffer limit reports as a validation error. Both scopes are checked.
    fn allocate(
        &mut self,
        gpu: &GpuDevice,
        label: &str,
        bytes: u64,
        usage: wgpu::BufferUsages,
    ) -> Result<wgpu::Buffer, String> {
        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes,
            usage,
            mapped_at_creation: false,
        });
        self.allocations += 1;
        let out_of_memory = pollster::block_on(gpu.device.pop_error_scope());
        let validation = pollster::block_on(gpu.device.pop_error_scope());
        match out_of_memory.or(validation) {
            None => Ok(buffer),
            Some(e) => Err(e.to_string()),
        }
    }

    /// Bind the kernel arguments in the fixed order for this engine's mode:
    /// parameter uniform first (runtime mode only), then the four buffers.
    fn rebind(&mut self, gpu: &GpuDevice, width: u16, height: u16) -> Result<(), Error> {
        let Some(buffers) = self.buffers.complete() else {
            // Zero geometry: nothing to bind.
            self.bind_group = None;
            return Ok(());
        };

        let mut entries = Vec::with_capacity(5);
        let mut binding = 0u32;
        if let Some(params) = &self.params {
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: params.as_entire_binding(),
            });
            binding += 1;
        }
        for buffer in buffers {
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            });
            binding += 1;
        }

        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("consistency check arguments"),
            layout: self.kernel.layout(),
            entries: &entries,
        });
        if let Some(e) = pollster::block_on(gpu.device.pop_error_scope()) {
            return Err(Error::ArgumentBind { log: e.to_string() });
        }

        self.write_params(gpu, width, height);
        self.bind_group = Some(bind_group);
        Ok(())
    }

    fn write_params(&self, gpu: &GpuDevice, width: u16, height: u16) {
        if let Some(params) = &self.params {
            let contents = CheckParams {
                tol: u32::from(self.tolerance),
                width: u32::from(width),
                elems: u32::from(width) * u32::from(height),
                _pad: 0,
            };
            gpu.queue
                .write_buffer(params, 0, bytemuck::bytes_of(&contents));
        }
    }
}

fn sanitize_workgroup(workgroup_size: u32) -> u32 {
    if workgroup_size == 0 {
        warn!("workgroup size 0 requested; substituting 1");
        1
    } else {
        workgroup_size
    }
}

fn recv_map(
    rx: &mpsc::Receiver<Result<(), wgpu::BufferAsyncError>>,
    operand: &'static str,
) -> Result<(), Error> {
    match rx.recv() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Transfer {
            operand,
            log: e.to_string(),
        }),
        Err(_) => Err(Error::Transfer {
            operand,
            log: "map callback was dropped".to_string(),
        }),
    }
}

/// Compact an image's rows into a packed byte vector sized for the padded
/// device buffer (stride padding removed, tail zeroed).
fn pack_rows(img: &DisparityImage, padded: usize) -> Vec<u8> {
    let width_bytes = img.width() * 2;
    let mut bytes = vec![0u8; padded];
    for y in 0..img.height() {
        let dst = y * width_bytes;
        bytes[dst..dst + width_bytes].copy_from_slice(bytemuck::cast_slice(img.row(y)));
    }
    bytes
}

/// Scatter packed read-back bytes into an image, honoring its stride.
fn unpack_rows(bytes: &[u8], img: &mut DisparityImage) {
    let width_bytes = img.width() * 2;
    for y in 0..img.height() {
        let src = y * width_bytes;
        img.row_mut(y)
            .copy_from_slice(bytemuck::cast_slice(&bytes[src..src + width_bytes]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::CpuConsistencyCheck;
    use crate::gpu::device::DeviceClass;

    // ---- Pure helpers (no GPU needed) --------------------------------------

    #[test]
    fn test_buffer_bytes_formula() {
        assert_eq!(buffer_bytes(4, 4), 32);
        assert_eq!(buffer_bytes(1024, 512), 2 * 1024 * 512);
        assert_eq!(buffer_bytes(0, 512), 0);
    }

    #[test]
    fn test_buffer_bytes_max_geometry_does_not_wrap() {
        // 2 * 65535 * 65535 exceeds u32; the u64 result must be exact.
        assert_eq!(buffer_bytes(u16::MAX, u16::MAX), 8_589_672_450);
    }

    #[test]
    fn test_global_work_size_rounds_up() {
        // 10 items at workgroup size 4 dispatch 12 items, not 10.
        assert_eq!(global_work_size(10, 4), 12);
        assert_eq!(global_work_size(12, 4), 12);
        assert_eq!(global_work_size(1, 64), 64);
        assert_eq!(global_work_size(0, 4), 0);
    }

    #[test]
    fn test_global_work_size_unit_group_is_exact() {
        assert_eq!(global_work_size(10, 1), 10);
        // A zero workgroup size falls back to 1 rather than dividing by zero.
        assert_eq!(global_work_size(10, 0), 10);
    }

    #[test]
    fn test_global_work_size_near_max_does_not_truncate() {
        // Rounding u32::MAX items up to a 2^20 multiple exceeds u32; the
        // u64 result must carry the exact value.
        assert_eq!(global_work_size(u32::MAX, 1 << 20), 1u64 << 32);
    }

    #[test]
    fn test_dispatch_extent_fits_one_dimension() {
        assert_eq!(dispatch_extent(1, 65_535), Some((1, 1)));
        assert_eq!(dispatch_extent(65_535, 65_535), Some((65_535, 1)));
    }

    #[test]
    fn test_dispatch_extent_splits_large_launches() {
        // 2560x1920 at workgroup size 64: 76_800 groups overflow one
        // dimension and spread over two.
        let (x, y) = dispatch_extent(76_800, 65_535).expect("fits in two dimensions");
        assert_eq!((x, y), (65_535, 2));
        assert!(u64::from(x) * u64::from(y) >= 76_800);

        // The full 16-bit geometry at the default workgroup size.
        let groups = global_work_size(4_294_836_225, 64) / 64;
        let (x, y) = dispatch_extent(groups, 65_535).expect("fits in two dimensions");
        assert!(u64::from(x) * u64::from(y) >= groups);
    }

    #[test]
    fn test_dispatch_extent_rejects_oversized_launches() {
        let too_many = u64::from(u32::MAX) * 65_535;
        assert_eq!(dispatch_extent(too_many, 65_535), None);
    }

    #[test]
    fn test_align_to_copy_alignment() {
        assert_eq!(align_to(18, 4), 20);
        assert_eq!(align_to(32, 4), 32);
        assert_eq!(align_to(0, 4), 0);
    }

    #[test]
    fn test_pack_rows_strips_stride_padding() {
        let img = DisparityImage::from_vec_with_stride(
            3,
            2,
            4,
            vec![10, 20, 30, 0, 40, 50, 60, 0],
        );
        let padded = align_to(buffer_bytes(3, 2), 4) as usize;
        let bytes = pack_rows(&img, padded);
        let packed: &[u16] = bytemuck::cast_slice(&bytes[..12]);
        assert_eq!(packed, &[10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn test_unpack_rows_honors_stride() {
        let mut img = DisparityImage::new_with_stride(3, 2, 5);
        let packed: Vec<u16> = vec![1, 2, 3, 4, 5, 6];
        unpack_rows(bytemuck::cast_slice(&packed), &mut img);
        assert_eq!(img.row(0), &[1, 2, 3]);
        assert_eq!(img.row(1), &[4, 5, 6]);
    }

    // ---- GPU integration tests (subprocess isolation) ----------------------
    //
    // Some driver stacks crash during process exit after a device has been
    // created, independent of how our wgpu objects are dropped. Each GPU
    // test therefore runs in an isolated child process: the inner_* test
    // does the real work and prints "GPU_TEST_OK" before returning; the
    // outer wrapper only checks for that token in the child's output.

    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args([
                "test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture",
            ])
            .output()
            .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    fn test_device() -> GpuDevice {
        GpuDevice::select(DeviceClass::Any).expect("need a compute adapter")
    }

    fn lcg_image(width: usize, height: usize, mut seed: u32) -> DisparityImage {
        let data: Vec<u16> = (0..width * height)
            .map(|_| {
                seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                ((seed >> 16) % 4096) as u16
            })
            .collect();
        DisparityImage::from_vec(width, height, data)
    }

    fn run_engine(
        engine: &mut GpuConsistencyCheck,
        gpu: &GpuDevice,
        left_in: &DisparityImage,
        right_in: &DisparityImage,
    ) -> (DisparityImage, DisparityImage) {
        let mut left_out = DisparityImage::new(left_in.width(), left_in.height());
        let mut right_out = DisparityImage::new(left_in.width(), left_in.height());
        engine
            .execute(gpu, left_in, right_in, &mut left_out, &mut right_out, None)
            .expect("execute should succeed");
        (left_out, right_out)
    }

    // Inner tests ─────────────────────────────────────────────────────────────

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_end_to_end_invalidation() {
        let gpu = test_device();
        let left_in = DisparityImage::filled(2, 2, 10);
        let right_in = DisparityImage::filled(2, 2, 12);

        let mut engine = GpuConsistencyCheck::new(
            &gpu,
            KernelSource::builtin(),
            EngineConfig::runtime(1),
            2,
            2,
        )
        .expect("engine");

        // Difference 2 > tolerance 1: every pixel invalidated.
        let (left_out, right_out) = run_engine(&mut engine, &gpu, &left_in, &right_in);
        assert!(left_out.pixels().all(|(_, _, v)| v == DEFAULT_INVALID_DISPARITY));
        assert!(right_out.pixels().all(|(_, _, v)| v == DEFAULT_INVALID_DISPARITY));

        // Tolerance 5: consistent, outputs copy the inputs through. Only
        // argument 0 changes; buffers are untouched.
        engine.set_tolerance(&gpu, 5).expect("runtime-mode tolerance update");
        let (left_out, right_out) = run_engine(&mut engine, &gpu, &left_in, &right_in);
        assert!(left_out.pixels().all(|(_, _, v)| v == 10));
        assert!(right_out.pixels().all(|(_, _, v)| v == 12));

        println!("GPU_TEST_OK");
        drop(engine);
        drop(gpu);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_matches_cpu_reference() {
        let gpu = test_device();
        let left_in = lcg_image(64, 48, 99991);
        let right_in = lcg_image(64, 48, 12345);
        let tolerance = 500;

        let cpu = CpuConsistencyCheck::new(tolerance);
        let mut cpu_left = DisparityImage::new(64, 48);
        let mut cpu_right = DisparityImage::new(64, 48);
        cpu.run(&left_in, &right_in, &mut cpu_left, &mut cpu_right)
            .expect("cpu reference");

        for config in [EngineConfig::runtime(tolerance), EngineConfig::compiled(tolerance)] {
            let mut engine =
                GpuConsistencyCheck::new(&gpu, KernelSource::builtin(), config, 64, 48)
                    .expect("engine");
            let (gpu_left, gpu_right) = run_engine(&mut engine, &gpu, &left_in, &right_in);
            assert_eq!(gpu_left.as_slice(), cpu_left.as_slice(),
                "left_out parity failure in {:?} mode", config.mode);
            assert_eq!(gpu_right.as_slice(), cpu_right.as_slice(),
                "right_out parity failure in {:?} mode", config.mode);
        }

        println!("GPU_TEST_OK");
        drop(gpu);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_resize_is_idempotent() {
        let gpu = test_device();
        let mut engine = GpuConsistencyCheck::new(
            &gpu,
            KernelSource::builtin(),
            EngineConfig::runtime(0),
            16,
            16,
        )
        .expect("engine");
        assert_eq!(engine.allocations(), 4);
        assert_eq!(engine.logical_buffer_bytes(), buffer_bytes(16, 16));

        // Same geometry: no reallocation.
        engine.resize(&gpu, 16, 16).expect("idempotent resize");
        assert_eq!(engine.allocations(), 4);

        let left_in = lcg_image(16, 16, 7);
        let right_in = lcg_image(16, 16, 11);
        run_engine(&mut engine, &gpu, &left_in, &right_in);
        assert_eq!(engine.allocations(), 4, "execute must not reallocate");

        // New geometry: exactly four fresh buffers, sized for it alone.
        engine.resize(&gpu, 32, 8).expect("resize");
        assert_eq!(engine.allocations(), 8);
        assert_eq!(engine.logical_buffer_bytes(), buffer_bytes(32, 8));

        println!("GPU_TEST_OK");
        drop(engine);
        drop(gpu);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_macro_mode_rejects_tolerance_update() {
        let gpu = test_device();
        let mut engine = GpuConsistencyCheck::new(
            &gpu,
            KernelSource::builtin(),
            EngineConfig::compiled(3),
            4,
            4,
        )
        .expect("engine");

        // Unchanged tolerance is still a no-op.
        engine.set_tolerance(&gpu, 3).expect("no-op update");

        let err = engine.set_tolerance(&gpu, 9).unwrap_err();
        assert!(matches!(err, Error::ToleranceIsCompiled { compiled: 3 }));

        println!("GPU_TEST_OK");
        drop(engine);
        drop(gpu);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_workgroup_override_covers_tail() {
        // 5x2 = 10 pixels with workgroup size 4 dispatches 12 items; the
        // two tail items must not corrupt the outputs.
        let gpu = test_device();
        let left_in = lcg_image(5, 2, 31);
        let right_in = lcg_image(5, 2, 37);

        let cpu = CpuConsistencyCheck::new(100);
        let mut cpu_left = DisparityImage::new(5, 2);
        let mut cpu_right = DisparityImage::new(5, 2);
        cpu.run(&left_in, &right_in, &mut cpu_left, &mut cpu_right)
            .expect("cpu reference");

        let mut engine = GpuConsistencyCheck::new(
            &gpu,
            KernelSource::builtin(),
            EngineConfig::runtime(100),
            5,
            2,
        )
        .expect("engine");
        let mut gpu_left = DisparityImage::new(5, 2);
        let mut gpu_right = DisparityImage::new(5, 2);
        engine
            .execute(&gpu, &left_in, &right_in, &mut gpu_left, &mut gpu_right, Some(4))
            .expect("execute with override");
        assert_eq!(engine.workgroup_size(), 4);
        assert_eq!(gpu_left.as_slice(), cpu_left.as_slice());
        assert_eq!(gpu_right.as_slice(), cpu_right.as_slice());

        println!("GPU_TEST_OK");
        drop(engine);
        drop(gpu);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_split_dispatch_matches_cpu() {
        // 512x256 pixels at workgroup size 1 need 131_072 workgroups, which
        // exceeds the per-dimension limit (65_535): the launch must spread
        // over two dimensions and still produce correct output.
        let gpu = test_device();
        let left_in = lcg_image(512, 256, 41);
        let right_in = lcg_image(512, 256, 43);

        let cpu = CpuConsistencyCheck::new(200);
        let mut cpu_left = DisparityImage::new(512, 256);
        let mut cpu_right = DisparityImage::new(512, 256);
        cpu.run(&left_in, &right_in, &mut cpu_left, &mut cpu_right)
            .expect("cpu reference");

        let mut engine = GpuConsistencyCheck::new(
            &gpu,
            KernelSource::builtin(),
            EngineConfig::runtime(200),
            512,
            256,
        )
        .expect("engine");
        let mut gpu_left = DisparityImage::new(512, 256);
        let mut gpu_right = DisparityImage::new(512, 256);
        engine
            .execute(&gpu, &left_in, &right_in, &mut gpu_left, &mut gpu_right, Some(1))
            .expect("split dispatch");
        assert_eq!(gpu_left.as_slice(), cpu_left.as_slice());
        assert_eq!(gpu_right.as_slice(), cpu_right.as_slice());

        println!("GPU_TEST_OK");
        drop(engine);
        drop(gpu);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_failed_allocation_keeps_prior_state() {
        // The full 16-bit geometry needs 8.6 GB per buffer, far over any
        // default buffer limit. The resize must fail with a report naming
        // which slots went through, keep the previous geometry, and leave
        // the engine usable after a valid resize.
        let gpu = test_device();
        let mut engine = GpuConsistencyCheck::new(
            &gpu,
            KernelSource::builtin(),
            EngineConfig::runtime(1),
            0,
            0,
        )
        .expect("engine");

        let err = engine.resize(&gpu, u16::MAX, u16::MAX).unwrap_err();
        match err {
            Error::Allocation { report, .. } => {
                assert_eq!(report.succeeded(), 0, "first slot must already fail");
                assert!(!report.left_in);
            }
            other => panic!("expected Allocation, got {other}"),
        }
        assert_eq!(engine.width(), 0, "failed resize must not adopt the geometry");
        assert_eq!(engine.height(), 0);
        assert_eq!(engine.allocations(), 1, "abort at the first failed slot");

        // Recovery: a sane geometry allocates and executes normally.
        engine.resize(&gpu, 4, 4).expect("recovery resize");
        assert_eq!(engine.allocations(), 5);
        let left_in = DisparityImage::filled(4, 4, 10);
        let right_in = DisparityImage::filled(4, 4, 10);
        let (left_out, _) = run_engine(&mut engine, &gpu, &left_in, &right_in);
        assert!(left_out.pixels().all(|(_, _, v)| v == 10));

        println!("GPU_TEST_OK");
        drop(engine);
        drop(gpu);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_dimension_mismatch_does_no_device_work() {
        let gpu = test_device();
        let mut engine = GpuConsistencyCheck::new(
            &gpu,
            KernelSource::builtin(),
            EngineConfig::runtime(0),
            0,
            0,
        )
        .expect("engine");

        let left_in = DisparityImage::new(4, 4);
        let right_in = DisparityImage::new(4, 3);
        let mut left_out = DisparityImage::new(4, 4);
        let mut right_out = DisparityImage::new(4, 4);
        let err = engine
            .execute(&gpu, &left_in, &right_in, &mut left_out, &mut right_out, None)
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
        assert_eq!(engine.allocations(), 0, "validation failure must precede allocation");

        // A dimension beyond the 16-bit geometry range is a documented
        // precondition violation and panics before any device work.
        let wide_in = DisparityImage::new(70_000, 1);
        let wide_ref = DisparityImage::new(70_000, 1);
        let mut wide_left = DisparityImage::new(70_000, 1);
        let mut wide_right = DisparityImage::new(70_000, 1);
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = engine.execute(
                &gpu,
                &wide_in,
                &wide_ref,
                &mut wide_left,
                &mut wide_right,
                None,
            );
        }))
        .is_err();
        assert!(panicked, "oversized geometry must panic");
        assert_eq!(engine.allocations(), 0);

        println!("GPU_TEST_OK");
        drop(engine);
        drop(gpu);
    }

    // Outer wrappers ──────────────────────────────────────────────────────────

    #[test]
    #[ignore = "requires a compute adapter"]
    fn test_end_to_end_invalidation() {
        let out = run_gpu_test_in_subprocess("gpu::engine::tests::inner_end_to_end_invalidation");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a compute adapter"]
    fn test_matches_cpu_reference() {
        let out = run_gpu_test_in_subprocess("gpu::engine::tests::inner_matches_cpu_reference");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a compute adapter"]
    fn test_resize_is_idempotent() {
        let out = run_gpu_test_in_subprocess("gpu::engine::tests::inner_resize_is_idempotent");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a compute adapter"]
    fn test_macro_mode_rejects_tolerance_update() {
        let out = run_gpu_test_in_subprocess(
            "gpu::engine::tests::inner_macro_mode_rejects_tolerance_update",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a compute adapter"]
    fn test_workgroup_override_covers_tail() {
        let out = run_gpu_test_in_subprocess(
            "gpu::engine::tests::inner_workgroup_override_covers_tail",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a compute adapter"]
    fn test_split_dispatch_matches_cpu() {
        let out = run_gpu_test_in_subprocess("gpu::engine::tests::inner_split_dispatch_matches_cpu");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a compute adapter"]
    fn test_failed_allocation_keeps_prior_state() {
        let out = run_gpu_test_in_subprocess(
            "gpu::engine::tests::inner_failed_allocation_keeps_prior_state",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a compute adapter"]
    fn test_dimension_mismatch_does_no_device_work() {
        let out = run_gpu_test_in_subprocess(
            "gpu::engine::tests::inner_dimension_mismatch_does_no_device_work",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
