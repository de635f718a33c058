// gpu/program.rs — kernel source handling and program building.
//
// The kernel ships as a WGSL template; `BuildOptions` plays the role of a
// compile-option string, substituting the `{{...}}` placeholders before the
// module is handed to the backend compiler. Baking constants into the source
// this way keeps the two binding modes honest: a kernel compiled with macros
// has no parameter uniform at all, and changing any baked value means a
// fresh compile — there is no in-place patching of a built program.
//
// Compilation runs on a worker thread and the result comes back over a
// single-shot channel, so the caller can log progress while a slow backend
// compiler grinds without busy-polling a shared flag. Diagnostics are
// captured with device error scopes and surfaced tagged with the adapter
// name.

use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::Error;
use crate::gpu::device::GpuDevice;

/// The WGSL template carried in-tree.
pub const BUILTIN_KERNEL: &str = include_str!("../shaders/consistency_check.wgsl");

/// Entry point the built-in template exposes.
pub const DEFAULT_ENTRY_POINT: &str = "consistency_check";

/// Kernel source text plus where it came from (for diagnostics).
#[derive(Debug, Clone)]
pub struct KernelSource {
    text: String,
    origin: String,
}

impl KernelSource {
    /// The in-tree consistency check template.
    pub fn builtin() -> Self {
        KernelSource {
            text: BUILTIN_KERNEL.to_string(),
            origin: "<builtin>".to_string(),
        }
    }

    /// Load a template from a file.
    ///
    /// # Errors
    /// [`Error::SourceUnreadable`] when the file is missing, unreadable, or
    /// empty — checked here, before any compilation is attempted.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::SourceUnreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if text.trim().is_empty() {
            return Err(Error::SourceUnreadable {
                path: path.display().to_string(),
                reason: "the contents appear to be empty".to_string(),
            });
        }
        Ok(KernelSource {
            text,
            origin: path.display().to_string(),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// Constants baked into the kernel source in macro mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroConstants {
    pub tolerance: u16,
    pub width: u16,
    pub height: u16,
}

impl MacroConstants {
    pub fn elems(self) -> u32 {
        u32::from(self.width) * u32::from(self.height)
    }
}

/// The compile-option set for one program build.
///
/// The invalid-disparity sentinel is always substituted; `with_macros`
/// additionally bakes tolerance, width, and element count into the source
/// instead of routing them through the parameter uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub invalid_disparity_value: u16,
    pub macros: Option<MacroConstants>,
}

impl BuildOptions {
    pub fn new(invalid_disparity_value: u16) -> Self {
        BuildOptions {
            invalid_disparity_value,
            macros: None,
        }
    }

    pub fn with_macros(
        invalid_disparity_value: u16,
        tolerance: u16,
        width: u16,
        height: u16,
    ) -> Self {
        BuildOptions {
            invalid_disparity_value,
            macros: Some(MacroConstants {
                tolerance,
                width,
                height,
            }),
        }
    }

    pub fn uses_macros(&self) -> bool {
        self.macros.is_some()
    }

    /// Number of bindings that precede the four buffers: the parameter
    /// uniform occupies binding 0 unless the constants are compiled in.
    pub(crate) fn buffer_binding_base(&self) -> u32 {
        if self.uses_macros() {
            0
        } else {
            1
        }
    }

    /// Substitute every placeholder in `template`. The textual analogue of
    /// a `-D` option string handed to a backend compiler.
    pub(crate) fn apply(&self, template: &str, workgroup_size: u32) -> String {
        assert!(workgroup_size >= 1, "workgroup size must be at least 1");
        let config = match self.macros {
            Some(m) => format!(
                "fn cfg_tol() -> u32 {{ return {}u; }}\n\
                 fn cfg_width() -> u32 {{ return {}u; }}\n\
                 fn cfg_elems() -> u32 {{ return {}u; }}",
                m.tolerance,
                m.width,
                m.elems(),
            ),
            None => "\
struct Params {
    tol: u32,
    width: u32,
    elems: u32,
}

@group(0) @binding(0) var<uniform> params: Params;

fn cfg_tol() -> u32 { return params.tol; }
fn cfg_width() -> u32 { return params.width; }
fn cfg_elems() -> u32 { return params.elems; }"
                .to_string(),
        };
        let base = self.buffer_binding_base();
        template
            .replace("{{CONFIG}}", &config)
            .replace("{{INVALID}}", &self.invalid_disparity_value.to_string())
            .replace("{{WG_SIZE}}", &workgroup_size.to_string())
            .replace("{{BIND_LEFT_IN}}", &base.to_string())
            .replace("{{BIND_RIGHT_IN}}", &(base + 1).to_string())
            .replace("{{BIND_LEFT_OUT}}", &(base + 2).to_string())
            .replace("{{BIND_RIGHT_OUT}}", &(base + 3).to_string())
    }
}

/// A program compiled for one device with one option set, one entry point,
/// and one workgroup size. Immutable once built; any change is a rebuild.
pub struct CompiledKernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    source: KernelSource,
    options: BuildOptions,
    entry_point: String,
    workgroup_size: u32,
}

impl CompiledKernel {
    /// Substitute options into the template, compile the module on a worker
    /// thread, and create the compute pipeline.
    ///
    /// # Errors
    /// [`Error::BuildFailure`] with the backend's diagnostic log on a
    /// compile error; [`Error::KernelResolution`] when `entry_point` does
    /// not resolve in the compiled module.
    pub fn build(
        gpu: &GpuDevice,
        source: KernelSource,
        options: BuildOptions,
        entry_point: &str,
        workgroup_size: u32,
    ) -> Result<Self, Error> {
        let shader_text = options.apply(&source.text, workgroup_size);
        let module = compile_module(gpu, &shader_text, &source.origin)?;

        let layout = bind_group_layout(gpu, &options);
        let pipeline_layout =
            gpu.device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("consistency check pipeline layout"),
                    bind_group_layouts: &[&layout],
                    push_constant_ranges: &[],
                });

        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = gpu
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
        if let Some(e) = pollster::block_on(gpu.device.pop_error_scope()) {
            return Err(Error::KernelResolution {
                entry_point: entry_point.to_string(),
                log: e.to_string(),
            });
        }

        Ok(CompiledKernel {
            pipeline,
            layout,
            source,
            options,
            entry_point: entry_point.to_string(),
            workgroup_size,
        })
    }

    /// Fresh compile of the same source with different options or workgroup
    /// size. Used by the engine when a macro-mode resize or a workgroup
    /// override invalidates the baked configuration.
    pub(crate) fn rebuild(
        &self,
        gpu: &GpuDevice,
        options: BuildOptions,
        workgroup_size: u32,
    ) -> Result<Self, Error> {
        Self::build(
            gpu,
            self.source.clone(),
            options,
            &self.entry_point,
            workgroup_size,
        )
    }

    pub(crate) fn pipeline(&self) -> &wgpu::ComputePipeline {
        &self.pipeline
    }

    pub(crate) fn layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn workgroup_size(&self) -> u32 {
        self.workgroup_size
    }
}

/// Compile the module on a worker thread, logging progress every 500ms
/// while the caller waits on the result channel.
fn compile_module(
    gpu: &GpuDevice,
    shader_text: &str,
    origin: &str,
) -> Result<wgpu::ShaderModule, Error> {
    let started = Instant::now();
    let (tx, rx) = mpsc::channel();

    let result = thread::scope(|s| {
        s.spawn(|| {
            gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
            let module = gpu
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(origin),
                    source: wgpu::ShaderSource::Wgsl(shader_text.into()),
                });
            let error = pollster::block_on(gpu.device.pop_error_scope());
            let _ = tx.send(match error {
                None => Ok(module),
                Some(e) => Err(e.to_string()),
            });
        });

        loop {
            match rx.recv_timeout(Duration::from_millis(500)) {
                Ok(result) => break result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    info!("building {origin}...");
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break Err("compiler thread terminated unexpectedly".to_string());
                }
            }
        }
    });

    match result {
        Ok(module) => {
            debug!("built {} in {:.3}s", origin, started.elapsed().as_secs_f64());
            Ok(module)
        }
        Err(log) => Err(Error::BuildFailure {
            device: gpu.adapter_info.name.clone(),
            log,
        }),
    }
}

/// The fixed argument layout for one binding mode. With macros only the
/// four buffers are bound; otherwise the parameter uniform precedes them.
fn bind_group_layout(gpu: &GpuDevice, options: &BuildOptions) -> wgpu::BindGroupLayout {
    let mut entries = Vec::with_capacity(5);
    let mut binding = 0;

    if !options.uses_macros() {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
        binding += 1;
    }

    // left_in, right_in: read-only from the kernel's perspective.
    for _ in 0..2 {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
        binding += 1;
    }

    // left_out, right_out.
    for _ in 0..2 {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
        binding += 1;
    }

    gpu.device
        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("consistency check bindings"),
            entries: &entries,
        })
}
