// gpu/device.rs — compute device selection and capability reporting.
//
// Responsibilities:
//   - Enumerate adapters of a requested class (GPU, CPU, accelerator, any)
//     and select one deterministically: the first enumerated. More than one
//     match is a warning, never an error — single-device machines are the
//     common case and `GpuDevice::from_adapter` is always available as an
//     explicit override.
//   - Own the wgpu device + queue the engine issues commands into.
//   - Format device capabilities (workgroup limits, memory sizes) purely for
//     observability; nothing here affects control flow.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` applies power-preference heuristics that
// can pick a software rasterizer when a real GPU is present. We enumerate
// explicitly and filter by the requested class instead, mirroring a device-
// type query against the platform.

use std::fmt;

use log::{debug, warn};

use crate::error::Error;

/// The class of compute device to enumerate.
///
/// Maps onto `wgpu::DeviceType`: discrete and integrated GPUs count as
/// [`Gpu`](DeviceClass::Gpu); software rasterizers as
/// [`Cpu`](DeviceClass::Cpu); virtual or otherwise unclassified adapters as
/// [`Accelerator`](DeviceClass::Accelerator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Gpu,
    Cpu,
    Accelerator,
    Any,
}

impl DeviceClass {
    fn matches(self, ty: wgpu::DeviceType) -> bool {
        match self {
            DeviceClass::Gpu => matches!(
                ty,
                wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::IntegratedGpu
            ),
            DeviceClass::Cpu => matches!(ty, wgpu::DeviceType::Cpu),
            DeviceClass::Accelerator => matches!(
                ty,
                wgpu::DeviceType::VirtualGpu | wgpu::DeviceType::Other
            ),
            DeviceClass::Any => true,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceClass::Gpu => "GPU",
            DeviceClass::Cpu => "CPU",
            DeviceClass::Accelerator => "accelerator",
            DeviceClass::Any => "any",
        };
        write!(f, "{name}")
    }
}

/// Human-readable name for a raw adapter type. Total over the enum; callers
/// can log any adapter the platform reports without special-casing.
pub fn device_type_name(ty: wgpu::DeviceType) -> &'static str {
    match ty {
        wgpu::DeviceType::DiscreteGpu => "discrete GPU",
        wgpu::DeviceType::IntegratedGpu => "integrated GPU",
        wgpu::DeviceType::VirtualGpu => "virtual GPU",
        wgpu::DeviceType::Cpu => "CPU",
        wgpu::DeviceType::Other => "other accelerator",
    }
}

/// Cached adapter information for logging and error tagging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {})",
            self.name,
            self.backend,
            device_type_name(self.device_type)
        )
    }
}

/// The compute context: device, queue, and cached adapter details.
///
/// Create via [`GpuDevice::select`] (or [`GpuDevice::from_adapter`] for an
/// explicit choice) and hold it for the lifetime of the application — device
/// initialization is expensive. Engines borrow it per call; every buffer and
/// command queue submission goes through this context.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    /// Limits the device was requested with; dispatches are validated
    /// against these.
    limits: wgpu::Limits,
    /// Full limits the adapter advertises, kept for `describe()` and the
    /// workgroup-multiple hint.
    adapter_limits: wgpu::Limits,
    /// Keeps the instance alive until `device` and `queue` are dropped.
    /// Fields drop in declaration order, so this stays last.
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Select the first enumerated device of the requested class.
    ///
    /// # Errors
    /// [`Error::NoMatchingDevice`] when the enumeration for `class` is
    /// empty; [`Error::DeviceRequest`] when the adapter refuses the device.
    pub fn select(class: DeviceClass) -> Result<Self, Error> {
        pollster::block_on(Self::select_async(class))
    }

    async fn select_async(class: DeviceClass) -> Result<Self, Error> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let mut matching: Vec<wgpu::Adapter> = instance
            .enumerate_adapters(wgpu::Backends::PRIMARY)
            .into_iter()
            .filter(|adapter| {
                let info = adapter.get_info();
                debug!(
                    "adapter: {} ({:?}, {})",
                    info.name,
                    info.backend,
                    device_type_name(info.device_type)
                );
                class.matches(info.device_type)
            })
            .collect();

        if matching.is_empty() {
            return Err(Error::NoMatchingDevice {
                class: class.to_string(),
            });
        }
        if matching.len() > 1 {
            warn!(
                "{} devices of class {} found; using the first ({}). \
                 Pass an adapter explicitly to pick another.",
                matching.len(),
                class,
                matching[0].get_info().name,
            );
        }
        let adapter = matching.swap_remove(0);
        Self::request(instance, adapter).await
    }

    /// Build a context from an explicitly chosen adapter, bypassing class
    /// based enumeration entirely.
    pub fn from_adapter(
        instance: wgpu::Instance,
        adapter: wgpu::Adapter,
    ) -> Result<Self, Error> {
        pollster::block_on(Self::request(instance, adapter))
    }

    async fn request(
        instance: wgpu::Instance,
        adapter: wgpu::Adapter,
    ) -> Result<Self, Error> {
        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };
        let adapter_limits = adapter.limits();
        let limits = wgpu::Limits::default();

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("crosscheck"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| Error::DeviceRequest {
                device: adapter_info.name.clone(),
                reason: e.to_string(),
            })?;

        debug!("selected {adapter_info}");

        Ok(GpuDevice {
            device,
            queue,
            adapter_info,
            limits,
            adapter_limits,
            _instance: instance,
        })
    }

    /// Largest workgroup size a 1-D dispatch may use on this context.
    pub fn max_workgroup_size(&self) -> u32 {
        self.limits
            .max_compute_invocations_per_workgroup
            .min(self.limits.max_compute_workgroup_size_x)
    }

    /// Largest workgroup count a single dispatch dimension may carry.
    /// Launches above this must be split across dimensions.
    pub fn max_workgroups_per_dimension(&self) -> u32 {
        self.limits.max_compute_workgroups_per_dimension
    }

    /// Preferred workgroup-size multiple. An optimization hint derived from
    /// the adapter's subgroup width, never a correctness constraint; 64 when
    /// the adapter does not report one.
    pub fn preferred_workgroup_multiple(&self) -> u32 {
        match self.adapter_limits.min_subgroup_size {
            0 => 64,
            n => n,
        }
    }

    /// Format the adapter identity and dispatch-relevant capability limits.
    /// Observability only.
    pub fn describe(&self) -> String {
        let a = &self.adapter_limits;
        format!(
            "--------------------\n\
             Device\n\
             name                                : {}\n\
             type                                : {}\n\
             backend                             : {:?}\n\
             vendor / device id                  : {:#06x} / {:#06x}\n\
             max workgroup invocations           : {}\n\
             max workgroup size (x, y, z)        : {} x {} x {}\n\
             max workgroups per dimension        : {}\n\
             max storage buffer binding          : {} bytes\n\
             max uniform buffer binding          : {} bytes\n\
             workgroup storage                   : {} bytes\n\
             --------------------",
            self.adapter_info.name,
            device_type_name(self.adapter_info.device_type),
            self.adapter_info.backend,
            self.adapter_info.vendor,
            self.adapter_info.device,
            a.max_compute_invocations_per_workgroup,
            a.max_compute_workgroup_size_x,
            a.max_compute_workgroup_size_y,
            a.max_compute_workgroup_size_z,
            a.max_compute_workgroups_per_dimension,
            a.max_storage_buffer_binding_size,
            a.max_uniform_buffer_binding_size,
            a.max_compute_workgroup_storage_size,
        )
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDevice {{ adapter: {} }}", self.adapter_info)
    }
}
