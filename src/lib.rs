// crosscheck: GPU-accelerated left/right disparity consistency checking.
//
// A stereo matcher produces two disparity maps, one per view. A disparity
// is trusted only if both views agree on it: each pixel's value is compared
// against the counterpart map at the position the disparity points to, and
// pixels whose difference exceeds a tolerance are replaced with an invalid
// sentinel. This crate runs that filter on a compute device via wgpu, with
// a sequential CPU reference implementation for validation and fallback.

pub mod check;
pub mod error;
pub mod gpu;
pub mod image;

pub use check::CpuConsistencyCheck;
pub use error::{AllocationReport, Error};
pub use gpu::device::{DeviceClass, GpuDevice};
pub use gpu::engine::{BindMode, EngineConfig, GpuConsistencyCheck};
pub use gpu::program::KernelSource;
pub use image::DisparityImage;
