// gpu/mod.rs — wgpu-based consistency check.
//
// The CPU implementation in crate::check remains the authoritative
// reference — the kernel is validated against it pixel-for-pixel.
//
// Layering:
//   device  — adapter enumeration, device/queue ownership, capability dump
//   program — kernel source loading, option substitution, compilation
//   engine  — buffer lifecycle, argument binding, dispatch, read-back

pub mod device;
pub mod engine;
pub mod program;
