// demos/cross_check.rs — end-to-end consistency check demo.
//
// Loads a pair of 16-bit disparity maps when two paths are given on the
// command line, otherwise synthesizes a random pair. Runs the check in both
// binding modes, reports the average device round-trip time, and verifies
// the device output against the CPU reference.
//
//   cargo run --example cross_check [left.png right.png]
//   RUST_LOG=debug cargo run --example cross_check

use std::time::Instant;

use crosscheck::{
    BindMode, CpuConsistencyCheck, DeviceClass, DisparityImage, EngineConfig,
    GpuConsistencyCheck, GpuDevice, KernelSource,
};

const TOLERANCE: u16 = 500;
const ITERATIONS: usize = 102;
// The first runs include lazy allocation and driver warm-up; skip them.
const WARMUP: usize = 2;

fn lcg_image(width: usize, height: usize, seed: &mut u32) -> DisparityImage {
    let data: Vec<u16> = (0..width * height)
        .map(|_| {
            *seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
            ((*seed >> 16) % 4096) as u16
        })
        .collect();
    DisparityImage::from_vec(width, height, data)
}

fn synthetic_pair(width: usize, height: usize) -> (DisparityImage, DisparityImage) {
    let mut seed: u32 = 0x1234_5678;
    let left = lcg_image(width, height, &mut seed);
    let right = lcg_image(width, height, &mut seed);
    (left, right)
}

fn load_png(path: &str) -> DisparityImage {
    let img = image::open(path)
        .unwrap_or_else(|e| panic!("cannot open {path}: {e}"))
        .into_luma16();
    let (width, height) = (img.width() as usize, img.height() as usize);
    DisparityImage::from_vec(width, height, img.into_raw())
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let (left_in, right_in) = match args.as_slice() {
        [_, left, right] => (load_png(left), load_png(right)),
        _ => {
            println!("no input images given; using a synthetic 512x1024 pair");
            synthetic_pair(512, 1024)
        }
    };
    let (width, height) = (left_in.width(), left_in.height());
    println!("input geometry: {width}x{height}, tolerance {TOLERANCE}");

    let gpu = match GpuDevice::select(DeviceClass::Gpu)
        .or_else(|_| GpuDevice::select(DeviceClass::Any))
    {
        Ok(gpu) => gpu,
        Err(e) => {
            eprintln!("no compute device available: {e}");
            std::process::exit(1);
        }
    };
    println!("{}", gpu.describe());

    // CPU reference for the parity check at the end.
    let cpu = CpuConsistencyCheck::new(TOLERANCE);
    let mut ref_left = DisparityImage::new(width, height);
    let mut ref_right = DisparityImage::new(width, height);
    cpu.run(&left_in, &right_in, &mut ref_left, &mut ref_right)
        .expect("CPU reference");

    for mode in [BindMode::RuntimeParams, BindMode::CompiledConstants] {
        let config = match mode {
            BindMode::RuntimeParams => EngineConfig::runtime(TOLERANCE),
            BindMode::CompiledConstants => EngineConfig::compiled(TOLERANCE),
        };
        let mut engine = GpuConsistencyCheck::new(
            &gpu,
            KernelSource::builtin(),
            config,
            width as u16,
            height as u16,
        )
        .unwrap_or_else(|e| panic!("engine construction failed in {mode:?} mode: {e}"));

        let mut left_out = DisparityImage::new(width, height);
        let mut right_out = DisparityImage::new(width, height);
        let mut total_ms = 0.0f64;
        for i in 0..ITERATIONS {
            let start = Instant::now();
            engine
                .execute(&gpu, &left_in, &right_in, &mut left_out, &mut right_out, None)
                .unwrap_or_else(|e| panic!("execute failed in {mode:?} mode: {e}"));
            if i >= WARMUP {
                total_ms += start.elapsed().as_secs_f64() * 1000.0;
            }
        }
        let average = total_ms / (ITERATIONS - WARMUP) as f64;

        let parity = left_out.as_slice() == ref_left.as_slice()
            && right_out.as_slice() == ref_right.as_slice();
        let invalid = left_out.pixels().filter(|&(_, _, v)| v == 0).count();
        println!(
            "{mode:?}: {average:.3} ms average over {} runs, \
             {invalid}/{} left pixels invalidated, CPU parity: {}",
            ITERATIONS - WARMUP,
            width * height,
            if parity { "ok" } else { "MISMATCH" },
        );
        if !parity {
            std::process::exit(1);
        }
    }
}
