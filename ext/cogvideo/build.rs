use std::env;
use std::path::Path;

fn main() {
    println!("cargo::rustc-check-cfg=cfg(force_cpu)");
    println!("cargo::rustc-check-cfg=cfg(has_cuda)");
    println!("cargo::rustc-check-cfg=cfg(has_metal)");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=configs");
    println!("cargo:rerun-if-env-changed=CANDLE_FORCE_CPU");
    println!("cargo:rerun-if-env-changed=CANDLE_CUDA_PATH");
    println!("cargo:rerun-if-env-changed=CUDA_ROOT");
    println!("cargo:rerun-if-env-changed=CUDA_PATH");

    // The loader falls back to CPU for both device tiers when this is set
    if env::var("CANDLE_FORCE_CPU").is_ok() {
        println!("cargo:rustc-cfg=force_cpu");
        println!("cargo:warning=CANDLE_FORCE_CPU is set, weights will be placed on the CPU");
        return;
    }

    if detect_cuda() {
        println!("cargo:rustc-cfg=has_cuda");
    }

    #[cfg(target_os = "macos")]
    {
        println!("cargo:rustc-cfg=has_metal");
    }
}

fn detect_cuda() -> bool {
    if env::var("CANDLE_CUDA_PATH").is_ok()
        || env::var("CUDA_ROOT").is_ok()
        || env::var("CUDA_PATH").is_ok()
    {
        return true;
    }

    let cuda_paths = [
        "/usr/local/cuda",
        "/opt/cuda",
        "C:\\Program Files\\NVIDIA GPU Computing Toolkit\\CUDA",
        "C:\\CUDA",
    ];
    if cuda_paths.iter().any(|path| Path::new(path).exists()) {
        return true;
    }

    // nvcc on PATH is the last resort
    if let Ok(path_var) = env::var("PATH") {
        for path in env::split_paths(&path_var) {
            if path.join("nvcc").exists() || path.join("nvcc.exe").exists() {
                return true;
            }
        }
    }

    false
}
