pub mod context;
pub mod cpu;
pub mod mmu;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod x64_cpu;
