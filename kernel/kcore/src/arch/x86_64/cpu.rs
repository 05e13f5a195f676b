//! Interrupt-flag control and halt.
//!
//! Hosted builds get inert shims so the core can be exercised by the test suite.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    use super::super::x64_cpu;

    const RFLAGS_IF: u64 = 1 << 9;

    pub fn irq_enabled() -> bool {
        x64_cpu::get_rflags() & RFLAGS_IF != 0
    }

    /// # Safety
    ///
    /// Code relying on interrupts firing must not be active on this CPU.
    pub unsafe fn disable_irq() {
        unsafe { x64_cpu::cli() }
    }

    /// # Safety
    ///
    /// No [`IrqDisabled`](crate::sync::irq::IrqDisabled) instances may be alive.
    pub unsafe fn enable_irq() {
        unsafe { x64_cpu::sti() }
    }

    pub fn halt() -> ! {
        unsafe {
            x64_cpu::cli();
            loop {
                x64_cpu::hlt();
            }
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    pub fn irq_enabled() -> bool {
        false
    }

    /// # Safety
    ///
    /// None on hosted builds.
    pub unsafe fn disable_irq() {}

    /// # Safety
    ///
    /// None on hosted builds.
    pub unsafe fn enable_irq() {}

    pub fn halt() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }
}

pub use imp::*;
