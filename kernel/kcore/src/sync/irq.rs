use core::marker::PhantomData;

use crate::arch;

/// A type-level assertion that interrupts are disabled
///
/// Whenever an instance of this structure is alive, users can safely assume that interrupts are
/// disabled. On a single CPU, "interrupts off" is the only mutual exclusion the kernel needs:
/// every mutating entry point into the core demands a reference to this token.
pub struct IrqDisabled {
    _not_send: PhantomData<*const ()>,
}

impl IrqDisabled {
    /// # Safety
    ///
    /// Interrupts must actually be disabled when this function is called and must remain disabled
    /// for the duration of the returned object's lifetime.
    pub unsafe fn new() -> Self {
        Self {
            _not_send: PhantomData,
        }
    }
}

/// Disables interrupts, invokes `f` with the disable witnessed, and restores the previous
/// interrupt state afterwards.
pub fn disable_with<R>(f: impl FnOnce(&IrqDisabled) -> R) -> R {
    unsafe {
        let prev_state = arch::cpu::irq_enabled();
        arch::cpu::disable_irq();

        let ret = f(&IrqDisabled::new());

        if prev_state {
            arch::cpu::enable_irq();
        }

        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disable_with_passes_through_result() {
        let value = disable_with(|irq| {
            let _witness: &IrqDisabled = irq;
            42
        });
        assert_eq!(value, 42);
    }
}
