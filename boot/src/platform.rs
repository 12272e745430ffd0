//! Hardware the boot hand-off needs, beyond flash.

/// Restart the chip.  This is all a running application needs from the
/// platform to reject itself.
pub trait Reset {
    fn reset(&mut self) -> !;
}

pub trait Platform: Reset {
    /// Address the CPU fetches its interrupt vectors from.  A segment loaded
    /// here must not become live until interrupts are off.
    fn vector_base(&self) -> u32;

    /// May an image occupy `[dest, dest + len)`?  Anything overlapping the
    /// bootloader's own code, data or stack must be refused.
    fn is_loadable(&self, dest: u32, len: usize) -> bool;

    /// Can the flash driver read straight into `[dest, dest + len)`?  If not,
    /// segments are copied through a bounce buffer.
    fn is_direct(&self, dest: u32, len: usize) -> bool;

    /// The execution memory at `[dest, dest + len)`.
    ///
    /// # Safety
    ///
    /// The range must be one `is_loadable` accepts, with no other live
    /// reference into it.
    unsafe fn memory(&mut self, dest: u32, len: usize) -> &mut [u8];

    /// Put pins the bootloader used back in their reset state.
    fn restore_pads(&mut self) {}

    fn disable_interrupts(&mut self);

    /// Make sure freshly written memory is what the CPU will execute.
    fn flush_icache(&mut self);

    /// Stop after a fatal boot failure.  Restarts by default, which retries
    /// the whole boot.
    fn halt(&mut self) -> ! {
        self.reset()
    }

    /// Transfer control to the loaded image.
    ///
    /// # Safety
    ///
    /// As for [`jump`].
    unsafe fn jump(&mut self, entry: u32) -> ! {
        jump(entry)
    }
}

/// Call the code at `entry`.  It never returns.
///
/// # Safety
///
/// `entry` must be the address of code that is fully loaded, takes no
/// arguments and never returns, and interrupts must be disabled.  Nothing
/// the caller owns is dropped: memory the bootloader used is simply
/// abandoned.
pub unsafe fn jump(entry: u32) -> ! {
    let entry: extern "C" fn() -> ! = core::mem::transmute(entry as usize);
    entry()
}

#[cfg(feature = "cortex-m")]
pub use self::cortex::CortexM;

#[cfg(feature = "cortex-m")]
mod cortex {
    use core::ops::Range;

    use super::{Platform, Reset};

    /// A Cortex-M part running the image out of RAM.
    pub struct CortexM {
        /// Memory that images may be loaded into.  The bootloader itself
        /// must run from elsewhere.
        pub ram: Range<u32>,
        pub vector_base: u32,
    }

    impl Reset for CortexM {
        fn reset(&mut self) -> ! {
            cortex_m::peripheral::SCB::sys_reset()
        }
    }

    impl Platform for CortexM {
        fn vector_base(&self) -> u32 {
            self.vector_base
        }

        fn is_loadable(&self, dest: u32, len: usize) -> bool {
            let end = dest as u64 + len as u64;
            dest >= self.ram.start && end <= self.ram.end as u64
        }

        fn is_direct(&self, dest: u32, len: usize) -> bool {
            self.is_loadable(dest, len)
        }

        unsafe fn memory(&mut self, dest: u32, len: usize) -> &mut [u8] {
            core::slice::from_raw_parts_mut(dest as usize as *mut u8, len)
        }

        fn disable_interrupts(&mut self) {
            cortex_m::interrupt::disable();
        }

        fn flush_icache(&mut self) {
            cortex_m::asm::dsb();
            cortex_m::asm::isb();
        }

        unsafe fn jump(&mut self, entry: u32) -> ! {
            // Thumb state.
            super::jump(entry | 1)
        }
    }
}
