//! Hardware reset.

#[cfg(target_arch = "x86_64")]
use x86::io::{inb, outb};

/// Resets the platform: first via the ACPI reset port, then via the
/// keyboard controller, then gives up and halts.
pub fn reboot() -> ! {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        // PCI reset control register.
        outb(0xcf9, 0x02);
        outb(0xcf9, 0x06);

        // Keyboard controller pulse reset line.
        for _ in 0..10 {
            while inb(0x64) & 0x02 != 0 {
                core::hint::spin_loop();
            }
            outb(0x64, 0xfe);
        }
    }

    loop {
        #[cfg(target_arch = "x86_64")]
        x86_64::instructions::hlt();
        #[cfg(not(target_arch = "x86_64"))]
        core::hint::spin_loop();
    }
}
