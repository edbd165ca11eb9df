//! Trap handling.
//!
//! The startup code installs tiny assembly stubs that push the register
//! state as a [`TrapRegs`] and call [`interrupt`]; on return they restore
//! from the same frame, so a handler can steer execution by editing `ip`.
//!
//! Almost every trap is fatal. The exceptions are the two narrow
//! recoveries the engine relies on: an NMI aimed at a core parked on a
//! halt (the barrier wakeup path), and a general protection fault right
//! after a rdmsr of an absent MSR, which yields zero.

use engine::Testword;

const INT_NMI: u64 = 2;
const INT_GPF: u64 = 13;
const INT_PAGEFLT: u64 = 14;

const OPCODE_HLT: u8 = 0xf4;
const OPCODE_RDMSR: u16 = 0x320f;

static TRAP_NAMES: [&str; 20] = [
    "Divide by 0",
    "Debug",
    "NMI",
    "Breakpoint",
    "Overflow",
    "Bounds",
    "Invalid Op",
    "No FPU",
    "Double fault",
    "Seg overrun",
    "Invalid TSS",
    "Seg fault",
    "Stack fault",
    "Gen prot.",
    "Page fault",
    "Reserved",
    "FPU error",
    "Alignment",
    "Machine chk",
    "SIMD FPE",
];

/// The register frame pushed by the interrupt stubs.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapRegs {
    pub ds: u64,
    pub es: u64,
    pub ss: u64,
    pub ax: u64,
    pub bx: u64,
    pub cx: u64,
    pub dx: u64,
    pub di: u64,
    pub si: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub bp: u64,
    pub vect: u64,
    pub code: u64,
    pub ip: u64,
    pub cs: u64,
    pub flags: u64,
    pub sp: u64,
}

/// The common trap entry point.
///
/// # Safety
///
/// Must only be called by the interrupt stubs, with a frame that will be
/// restored on return.
#[no_mangle]
pub unsafe extern "C" fn interrupt(regs: &mut TrapRegs) {
    if regs.vect == INT_NMI {
        let pc = regs.ip as *const u8;
        if pc.sub(1).read() == OPCODE_HLT {
            // A barrier wakeup signal sent while this core was halted.
            return;
        }
        // The rare case that the core had not yet reached its halt when
        // the wakeup arrived: the barrier re-checks its generation in a
        // loop, so skipping the halt opcode is enough to resume it.
        if pc.read() == OPCODE_HLT {
            regs.ip += 1;
            return;
        }
        // Anything else on the NMI line is a parity error.
        if let Some(engine) = crate::shim::engine() {
            engine.parity_error();
        }
        return;
    }

    // A GPF right after a rdmsr means the MSR does not exist on this
    // part; report it as zero and continue.
    if regs.vect == INT_GPF {
        let pc = regs.ip as *const u16;
        if pc.read_unaligned() == OPCODE_RDMSR {
            regs.ip += 2;
            regs.ax = 0;
            regs.dx = 0;
            return;
        }
    }

    let fault_addr = if regs.vect == INT_PAGEFLT { page_fault_address() } else { 0 };

    let name = TRAP_NAMES.get(regs.vect as usize).unwrap_or(&"Unknown");
    log::error!("unexpected interrupt: {} (vector {})", name, regs.vect);
    log::error!("  ip: {:016x}  cs: {:04x}  flags: {:08x}  code: {:x}", regs.ip, regs.cs, regs.flags, regs.code);
    log::error!("  ax: {:016x}  bx: {:016x}  cx: {:016x}  dx: {:016x}", regs.ax, regs.bx, regs.cx, regs.dx);
    log::error!("  di: {:016x}  si: {:016x}  bp: {:016x}  sp: {:016x}", regs.di, regs.si, regs.bp, regs.sp);
    log::error!("  r8: {:016x}  r9: {:016x} r10: {:016x} r11: {:016x}", regs.r8, regs.r9, regs.r10, regs.r11);
    if regs.vect == INT_PAGEFLT {
        log::error!("  fault address: {:016x}", fault_addr);
    }

    // Dump the top of the stack and the faulting code bytes.
    for i in 0..6 {
        let addr = regs.sp + 8 * (5 - i);
        let value = (addr as *const Testword).read_volatile();
        log::error!("  stack {:012x}: {:016x}", addr, value);
    }

    crate::hwctrl::reboot();
}

fn page_fault_address() -> u64 {
    #[cfg(target_arch = "x86_64")]
    return x86_64::registers::control::Cr2::read().as_u64();

    #[allow(unreachable_code)]
    0
}
