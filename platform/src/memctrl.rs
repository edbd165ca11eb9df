//! Machine-check bank polling for ECC events.
//!
//! The memory controller logs corrected and uncorrected ECC events in the
//! IA32_MCi status banks. The master polls these between progress ticks
//! when ECC polling is enabled and feeds hits to the error reporter.

use bitfield::bitfield;
use engine::system::EccStatus;

const IA32_MCG_CAP: u32 = 0x179;
const IA32_MC0_STATUS: u32 = 0x401;
const IA32_MC0_ADDR: u32 = 0x402;
const MSRS_PER_BANK: u32 = 4;

bitfield! {
    /// IA32_MCi_STATUS layout.
    pub struct McBankStatus(u64);
    impl Debug;
    pub valid, _: 63;
    pub overflow, _: 62;
    pub uncorrected, _: 61;
    pub enabled, _: 60;
    pub misc_valid, _: 59;
    pub addr_valid, _: 58;
    pub u16, corrected_count, _: 52, 38;
    pub u16, model_code, _: 31, 16;
    pub u16, mca_code, _: 15, 0;
}

/// Scans the machine-check banks for a logged ECC event, clearing the
/// bank it came from. Relies on the GPF-after-rdmsr recovery for parts
/// with fewer banks than advertised.
///
/// # Safety
///
/// Ring 0 only.
#[cfg(target_arch = "x86_64")]
pub unsafe fn poll() -> Option<EccStatus> {
    use x86::msr::{rdmsr, wrmsr};

    let bank_count = (rdmsr(IA32_MCG_CAP) & 0xff) as u32;

    for bank in 0..bank_count {
        let status_msr = IA32_MC0_STATUS + bank * MSRS_PER_BANK;
        let status = McBankStatus(rdmsr(status_msr));
        if !status.valid() || !status.addr_valid() {
            continue;
        }

        let addr = rdmsr(IA32_MC0_ADDR + bank * MSRS_PER_BANK) as usize;
        wrmsr(status_msr, 0);

        return Some(EccStatus {
            addr,
            count: status.corrected_count().max(1) as u64,
            core: 0,
            channel: bank as usize,
            correctable: !status.uncorrected(),
        });
    }

    None
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn poll() -> Option<EccStatus> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_fields_decode() {
        // valid + addr_valid + corrected count of 3.
        let raw = (1u64 << 63) | (1 << 58) | (3 << 38) | 0x009f;
        let status = McBankStatus(raw);

        assert!(status.valid());
        assert!(status.addr_valid());
        assert!(!status.uncorrected());
        assert_eq!(status.corrected_count(), 3);
        assert_eq!(status.mca_code(), 0x9f);
    }
}
