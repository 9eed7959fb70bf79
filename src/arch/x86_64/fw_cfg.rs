//! QEMU fw_cfg legacy I/O interface, just enough to read the CPU count.

use x86_64::instructions::port::Port;

const FW_CFG_SELECTOR: u16 = 0x510;
const FW_CFG_DATA: u16 = 0x511;

const FW_CFG_NB_CPUS: u16 = 0x05;

/// Number of CPUs the VM was started with, read little-endian.
pub fn cpu_count() -> u16 {
    let mut selector: Port<u16> = Port::new(FW_CFG_SELECTOR);
    let mut data: Port<u8> = Port::new(FW_CFG_DATA);

    // SAFETY: fw_cfg ports are side-effect free apart from the item cursor.
    unsafe {
        selector.write(FW_CFG_NB_CPUS);
        let low = data.read();
        let high = data.read();
        u16::from_le_bytes([low, high])
    }
}
