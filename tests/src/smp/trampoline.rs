//! Trampoline Page Tests

#[cfg(test)]
mod tests {
    use nexa_smp::smp::trampoline::{
        call_gate_descriptor, CODE64_SELECTOR, FOOTER_OFFSET, FOOTER_SIZE, GATE_GDT_BYTES,
        GATE_GDT_OFFSET, GATE_SELECTOR, TRAMPOLINE_MAGIC,
    };
    use nexa_smp::smp::{
        build_page, CallGateBridge, DirectBridge, EntryBridge, TrampolineError, TrampolineKind,
        TrampolineSource, TRAMPOLINE_PAGE_SIZE,
    };
    use x86_64::structures::gdt::DescriptorFlags;

    static IMAGE: [u8; 200] = {
        let mut image = [0u8; 200];
        let mut i = 0;
        while i < image.len() {
            image[i] = (i as u8).wrapping_mul(7) | 1;
            i += 1;
        }
        image
    };

    static HUGE: [u8; TRAMPOLINE_PAGE_SIZE] = [0x90; TRAMPOLINE_PAGE_SIZE];

    fn source(image: &'static [u8], entry: u64) -> TrampolineSource {
        TrampolineSource {
            image,
            entry,
            page_table: 0x0010_0000,
            stack_base: 0x0040_0000,
            stack_size: 0x4000,
        }
    }

    fn read_u64(bytes: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    }

    // =========================================================================
    // Layout
    // =========================================================================

    #[test]
    fn test_footer_sits_at_page_end() {
        assert_eq!(FOOTER_SIZE, 48);
        assert_eq!(FOOTER_OFFSET + FOOTER_SIZE, TRAMPOLINE_PAGE_SIZE);
        assert_eq!(GATE_GDT_OFFSET % 16, 0);
        assert!(GATE_GDT_OFFSET + GATE_GDT_BYTES <= FOOTER_OFFSET);
    }

    #[test]
    fn test_direct_page_contents() {
        let page = build_page(&source(&IMAGE, 0x0010_2000), &DirectBridge).unwrap();
        let bytes = page.as_bytes();

        assert_eq!(bytes.len(), TRAMPOLINE_PAGE_SIZE);
        assert_eq!(&bytes[..IMAGE.len()], &IMAGE[..]);
        assert!(
            bytes[IMAGE.len()..FOOTER_OFFSET].iter().all(|&b| b == 0),
            "nothing but zeroes between image and footer"
        );

        let footer = page.footer().expect("footer magic");
        assert_eq!(footer.magic, TRAMPOLINE_MAGIC);
        assert_eq!(footer.kind(), Some(TrampolineKind::Direct));
        assert_eq!(footer.entry, 0x0010_2000);
        assert_eq!(footer.page_table, 0x0010_0000);
        assert_eq!(footer.stack_base, 0x0040_0000);
        assert_eq!(footer.stack_size, 0x4000);
        assert_eq!(footer.gdt_offset, 0);
        assert_eq!(footer.gate_selector, 0);
    }

    #[test]
    fn test_magic_is_sipi() {
        let page = build_page(&source(&IMAGE, 0x1000), &DirectBridge).unwrap();
        assert_eq!(&page.as_bytes()[FOOTER_OFFSET..FOOTER_OFFSET + 4], b"SIPI");
    }

    // =========================================================================
    // Call-gate bridge
    // =========================================================================

    #[test]
    fn test_call_gate_gdt() {
        let entry = 0xFFFF_8000_0012_3456;
        let page = build_page(&source(&IMAGE, entry), &CallGateBridge).unwrap();
        let bytes = page.as_bytes();
        let gdt = GATE_GDT_OFFSET;

        assert_eq!(read_u64(bytes, gdt), 0);
        assert_eq!(read_u64(bytes, gdt + 8), DescriptorFlags::KERNEL_CODE32.bits());
        assert_eq!(read_u64(bytes, gdt + 16), DescriptorFlags::KERNEL_DATA.bits());
        assert_eq!(read_u64(bytes, gdt + 24), DescriptorFlags::KERNEL_CODE64.bits());

        let [low, high] = call_gate_descriptor(entry, CODE64_SELECTOR);
        assert_eq!(read_u64(bytes, gdt + 32), low);
        assert_eq!(read_u64(bytes, gdt + 40), high);

        let footer = page.footer().unwrap();
        assert_eq!(footer.kind(), Some(TrampolineKind::CallGate));
        assert_eq!(footer.gdt_offset as usize, GATE_GDT_OFFSET);
        assert_eq!(footer.gdt_limit as usize, GATE_GDT_BYTES - 1);
        assert_eq!(footer.gate_selector, GATE_SELECTOR);
        assert_eq!(GATE_SELECTOR as usize, 4 * 8);
    }

    #[test]
    fn test_call_gate_descriptor_encoding() {
        let target = 0xFFFF_8000_ABCD_1234u64;
        let [low, high] = call_gate_descriptor(target, CODE64_SELECTOR);

        assert_eq!(low & 0xFFFF, 0x1234, "offset 15:0");
        assert_eq!((low >> 48) & 0xFFFF, 0xABCD, "offset 31:16");
        assert_eq!(high, 0xFFFF_8000, "offset 63:32");
        assert_eq!((low >> 16) & 0xFFFF, u64::from(CODE64_SELECTOR));
        assert_eq!((low >> 40) & 0xF, 0xC, "64-bit call gate type");
        assert_eq!((low >> 45) & 0b11, 0, "DPL 0");
        assert_eq!((low >> 47) & 1, 1, "present");
    }

    #[test]
    fn test_call_gate_reaches_high_entry() {
        // the direct bridge would reject this entry
        let entry = 0xFFFF_FFFF_8000_0000;
        assert!(build_page(&source(&IMAGE, entry), &CallGateBridge).is_ok());
    }

    // =========================================================================
    // Rejections
    // =========================================================================

    #[test]
    fn test_direct_rejects_entry_above_4g() {
        let err = build_page(&source(&IMAGE, 0x1_0000_0000), &DirectBridge)
            .err()
            .unwrap();
        assert_eq!(err, TrampolineError::EntryUnreachable { entry: 0x1_0000_0000 });
    }

    #[test]
    fn test_oversized_image_rejected() {
        for bridge in [&DirectBridge as &dyn EntryBridge, &CallGateBridge] {
            let err = build_page(&source(&HUGE, 0x1000), bridge).err().unwrap();
            assert_eq!(
                err,
                TrampolineError::ImageTooLarge {
                    image: TRAMPOLINE_PAGE_SIZE,
                    capacity: bridge.image_capacity(),
                }
            );
        }
    }

    #[test]
    fn test_capacity_boundary() {
        static EXACT: [u8; 3984] = [0xCC; 3984];
        assert_eq!(DirectBridge.image_capacity(), EXACT.len());
        assert!(build_page(&source(&EXACT, 0x1000), &DirectBridge).is_ok());
        assert!(build_page(&source(&EXACT, 0x1000), &CallGateBridge).is_err());
    }

    #[test]
    fn test_empty_image_rejected() {
        static EMPTY: [u8; 0] = [];
        let err = build_page(&source(&EMPTY, 0x1000), &DirectBridge).err().unwrap();
        assert_eq!(err, TrampolineError::EmptyImage);
        assert_eq!(err.to_string(), "trampoline image is empty");
    }

    #[test]
    fn test_kind_selects_bridge() {
        assert_eq!(TrampolineKind::Direct.bridge().kind(), TrampolineKind::Direct);
        assert_eq!(TrampolineKind::CallGate.bridge().kind(), TrampolineKind::CallGate);
    }
}
