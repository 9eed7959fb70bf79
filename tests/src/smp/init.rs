//! SMP Initialization Tests

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use nexa_smp::smp::{BringupPhase, IPI_VECTOR};

    use crate::mock::MachineBuilder;

    #[test]
    fn test_smp_init_performs_bringup() {
        let board = MachineBuilder::new(&[0, 1, 2, 3]).build();
        let smp = board.smp();

        smp.smp_init();

        assert_eq!(smp.bringup_phase(), BringupPhase::Complete);
        assert_eq!(smp.cpu_count(), 4);
        assert_eq!(smp.online_cpus(), 4);
        assert_eq!(board.machine().installed_vectors(), vec![IPI_VECTOR]);
        assert_eq!(IPI_VECTOR, 0x20);
    }

    #[test]
    fn test_smp_init_after_ap_init_skips_bringup() {
        let board = MachineBuilder::new(&[0, 1]).build();
        let smp = board.smp();
        smp.ap_init();
        let startups = board.machine().icr_log().len();

        smp.smp_init();

        // only the identity-setup IPI was added
        assert_eq!(board.machine().icr_log().len(), startups + 1);
        assert_eq!(board.machine().fixed_targets(), vec![1]);
    }

    #[test]
    fn test_smp_ids_dense_and_distinct() {
        let board = MachineBuilder::new(&[8, 3, 12, 5, 1]).build();
        let smp = board.smp();
        smp.smp_init();

        assert_eq!(smp.smp_id(), 0, "boot CPU is logical 0");

        let seen = Mutex::new(Vec::new());
        for cpu in 0..smp.cpu_count() {
            smp.on_cpu(cpu, &|| seen.lock().unwrap().push((cpu, smp.smp_id())));
        }
        for (cpu, id) in seen.into_inner().unwrap() {
            assert_eq!(cpu, id);
        }

        for cpu in 0..5 {
            let stamped = board.machine().local_index(cpu);
            let apic_id = board.machine().apic_id(cpu);
            assert_eq!(smp.hardware_id(stamped), Some(apic_id));
        }
    }

    #[test]
    fn test_cpus_active_baseline() {
        let board = MachineBuilder::new(&[0, 1, 2]).build();
        let smp = board.smp();
        assert_eq!(smp.cpus_active(), 0);

        smp.smp_init();
        assert_eq!(smp.cpus_active(), 1);

        smp.smp_init();
        smp.smp_init();
        assert_eq!(smp.cpus_active(), 1, "baseline is counted once");
    }

    #[test]
    fn test_uniprocessor_init() {
        let board = MachineBuilder::new(&[0]).build();
        let smp = board.smp();
        smp.smp_init();

        assert_eq!(smp.smp_id(), 0);
        assert_eq!(smp.cpus_active(), 1);
        assert!(board.machine().fixed_targets().is_empty());
    }

    // =========================================================================
    // smp_reset_apic
    // =========================================================================

    #[test]
    fn test_reset_apic_reaches_every_cpu() {
        let board = MachineBuilder::new(&[0, 1, 2, 3]).build();
        let smp = board.smp();
        smp.smp_init();
        assert_eq!(smp.cpu_count(), 4);

        for _ in 0..3 {
            smp.smp_reset_apic();
            assert_eq!(smp.cpu_count(), 4);
            assert_eq!(smp.cpus_active(), 1);
        }

        for cpu in 0..4 {
            assert_eq!(board.machine().resets(cpu), 3, "CPU {cpu}");
        }
    }

    #[test]
    fn test_reset_apic_before_bringup() {
        let board = MachineBuilder::new(&[6, 1, 2, 3]).build();
        let smp = board.smp();

        smp.smp_reset_apic();
        smp.smp_reset_apic();

        assert_eq!(board.machine().resets(0), 2);
        for cpu in 1..4 {
            assert_eq!(board.machine().resets(cpu), 0, "CPU {cpu} is still in reset");
        }
        assert!(board.machine().icr_log().is_empty());
        assert_eq!(smp.cpu_count(), 1);
        assert_eq!(smp.cpus_active(), 1);
        assert_eq!(smp.hardware_id(0), Some(6));
        assert_eq!(smp.smp_id(), 0);
    }

    #[test]
    fn test_smp_init_after_early_reset() {
        let board = MachineBuilder::new(&[6, 1, 2, 3]).build();
        let smp = board.smp();
        smp.smp_reset_apic();

        smp.smp_init();

        assert_eq!(smp.bringup_phase(), BringupPhase::Complete);
        assert_eq!(smp.online_cpus(), 4);
        assert_eq!(smp.hardware_id(0), Some(6));
        assert_eq!(smp.cpus_active(), 1);
    }
}
