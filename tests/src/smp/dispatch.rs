//! Remote-call Dispatch Tests
//!
//! Every test boots a simulated board through `smp_init` first so the
//! remote-call vector is routed and the quiescent baseline is set.

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use nexa_smp::smp::{Platform, Smp};

    use crate::mock::{MachineBuilder, SimBoard, SimPlatform};

    const SETTLE: Duration = Duration::from_secs(5);

    fn ready_board(apic_ids: &[u32]) -> SimBoard {
        let board = MachineBuilder::new(apic_ids).build();
        board.smp().smp_init();
        board
    }

    fn fixed_sent(board: &SimBoard) -> usize {
        board.machine().fixed_targets().len()
    }

    // =========================================================================
    // on_cpu
    // =========================================================================

    #[test]
    fn test_on_cpu_runs_on_target() {
        let board = ready_board(&[0, 1, 2, 3]);
        let smp = board.smp();
        let counter = AtomicUsize::new(5);
        let ran_on = AtomicUsize::new(usize::MAX);

        smp.on_cpu(2, &|| {
            counter.fetch_add(1, Ordering::SeqCst);
            ran_on.store(smp.smp_id(), Ordering::SeqCst);
        });

        // synchronous: visible as soon as on_cpu returns
        assert_eq!(counter.load(Ordering::SeqCst), 6);
        assert_eq!(ran_on.load(Ordering::SeqCst), 2);
        assert_eq!(smp.cpus_active(), 1);
        assert_eq!(
            board.machine().fixed_targets().last().copied(),
            smp.hardware_id(2)
        );
    }

    #[test]
    fn test_on_cpu_self_target_runs_inline() {
        let board = ready_board(&[0, 1, 2]);
        let smp = board.smp();
        let before = fixed_sent(&board);
        let local_before = smp.remote_call_stats().local_calls;
        let ran_on = AtomicUsize::new(usize::MAX);

        smp.on_cpu(0, &|| ran_on.store(smp.smp_id(), Ordering::SeqCst));

        assert_eq!(ran_on.load(Ordering::SeqCst), 0);
        assert_eq!(fixed_sent(&board), before, "no IPI for a self-targeted call");
        assert_eq!(smp.remote_call_stats().local_calls, local_before + 1);
    }

    #[test]
    fn test_sync_call_acknowledged_after_it_returns() {
        let board = ready_board(&[0, 1, 2]);
        let smp = board.smp();
        let machine = board.machine();
        let before = machine.eoi_count(2);
        let during = AtomicUsize::new(usize::MAX);

        smp.on_cpu(2, &|| during.store(machine.eoi_count(2), Ordering::SeqCst));

        assert_eq!(during.load(Ordering::SeqCst), before, "EOI while still running");
        assert!(board.wait_until(SETTLE, || machine.eoi_count(2) == before + 1));
    }

    #[test]
    fn test_self_target_before_bringup() {
        let board = MachineBuilder::new(&[4, 1, 2]).build();
        let smp = board.smp();
        let calls = AtomicUsize::new(0);

        smp.on_cpu(0, &|| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        smp.on_cpus(&|| {
            calls.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(board.machine().icr_log().is_empty());
        assert_eq!(smp.hardware_id(0), Some(4));
        assert_eq!(smp.remote_call_stats().local_calls, 1);
    }

    #[test]
    fn test_on_cpu_unregistered_target_panics() {
        let board = ready_board(&[0, 1]);
        let before = fixed_sent(&board);

        let result = panic::catch_unwind(AssertUnwindSafe(|| board.smp().on_cpu(7, &|| {})));
        assert!(result.is_err());
        assert_eq!(fixed_sent(&board), before);
    }

    // =========================================================================
    // on_cpu_async
    // =========================================================================

    #[test]
    fn test_on_cpu_async_completes_eventually() {
        let board = ready_board(&[0, 1, 2]);
        let smp = board.smp();
        let hits = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&hits);
        let func = &*Box::leak(Box::new(move || {
            if smp.smp_id() == 1 {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));
        smp.on_cpu_async(1, func);

        assert!(board.wait_until(SETTLE, || hits.load(Ordering::SeqCst) == 1));
        assert!(board.wait_until(SETTLE, || smp.cpus_active() == 1));
        assert_eq!(smp.remote_call_stats().async_sent, 1);
    }

    #[test]
    fn test_async_acknowledged_before_callee_runs() {
        let board = ready_board(&[0, 1, 2]);
        let smp = board.smp();
        let release = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let (gate, done) = (Arc::clone(&release), Arc::clone(&finished));
        let func = &*Box::leak(Box::new(move || {
            while !gate.load(Ordering::SeqCst) {
                smp.platform().relax();
            }
            done.store(true, Ordering::SeqCst);
        }));

        let eoi_before = board.machine().eoi_count(1);
        smp.on_cpu_async(1, func);

        // returned while the callee is still blocked
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(smp.cpus_active(), 2);
        assert!(board.wait_until(SETTLE, || {
            board.machine().eoi_count(1) == eoi_before + 1
        }));
        assert!(!finished.load(Ordering::SeqCst), "acknowledged only after running");

        release.store(true, Ordering::SeqCst);
        assert!(board.wait_until(SETTLE, || finished.load(Ordering::SeqCst)));
        assert!(board.wait_until(SETTLE, || smp.cpus_active() == 1));
    }

    // =========================================================================
    // on_cpus
    // =========================================================================

    #[test]
    fn test_on_cpus_skips_caller() {
        let board = ready_board(&[0, 3, 6, 9]);
        let smp = board.smp();
        let per_cpu: Vec<AtomicUsize> = (0..4).map(|_| AtomicUsize::new(0)).collect();

        smp.on_cpus(&|| {
            per_cpu[smp.smp_id()].fetch_add(1, Ordering::SeqCst);
        });

        let counts: Vec<usize> = per_cpu.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(counts, vec![0, 1, 1, 1]);
        assert_eq!(smp.cpus_active(), 1);
    }

    #[test]
    fn test_on_cpus_dispatches_highest_index_first() {
        let board = ready_board(&[0, 3, 6, 9]);
        let smp = board.smp();
        let before = fixed_sent(&board);

        smp.on_cpus(&|| {});

        let targets = board.machine().fixed_targets()[before..].to_vec();
        let expected: Vec<u32> = (1..4)
            .rev()
            .map(|cpu| smp.hardware_id(cpu).unwrap())
            .collect();
        assert_eq!(targets, expected);
    }

    #[test]
    fn test_on_cpus_uniprocessor_is_noop() {
        let board = ready_board(&[0]);
        let calls = AtomicUsize::new(0);

        board.smp().on_cpus(&|| {
            calls.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(board.smp().cpus_active(), 1);
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    fn leak_hammer(
        smp: &'static Smp<SimPlatform>,
        counter: &Arc<AtomicUsize>,
        rounds: usize,
    ) -> &'static (impl Fn() + Sync) {
        let counter = Arc::clone(counter);
        &*Box::leak(Box::new(move || {
            for _ in 0..rounds {
                smp.on_cpu(3, &|| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }))
    }

    #[test]
    fn test_concurrent_initiators_serialize() {
        let board = ready_board(&[0, 1, 2, 3]);
        let smp = board.smp();
        let counter = Arc::new(AtomicUsize::new(0));

        let from_cpu1 = leak_hammer(smp, &counter, 50);
        let from_cpu2 = leak_hammer(smp, &counter, 50);
        smp.on_cpu_async(1, from_cpu1);
        smp.on_cpu_async(2, from_cpu2);

        for _ in 0..50 {
            smp.on_cpu(3, &|| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(board.wait_until(SETTLE, || counter.load(Ordering::SeqCst) == 150));
        assert!(board.wait_until(SETTLE, || smp.cpus_active() == 1));
        assert_eq!(
            board.machine().overlapping_fixed_ipis(),
            0,
            "a fixed IPI went out while another was undelivered"
        );
    }

    #[test]
    fn test_results_collected_from_every_cpu() {
        let board = ready_board(&[0, 1, 2, 3, 4, 5]);
        let smp = board.smp();
        let ids = Mutex::new(Vec::new());

        for cpu in 0..smp.cpu_count() {
            smp.on_cpu(cpu, &|| ids.lock().unwrap().push(smp.smp_id()));
        }

        let mut ids = ids.into_inner().unwrap();
        ids.sort_unstable();
        assert_eq!(ids, (0..6).collect::<Vec<_>>());
    }

    // =========================================================================
    // Interrupt acknowledgement and counters
    // =========================================================================

    #[test]
    fn test_every_handled_ipi_acknowledged() {
        let board = ready_board(&[0, 1, 2]);
        let smp = board.smp();

        for _ in 0..4 {
            smp.on_cpus(&|| {});
            smp.on_cpu(1, &|| {});
        }

        // smp_init + on_cpus + on_cpu
        let machine = board.machine();
        assert!(board.wait_until(SETTLE, || {
            machine.handled(1) == 1 + 4 + 4 && machine.handled(2) == 1 + 4
        }));
        for cpu in 1..3 {
            assert_eq!(machine.eoi_count(cpu), machine.handled(cpu));
        }
        assert_eq!(machine.eoi_count(0), 0);
    }

    #[test]
    fn test_remote_call_stats() {
        let board = ready_board(&[0, 1, 2]);
        let smp = board.smp();
        let base = smp.remote_call_stats();

        smp.on_cpu(1, &|| {});
        smp.on_cpu(0, &|| {});
        smp.on_cpus(&|| {});

        assert!(board.wait_until(SETTLE, || {
            smp.remote_call_stats().handled == base.handled + 3
        }));
        let stats = smp.remote_call_stats();
        assert_eq!(stats.sync_sent, base.sync_sent + 1);
        assert_eq!(stats.async_sent, base.async_sent + 2);
        assert_eq!(stats.local_calls, base.local_calls + 1);
        assert_eq!(stats.spurious, 0);
    }

    #[test]
    fn test_spurious_ipi_is_acknowledged() {
        let board = ready_board(&[0, 1]);
        let smp = board.smp();
        let eoi_before = board.machine().eoi_count(0);

        smp.handle_ipi();

        assert_eq!(smp.remote_call_stats().spurious, 1);
        assert_eq!(board.machine().eoi_count(0), eoi_before + 1);
        assert_eq!(smp.cpus_active(), 1);
    }
}
