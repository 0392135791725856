use clap::Parser as ClapParser;
use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use heap::{Collector, ConcurrentPhase, GcResult, Heap, HeapSettings, RootSet};
use object::ClassTable;

mod workload;

use workload::{ROOT_SLOTS, Workload, WorkloadClasses};

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Drive the region collector with a synthetic workload", long_about = None)]
struct Cli {
    /// Heap size in megabytes
    #[arg(long, default_value_t = 64)]
    heap_mb: usize,

    /// Region size in kilobytes
    #[arg(long, default_value_t = 256)]
    region_kb: usize,

    /// Collector threads used in pauses
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Mutator cycles, each ending in a global collection
    #[arg(long, default_value_t = 8)]
    cycles: usize,

    /// Objects allocated per cycle
    #[arg(long, default_value_t = 200_000)]
    objects_per_cycle: usize,

    /// Fraction of allocated nodes kept reachable
    #[arg(long, default_value_t = 0.05)]
    survival: f64,

    /// Trace concurrently on a helper thread while the mutator runs
    #[arg(long)]
    concurrent: bool,

    /// Compact only until this many live kilobytes were moved
    #[arg(long)]
    work_goal_kb: Option<usize>,

    /// Verify the heap after every collection
    #[arg(long)]
    verify: bool,
}

impl Cli {
    fn settings(&self) -> HeapSettings {
        HeapSettings {
            heap_size: self.heap_mb * 1024 * 1024,
            region_size: self.region_kb * 1024,
            gc_threads: self.threads,
            ..HeapSettings::default()
        }
    }
}

/// Concurrent tracing budget per step, in bytes.
const CONCURRENT_STEP_BYTES: usize = 64 * 1024;

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(err) = run(&cli) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> GcResult<()> {
    let mut table = ClassTable::new();
    let classes = WorkloadClasses::register(&mut table);
    let heap = Arc::new(Heap::new(cli.settings(), table)?);
    let roots = Arc::new(RootSet::new(ROOT_SLOTS));
    let collector = Collector::new(heap.clone(), roots.clone());
    let mut workload = Workload::new(heap.clone(), roots, classes, cli.survival);
    log::info!("{heap:?}");

    for cycle in 0..cli.cycles {
        let report = if cli.concurrent {
            run_concurrent(&collector, &mut workload, cli.objects_per_cycle)?
        } else {
            let report = workload.run_cycle(&collector, cli.objects_per_cycle)?;
            match cli.work_goal_kb {
                Some(goal) => {
                    collector.run_compact(Some(goal * 1024))?;
                }
                None => {
                    collector.run_global_collection();
                }
            }
            report
        };
        println!(
            "cycle {cycle}: {} allocated, {} retained, {} scavenges ({} backed out), {} finalized, {} references enqueued",
            report.allocated,
            report.retained,
            report.scavenges,
            report.backouts,
            report.finalized,
            report.references_enqueued
        );

        if cli.verify {
            match collector.verify_heap() {
                Ok(summary) => log::info!("heap verified: {summary:?}"),
                Err(err) => {
                    eprintln!("Heap verification failed after cycle {cycle}: {err}");
                    process::exit(2);
                }
            }
        }
    }

    println!("{:#?}", heap.stats().snapshot());
    for group in 0..heap.settings().compact_group_count() {
        println!(
            "compact group {group}: weighted survival rate {:.3}",
            collector.weighted_survival_rate(group)
        );
    }
    Ok(())
}

/// Runs one mutator cycle with a helper thread tracing concurrently, then
/// the final pause.
fn run_concurrent(
    collector: &Collector,
    workload: &mut Workload,
    objects: usize,
) -> GcResult<workload::CycleReport> {
    let done = AtomicBool::new(false);
    let report = thread::scope(|s| {
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                match collector.run_concurrent_cycle_step(CONCURRENT_STEP_BYTES) {
                    ConcurrentPhase::Complete | ConcurrentPhase::Halted => break,
                    _ => thread::yield_now(),
                }
            }
        });
        let report = workload.run_cycle(collector, objects);
        done.store(true, Ordering::Release);
        report
    })?;

    let phase = collector.concurrent().phase();
    let summary = collector.complete_concurrent_cycle();
    log::info!(
        "final pause after {phase:?}: {} bytes marked, {} regions freed",
        summary.marked_bytes,
        summary.sweep.regions_freed + summary.compact.as_ref().map_or(0, |c| c.regions_freed)
    );
    Ok(report)
}
