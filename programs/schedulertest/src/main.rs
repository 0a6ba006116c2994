//! Exercises the two alternative scheduling policies on CPU-bound
//! workloads: fair (vruntime) decision checking and fairness spread, then
//! FCFS completion order.

use marrow_kernel::system::{SystemParams, SystemState};
use marrow_kernel::threading::scheduling::{FairScheduler, FcfsScheduler};
use marrow_kernel::user_program::{Program, Syscall, UserOp};
use std::collections::BTreeMap;
use std::process::ExitCode;

fn cpu_bound(nops: usize) -> Program {
    let mut ops = vec![UserOp::Nop; nops];
    ops.push(UserOp::Syscall(Syscall::Exit(0)));
    Program::new(ops)
}

fn fair_test() -> bool {
    let sys = SystemState::new(SystemParams { phys_frames: 64 });
    sys.set_scheduler(Box::new(FairScheduler::new(sys.console.clone())));

    let mut pids = Vec::new();
    for name in ["/cpu0", "/cpu1", "/cpu2"] {
        let program = cpu_bound(1000);
        let image = program.default_image(0);
        sys.install_program(name, &image, program).unwrap();
        pids.push(sys.spawn(name, &[]).unwrap());
    }
    sys.run();

    for &pid in &pids {
        if sys.exit_code(pid) != Some(0) {
            println!("fair: pid {pid} did not exit cleanly");
            return false;
        }
    }

    // Replay the decision log: the chosen pid must always carry the lowest
    // vruntime of its snapshot (ties by pid), and with equal nice values the
    // dispatch counts must stay close.
    let mut candidates: Vec<(u64, u16)> = Vec::new();
    let mut dispatches: BTreeMap<u16, usize> = BTreeMap::new();
    for line in sys.console.lines() {
        if line.starts_with("[Scheduler Tick]") {
            candidates.clear();
        } else if let Some(rest) = line.strip_prefix("PID: ") {
            let mut parts = rest.split(" | ");
            let pid: u16 = parts.next().unwrap().trim().parse().unwrap();
            let vruntime: u64 = parts
                .next()
                .unwrap()
                .strip_prefix("vRuntime: ")
                .unwrap()
                .parse()
                .unwrap();
            candidates.push((vruntime, pid));
        } else if let Some(rest) = line.strip_prefix("--> Scheduling PID ") {
            let chosen: u16 = rest.split_whitespace().next().unwrap().parse().unwrap();
            let Some(&best) = candidates.iter().min() else {
                println!("fair: decision without candidate snapshot");
                return false;
            };
            if chosen != best.1 {
                println!(
                    "fair: chose pid {chosen} but pid {} had the lowest vruntime {}",
                    best.1, best.0
                );
                return false;
            }
            *dispatches.entry(chosen).or_default() += 1;
        }
    }

    let counts: Vec<usize> = pids
        .iter()
        .map(|p| dispatches.get(p).copied().unwrap_or(0))
        .collect();
    println!("fair: dispatch counts per pid: {counts:?}");
    let min = counts.iter().min().unwrap();
    let max = counts.iter().max().unwrap();
    if max - min > 1 {
        println!("fair: dispatch spread {min}..{max} exceeds one slice");
        return false;
    }
    true
}

fn fcfs_test() -> bool {
    let sys = SystemState::new(SystemParams { phys_frames: 64 });
    sys.set_scheduler(Box::new(FcfsScheduler::new()));

    // First arrival is the longest; FCFS must still finish it first.
    let mut pids = Vec::new();
    for (name, nops) in [("/long", 600), ("/mid", 100), ("/short", 20)] {
        let program = cpu_bound(nops);
        let image = program.default_image(0);
        sys.install_program(name, &image, program).unwrap();
        pids.push(sys.spawn(name, &[]).unwrap());
        *sys.ticks.lock() += 5;
    }
    sys.run();

    let order = sys.exit_order();
    println!("fcfs: exit order: {order:?}");
    if order != pids {
        println!("fcfs: expected {pids:?}");
        return false;
    }
    true
}

fn main() -> ExitCode {
    let mut failures = 0;
    if fair_test() {
        println!("fair scheduler OK");
    } else {
        failures += 1;
    }
    if fcfs_test() {
        println!("fcfs scheduler OK");
    } else {
        failures += 1;
    }
    if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
