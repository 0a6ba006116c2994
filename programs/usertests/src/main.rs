//! Scenario battery for the paging core. Each scenario boots a fresh
//! machine, runs a small program against it and checks the stable log lines
//! and final state. Exit code 0 only if every scenario passes.

use marrow_kernel::system::{SystemParams, SystemState};
use marrow_kernel::user_program::{Program, Syscall, UserOp};
use marrow_syscalls::SBRK_LAZY;
use std::process::ExitCode;

const PG: usize = 4096;

fn boot(frames: usize) -> SystemState {
    SystemState::new(SystemParams {
        phys_frames: frames,
    })
}

fn install(sys: &SystemState, path: &str, ops: Vec<UserOp>) {
    let program = Program::new(ops);
    let image = program.default_image(0);
    sys.install_program(path, &image, program).unwrap();
}

/// exec followed by the first instruction fetch: lazy map first, then the
/// fault, the demand load and the residency stamp, in order.
fn demand_load_text() -> Result<(), String> {
    let sys = boot(16);
    install(&sys, "/init", vec![UserOp::Syscall(Syscall::Exit(0))]);
    let pid = sys.spawn("/init", &[]).unwrap();
    sys.run();
    if sys.exit_code(pid) != Some(0) {
        return Err(format!("exit code {:?}", sys.exit_code(pid)));
    }
    let lines = sys.console.lines();
    let pos = |needle: &str| {
        lines
            .iter()
            .position(|l| l.contains(needle))
            .ok_or_else(|| format!("missing log line: {needle}"))
    };
    let lazymap = pos("INIT-LAZYMAP")?;
    let fault = pos("PAGEFAULT va=0x0 access=exec cause=exec")?;
    let load = pos("LOADEXEC va=0x0")?;
    let resident = pos("RESIDENT va=0x0")?;
    if !(lazymap < fault && fault < load && load < resident) {
        return Err("log lines out of order".into());
    }
    Ok(())
}

/// sbrk(2 pages, LAZY) then a read of the last byte: sz moves immediately,
/// and exactly one heap fault backs the touched page.
fn lazy_heap_growth() -> Result<(), String> {
    let sys = boot(16);
    install(
        &sys,
        "/grow",
        vec![
            UserOp::Syscall(Syscall::Sbrk {
                increment: (2 * PG) as isize,
                mode: SBRK_LAZY,
            }),
            UserOp::Load(8 * PG - 1),
            UserOp::Syscall(Syscall::Exit(0)),
        ],
    );
    let pid = sys.spawn("/grow", &[]).unwrap();
    sys.run();
    if sys.exit_code(pid) != Some(0) {
        return Err(format!("exit code {:?}", sys.exit_code(pid)));
    }
    for (needle, want) in [
        ("cause=heap", 1),
        ("ALLOC   va=0x7000", 1),
        ("RESIDENT va=0x7000", 1),
    ] {
        let got = sys.console.count_matching(needle);
        if got != want {
            return Err(format!("{needle}: expected {want}, got {got}"));
        }
    }
    Ok(())
}

/// Dirty pages under frame pressure leave in residency order, get written
/// to swap, and come back byte-identical.
fn fifo_swap_roundtrip() -> Result<(), String> {
    let sys = boot(8);
    // Grow the heap, dirty ten pages with distinct markers, then re-read
    // the first one; with 8 frames the early pages must swap out.
    let heap = 6 * PG;
    let mut ops = vec![UserOp::Syscall(Syscall::Sbrk {
        increment: (12 * PG) as isize,
        mode: SBRK_LAZY,
    })];
    for i in 0..10usize {
        ops.push(UserOp::Store(heap + i * PG, i as u8 + 1));
    }
    ops.push(UserOp::Load(heap));
    ops.push(UserOp::Xori(1));
    ops.push(UserOp::JumpIfZero(ops.len() + 2));
    ops.push(UserOp::Syscall(Syscall::Exit(1)));
    ops.push(UserOp::Syscall(Syscall::Exit(0)));
    install(&sys, "/thrash", ops);
    let pid = sys.spawn("/thrash", &[]).unwrap();
    sys.run();
    if sys.exit_code(pid) != Some(0) {
        return Err(format!(
            "byte mismatch after swap-in (exit {:?})",
            sys.exit_code(pid)
        ));
    }
    for needle in ["algo=FIFO", "EVICT   va", "SWAPOUT va", "SWAPIN  va", "state=dirty"] {
        if sys.console.count_matching(needle) == 0 {
            return Err(format!("missing log line: {needle}"));
        }
    }
    if sys.console.count_matching("SWAPCLEANUP") != 1 {
        return Err("missing SWAPCLEANUP at exit".into());
    }
    Ok(())
}

/// A clean text page under pressure is discarded, not swapped, and a later
/// fetch re-reads it from the executable.
fn clean_text_discard() -> Result<(), String> {
    let sys = boot(3);
    let heap = 6 * PG;
    install(
        &sys,
        "/discard",
        vec![
            UserOp::Syscall(Syscall::Sbrk {
                increment: (4 * PG) as isize,
                mode: SBRK_LAZY,
            }),
            UserOp::Store(heap, 1),
            UserOp::Store(heap + PG, 2),
            UserOp::Store(heap + 2 * PG, 3),
            UserOp::Nop,
            UserOp::Syscall(Syscall::Exit(0)),
        ],
    );
    let pid = sys.spawn("/discard", &[]).unwrap();
    sys.run();
    if sys.exit_code(pid) != Some(0) {
        return Err(format!("exit code {:?}", sys.exit_code(pid)));
    }
    if sys.console.count_matching("DISCARD va=0x0") == 0 {
        return Err("text page was never discarded".into());
    }
    if sys.console.count_matching("EVICT   va=0x0 state=clean") == 0 {
        return Err("text eviction was not clean".into());
    }
    if sys.console.count_matching("LOADEXEC va=0x0") < 2 {
        return Err("text page was not re-read after discard".into());
    }
    if sys.console.count_matching("SWAPOUT va=0x0") != 0 {
        return Err("clean text page must not be written to swap".into());
    }
    Ok(())
}

/// Per-process swap capacity is a hard ceiling: overflowing 1024 slots
/// kills the process.
fn swap_exhaustion_kill() -> Result<(), String> {
    let sys = boot(2);
    let heap = 6 * PG;
    let pages = 1100usize;
    let mut ops = vec![UserOp::Syscall(Syscall::Sbrk {
        increment: (pages * PG + 2 * PG) as isize,
        mode: SBRK_LAZY,
    })];
    for i in 0..pages {
        ops.push(UserOp::Store(heap + i * PG, (i % 251) as u8));
    }
    ops.push(UserOp::Syscall(Syscall::Exit(0)));
    install(&sys, "/floodswap", ops);
    let pid = sys.spawn("/floodswap", &[]).unwrap();
    sys.run();
    if sys.exit_code(pid) != Some(-1) {
        return Err(format!(
            "expected the flood to be killed, got exit {:?}",
            sys.exit_code(pid)
        ));
    }
    if sys.console.count_matching("KILL    swap-exhausted") == 0 {
        return Err("missing swap-exhausted kill".into());
    }
    Ok(())
}

/// An access outside every legal region kills the process.
fn invalid_access_kill() -> Result<(), String> {
    let sys = boot(8);
    install(
        &sys,
        "/wild",
        vec![
            UserOp::Store(0x2000_0000, 1),
            UserOp::Syscall(Syscall::Exit(0)),
        ],
    );
    let pid = sys.spawn("/wild", &[]).unwrap();
    sys.run();
    if sys.exit_code(pid) != Some(-1) {
        return Err(format!("exit code {:?}", sys.exit_code(pid)));
    }
    if sys
        .console
        .count_matching("KILL    invalid-access va=0x20000000 access=write")
        == 0
    {
        return Err("missing invalid-access kill".into());
    }
    Ok(())
}

/// getreadcount accumulates exactly the bytes of successful reads.
fn read_count_accumulates() -> Result<(), String> {
    let sys = boot(16);
    let buf = 0x4000;
    install(
        &sys,
        "/reads",
        vec![
            UserOp::Syscall(Syscall::Open {
                path: "/f".into(),
                create: true,
            }),
            UserOp::Syscall(Syscall::Write {
                fd: 3,
                data: vec![9u8; 100],
            }),
            UserOp::Syscall(Syscall::Close(3)),
            UserOp::Syscall(Syscall::Open {
                path: "/f".into(),
                create: false,
            }),
            UserOp::Syscall(Syscall::Read { fd: 3, va: buf, len: 40 }),
            UserOp::Syscall(Syscall::Read { fd: 3, va: buf, len: 60 }),
            // EOF: contributes nothing.
            UserOp::Syscall(Syscall::Read { fd: 3, va: buf, len: 10 }),
            UserOp::Syscall(Syscall::Exit(0)),
        ],
    );
    let pid = sys.spawn("/reads", &[]).unwrap();
    sys.run();
    if sys.exit_code(pid) != Some(0) {
        return Err(format!("exit code {:?}", sys.exit_code(pid)));
    }
    if sys.read_count() != 100 {
        return Err(format!("read count {} != 100", sys.read_count()));
    }
    Ok(())
}

fn main() -> ExitCode {
    let tests: &[(&str, fn() -> Result<(), String>)] = &[
        ("demand_load_text", demand_load_text),
        ("lazy_heap_growth", lazy_heap_growth),
        ("fifo_swap_roundtrip", fifo_swap_roundtrip),
        ("clean_text_discard", clean_text_discard),
        ("swap_exhaustion_kill", swap_exhaustion_kill),
        ("invalid_access_kill", invalid_access_kill),
        ("read_count_accumulates", read_count_accumulates),
    ];
    let mut failures = 0;
    for (name, test) in tests {
        match test() {
            Ok(()) => println!("{name}: OK"),
            Err(why) => {
                println!("{name}: FAILED: {why}");
                failures += 1;
            }
        }
    }
    if failures == 0 {
        println!("ALL TESTS PASSED");
        ExitCode::SUCCESS
    } else {
        println!("{failures} test(s) failed");
        ExitCode::from(1)
    }
}
