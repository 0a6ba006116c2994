//! Exercises the memstat syscall and lazy heap growth: snapshot, grow the
//! heap lazily, dirty one page, snapshot again, and check the paging logs.

use marrow_kernel::system::{SystemParams, SystemState};
use marrow_kernel::user_program::{Program, Syscall, UserOp};
use marrow_syscalls::SBRK_LAZY;
use std::process::ExitCode;

const PG: usize = 4096;

fn main() -> ExitCode {
    let sys = SystemState::new(SystemParams::default());

    // Snapshot buffer sits in the stack band; the heap page is grown by
    // sbrk and lands just above stack_top (one text page + 5 stack pages).
    let buf_va = 0x3000;
    let heap_va = 0x6000;
    let program = Program::new(vec![
        // 0: first snapshot must succeed
        UserOp::Syscall(Syscall::MemStat { va: buf_va }),
        UserOp::JumpIfZero(3),
        UserOp::Syscall(Syscall::Exit(1)),
        // 3: grow the heap lazily and dirty one byte of it
        UserOp::Syscall(Syscall::Sbrk {
            increment: PG as isize,
            mode: SBRK_LAZY,
        }),
        UserOp::Store(heap_va, b'A'),
        // 5: second snapshot must also succeed
        UserOp::Syscall(Syscall::MemStat { va: buf_va }),
        UserOp::JumpIfZero(8),
        UserOp::Syscall(Syscall::Exit(1)),
        // 8:
        UserOp::Syscall(Syscall::Exit(0)),
    ]);
    let image = program.default_image(0);
    sys.install_program("/memtest", &image, program).unwrap();

    println!("Testing memstat system call:");
    let pid = sys.spawn("/memtest", &[]).unwrap();
    sys.run();

    let mut failures = 0;
    if sys.exit_code(pid) != Some(0) {
        println!("memstat failed (exit {:?})", sys.exit_code(pid));
        failures += 1;
    }
    // The heap page was touched exactly once.
    let heap_faults = sys.console.count_matching("cause=heap");
    if heap_faults != 1 {
        println!("expected 1 heap fault, saw {heap_faults}");
        failures += 1;
    }
    if sys.console.count_matching(&format!("ALLOC   va={heap_va:#x}")) != 1 {
        println!("missing ALLOC for the heap page");
        failures += 1;
    }
    println!("Allocated and accessed heap page");

    for line in sys.console.lines() {
        if line.contains("PAGEFAULT") || line.contains("RESIDENT") {
            println!("  {line}");
        }
    }

    if failures == 0 {
        println!("memtest OK");
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
