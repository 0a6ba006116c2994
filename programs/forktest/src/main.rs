//! Fork/wait stress: fork ten children, each exits immediately, the parent
//! reaps them all and then checks that a further wait reports no children.

use marrow_kernel::system::{SystemParams, SystemState};
use marrow_kernel::user_program::{Program, Syscall, UserOp};
use std::process::ExitCode;

const N: usize = 10;

fn main() -> ExitCode {
    let sys = SystemState::new(SystemParams { phys_frames: 128 });

    // Layout of the instruction stream:
    //   0 .. 2N        fork / jump-if-child pairs
    //   2N .. 3N       one wait per child
    //   3N             extra wait, must return -1
    //   3N+1, 3N+2     xor with -1, jump to success when it was -1
    //   3N+3           exit(1)  (extra wait unexpectedly succeeded)
    //   3N+4           exit(0)
    //   3N+5           child: exit(0)
    let child = 3 * N + 5;
    let mut ops = Vec::new();
    for _ in 0..N {
        ops.push(UserOp::Syscall(Syscall::Fork));
        ops.push(UserOp::JumpIfZero(child));
    }
    for _ in 0..N {
        ops.push(UserOp::Syscall(Syscall::Wait));
    }
    ops.push(UserOp::Syscall(Syscall::Wait));
    ops.push(UserOp::Xori(-1));
    ops.push(UserOp::JumpIfZero(3 * N + 4));
    ops.push(UserOp::Syscall(Syscall::Exit(1)));
    ops.push(UserOp::Syscall(Syscall::Exit(0)));
    ops.push(UserOp::Syscall(Syscall::Exit(0)));
    assert_eq!(ops.len(), child + 1);

    let program = Program::new(ops);
    let image = program.default_image(0);
    sys.install_program("/forktest", &image, program).unwrap();

    let parent = sys.spawn("/forktest", &[]).unwrap();
    sys.run();

    let mut failures = 0;
    if sys.exit_code(parent) != Some(0) {
        println!("forktest: parent exited with {:?}", sys.exit_code(parent));
        failures += 1;
    }
    let pids = sys.process.table.pids();
    if pids != vec![parent] {
        println!("forktest: unreaped processes remain: {pids:?}");
        failures += 1;
    }
    if failures == 0 {
        println!("forktest OK: {N} children forked and reaped");
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
