//! Exercises the getreadcount counter: write a 100-byte file, read it back,
//! and check the counter moved by exactly the bytes read.

use marrow_kernel::system::{SystemParams, SystemState};
use marrow_kernel::user_program::{Program, Syscall, UserOp};
use std::process::ExitCode;

// File descriptors are handed out deterministically starting at 3, so the
// instruction stream can name them directly.
const FD: usize = 3;

fn main() -> ExitCode {
    let sys = SystemState::new(SystemParams::default());

    let mut test_data =
        b"This is a test file with exactly 100 bytes of data, padded out to that length.".to_vec();
    test_data.resize(100, b'.');

    // Read destination: inside the stack band, backed on demand.
    let buf_va = 0x4000;
    let program = Program::new(vec![
        UserOp::Syscall(Syscall::Open {
            path: "/testfile.txt".into(),
            create: true,
        }),
        UserOp::Syscall(Syscall::Write {
            fd: FD,
            data: test_data.clone(),
        }),
        UserOp::Syscall(Syscall::Close(FD)),
        UserOp::Syscall(Syscall::GetReadCount),
        UserOp::Syscall(Syscall::Open {
            path: "/testfile.txt".into(),
            create: false,
        }),
        UserOp::Syscall(Syscall::Read {
            fd: FD,
            va: buf_va,
            len: 100,
        }),
        UserOp::Syscall(Syscall::Close(FD)),
        UserOp::Syscall(Syscall::GetReadCount),
        UserOp::Syscall(Syscall::Unlink("/testfile.txt".into())),
        UserOp::Syscall(Syscall::Exit(0)),
    ]);
    let image = program.default_image(0);
    sys.install_program("/readcount", &image, program).unwrap();

    let initial_count = sys.read_count();
    println!("Initial read count: {initial_count}");

    let pid = sys.spawn("/readcount", &[]).unwrap();
    sys.run();

    let final_count = sys.read_count();
    println!("Final read count: {final_count}");
    println!(
        "Increase in read count: {}",
        final_count.wrapping_sub(initial_count)
    );

    if sys.exit_code(pid) != Some(0) {
        println!("ERROR: test program exited with {:?}", sys.exit_code(pid));
        return ExitCode::from(1);
    }
    if final_count.wrapping_sub(initial_count) == 100 {
        println!("SUCCESS: Read count increased by exactly 100 bytes");
        ExitCode::SUCCESS
    } else {
        println!(
            "ERROR: Expected increase of 100, got {}",
            final_count.wrapping_sub(initial_count)
        );
        ExitCode::from(1)
    }
}
