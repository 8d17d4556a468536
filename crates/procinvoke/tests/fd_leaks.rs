//! Repeated invocations must not grow the descriptor table
//!
//! Kept alone in its binary so no other test opens descriptors meanwhile.

use std::path::Path;

use procinvoke::{
    anonymous_pipe, InputRedirect, InvocationConfig, OutputRedirect, ProcessInvocation,
};

const ITERATIONS: usize = 500;

fn open_descriptors() -> usize {
    let dir = if Path::new("/proc/self/fd").exists() {
        "/proc/self/fd"
    } else {
        "/dev/fd"
    };
    std::fs::read_dir(dir).unwrap().count()
}

async fn run_once(iteration: usize, config: &InvocationConfig) {
    let (read, write) = anonymous_pipe().unwrap();
    let (extra_read, extra_write) = anonymous_pipe().unwrap();

    let invocation = if iteration % 10 == 0 {
        ProcessInvocation::new("/bin/sh")
            .args(["-c", "echo relayed >&3; echo out"])
            .send_fd(3, extra_write)
            .additional_output_fd(extra_read)
            .stderr(OutputRedirect::to_owned_fd(write))
            .additional_output_fd(read)
            .config(config.clone())
    } else {
        drop(extra_write);
        drop(extra_read);
        ProcessInvocation::new("/bin/sh")
            .args(["-c", "echo out; echo err >&2"])
            .stderr(OutputRedirect::to_owned_fd(write))
            .additional_output_fd(read)
    };

    let collected = invocation
        .stdin(InputRedirect::Null)
        .invoke_and_collect_raw_output()
        .await
        .unwrap();
    assert!(collected.lines.iter().any(|line| line.line == b"out"));
}

#[tokio::test]
async fn test_no_descriptor_leak_across_invocations() {
    let relay = Path::new(env!("CARGO_BIN_EXE_procinvoke-relay"));
    let config = InvocationConfig::default().with_relay_directory(relay.parent().unwrap());

    // Warm up lazily created runtime and registry descriptors.
    for i in 0..10 {
        run_once(i, &config).await;
    }
    let before = open_descriptors();

    for i in 0..ITERATIONS {
        run_once(i, &config).await;
    }
    // Drain tasks close their descriptors right after the last event.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert_eq!(open_descriptors(), before);

    // A launch that fails before spawning hands the descriptors back, and
    // dropping the invocation closes them.
    let (read, write) = anonymous_pipe().unwrap();
    let invocation = ProcessInvocation::new("/bin/true")
        .stdin(InputRedirect::Null)
        .send_fd(3, write)
        .additional_output_fd(read)
        .config(InvocationConfig::default().with_relay_directory("/nonexistent-relay-dir"));
    assert!(invocation.invoke_and_collect_raw_output().await.is_err());
    assert_eq!(open_descriptors(), before + 2);
    drop(invocation);
    assert_eq!(open_descriptors(), before);
}
