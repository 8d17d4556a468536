//! Descriptor passing through the relay executable

use std::os::fd::AsRawFd;
use std::path::Path;

use procinvoke::{
    anonymous_pipe, CustomPath, InputRedirect, InvocationConfig, InvocationError,
    ProcessInvocation, RawLine, Termination,
};

fn relay_config() -> InvocationConfig {
    let relay = Path::new(env!("CARGO_BIN_EXE_procinvoke-relay"));
    InvocationConfig::default().with_relay_directory(relay.parent().unwrap())
}

#[tokio::test]
async fn test_sent_descriptor_output_arrives_tagged_with_read_end() {
    let (read, write) = anonymous_pipe().unwrap();
    let read_fd = read.as_raw_fd();

    let collected = ProcessInvocation::new("/bin/sh")
        .args(["-c", "echo hello >&3; echo regular"])
        .stdin(InputRedirect::Null)
        .send_fd(3, write)
        .additional_output_fd(read)
        .config(relay_config())
        .invoke_and_collect_raw_output()
        .await
        .unwrap();

    assert_eq!(collected.termination, Termination::SUCCESS);
    assert!(collected.lines.contains(&RawLine::new("hello", "\n", read_fd)));
    assert!(collected.lines.contains(&RawLine::new("regular", "\n", 1)));
    assert_eq!(collected.lines.len(), 2);
}

#[tokio::test]
async fn test_relay_searches_path_for_bare_names() {
    let (read, write) = anonymous_pipe().unwrap();
    let collected = ProcessInvocation::new("sh")
        .args(["-c", "echo via-path >&5"])
        .stdin(InputRedirect::Null)
        .custom_path(CustomPath::Explicit(vec!["/nonexistent".into(), "/bin".into()]))
        .send_fd(5, write)
        .additional_output_fd(read)
        .config(relay_config())
        .invoke_and_collect_raw_output()
        .await
        .unwrap();

    assert_eq!(collected.lines.len(), 1);
    assert_eq!(collected.lines[0].line, b"via-path");
}

#[tokio::test]
async fn test_relay_feeds_stdin_from_memory() {
    let (_read, write) = anonymous_pipe().unwrap();
    let collected = ProcessInvocation::new("/bin/cat")
        .stdin(InputRedirect::send("x\ny\n"))
        .send_fd(7, write)
        .config(relay_config())
        .invoke_and_collect_stdout()
        .await
        .unwrap();
    assert_eq!(collected.lines, ["x", "y"]);
}

#[tokio::test]
async fn test_missing_target_exits_127() {
    let (_read, write) = anonymous_pipe().unwrap();
    let result = ProcessInvocation::new("/nonexistent/target")
        .stdin(InputRedirect::Null)
        .send_fd(3, write)
        .config(relay_config())
        .invoke_and_collect_raw_output()
        .await;

    assert!(matches!(
        result,
        Err(InvocationError::UnexpectedTermination(t)) if t == Termination::exit(127)
    ));
}

#[tokio::test]
async fn test_unknown_relay_location_is_reported() {
    let (_read, write) = anonymous_pipe().unwrap();
    let config = InvocationConfig::default().with_relay_path_env_var("PROCINVOKE_TEST_RELAY_UNSET");
    let result = ProcessInvocation::new("/bin/true")
        .use_path(false)
        .stdin(InputRedirect::Null)
        .send_fd(3, write)
        .config(config)
        .invoke_and_collect_raw_output()
        .await;

    match result {
        Err(InvocationError::RelayPathNotSet { env_var }) => {
            assert_eq!(env_var, "PROCINVOKE_TEST_RELAY_UNSET");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_sent_descriptors_are_consumed_by_launch() {
    let (_read, write) = anonymous_pipe().unwrap();
    let invocation = ProcessInvocation::new("/bin/true")
        .stdin(InputRedirect::Null)
        .send_fd(4, write)
        .config(relay_config());

    invocation.invoke_and_collect_raw_output().await.unwrap();
    let again = invocation.invoke_and_collect_raw_output().await;
    assert!(matches!(again, Err(InvocationError::InvalidConfiguration(_))));
}

#[tokio::test]
async fn test_failed_launch_keeps_descriptors_for_retry() {
    let (read, write) = anonymous_pipe().unwrap();
    let read_fd = read.as_raw_fd();
    let missing = InvocationConfig::default().with_relay_directory("/nonexistent-relay-dir");
    let invocation = ProcessInvocation::new("/bin/sh")
        .args(["-c", "echo retried >&3"])
        .use_path(false)
        .stdin(InputRedirect::Null)
        .send_fd(3, write)
        .additional_output_fd(read);

    let failed = invocation
        .clone()
        .config(missing)
        .invoke_and_collect_raw_output()
        .await;
    assert!(matches!(failed, Err(InvocationError::System { .. })));

    let collected = invocation
        .config(relay_config())
        .invoke_and_collect_raw_output()
        .await
        .unwrap();
    assert_eq!(collected.lines, vec![RawLine::new("retried", "\n", read_fd)]);
}
