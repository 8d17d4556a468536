//! PATH search through the relay matches direct execution
//!
//! Changes the process working directory and `PATH`, so this binary holds a
//! single test that runs every case in turn.

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use procinvoke::{
    anonymous_pipe, CustomPath, InputRedirect, InvocationConfig, InvocationError,
    ProcessInvocation, Termination,
};

#[derive(Debug, PartialEq)]
enum Outcome {
    Ran(Vec<String>),
    Exited(Termination),
    Failed(Option<i32>),
}

fn write_tool(dir: &Path, name: &str, output: &str) {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\necho {output}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn relay_config() -> InvocationConfig {
    let relay = Path::new(env!("CARGO_BIN_EXE_procinvoke-relay"));
    InvocationConfig::default().with_relay_directory(relay.parent().unwrap())
}

async fn outcome(invocation: ProcessInvocation) -> Outcome {
    match invocation.invoke_and_collect_stdout().await {
        Ok(collected) => Outcome::Ran(collected.lines),
        Err(InvocationError::UnexpectedTermination(t)) => Outcome::Exited(t),
        Err(e) => Outcome::Failed(e.raw_os_error()),
    }
}

/// Run `invocation` directly and through the relay
async fn direct_and_relayed(invocation: ProcessInvocation) -> (Outcome, Outcome) {
    let direct = outcome(invocation.clone()).await;
    let (_read, write) = anonymous_pipe().unwrap();
    let relayed = outcome(invocation.send_fd(3, write).config(relay_config())).await;
    (direct, relayed)
}

fn ran(line: &str) -> Outcome {
    Outcome::Ran(vec![line.to_string()])
}

#[tokio::test]
async fn test_relay_search_matches_direct_execution() {
    let root = tempfile::tempdir().unwrap();
    let parent_dir = fs::canonicalize(root.path()).unwrap();
    let work: PathBuf = parent_dir.join("work");
    let colon_dir = parent_dir.join("a:b");

    write_tool(&parent_dir, "tool", "parent-empty");
    write_tool(&parent_dir.join("rel"), "tool", "parent-rel");
    write_tool(&colon_dir, "colon", "colon-dir");
    write_tool(&work, "tool", "workdir-empty");
    write_tool(&work.join("rel"), "tool", "workdir-rel");
    write_tool(&work, "colon", "workdir-colon");

    let original_cwd = env::current_dir().unwrap();
    let original_path = env::var_os("PATH");
    env::set_current_dir(&parent_dir).unwrap();

    let tool = |name: &str, custom_path: CustomPath| {
        ProcessInvocation::new(name)
            .custom_path(custom_path)
            .working_directory(&work)
            .stdin(InputRedirect::Null)
    };

    // Relative directories resolve against the parent, not the working directory.
    let (direct, relayed) =
        direct_and_relayed(tool("tool", CustomPath::Explicit(vec!["rel".into()]))).await;
    assert_eq!(direct, ran("parent-rel"));
    assert_eq!(relayed, direct);

    // An empty entry is the parent's directory.
    let (direct, relayed) =
        direct_and_relayed(tool("tool", CustomPath::Explicit(vec!["".into()]))).await;
    assert_eq!(direct, ran("parent-empty"));
    assert_eq!(relayed, direct);

    // Inherited PATH with empty segments.
    env::set_var("PATH", "/nonexistent::");
    let (direct, relayed) = direct_and_relayed(tool("tool", CustomPath::Inherit)).await;
    match &original_path {
        Some(path) => env::set_var("PATH", path),
        None => env::remove_var("PATH"),
    }
    assert_eq!(direct, ran("parent-empty"));
    assert_eq!(relayed, direct);

    // An empty list runs the name relative to the parent in both modes.
    let (direct, relayed) =
        direct_and_relayed(tool("tool", CustomPath::Explicit(Vec::new()))).await;
    assert_eq!(direct, ran("parent-empty"));
    assert_eq!(relayed, direct);

    // Colon entries cannot be passed on: the relay gets no directories and
    // looks for the name next to the parent, where it does not exist.
    let (direct, relayed) =
        direct_and_relayed(tool("colon", CustomPath::Explicit(vec![colon_dir.clone()]))).await;
    assert_eq!(direct, ran("colon-dir"));
    assert_eq!(relayed, Outcome::Exited(Termination::exit(127)));

    let (direct, relayed) = direct_and_relayed(tool(
        "colon",
        CustomPath::Explicit(vec![colon_dir.clone(), parent_dir.join("c:d")]),
    ))
    .await;
    assert_eq!(direct, ran("colon-dir"));
    assert_eq!(relayed, Outcome::Exited(Termination::exit(127)));

    env::set_current_dir(original_cwd).unwrap();
}
