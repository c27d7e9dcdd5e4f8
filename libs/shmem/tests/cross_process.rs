// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tests that need a second process. The test binary re-executes itself, running one of the
//! `child_*` functions, which are no-ops unless `SHMEM_CHILD_ROOT` is set.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use shmem::{OpenOptions, SharedMemoryConfig, SharedMemoryId, SharedMemoryManager, SharedMemoryType};

const ROOT_VAR: &str = "SHMEM_CHILD_ROOT";
const NAME: &str = "Global\\cross-process";
const TY: SharedMemoryType = SharedMemoryType::new(7, 1);
const PATTERN: &[u8] = b"written by the child";
/// Printed by a child once its region is populated. The test harness may have written a partial
/// status line before it, so it is matched as a line suffix.
const READY: &str = "shmem-child-ready";
const READY_TIMEOUT: Duration = Duration::from_secs(30);

fn manager(root: &Path) -> SharedMemoryManager {
    SharedMemoryManager::static_initialize(SharedMemoryConfig {
        root: root.to_path_buf(),
        runtime_temp_dir: String::from(".pal"),
    })
    .unwrap()
}

fn child_root() -> Option<PathBuf> {
    std::env::var_os(ROOT_VAR).map(PathBuf::from)
}

fn spawn_child(test: &str, root: &Path) -> Child {
    Command::new(std::env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(ROOT_VAR, root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap()
}

/// Blocks until `child` reports [`READY`] on stdout, killing it if that takes too long.
fn wait_until_ready(child: &mut Child) {
    let stdout = BufReader::new(child.stdout.take().unwrap());
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // keep draining stdout after the ready line so the child's later output does not hit a
        // closed pipe
        for line in stdout.lines() {
            let Ok(line) = line else { break };
            if line.trim_end().ends_with(READY) {
                let _ = tx.send(());
            }
        }
    });

    if rx.recv_timeout(READY_TIMEOUT).is_err() {
        let _ = child.kill();
        let _ = child.wait();
        panic!("child never reported readiness");
    }
}

/// Maps the region, fills it and exits without any cleanup.
#[test]
fn child_crashes_while_mapped() {
    let Some(root) = child_root() else { return };

    let manager = manager(&root);
    let mut region = manager
        .create_or_open(NAME, TY, 64, OpenOptions::new().create(true))
        .unwrap()
        .unwrap()
        .into_region();
    // Safety: nobody else maps the region yet
    unsafe { region.payload_mut()[..PATTERN.len()].copy_from_slice(PATTERN) };

    std::process::exit(0);
}

/// Maps and fills the region, then keeps it mapped until stdin is closed.
#[test]
fn child_holds_region() {
    let Some(root) = child_root() else { return };

    let manager = manager(&root);
    let mut region = manager
        .create_or_open(NAME, TY, 64, OpenOptions::new().create(true))
        .unwrap()
        .unwrap()
        .into_region();
    // Safety: the parent only reads after the ready line below
    unsafe { region.payload_mut()[..PATTERN.len()].copy_from_slice(PATTERN) };

    println!("\n{READY}");
    std::io::stdout().flush().unwrap();

    let mut rest = Vec::new();
    std::io::stdin().read_to_end(&mut rest).unwrap();
    drop(region);
}

#[test]
fn crashed_holder_is_detected() {
    if child_root().is_some() {
        return;
    }

    let root = tempfile::tempdir().unwrap();
    let status = spawn_child("child_crashes_while_mapped", root.path())
        .wait()
        .unwrap();
    assert!(status.success());

    let manager = manager(root.path());
    let path = manager
        .file_path(&SharedMemoryId::new(NAME, false).unwrap())
        .unwrap();
    assert!(path.exists(), "the crashed child leaves its file behind");

    let opened = manager
        .create_or_open(NAME, TY, 64, OpenOptions::new().create(true))
        .unwrap()
        .unwrap();
    assert!(opened.created());

    let region = opened.into_region();
    // Safety: this process is the only user
    let payload = unsafe { region.payload() };
    assert!(payload[..PATTERN.len()].iter().all(|&b| b == 0));
}

#[test]
fn live_holder_keeps_region() {
    if child_root().is_some() {
        return;
    }

    let root = tempfile::tempdir().unwrap();
    let mut child = spawn_child("child_holds_region", root.path());

    wait_until_ready(&mut child);

    let manager = manager(root.path());
    let path = manager
        .file_path(&SharedMemoryId::new(NAME, false).unwrap())
        .unwrap();

    let opened = manager
        .create_or_open(NAME, TY, 64, OpenOptions::new())
        .unwrap()
        .unwrap();
    assert!(!opened.created());
    let region = opened.into_region();
    // Safety: the child finished writing before printing the ready line
    let seen = unsafe { region.payload()[..PATTERN.len()].to_vec() };
    assert_eq!(seen, PATTERN);

    // the child still maps the region, so our release must not remove the file
    drop(region);
    assert!(path.exists());

    drop(child.stdin.take());
    assert!(child.wait().unwrap().success());
    assert!(!path.exists(), "the last user removes the file");
}
