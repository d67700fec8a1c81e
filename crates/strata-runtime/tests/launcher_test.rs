//! Launcher tests against real host processes.
//!
//! These cover exit status decoding and stream wiring without entering a
//! container root, so they run unprivileged.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io::{Cursor, Write};
use std::process::Command;
use std::sync::{Arc, Mutex};

use signal_hook::consts::SIGTERM;
use strata_common::error::EngineError;
use strata_runtime::launcher::{PipedStdio, StdioMode, run_process};
use strata_runtime::signal::Interrupt;

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).expect("utf-8 output")
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn sh(script: &str) -> Command {
    let mut command = Command::new("sh");
    let _ = command.arg("-c").arg(script);
    command
}

fn piped(stdin: Option<&'static str>) -> (StdioMode, SharedBuffer, SharedBuffer) {
    let out = SharedBuffer::default();
    let err = SharedBuffer::default();
    let mode = StdioMode::Piped(PipedStdio {
        stdin: stdin.map(|s| Box::new(Cursor::new(s.as_bytes())) as Box<dyn std::io::Read + Send>),
        stdout: Box::new(out.clone()),
        stderr: Box::new(err.clone()),
    });
    (mode, out, err)
}

// ── Exit status ──────────────────────────────────────────────────────

#[test]
fn pipeline_exit_code_passes_through() {
    for code in [0, 1, 3, 42] {
        let (mode, _, _) = piped(None);
        let result = run_process(sh(&format!("exit {code}")), mode, &Interrupt::new())
            .expect("process runs");
        assert_eq!(result.code, code);
        assert_eq!(result.signal, None);
    }
}

#[test]
fn pipeline_signal_termination_is_decoded() {
    let (mode, _, _) = piped(None);
    let result = run_process(sh("kill -TERM $$"), mode, &Interrupt::new()).expect("process runs");
    assert_eq!(result.signal, Some(SIGTERM));
    assert_eq!(result.code, 128 + SIGTERM);
}

#[test]
fn pipeline_missing_command_is_not_a_process_exit() {
    let (mode, _, _) = piped(None);
    let result = run_process(
        Command::new("/nonexistent/strata-test-command"),
        mode,
        &Interrupt::new(),
    );
    assert!(matches!(result, Err(EngineError::CommandNotFound { .. })));
}

// ── Streams ──────────────────────────────────────────────────────────

#[test]
fn pipeline_stdout_and_stderr_are_separate() {
    let (mode, out, err) = piped(None);
    let result = run_process(sh("echo out; echo err >&2"), mode, &Interrupt::new())
        .expect("process runs");
    assert!(result.success());
    assert_eq!(out.contents(), "out\n");
    assert_eq!(err.contents(), "err\n");
}

#[test]
fn pipeline_stdin_is_forwarded() {
    let (mode, out, _) = piped(Some("hello from stdin\n"));
    let result = run_process(Command::new("cat"), mode, &Interrupt::new()).expect("process runs");
    assert_eq!(result.code, 0);
    assert_eq!(out.contents(), "hello from stdin\n");
}

#[test]
fn pipeline_large_output_does_not_block() {
    let (mode, out, _) = piped(None);
    let result = run_process(
        sh("i=0; while [ $i -lt 20000 ]; do echo line$i; i=$((i+1)); done"),
        mode,
        &Interrupt::new(),
    )
    .expect("process runs");
    assert!(result.success());
    assert_eq!(out.contents().lines().count(), 20000);
}

#[test]
fn pipeline_forwarded_signal_reaches_child() {
    let interrupt = Interrupt::new();
    let forwarder = interrupt.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(200));
        forwarder.notify(SIGTERM);
    });
    let (mode, _, _) = piped(None);
    let result = run_process(sh("exec sleep 30"), mode, &interrupt).expect("process runs");
    handle.join().expect("forwarder thread");
    assert_eq!(result.signal, Some(SIGTERM));
}
