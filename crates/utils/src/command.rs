//! Helpers for executing external commands.

use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Maximum number of stderr lines included in an error message.
const MAX_STDERR_LINES: usize = 10;

fn stderr_tail(stderr: &[u8]) -> String {
    let s = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = s.lines().collect();
    let start = lines.len().saturating_sub(MAX_STDERR_LINES);
    lines[start..].join("\n")
}

fn describe(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

/// Extension trait for running subprocesses synchronously, turning
/// unsuccessful exit into an error that carries the process stderr.
pub trait CommandRunExt {
    /// Log (at debug level) the command and arguments that will run.
    fn log_debug(&mut self) -> &mut Self;
    /// Execute the child, inheriting stdio; error on unsuccessful exit.
    fn run(&mut self) -> Result<()>;
    /// Execute the child with stderr captured; on unsuccessful exit the
    /// error message includes the tail of stderr.
    fn run_capture_stderr(&mut self) -> Result<()>;
    /// Execute the child, capturing stdout as a UTF-8 string.
    fn run_get_string(&mut self) -> Result<String>;
    /// Execute the child, deserializing stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!(
            "exec: {} {:?}",
            self.get_program().to_string_lossy(),
            self.get_args().collect::<Vec<_>>()
        );
        self
    }

    fn run(&mut self) -> Result<()> {
        let name = describe(self);
        let st = self
            .status()
            .with_context(|| format!("spawning {name}"))?;
        if !st.success() {
            anyhow::bail!("{name} failed: {st}");
        }
        Ok(())
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let name = describe(self);
        let output = self
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawning {name}"))?;
        if !output.status.success() {
            anyhow::bail!(
                "{name} failed: {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            );
        }
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        let name = describe(self);
        let output = self
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawning {name}"))?;
        if !output.status.success() {
            anyhow::bail!(
                "{name} failed: {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            );
        }
        String::from_utf8(output.stdout).with_context(|| format!("decoding {name} output"))
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let name = describe(self);
        let buf = self.run_get_string()?;
        serde_json::from_str(&buf).with_context(|| format!("parsing {name} JSON output"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        Command::new("true").run().unwrap();
    }

    #[test]
    fn test_run_failure() {
        assert!(Command::new("false").run().is_err());
    }

    #[test]
    fn test_run_capture_stderr() {
        let e = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .run_capture_stderr()
            .unwrap_err();
        let msg = format!("{e}");
        assert!(msg.contains("oops"), "{msg}");
    }

    #[test]
    fn test_run_get_string() {
        let s = Command::new("echo").arg("hello").run_get_string().unwrap();
        assert_eq!(s.trim(), "hello");
    }

    #[test]
    fn test_run_and_parse_json() {
        #[derive(serde::Deserialize)]
        struct V {
            a: u32,
        }
        let v: V = Command::new("echo")
            .arg(r#"{"a": 5}"#)
            .run_and_parse_json()
            .unwrap();
        assert_eq!(v.a, 5);
    }

    #[test]
    fn test_stderr_tail_truncates() {
        let long = (0..40).map(|i| format!("line{i}\n")).collect::<String>();
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.starts_with("line30"));
        assert!(tail.ends_with("line39"));
    }
}
