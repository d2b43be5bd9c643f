/*
 * rescenter - Resource aggregation and transaction engine for software centers.
 * Copyright (C) 2025  compiledkernel-idk and rescenter contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Running package-manager tools.

use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{ChildStdout, Command};
use tracing::debug;

use crate::error::{RescenterError, RescenterResult};
use crate::transaction::{TransactionDriver, TransactionStatus};

/// Check if a tool is installed
pub fn is_available(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Captured output of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run a command to completion
pub async fn run(backend: &str, program: &str, args: &[&str]) -> RescenterResult<CommandOutput> {
    debug!(%program, ?args, "running");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| RescenterError::backend_with(backend, format!("failed to run {program}"), e))?;
    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command and return its stdout; a non-zero exit is a backend error
pub async fn run_checked(backend: &str, program: &str, args: &[&str]) -> RescenterResult<String> {
    let output = run(backend, program, args).await?;
    if !output.success {
        return Err(failure(backend, program, &output.stderr));
    }
    Ok(output.stdout)
}

fn failure(backend: &str, program: &str, stderr: &str) -> RescenterError {
    let message = stderr.trim();
    if message.is_empty() {
        RescenterError::backend(backend, format!("{program} failed"))
    } else {
        RescenterError::backend(backend, message.lines().last().unwrap_or(message).to_string())
    }
}

/// Last percentage found in a line of tool output, e.g. `Installing 3/5… 42%`
pub fn parse_percent(line: &str) -> Option<u8> {
    line.split(|c: char| c.is_whitespace() || c == '[' || c == ']' || c == '(' || c == ')')
        .filter_map(|word| word.strip_suffix('%'))
        .filter_map(|number| number.parse::<f32>().ok())
        .filter(|value| (0.0..=100.0).contains(value))
        .last()
        .map(|value| value as u8)
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

/// Run the command behind a transaction.
///
/// Moves the transaction to Running, turns percentages on stdout into
/// progress and kills the child when cancellation is requested. The caller
/// reports the outcome through [`TransactionDriver::finish`].
pub async fn run_transaction(
    driver: &TransactionDriver,
    backend: &str,
    program: &str,
    args: &[String],
) -> RescenterResult<()> {
    driver.set_status(TransactionStatus::Running)?;
    debug!(%program, ?args, "transaction command");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RescenterError::backend_with(backend, format!("failed to start {program}"), e))?;

    let stderr = child.stderr.take();
    let errors = tokio::spawn(async move {
        let mut text = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut text).await;
        }
        text
    });
    let mut lines = child.stdout.take().map(|out| BufReader::new(out).lines());

    loop {
        tokio::select! {
            _ = driver.cancelled() => {
                let _ = child.kill().await;
                return Err(RescenterError::Interrupted);
            }
            line = next_line(&mut lines) => match line {
                Some(line) => {
                    if let Some(percent) = parse_percent(&line) {
                        driver.set_progress(percent.min(99));
                    }
                }
                None => break,
            },
        }
    }

    let status = tokio::select! {
        _ = driver.cancelled() => {
            let _ = child.kill().await;
            return Err(RescenterError::Interrupted);
        }
        status = child.wait() => status
            .map_err(|e| RescenterError::backend_with(backend, format!("{program} did not finish"), e))?,
    };
    let stderr = errors.await.unwrap_or_default();
    if status.success() {
        Ok(())
    } else {
        Err(failure(backend, program, &stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{Transaction, TransactionRole};
    use std::time::Duration;

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent("Installing 2/3… 42%"), Some(42));
        assert_eq!(parse_percent("[####    ] 55.5%"), Some(55));
        assert_eq!(parse_percent("Download snap \"vlc\" (3.0) 12% 80%"), Some(80));
        assert_eq!(parse_percent("Looking for matches…"), None);
        assert_eq!(parse_percent("150%"), None);
    }

    #[tokio::test]
    async fn test_run_checked_reports_stderr() {
        let out = run_checked("test", "sh", &["-c", "echo hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");

        let err = run_checked("test", "sh", &["-c", "echo 'no remote' >&2; exit 1"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no remote"));
    }

    #[tokio::test]
    async fn test_transaction_progress_and_success() {
        let (t, driver) = Transaction::detached("job", TransactionRole::Install);
        let args = vec!["-c".to_string(), "echo 30%; echo 60%".to_string()];
        run_transaction(&driver, "test", "sh", &args).await.unwrap();
        assert_eq!(t.progress(), 60);
        driver.finish(&Ok(()));
        assert_eq!(t.status(), TransactionStatus::Done);
    }

    #[tokio::test]
    async fn test_cancel_kills_the_command() {
        let (t, driver) = Transaction::detached("job", TransactionRole::Install);
        let args = vec!["-c".to_string(), "sleep 30".to_string()];
        let canceller = std::sync::Arc::clone(&t);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel().unwrap();
        });
        let result = tokio::time::timeout(Duration::from_secs(10), run_transaction(&driver, "test", "sh", &args))
            .await
            .expect("cancelled in time");
        assert!(matches!(result, Err(RescenterError::Interrupted)));
        driver.finish(&result);
        assert_eq!(t.status(), TransactionStatus::Cancelled);
    }
}
