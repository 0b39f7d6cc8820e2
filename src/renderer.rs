//! Invocation of the external renderer.
//!
//! The renderer is an opaque executable driven by two flags:
//!
//! ```text
//! <renderer> --model <model path> --image <output png path>
//! ```
//!
//! It runs with a fixed working directory so it can resolve its own relative
//! resources, and every invocation is waited on with a deadline. The child is
//! owned by a guard that kills and reaps it on drop, so an aborted test never
//! leaves a renderer behind holding the output file open.

use crate::error::{Error, RenderError, Result};
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Bytes of renderer stderr kept for failure reports.
const STDERR_TAIL_BYTES: usize = 4096;

/// How long stderr may stay open after the renderer itself exited.
///
/// A helper process spawned by the renderer can inherit the pipe and keep it
/// open indefinitely; past this grace period the tail read so far is used.
const STDERR_GRACE: Duration = Duration::from_millis(200);

const POLL_INTERVAL_MIN: Duration = Duration::from_millis(2);
const POLL_INTERVAL_MAX: Duration = Duration::from_millis(50);

/// Outcome of a renderer run that exited with status 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
  pub exit_code: i32,
  pub elapsed: Duration,
  /// Tail of the renderer's stderr.
  pub stderr: String,
}

/// How to launch the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererCommand {
  program: PathBuf,
  working_dir: PathBuf,
  timeout: Duration,
  extra_args: Vec<OsString>,
}

impl RendererCommand {
  pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
      working_dir: working_dir.into(),
      timeout: DEFAULT_TIMEOUT,
      extra_args: Vec::new(),
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Arguments appended after `--model`/`--image`.
  pub fn with_extra_args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
  {
    self.extra_args = args.into_iter().map(Into::into).collect();
    self
  }

  pub fn program(&self) -> &Path {
    &self.program
  }

  pub fn working_dir(&self) -> &Path {
    &self.working_dir
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  /// Full argument vector for one render.
  pub fn args_for(&self, model: &Path, image: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
      "--model".into(),
      model.as_os_str().to_owned(),
      "--image".into(),
      image.as_os_str().to_owned(),
    ];
    args.extend(self.extra_args.iter().cloned());
    args
  }

  /// Render `model` into `image`, blocking until the renderer exits or the timeout elapses.
  ///
  /// Relative paths are resolved by the renderer against the working directory.
  pub fn render_model(&self, model: &Path, image: &Path) -> Result<ProcessResult> {
    let args = self.args_for(model, image);
    tracing::debug!(
      program = %self.program.display(),
      cwd = %self.working_dir.display(),
      args = ?args,
      "launching renderer"
    );

    let mut cmd = Command::new(&self.program);
    cmd
      .args(&args)
      .current_dir(&self.working_dir)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::piped());

    let start = Instant::now();
    let child = cmd.spawn().map_err(|source| Error::Launch {
      program: self.program.clone(),
      source,
    })?;
    let mut guard = ChildGuard::new(child);
    let stderr_rx = guard.take_stderr_reader();

    let status = match guard.wait_with_deadline(start + self.timeout) {
      Ok(Some(status)) => status,
      Ok(None) => {
        let pid = guard.pid();
        guard.kill();
        drop(stderr_rx);
        tracing::warn!(
          pid,
          timeout_ms = self.timeout.as_millis() as u64,
          "renderer timed out and was killed"
        );
        return Err(
          RenderError::Timeout {
            timeout: self.timeout,
            pid,
          }
          .into(),
        );
      }
      Err(err) => {
        guard.kill();
        drop(stderr_rx);
        return Err(Error::io(&self.program, err));
      }
    };

    let elapsed = start.elapsed();
    let stderr = collect_stderr(stderr_rx, Instant::now() + STDERR_GRACE);
    tracing::debug!(
      ?status,
      elapsed_ms = elapsed.as_millis() as u64,
      "renderer exited"
    );

    match status.code() {
      Some(0) => Ok(ProcessResult {
        exit_code: 0,
        elapsed,
        stderr,
      }),
      Some(code) => Err(RenderError::NonZeroExit { code, stderr }.into()),
      None => Err(RenderError::Terminated { stderr }.into()),
    }
  }
}

/// Owns a running child; kills and reaps it on drop unless it was already reaped.
struct ChildGuard {
  child: Child,
  reaped: bool,
}

impl ChildGuard {
  fn new(child: Child) -> Self {
    Self {
      child,
      reaped: false,
    }
  }

  fn pid(&self) -> u32 {
    self.child.id()
  }

  /// Stream stderr chunks from a detached thread. The channel closes at EOF.
  fn take_stderr_reader(&mut self) -> Option<Receiver<Vec<u8>>> {
    let mut stderr = self.child.stderr.take()?;
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
      let mut chunk = [0u8; 1024];
      loop {
        match stderr.read(&mut chunk) {
          Ok(0) => break,
          Ok(n) => {
            if tx.send(chunk[..n].to_vec()).is_err() {
              break;
            }
          }
          Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
          Err(_) => break,
        }
      }
    });
    Some(rx)
  }

  /// Poll until the child exits. `Ok(None)` means the deadline passed first.
  fn wait_with_deadline(&mut self, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    let mut interval = POLL_INTERVAL_MIN;
    loop {
      if let Some(status) = self.child.try_wait()? {
        self.reaped = true;
        return Ok(Some(status));
      }
      let now = Instant::now();
      if now >= deadline {
        return Ok(None);
      }
      thread::sleep(interval.min(deadline - now));
      interval = (interval * 2).min(POLL_INTERVAL_MAX);
    }
  }

  fn kill(&mut self) {
    if self.reaped {
      return;
    }
    let _ = self.child.kill();
    let _ = self.child.wait();
    self.reaped = true;
  }
}

impl Drop for ChildGuard {
  fn drop(&mut self) {
    if !self.reaped {
      tracing::warn!(pid = self.child.id(), "killing abandoned renderer");
      self.kill();
    }
  }
}

/// Gather stderr until EOF or `until`, keeping the last [`STDERR_TAIL_BYTES`].
fn collect_stderr(rx: Option<Receiver<Vec<u8>>>, until: Instant) -> String {
  let Some(rx) = rx else {
    return String::new();
  };
  let mut tail = Vec::new();
  loop {
    match rx.recv_timeout(until.saturating_duration_since(Instant::now())) {
      Ok(chunk) => {
        tail.extend_from_slice(&chunk);
        if tail.len() > 2 * STDERR_TAIL_BYTES {
          tail.drain(..tail.len() - STDERR_TAIL_BYTES);
        }
      }
      Err(RecvTimeoutError::Disconnected) => break,
      Err(RecvTimeoutError::Timeout) => {
        tracing::debug!("renderer stderr still open after exit; using partial tail");
        break;
      }
    }
  }
  let start = tail.len().saturating_sub(STDERR_TAIL_BYTES);
  String::from_utf8_lossy(&tail[start..]).into_owned()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn args_put_model_then_image() {
    let cmd = RendererCommand::new("renderer", ".");
    let args = cmd.args_for(
      Path::new("Models/bun_zipper.ply"),
      Path::new("Images/Bunny.received.png"),
    );
    assert_eq!(
      args,
      vec![
        OsString::from("--model"),
        OsString::from("Models/bun_zipper.ply"),
        OsString::from("--image"),
        OsString::from("Images/Bunny.received.png"),
      ]
    );
  }

  #[test]
  fn extra_args_follow_required_flags() {
    let cmd = RendererCommand::new("renderer", ".").with_extra_args(["--headless"]);
    let args = cmd.args_for(Path::new("m.ply"), Path::new("o.png"));
    assert_eq!(args.len(), 5);
    assert_eq!(args[4], OsString::from("--headless"));
  }

  #[test]
  fn default_timeout_is_bounded() {
    let cmd = RendererCommand::new("renderer", ".");
    assert_eq!(cmd.timeout(), DEFAULT_TIMEOUT);
    let cmd = cmd.with_timeout(Duration::from_millis(250));
    assert_eq!(cmd.timeout(), Duration::from_millis(250));
  }

  #[test]
  fn stderr_tail_keeps_last_bytes() {
    let (tx, rx) = mpsc::channel();
    tx.send(vec![b'a'; STDERR_TAIL_BYTES]).unwrap();
    tx.send(b"last line".to_vec()).unwrap();
    drop(tx);
    let tail = collect_stderr(Some(rx), Instant::now() + Duration::from_secs(5));
    assert_eq!(tail.len(), STDERR_TAIL_BYTES);
    assert!(tail.ends_with("last line"));
  }

  #[test]
  fn open_stderr_does_not_block_past_the_deadline() {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    tx.send(b"partial".to_vec()).unwrap();
    let start = Instant::now();
    let tail = collect_stderr(Some(rx), start + Duration::from_millis(50));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(tail, "partial");
    drop(tx);
  }

  #[test]
  fn missing_binary_is_a_launch_error() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = RendererCommand::new(dir.path().join("no-such-renderer"), dir.path());
    let err = cmd
      .render_model(Path::new("m.ply"), Path::new("o.png"))
      .unwrap_err();
    assert!(matches!(err, Error::Launch { .. }), "{err}");
  }
}
