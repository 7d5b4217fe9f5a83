use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::envelope::ActionError;
use crate::state::{env_optional, tail_excerpt};

pub(crate) const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const PROCESS_POLL_MS: u64 = 50;
const PIPE_DRAIN_MS: u64 = 100;
pub(crate) const STDERR_EXCERPT_CHARS: usize = 2_000;

#[derive(Debug, Default, Clone)]
pub(crate) struct ExecOptions {
    /// 0 means "use the default".
    pub(crate) timeout_ms: u64,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) stdin_text: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct ExecOutcome {
    pub(crate) exit_code: Option<i32>,
    pub(crate) signal: Option<i32>,
    pub(crate) killed: bool,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) duration_ms: u64,
}

impl ExecOutcome {
    pub(crate) fn success(&self) -> bool {
        !self.killed && self.exit_code == Some(0)
    }

    /// Exit code as a JSON value, reporting the signal when the process was
    /// killed by one (teacher convention: "signal 9" instead of null).
    pub(crate) fn exit_info(&self) -> serde_json::Value {
        if let Some(code) = self.exit_code {
            serde_json::json!(code)
        } else if let Some(sig) = self.signal {
            serde_json::json!(format!("signal {sig}"))
        } else {
            serde_json::json!("unknown")
        }
    }

    /// Execution metadata attached to every response envelope.
    pub(crate) fn meta_json(&self) -> serde_json::Value {
        serde_json::json!({
            "exitCode": self.exit_info(),
            "signal": self.signal,
            "killed": self.killed,
            "durationMs": self.duration_ms,
        })
    }
}

/// Optional wrapper prefix for every spawned backend command, e.g.
/// `DESKRELAY_COMMAND_WRAPPER="docker exec workbox"`.
pub(crate) fn command_wrapper() -> Option<Vec<String>> {
    env_optional("DESKRELAY_COMMAND_WRAPPER").map(|raw| {
        raw.split_whitespace()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
    })
}

pub(crate) fn build_backend_command(program: &str, args: &[String]) -> Command {
    let mut cmd = if let Some(wrapper) = command_wrapper() {
        let mut c = Command::new(&wrapper[0]);
        c.args(&wrapper[1..]).arg(program).args(args);
        c
    } else {
        let mut c = Command::new(program);
        c.args(args);
        c
    };

    // Process group isolation: the child becomes its own process group leader
    // so a timeout kill takes the whole tree without touching the adapter.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    cmd
}

/// Kill a child process and its entire process group: SIGTERM the group
/// first, short grace, then SIGKILL anything still alive.
#[cfg(unix)]
pub(crate) fn kill_process_tree(child: &mut std::process::Child) {
    let pid = child.id() as i32;
    unsafe {
        libc::kill(-pid, libc::SIGTERM);
    }
    thread::sleep(Duration::from_millis(500));
    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => unsafe {
            libc::killpg(pid, libc::SIGKILL);
        },
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
pub(crate) fn kill_process_tree(child: &mut std::process::Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn status_signal(status: &std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}

fn spawn_reader(
    pipe: Option<impl Read + Send + 'static>,
    buf: Arc<Mutex<Vec<u8>>>,
) {
    let Some(mut pipe) = pipe else {
        return;
    };
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if let Ok(mut guard) = buf.lock() {
                        guard.extend_from_slice(&chunk[..n]);
                    }
                }
                Err(_) => break,
            }
        }
    });
}

fn drain_buffer(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8_lossy(&buf.lock().unwrap_or_else(|e| e.into_inner())).to_string()
}

/// Run a backend command with a hard wall-clock bound. Always resolves to an
/// `ExecOutcome` — including on timeout, where the child tree is killed and
/// `killed = true` — except when the executable itself cannot be spawned,
/// which is the one transport-level `Err`.
pub(crate) fn run_command(
    program: &str,
    args: &[String],
    opts: &ExecOptions,
) -> Result<ExecOutcome, String> {
    let timeout_ms = if opts.timeout_ms == 0 {
        DEFAULT_TIMEOUT_MS
    } else {
        opts.timeout_ms
    };

    let mut cmd = build_backend_command(program, args);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if opts.stdin_text.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &opts.env {
        cmd.env(key, value);
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| format!("spawn {program}: {e}"))?;

    if let Some(text) = &opts.stdin_text {
        if let Some(mut stdin) = child.stdin.take() {
            // Best effort: the child may exit before consuming everything.
            let _ = stdin.write_all(text.as_bytes());
        }
    }

    let stdout_buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    spawn_reader(child.stdout.take(), stdout_buf.clone());
    spawn_reader(child.stderr.take(), stderr_buf.clone());

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                // Give reader threads a moment to drain remaining pipe data.
                thread::sleep(Duration::from_millis(PIPE_DRAIN_MS));
                return Ok(ExecOutcome {
                    exit_code: status.code(),
                    signal: status_signal(&status),
                    killed: false,
                    stdout: drain_buffer(&stdout_buf),
                    stderr: drain_buffer(&stderr_buf),
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
            Ok(None) => {
                if start.elapsed() >= Duration::from_millis(timeout_ms) {
                    eprintln!("[exec] {program} exceeded {timeout_ms}ms, killing process tree");
                    kill_process_tree(&mut child);
                    let status = child
                        .wait()
                        .map_err(|e| format!("wait {program} after kill: {e}"))?;
                    thread::sleep(Duration::from_millis(PIPE_DRAIN_MS));
                    return Ok(ExecOutcome {
                        exit_code: status.code(),
                        signal: status_signal(&status),
                        killed: true,
                        stdout: drain_buffer(&stdout_buf),
                        stderr: drain_buffer(&stderr_buf),
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                }
                thread::sleep(Duration::from_millis(PROCESS_POLL_MS));
            }
            Err(err) => return Err(format!("wait {program}: {err}")),
        }
    }
}

/// Backend stdout is JSON when the backend cooperates; anything else is kept
/// raw so callers still see what came back.
pub(crate) fn parse_stdout_json(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout.trim()).unwrap_or_else(|_| serde_json::json!({ "raw": stdout }))
}

/// Fold a failed backend invocation into the router error shape, with the
/// stderr tail attached for offline troubleshooting.
pub(crate) fn backend_failure(program: &str, outcome: &ExecOutcome) -> ActionError {
    let message = if outcome.killed {
        format!("{program} timed out after {}ms", outcome.duration_ms)
    } else {
        format!("{program} failed (exit {})", outcome.exit_info())
    };
    let mut detail = outcome.meta_json();
    if let Some(map) = detail.as_object_mut() {
        map.insert(
            "stderrExcerpt".to_string(),
            serde_json::json!(tail_excerpt(&outcome.stderr, STDERR_EXCERPT_CHARS)),
        );
    }
    ActionError::Backend { message, detail }
}

// ── HTTP ─────────────────────────────────────────────────────────────────

/// The HTTP counterpart of `ExecOutcome`. A transport failure (DNS, TLS,
/// refused connection, timeout) carries `transport_error`; a reachable server
/// that answered non-2xx carries `status` with the response body. Never both.
#[derive(Debug)]
pub(crate) struct HttpOutcome {
    pub(crate) status: Option<u16>,
    pub(crate) body: String,
    pub(crate) transport_error: Option<String>,
    pub(crate) duration_ms: u64,
}

impl HttpOutcome {
    pub(crate) fn success(&self) -> bool {
        matches!(self.status, Some(code) if (200..300).contains(&code))
    }
}

pub(crate) fn http_call(
    method: &str,
    url: &str,
    headers: &[(String, String)],
    json_body: Option<&serde_json::Value>,
    timeout_ms: u64,
) -> HttpOutcome {
    let timeout_ms = if timeout_ms == 0 {
        DEFAULT_TIMEOUT_MS
    } else {
        timeout_ms
    };
    let start = Instant::now();
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_millis(timeout_ms))
        .timeout_read(Duration::from_millis(timeout_ms))
        .timeout_write(Duration::from_millis(timeout_ms))
        .build();
    let mut req = match method {
        "GET" => agent.get(url),
        "POST" => agent.post(url),
        "PUT" => agent.put(url),
        "PATCH" => agent.patch(url),
        "DELETE" => agent.delete(url),
        other => {
            return HttpOutcome {
                status: None,
                body: String::new(),
                transport_error: Some(format!("unsupported method: {other}")),
                duration_ms: 0,
            };
        }
    };
    for (key, value) in headers {
        req = req.set(key, value);
    }
    let response = match json_body {
        Some(body) => req.send_json(body.clone()),
        None => req.call(),
    };
    match response {
        Ok(resp) => {
            let status = resp.status();
            let body = resp.into_string().unwrap_or_default();
            HttpOutcome {
                status: Some(status),
                body,
                transport_error: None,
                duration_ms: start.elapsed().as_millis() as u64,
            }
        }
        Err(ureq::Error::Status(code, resp)) => {
            let body = resp.into_string().unwrap_or_default();
            HttpOutcome {
                status: Some(code),
                body,
                transport_error: None,
                duration_ms: start.elapsed().as_millis() as u64,
            }
        }
        Err(err) => HttpOutcome {
            status: None,
            body: String::new(),
            transport_error: Some(err.to_string()),
            duration_ms: start.elapsed().as_millis() as u64,
        },
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
