#![allow(dead_code)]

use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Get the path to a test script file
pub fn get_script_path(file: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("scripts")
        .join(file)
}

pub fn has_python3() -> bool {
    Command::new("python3")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

pub fn has_setsid() -> bool {
    Command::new("setsid")
        .arg("true")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

pub fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// A port the OS considers free right now.
pub fn free_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Isolated storage and home directories for running the `happys` binary.
pub struct TestEnv {
    temp_dir: TempDir,
    happys_bin: PathBuf,
    home_dir: PathBuf,
    storage_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let home_dir = temp_dir.path().join("home");
        let storage_dir = temp_dir.path().join("stacks");
        fs::create_dir_all(&home_dir).unwrap();
        fs::create_dir_all(&storage_dir).unwrap();

        // keep concurrently running tests off each other's ports
        let base = free_port();
        fs::write(
            storage_dir.join("config.toml"),
            format!(
                "[settings.ports]\nserver_base = {base}\nui_base = {}\n\n[settings.ready]\ntimeout = \"20s\"\ninterval = \"100ms\"\n\n[settings.kill]\ngrace = \"2s\"\n",
                base.saturating_add(100)
            ),
        )
        .unwrap();

        Self {
            temp_dir,
            happys_bin: PathBuf::from(env!("CARGO_BIN_EXE_happys")),
            home_dir,
            storage_dir,
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn stack_dir(&self, name: &str) -> PathBuf {
        self.storage_dir.join(name)
    }

    pub fn runtime_state_path(&self, name: &str) -> PathBuf {
        self.stack_dir(name).join("stack.runtime.json")
    }

    pub fn read_runtime_state(&self, name: &str) -> Option<serde_json::Value> {
        let raw = fs::read_to_string(self.runtime_state_path(name)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn read_log(&self, name: &str, file: &str) -> String {
        fs::read_to_string(self.stack_dir(name).join("logs").join(file)).unwrap_or_default()
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.happys_bin);
        cmd.args(args)
            .current_dir(self.temp_dir.path())
            .env("HOME", &self.home_dir)
            .env("HAPPY_STACKS_STORAGE_DIR", &self.storage_dir)
            .env("HAPPY_STACKS_LOG", "debug")
            .env_remove("HAPPY_STACKS_STACK")
            .env_remove("HAPPY_LOCAL_STACK")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Run a happys command and return the output
    pub fn run_command(&self, args: &[&str]) -> Output {
        self.run_command_with_env(args, &[])
    }

    /// Run a happys command with additional environment variables
    pub fn run_command_with_env(&self, args: &[&str], extra_env: &[(&str, &str)]) -> Output {
        let mut cmd = self.command(args);
        for (key, val) in extra_env {
            cmd.env(key, val);
        }
        let output = cmd.output().expect("Failed to execute happys command");
        println!("$ happys {}", args.join(" "));
        println!("stdout: {}", String::from_utf8_lossy(&output.stdout));
        println!("stderr: {}", String::from_utf8_lossy(&output.stderr));
        output
    }

    /// Create a stack whose server is the python health fixture.
    pub fn new_python_stack(&self, name: &str, extra: &[&str]) -> Output {
        let script = get_script_path("health_server.py");
        let server_cmd = format!("SERVER_CMD=python3 {}", script.display());
        let mut args = vec!["stack", "new", name, "--set", server_cmd.as_str()];
        for e in extra {
            args.push(e);
        }
        self.run_command(&args)
    }

    /// Polls `f` until it returns true or `timeout` elapses.
    pub fn wait_until(&self, timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        f()
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        // best effort: never leave supervisors behind
        for entry in fs::read_dir(&self.storage_dir).into_iter().flatten().flatten() {
            if entry.path().join("stack.runtime.json").exists()
                && let Some(name) = entry.file_name().to_str()
            {
                let _ = self.command(&["stack", "stop", name]).output();
            }
        }
    }
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// stderr with miette's line wrapping and gutter undone, for substring checks.
pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr)
        .replace('│', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn http_ok(port: u16) -> bool {
    use std::io::{Read, Write};
    let Ok(mut sock) = std::net::TcpStream::connect(("127.0.0.1", port)) else {
        return false;
    };
    let _ = sock.set_read_timeout(Some(Duration::from_secs(2)));
    if sock
        .write_all(b"GET /health HTTP/1.0\r\nHost: localhost\r\n\r\n")
        .is_err()
    {
        return false;
    }
    let mut buf = String::new();
    let _ = sock.read_to_string(&mut buf);
    buf.starts_with("HTTP/1.0 200") || buf.starts_with("HTTP/1.1 200")
}
