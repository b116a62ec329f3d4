//! Short-lived subprocesses whose output we need (`<cli> daemon start`,
//! rebuild commands). Long-lived stack children are spawned by
//! `stack::runner` instead.

use crate::Result;
use miette::IntoDiagnostic;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Full environment of the child; nothing is inherited.
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Parses a user-supplied command line (`CLI_BUILD_CMD`).
    pub fn from_shell_words(line: &str) -> Result<Self> {
        let mut words = shell_words::split(line).into_diagnostic()?.into_iter();
        let program = words
            .next()
            .ok_or_else(|| miette::miette!("empty command"))?;
        Ok(Self::new(program).args(words))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut words = vec![self.program.as_str()];
        words.extend(self.args.iter().map(String::as_str));
        write!(f, "{}", shell_words::join(words))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

pub trait CommandRunner: Send + Sync {
    /// Runs to completion and captures output. A non-zero exit is returned as
    /// output, not as an error; only a failure to spawn is an error.
    fn capture(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

pub struct DuctRunner;

impl CommandRunner for DuctRunner {
    fn capture(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!("$ {spec}");
        let mut expr = duct::cmd(&spec.program, &spec.args)
            .full_env(&spec.env)
            .stdin_null()
            .stdout_capture()
            .stderr_capture()
            .unchecked();
        if let Some(dir) = &spec.cwd {
            expr = expr.dir(dir);
        }
        let out = expr
            .run()
            .map_err(|e| miette::miette!("failed to run {}: {e}", spec.program))?;
        let output = CommandOutput {
            code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        };
        trace!("{} exited with {:?}", spec.program, output.code);
        Ok(output)
    }
}

pub mod fake {
    //! Scripted [`CommandRunner`] for tests.

    use super::*;
    use std::sync::Mutex;

    type Handler = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

    /// Matches each call against registered patterns (substring of the
    /// rendered command line); the most recently registered match wins.
    /// Unmatched calls succeed with empty output.
    #[derive(Default)]
    pub struct FakeRunner {
        handlers: Mutex<Vec<(String, Handler)>>,
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on<F>(&self, pattern: &str, handler: F) -> &Self
        where
            F: Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static,
        {
            self.handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((pattern.to_string(), Box::new(handler)));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.specs().iter().map(|s| s.to_string()).collect()
        }

        pub fn specs(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    impl CommandRunner for FakeRunner {
        fn capture(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(spec.clone());
            let line = spec.to_string();
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            Ok(handlers
                .iter()
                .rev()
                .find(|(pattern, _)| line.contains(pattern.as_str()))
                .map(|(_, handler)| handler(spec))
                .unwrap_or_else(|| CommandOutput::ok("")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeRunner;
    use super::*;

    #[test]
    fn test_from_shell_words() -> Result<()> {
        let spec = CommandSpec::from_shell_words("yarn --cwd '/src/happy cli' build")?;
        assert_eq!(spec.program, "yarn");
        assert_eq!(spec.args, vec!["--cwd", "/src/happy cli", "build"]);
        assert_eq!(spec.to_string(), "yarn --cwd '/src/happy cli' build");
        assert!(CommandSpec::from_shell_words("  ").is_err());
        Ok(())
    }

    #[test]
    fn test_combined_output() {
        let out = CommandOutput {
            code: Some(1),
            stdout: "a\n".into(),
            stderr: "b\n".into(),
        };
        assert_eq!(out.combined(), "a\nb");
        assert!(!out.success());
        assert_eq!(CommandOutput::failed(2, "boom").combined(), "boom");
    }

    #[cfg(unix)]
    #[test]
    fn test_duct_runner_captures_nonzero() -> Result<()> {
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .env("PATH", "/usr/bin:/bin");
        let out = DuctRunner.capture(&spec)?;
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_duct_runner_clears_env() -> Result<()> {
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo \"${ONLY:-}${HOME:-}\""])
            .env("PATH", "/usr/bin:/bin")
            .env("ONLY", "x");
        let out = DuctRunner.capture(&spec)?;
        assert_eq!(out.stdout.trim(), "x");
        Ok(())
    }

    #[test]
    fn test_fake_runner_latest_match_wins() -> Result<()> {
        let runner = FakeRunner::new();
        runner
            .on("daemon start", |_| CommandOutput::failed(1, "first"))
            .on("daemon start", |_| CommandOutput::ok("second"));
        let out = runner.capture(&CommandSpec::new("happy").args(["daemon", "start"]))?;
        assert_eq!(out.stdout, "second");
        let out = runner.capture(&CommandSpec::new("happy").args(["daemon", "stop"]))?;
        assert!(out.success());
        assert_eq!(runner.calls(), vec!["happy daemon start", "happy daemon stop"]);
        Ok(())
    }
}
