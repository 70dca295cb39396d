//! External proxy control: syntax check and reload
//!
//! The deployer only knows the [`ProxyControl`] trait. The production
//! implementation shells out to configurable commands with a bounded timeout.

use futures::future::BoxFuture;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Placeholder substituted with the live configuration directory
pub const CONF_DIR_PLACEHOLDER: &str = "{conf_dir}";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid command {command:?}: {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    #[error("{program} exited with {code}: {output}")]
    Failed {
        program: String,
        code: String,
        output: String,
    },
}

/// Capability to validate and activate configuration on the proxy
pub trait ProxyControl: Send + Sync {
    /// Check the configuration in `conf_dir`. Returns the tool's output.
    fn check_syntax<'a>(&'a self, conf_dir: &'a Path) -> BoxFuture<'a, Result<String, ControlError>>;

    /// Make the running proxy pick up the configuration
    fn reload<'a>(&'a self, conf_dir: &'a Path) -> BoxFuture<'a, Result<String, ControlError>>;
}

/// Runs shell-style command lines, e.g. `nginx -t` and `nginx -s reload`
#[derive(Debug, Clone)]
pub struct CommandControl {
    syntax_check: Vec<String>,
    reload: Vec<String>,
    timeout: Duration,
}

impl CommandControl {
    pub fn new(syntax_check: &str, reload: &str, timeout: Duration) -> Result<Self, ControlError> {
        Ok(Self {
            syntax_check: parse_command(syntax_check)?,
            reload: parse_command(reload)?,
            timeout,
        })
    }

    async fn run(&self, argv: &[String], conf_dir: &Path) -> Result<String, ControlError> {
        let conf_dir = conf_dir.to_string_lossy();
        let argv: Vec<String> = argv
            .iter()
            .map(|arg| arg.replace(CONF_DIR_PLACEHOLDER, &conf_dir))
            .collect();
        let program = argv[0].clone();

        debug!(command = ?argv, "Running proxy control command");

        let mut cmd = Command::new(&program);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| ControlError::Spawn {
            program: program.clone(),
            source,
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ControlError::Spawn {
                program: program.clone(),
                source,
            })?,
            Err(_) => {
                warn!(program = %program, timeout_secs = self.timeout.as_secs(), "Command timed out");
                return Err(ControlError::TimedOut {
                    program,
                    timeout: self.timeout,
                });
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let text = text.trim().to_string();

        if output.status.success() {
            Ok(text)
        } else {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(ControlError::Failed {
                program,
                code,
                output: text,
            })
        }
    }
}

impl ProxyControl for CommandControl {
    fn check_syntax<'a>(&'a self, conf_dir: &'a Path) -> BoxFuture<'a, Result<String, ControlError>> {
        Box::pin(self.run(&self.syntax_check, conf_dir))
    }

    fn reload<'a>(&'a self, conf_dir: &'a Path) -> BoxFuture<'a, Result<String, ControlError>> {
        Box::pin(self.run(&self.reload, conf_dir))
    }
}

fn parse_command(command: &str) -> Result<Vec<String>, ControlError> {
    let argv = shell_words::split(command).map_err(|e| ControlError::InvalidCommand {
        command: command.to_string(),
        reason: e.to_string(),
    })?;
    if argv.is_empty() {
        return Err(ControlError::InvalidCommand {
            command: command.to_string(),
            reason: "empty command".to_string(),
        });
    }
    Ok(argv)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn control(check: &str, reload: &str) -> CommandControl {
        CommandControl::new(check, reload, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("nginx -t").unwrap(), vec!["nginx", "-t"]);
        assert_eq!(
            parse_command("sh -c 'echo a b'").unwrap(),
            vec!["sh", "-c", "echo a b"]
        );
        assert!(parse_command("").is_err());
        assert!(parse_command("   ").is_err());
        assert!(parse_command("echo 'unterminated").is_err());
    }

    #[tokio::test]
    async fn test_success_captures_output() {
        let control = control("echo syntax is ok", "true");
        let out = control.check_syntax(Path::new("/tmp")).await.unwrap();
        assert_eq!(out, "syntax is ok");
        assert!(control.reload(Path::new("/tmp")).await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_reports_output() {
        let control = control("sh -c 'echo emerg >&2; exit 1'", "false");
        let err = control.check_syntax(Path::new("/tmp")).await.unwrap_err();
        match err {
            ControlError::Failed { code, output, .. } => {
                assert_eq!(code, "1");
                assert_eq!(output, "emerg");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_conf_dir_is_substituted() {
        let control = control("echo {conf_dir}", "true");
        let out = control.check_syntax(Path::new("/etc/nginx/conf.d")).await.unwrap();
        assert_eq!(out, "/etc/nginx/conf.d");
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let control = CommandControl::new("sleep 5", "true", Duration::from_millis(100)).unwrap();
        let err = control.check_syntax(Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, ControlError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let control = control("/nonexistent/edgeplane-nginx -t", "true");
        let err = control.check_syntax(Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, ControlError::Spawn { .. }));
    }
}
