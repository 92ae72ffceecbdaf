//! External renderer invocation for diagram validation.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::{AppError, Result};

use super::DiagramValidator;

/// Validator that pipes diagram source to an external renderer command
/// and treats a non-zero exit as a validation failure.
pub struct CommandValidator {
    program: String,
    args: Vec<String>,
}

impl CommandValidator {
    /// Build from a whitespace-separated command line, e.g.
    /// `"mmdc --input -"`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the command line is empty.
    pub fn new(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_owned);
        let program = parts
            .next()
            .ok_or_else(|| AppError::Config("validator command is empty".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl DiagramValidator for CommandValidator {
    async fn validate(&self, source: &str) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| AppError::Validation(format!("failed to launch renderer: {err}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(source.as_bytes())
                .await
                .map_err(|err| AppError::Validation(format!("failed to feed renderer: {err}")))?;
            // Close stdin so the renderer sees EOF.
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| AppError::Validation(format!("renderer did not exit: {err}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let diagnostic = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            if diagnostic.is_empty() {
                Err(AppError::Validation(format!(
                    "renderer exited with {}",
                    output.status
                )))
            } else {
                Err(AppError::Validation(diagnostic))
            }
        }
    }
}
