//! Launch command construction.
//!
//! Commands are configured as single strings (`"llama-server --port 8080 -ngl 99"`) and split
//! here into a program and its arguments. Dynamic-model backends get the resolved model path
//! injected as `--model <path>`.
use std::fmt;
use std::path::Path;

const MODEL_FLAG: &str = "--model";

/// A program plus its arguments, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    /// Build from already split tokens. `None` when there are no tokens.
    pub fn from_tokens(mut tokens: Vec<String>) -> Option<Self> {
        if tokens.is_empty() {
            return None;
        }
        let program = tokens.remove(0);
        Some(Self {
            program,
            args: tokens,
        })
    }

    /// Split a configured command line. `None` for blank commands.
    pub fn parse(command: &str) -> Option<Self> {
        Self::from_tokens(split_command(command))
    }

    /// Parse a start command, injecting `--model <path>` when a model path is given.
    pub fn start(command: &str, model_path: Option<&Path>) -> Option<Self> {
        let mut tokens = split_command(command);
        if tokens.is_empty() {
            return None;
        }
        if let Some(path) = model_path {
            inject_model(&mut tokens, &path.to_string_lossy());
        }
        Self::from_tokens(tokens)
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Split a command line on whitespace. Single or double quotes group words and are removed;
/// backslashes are literal so Windows paths survive.
pub fn split_command(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }

    tokens
}

/// Replace the value of an existing `--model` flag, or append one.
fn inject_model(tokens: &mut Vec<String>, path: &str) {
    let prefixed = format!("{MODEL_FLAG}=");

    if let Some(idx) = tokens.iter().position(|t| t == MODEL_FLAG) {
        match tokens.get_mut(idx + 1) {
            Some(value) => *value = path.to_string(),
            None => tokens.push(path.to_string()),
        }
        return;
    }

    if let Some(token) = tokens.iter_mut().find(|t| t.starts_with(&prefixed)) {
        *token = format!("{prefixed}{path}");
        return;
    }

    tokens.push(MODEL_FLAG.to_string());
    tokens.push(path.to_string());
}
