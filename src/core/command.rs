use crate::domain::model::{Machine, OptionValue};
use std::fmt;

/// Per-task values that option macros (`@NAME`, ...) expand to.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext<'a> {
    pub machine: &'a Machine,
    pub username: &'a str,
    pub group_index: usize,
    pub group_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    NotAShebang(String),
    UnsupportedShebang(String),
    UnknownMacro(String),
    EmptyScript,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::NotAShebang(line) => {
                write!(f, "First line of script is not a shebang: {}", line)
            }
            CommandError::UnsupportedShebang(line) => write!(f, "Unsupported shebang: {}", line),
            CommandError::UnknownMacro(name) => write!(f, "Unknown macro: \"{}\"", name),
            CommandError::EmptyScript => f.write_str("Script is empty"),
        }
    }
}

impl std::error::Error for CommandError {}

/// Quotes `value` so that a POSIX shell passes it through unchanged.
pub fn shell_quote(value: &str) -> String {
    let is_plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));

    if is_plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Runs `commands` one after another with bash, which might not be the
/// default shell on the remote machine.
pub fn bash_wrap(commands: &[String]) -> String {
    format!("bash -c {}", shell_quote(&commands.join(" && ")))
}

fn expand_option(value: &OptionValue, ctx: &TaskContext<'_>) -> Result<String, CommandError> {
    match value {
        OptionValue::Str(s) if s.starts_with('@') => match s.as_str() {
            "@GROUP_INDEX" => Ok(ctx.group_index.to_string()),
            "@GROUP_SIZE" => Ok(ctx.group_size.to_string()),
            "@NAME" => Ok(ctx.machine.name.clone()),
            "@EXTERNAL" => Ok(ctx.machine.external_addr.clone()),
            "@INTERNAL" => Ok(ctx.machine.internal_addr.clone()),
            "@USERNAME" => Ok(ctx.username.to_string()),
            other => Err(CommandError::UnknownMacro(other.to_string())),
        },
        other => Ok(other.to_string()),
    }
}

/// The argument string passed to the script, with macros expanded.
pub fn generate_options(args: &[OptionValue], ctx: &TaskContext<'_>) -> Result<String, CommandError> {
    let mut options = String::new();
    for arg in args {
        options.push(' ');
        options.push_str(&shell_quote(&expand_option(arg, ctx)?));
    }
    Ok(options)
}

/// Builds the full remote command for one task.
pub fn generate_command(
    task_name: &str,
    script: &str,
    prelude: Option<&str>,
    workdir: Option<&str>,
    args: &[OptionValue],
    ctx: &TaskContext<'_>,
) -> Result<String, CommandError> {
    let mut cmd = String::new();

    if let Some(workdir) = workdir.filter(|w| !w.is_empty()) {
        cmd.push_str(&format!("cd {} && ", quote_path(workdir)));
    }

    if let Some(prelude) = prelude {
        cmd.push_str(prelude);
    }

    let first_line = script.lines().next().ok_or(CommandError::EmptyScript)?;
    if !first_line.contains("#!") {
        return Err(CommandError::NotAShebang(first_line.to_string()));
    }

    let options = generate_options(args, ctx)?;

    if first_line.contains("python") {
        cmd.push_str(&format!("python3 -c {}{}", shell_quote(script), options));
    } else if first_line.contains("bash") {
        // the name fills $0 so that options start at $1
        cmd.push_str(&format!(
            "bash -c {} {}{}",
            shell_quote(script),
            shell_quote(task_name),
            options
        ));
    } else {
        return Err(CommandError::UnsupportedShebang(first_line.to_string()));
    }

    Ok(cmd)
}

/// Like `shell_quote` but keeps a leading `~/` expandable.
pub(crate) fn quote_path(path: &str) -> String {
    if path == "~" {
        return path.to_string();
    }
    match path.strip_prefix("~/") {
        Some(rest) => format!("~/{}", shell_quote(rest)),
        None => shell_quote(path),
    }
}
