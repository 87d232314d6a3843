//! Command packing for transport through a remote login shell.
//!
//! A remote SSH session hands its command line to the user's login shell, so
//! arguments containing quotes, globs, or newlines would otherwise be
//! reinterpreted. Commands are therefore quoted, base64 encoded, and
//! re-expanded on the guest with `eval set -- ... && exec "$@"`.

use std::borrow::Cow;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use shell_escape::unix::escape;

const PACK_PREFIX: &str = "eval set -- \"$(echo ";
const PACK_SUFFIX: &str = " | base64 --decode)\" && exec \"$@\"";

/// A command to run on a guest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteCommand {
    /// A shell snippet, executed as `sh -c <snippet>`.
    Shell(String),
    /// An argument vector executed verbatim.
    Argv(Vec<String>),
}

impl RemoteCommand {
    /// Builds an argument vector command from any string-like items.
    #[must_use]
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Argv(args.into_iter().map(Into::into).collect())
    }

    /// Returns the argument vector executed on the guest.
    #[must_use]
    pub fn into_argv(self) -> Vec<String> {
        match self {
            Self::Shell(script) => vec![String::from("sh"), String::from("-c"), script],
            Self::Argv(args) => args,
        }
    }

    /// Wraps the command so it runs through `sudo --`.
    #[must_use]
    pub fn sudo(self) -> Self {
        let mut args = vec![String::from("sudo"), String::from("--")];
        args.extend(self.into_argv());
        Self::Argv(args)
    }
}

impl From<&str> for RemoteCommand {
    fn from(value: &str) -> Self {
        Self::Shell(value.to_owned())
    }
}

impl From<String> for RemoteCommand {
    fn from(value: String) -> Self {
        Self::Shell(value)
    }
}

impl From<Vec<String>> for RemoteCommand {
    fn from(value: Vec<String>) -> Self {
        Self::Argv(value)
    }
}

impl From<&[&str]> for RemoteCommand {
    fn from(value: &[&str]) -> Self {
        Self::argv(value.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for RemoteCommand {
    fn from(value: [&str; N]) -> Self {
        Self::argv(value)
    }
}

/// Renders `args` for log output using minimal POSIX escaping.
#[must_use]
pub fn shell_quote<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| escape(Cow::Borrowed(arg.as_ref())).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quotes every argument in single quotes, the way `getopt --shell sh` does.
///
/// Embedded single quotes become `'\''`.
#[must_use]
pub fn shell_safe<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| format!("'{}'", arg.as_ref().replace('\'', "'\\''")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Packs `args` into a single line that any POSIX login shell expands back
/// into the identical argument vector before `exec`.
#[must_use]
pub fn shell_pack<S: AsRef<str>>(args: &[S]) -> String {
    let encoded = STANDARD.encode(shell_safe(args));
    format!("{PACK_PREFIX}{encoded}{PACK_SUFFIX}")
}

/// Recovers the argument vector from a line produced by [`shell_pack`].
///
/// Returns `None` when the line is not a packed command.
#[must_use]
pub fn unpack(line: &str) -> Option<Vec<String>> {
    let encoded = line.strip_prefix(PACK_PREFIX)?.strip_suffix(PACK_SUFFIX)?;
    let decoded = STANDARD.decode(encoded).ok()?;
    split_quoted(&String::from_utf8(decoded).ok()?)
}

fn split_quoted(text: &str) -> Option<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut chars = text.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                started = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        inner => current.push(inner),
                    }
                }
            }
            '\\' => {
                started = true;
                current.push(chars.next()?);
            }
            ' ' => {
                if started {
                    args.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            other => {
                started = true;
                current.push(other);
            }
        }
    }

    if started {
        args.push(current);
    }
    Some(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::process::Command;

    #[test]
    fn shell_safe_quotes_like_getopt() {
        assert_eq!(shell_safe(&["echo", "it's"]), "'echo' 'it'\\''s'");
    }

    #[test]
    fn shell_pack_wraps_base64_payload() {
        let packed = shell_pack(&["true"]);
        assert_eq!(
            packed,
            "eval set -- \"$(echo J3RydWUn | base64 --decode)\" && exec \"$@\""
        );
    }

    #[rstest]
    #[case(vec!["echo", "plain"])]
    #[case(vec!["printf", "%s", "a b", "", "it's", "$HOME", "`id`", "*", "line\nbreak", "\\"])]
    fn unpack_recovers_packed_arguments(#[case] args: Vec<&str>) {
        let packed = shell_pack(&args);
        let recovered = unpack(&packed).expect("packed line should unpack");
        assert_eq!(recovered, args);
    }

    #[test]
    fn unpack_rejects_unpacked_lines() {
        assert!(unpack("echo hi").is_none());
    }

    #[test]
    fn packed_command_preserves_arguments_through_a_real_shell() {
        let args = [
            "printf",
            "[%s]",
            "a b",
            "it's",
            "$HOME",
            "*",
            "semi;colon",
            "two\nlines",
            "",
        ];
        let output = Command::new("sh")
            .arg("-c")
            .arg(shell_pack(&args))
            .output()
            .expect("sh should run");

        assert!(output.status.success(), "sh failed: {output:?}");
        assert_eq!(
            String::from_utf8_lossy(&output.stdout),
            "[a b][it's][$HOME][*][semi;colon][two\nlines][]"
        );
    }

    #[test]
    fn shell_string_runs_through_sh_c() {
        let argv = RemoteCommand::from("echo $HOME").into_argv();
        assert_eq!(argv, vec!["sh", "-c", "echo $HOME"]);
    }

    #[test]
    fn sudo_prefixes_argv() {
        let argv = RemoteCommand::from(["cloud-init", "clean"]).sudo().into_argv();
        assert_eq!(argv, vec!["sudo", "--", "cloud-init", "clean"]);
    }

    #[test]
    fn shell_quote_escapes_for_logs() {
        assert_eq!(shell_quote(&["echo", "a b"]), "echo 'a b'");
    }
}
