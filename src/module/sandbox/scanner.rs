//! Textual pre-scan for disallowed operations
//!
//! Best-effort only: obfuscated code can slip past a word match, which is why
//! execution also runs in a restricted namespace inside its own process.
//!
//! Besides the configured block-list, the scan rejects shapes that would step
//! around the namespace: redirections, path separators (absolute or relative
//! paths to host binaries and files), command names produced by expansion and
//! the `.` builtin. Quoting and backslashes are stripped before matching so
//! `e''val` and `e\val` read as `eval`.

use std::collections::HashSet;

/// Reported for any `/` in the code
pub const PATH_OPERATION: &str = "path";
/// Reported for `<` or `>`
pub const REDIRECTION_OPERATION: &str = "redirection";
/// Reported when a command name starts with an expansion
pub const DYNAMIC_COMMAND_OPERATION: &str = "dynamic-command";
/// Reported for the `.` builtin
pub const SOURCE_OPERATION: &str = "source";

/// Reserved words that may precede a command name
const SHELL_KEYWORDS: &[&str] = &[
    "!", "if", "then", "else", "elif", "fi", "do", "done", "while", "until", "for", "case", "in",
    "esac",
];

/// Word-level block-list matcher
#[derive(Debug, Clone)]
pub struct CodeScanner {
    blocked: HashSet<String>,
}

impl CodeScanner {
    pub fn new<I, S>(blocked: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blocked: blocked.into_iter().map(Into::into).collect(),
        }
    }

    /// First disallowed operation found in `code`, if any
    ///
    /// Words are maximal runs of ASCII alphanumerics, `_` and `-` after quote
    /// removal.
    pub fn scan(&self, code: &str) -> Option<String> {
        let unquoted: String = code
            .chars()
            .filter(|c| !matches!(c, '\'' | '"' | '\\'))
            .collect();

        if unquoted.contains(['<', '>']) {
            return Some(REDIRECTION_OPERATION.to_string());
        }
        if unquoted.contains('/') {
            return Some(PATH_OPERATION.to_string());
        }

        if let Some(word) = unquoted
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .filter(|word| !word.is_empty())
            .find(|word| self.blocked.contains(*word))
        {
            return Some(word.to_string());
        }

        let operation = command_words(&unquoted).find_map(|word| {
            if word == "." {
                Some(SOURCE_OPERATION.to_string())
            } else if word.starts_with('$') {
                Some(DYNAMIC_COMMAND_OPERATION.to_string())
            } else {
                None
            }
        });
        operation
    }
}

/// First word of every simple command, skipping keywords and assignments
fn command_words(code: &str) -> impl Iterator<Item = &str> {
    code.split(|c: char| matches!(c, ';' | '|' | '&' | '\n' | '(' | ')' | '`' | '{' | '}'))
        .filter_map(|segment| {
            let mut words = segment.split_whitespace();
            let first = words.next()?;
            // `case WORD in` and `for NAME in ...` hold no command
            if first == "case" || first == "for" {
                return None;
            }
            std::iter::once(first)
                .chain(words)
                .find(|word| !SHELL_KEYWORDS.contains(word) && !is_assignment(word))
        })
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}
