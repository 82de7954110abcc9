//! Command classification.
//!
//! Pure text inspection deciding how a block's completion is detected. It
//! never changes how the channel is opened.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a block finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Runs to completion and reports an exit status.
    #[default]
    OneShot,
    /// Produces output until cancelled.
    Continuous,
    /// Reads caller input until stdin is closed.
    Interactive,
}

impl Classification {
    /// Returns the display name for this classification.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneShot => "one_shot",
            Self::Continuous => "continuous",
            Self::Interactive => "interactive",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::OneShot => 0,
            Self::Continuous => 1,
            Self::Interactive => 2,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Programs that always take over the terminal.
const INTERACTIVE_PROGRAMS: &[&str] = &[
    "vi", "vim", "nvim", "nano", "emacs", "pico", "less", "more", "most", "man", "ssh", "telnet", "ftp", "sftp",
    "tmux", "screen", "passwd", "su", "mc", "ranger", "nnn", "htop", "btop", "top", "fzf",
];

/// Programs that become a REPL when given no arguments.
const REPL_PROGRAMS: &[&str] = &[
    "sh", "bash", "zsh", "fish", "dash", "python", "python3", "ipython", "node", "irb", "ghci", "lua", "psql",
    "mysql", "sqlite3", "redis-cli", "mongo", "mongosh", "cat", "bc",
];

/// Programs that never exit on their own.
const STREAMING_PROGRAMS: &[&str] = &["watch", "yes", "tcpdump", "iftop", "nload"];

/// Programs that stream when given one of the listed flags.
const FOLLOW_FLAGS: &[(&str, &[&str])] = &[
    ("tail", &["-f", "-F", "--follow"]),
    ("journalctl", &["-f", "--follow"]),
    ("dmesg", &["-w", "--follow"]),
    ("kubectl", &["-f", "--follow", "-w", "--watch"]),
    ("docker", &["-f", "--follow"]),
    ("podman", &["-f", "--follow"]),
];

/// Classifies a command line.
///
/// Every segment of a pipeline or command list is inspected and the most
/// demanding classification wins. `sudo`, `env`, `nohup`, `time`, and leading
/// `NAME=value` assignments are skipped.
#[must_use]
pub fn classify(command: &str) -> Classification {
    command
        .split(['|', ';', '&'])
        .map(classify_segment)
        .max_by_key(|c| c.rank())
        .unwrap_or_default()
}

fn classify_segment(segment: &str) -> Classification {
    let mut words = segment.split_whitespace().peekable();

    // Skip wrappers and environment assignments.
    while let Some(&word) = words.peek() {
        let is_assignment = word
            .split_once('=')
            .is_some_and(|(name, _)| !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        match word {
            "sudo" | "env" | "nohup" | "time" | "exec" | "command" => {
                words.next();
                while let Some(flag) = words.next_if(|w| w.starts_with('-')) {
                    match flag {
                        // Login shell.
                        "-i" | "-s" | "--login" | "--shell" => return Classification::Interactive,
                        "-u" | "-g" | "-C" => {
                            words.next();
                        }
                        _ => {}
                    }
                }
            }
            _ if is_assignment => {
                words.next();
            }
            _ => break,
        }
    }

    let Some(program) = words.next() else {
        return Classification::OneShot;
    };
    let program = program.rsplit('/').next().unwrap_or(program);
    let args: Vec<&str> = words.collect();

    let follows = FOLLOW_FLAGS
        .iter()
        .find(|(name, _)| *name == program)
        .is_some_and(|(_, flags)| args.iter().any(|a| flags.contains(a)));
    if follows {
        return Classification::Continuous;
    }

    if INTERACTIVE_PROGRAMS.contains(&program) {
        return Classification::Interactive;
    }

    // Only flags (or nothing) means the program waits on stdin.
    if REPL_PROGRAMS.contains(&program) && args.iter().all(|a| a.starts_with('-')) {
        return Classification::Interactive;
    }

    if STREAMING_PROGRAMS.contains(&program) {
        return Classification::Continuous;
    }

    if program == "ping" && !args.iter().any(|a| a.starts_with("-c")) {
        return Classification::Continuous;
    }

    Classification::OneShot
}
