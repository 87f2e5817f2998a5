//! Command definitions
//!
//! [`Cli`] is the process command line. [`ReplCommand`] is parsed from each
//! line typed at the interactive prompt, with the same clap machinery.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dapsession", about = "Interactive debugger speaking the Debug Adapter Protocol")]
#[command(version, long_about = None)]
pub struct Cli {
    /// Program to launch
    #[arg(required_unless_present = "attach")]
    pub program: Option<PathBuf>,

    /// Arguments to pass to the program
    #[arg(last = true)]
    pub args: Vec<String>,

    /// Attach to a running process instead of launching
    #[arg(long, conflicts_with = "program")]
    pub attach: Option<u32>,

    /// Debug adapter to use (default from config)
    #[arg(long)]
    pub adapter: Option<String>,

    /// Working directory for the program
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Set breakpoint(s) before the program starts (file:line or function name)
    /// Can be specified multiple times: --break main --break src/file.c:42
    #[arg(long = "break", short = 'b')]
    pub breakpoints: Vec<String>,

    /// Stop at program entry point
    #[arg(long)]
    pub stop_on_entry: bool,

    /// Also write a detailed log file (including DAP traffic)
    #[arg(long)]
    pub log_file: bool,
}

/// One line typed at the prompt
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_version_flag = true)]
pub struct ReplLine {
    #[command(subcommand)]
    pub command: ReplCommand,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum ReplCommand {
    /// Set a breakpoint: file:line[:col], function name, *address or data:id
    #[command(alias = "b")]
    Break {
        location: String,

        /// Only stop when this expression is true
        #[arg(long, short)]
        condition: Option<String>,

        /// Only stop when the hit count satisfies this
        #[arg(long)]
        hit: Option<String>,

        /// Log this message instead of stopping
        #[arg(long)]
        log: Option<String>,
    },

    /// Delete a breakpoint
    #[command(alias = "d")]
    Delete { id: u32 },

    /// Delete every breakpoint in a source file
    Close { file: PathBuf },

    /// Enable a breakpoint, or all of them
    Enable { id: Option<u32> },

    /// Disable a breakpoint, or all of them
    Disable { id: Option<u32> },

    /// List breakpoints
    #[command(alias = "bl")]
    Breakpoints,

    /// Save breakpoints (default: the project's breakpoint store)
    Save { path: Option<PathBuf> },

    /// Load breakpoints (default: the project's breakpoint store)
    Load { path: Option<PathBuf> },

    /// Continue execution
    #[command(alias = "c")]
    Continue,

    /// Step over
    #[command(alias = "n")]
    Next,

    /// Step into
    #[command(alias = "s")]
    Step,

    /// Step out
    #[command(alias = "out")]
    Finish,

    /// Pause execution
    Pause,

    /// List threads
    Threads,

    /// Switch to a thread
    Thread { id: i64 },

    /// Print the call stack of the selected thread
    #[command(alias = "bt")]
    Backtrace,

    /// Select a stack frame (0 = innermost)
    #[command(alias = "f")]
    Frame { index: usize },

    /// Scopes of the selected frame
    Scopes,

    /// Expand a variables reference
    #[command(alias = "v")]
    Vars { reference: i64 },

    /// Evaluate an expression in the selected frame
    #[command(alias = "p")]
    Print {
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        expression: Vec<String>,
    },

    /// Re-evaluate an expression at every stop
    Watch {
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        expression: Vec<String>,
    },

    /// Remove a watch
    Unwatch { id: u32 },

    /// List watches and their last values
    Watches,

    /// Show buffered program output
    Output {
        /// Only the last N entries
        #[arg(long)]
        tail: Option<usize>,

        /// Clear the buffer after showing it
        #[arg(long)]
        clear: bool,
    },

    /// Show session status
    Status,

    /// Restart the program
    Restart,

    /// Detach, leaving the program running
    Detach,

    /// Terminate the program
    Kill,

    /// Exit the debugger
    #[command(alias = "q", alias = "exit")]
    Quit,
}

/// Split a prompt line into words; double quotes group words
pub fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_word = false;

    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ReplCommand {
        ReplLine::try_parse_from(split_words(line)).unwrap().command
    }

    #[test]
    fn test_split_words_honours_quotes() {
        assert_eq!(
            split_words(r#"break main.c:10 -c "x > 3""#),
            vec!["break", "main.c:10", "-c", "x > 3"]
        );
        assert_eq!(split_words("  c  "), vec!["c"]);
        assert_eq!(split_words(r#"p """#), vec!["p", ""]);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!(parse("c"), ReplCommand::Continue);
        assert_eq!(parse("bt"), ReplCommand::Backtrace);
        assert_eq!(parse("q"), ReplCommand::Quit);
        assert_eq!(parse("enable"), ReplCommand::Enable { id: None });
        assert_eq!(
            parse("close src/main.c"),
            ReplCommand::Close {
                file: PathBuf::from("src/main.c")
            }
        );
    }

    #[test]
    fn test_parse_break_with_condition() {
        assert_eq!(
            parse(r#"b file.c:42 -c "i == 3""#),
            ReplCommand::Break {
                location: "file.c:42".into(),
                condition: Some("i == 3".into()),
                hit: None,
                log: None,
            }
        );
    }

    #[test]
    fn test_parse_print_keeps_words() {
        assert_eq!(
            parse("p a + -b"),
            ReplCommand::Print {
                expression: vec!["a".into(), "+".into(), "-b".into()]
            }
        );
    }

    #[test]
    fn test_cli_requires_program_or_attach() {
        assert!(Cli::try_parse_from(["dapsession"]).is_err());
        let cli = Cli::try_parse_from(["dapsession", "--attach", "42"]).unwrap();
        assert_eq!(cli.attach, Some(42));
        let cli = Cli::try_parse_from(["dapsession", "-b", "main", "app", "--", "-v"]).unwrap();
        assert_eq!(cli.program, Some(PathBuf::from("app")));
        assert_eq!(cli.args, vec!["-v"]);
        assert_eq!(cli.breakpoints, vec!["main"]);
    }
}
