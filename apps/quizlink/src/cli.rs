use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "quizlink",
    about = "Run a quiz session over a direct peer-to-peer data channel",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "QUIZLINK_RELAY_URL",
        default_value = "http://127.0.0.1:8080",
        help = "Base URL of the signaling relay"
    )]
    pub relay: String,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a session and wait for a participant.
    Host,
    /// Join an existing session as its participant.
    Join(JoinArgs),
}

#[derive(Args, Debug)]
pub struct JoinArgs {
    #[arg(value_name = "SESSION_ID")]
    pub session_id: String,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "QUIZLINK_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "QUIZLINK_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_takes_session_id() {
        let cli = Cli::try_parse_from(["quizlink", "join", "abc-123", "--relay", "http://relay"])
            .expect("parses");
        assert_eq!(cli.relay, "http://relay");
        match cli.command {
            Command::Join(args) => assert_eq!(args.session_id, "abc-123"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn log_level_is_a_value_enum() {
        let cli = Cli::try_parse_from(["quizlink", "--log-level", "debug", "host"]).expect("parses");
        assert_eq!(cli.logging.level, LogLevel::Debug);
        assert!(Cli::try_parse_from(["quizlink", "--log-level", "loud", "host"]).is_err());
    }
}
