//! Command-line surface, translated from `servercli.cpp`: a positional
//! grpc-style endpoint plus `-c`/`-d` flags, each overridable by an
//! `GSTTRANSFORMER_*`-prefixed environment variable. The env var names are
//! kept verbatim since they are wire-visible operational surface, not an
//! implementation detail (SPEC_FULL §AMBIENT STACK).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "gsttransformerserver",
    about = "Bidirectional streaming media transform gRPC server"
)]
pub struct Cli {
    /// grpc style endpoint to listen on, e.g. `0.0.0.0:50051`.
    #[arg(env = "GSTTRANSFORMER_ENDPOINT")]
    pub endpoint: String,

    /// JSON configuration file (see SPEC_FULL §6 for the schema). Absent
    /// means an all-defaults `ServicePolicy`.
    #[arg(short = 'c', long = "config-file", env = "GSTTRANSFORMER_CONFIG_PATH")]
    pub config_file: Option<PathBuf>,

    /// Debug level: trace, debug, info, notice, warn, or error. `notice` is
    /// mapped onto `tracing`'s `warn` level, which is the closest match.
    #[arg(
        short = 'd',
        long = "log-level",
        env = "GSTTRANSFORMER_LOG_LEVEL",
        default_value = "info"
    )]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoint_and_defaults() {
        let cli = Cli::parse_from(["gsttransformerserver", "0.0.0.0:50051"]);
        assert_eq!(cli.endpoint, "0.0.0.0:50051");
        assert_eq!(cli.log_level, "info");
        assert!(cli.config_file.is_none());
    }

    #[test]
    fn parses_config_and_log_level_flags() {
        let cli = Cli::parse_from([
            "gsttransformerserver",
            "-c",
            "/etc/gsttransformer.json",
            "-d",
            "debug",
            "127.0.0.1:9000",
        ]);
        assert_eq!(cli.endpoint, "127.0.0.1:9000");
        assert_eq!(cli.log_level, "debug");
        assert_eq!(
            cli.config_file,
            Some(PathBuf::from("/etc/gsttransformer.json"))
        );
    }
}
