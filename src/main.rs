use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{debug, error};

use logmux::cli::{QueryArgs, ResolveArgs};

/// Query logs across many hosts at once
#[derive(Parser)]
#[command(name = "logmux")]
#[command(about = "logmux - distributed log querying over ssh", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one query against a set of logstreams and print the result
    Query {
        /// Logstream spec, e.g. "user@host1:22:/var/log/syslog,web-*"
        #[arg(value_name = "LSTREAMS")]
        lstreams: String,

        /// Start of the time window (RFC 3339, "YYYY-MM-DD HH:MM", or
        /// relative like "-2h")
        #[arg(long, default_value = "-1h")]
        from: String,

        /// End of the time window; open-ended when omitted
        #[arg(long)]
        to: Option<String>,

        /// Filter pattern (awk regular expression)
        #[arg(short, long)]
        query: Option<String>,

        /// How many log lines to fetch from each logstream at most
        #[arg(long, default_value = "250")]
        max_lines: usize,

        /// Use the external ssh binary instead of the built-in SSH client
        #[arg(long)]
        external_ssh: bool,

        /// Ephemeral SSH key provider (mock, external, or empty to disable)
        #[arg(long, default_value = "")]
        ephemeral_key_provider: String,

        /// Logstreams config file (default: ~/.config/logmux/logstreams.yaml)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// SSH config file (default: ~/.ssh/config)
        #[arg(long, value_name = "PATH")]
        ssh_config: Option<PathBuf>,

        /// How long to wait for all streams to connect, in seconds
        #[arg(long, default_value = "30")]
        connect_timeout: u64,

        /// Print the merged response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show what a logstream spec resolves to, without connecting
    Resolve {
        /// Logstream spec
        #[arg(value_name = "LSTREAMS")]
        lstreams: String,

        /// Resolve for the external-ssh transport mode
        #[arg(long)]
        external_ssh: bool,

        /// Logstreams config file (default: ~/.config/logmux/logstreams.yaml)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// SSH config file (default: ~/.ssh/config)
        #[arg(long, value_name = "PATH")]
        ssh_config: Option<PathBuf>,
    },
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn init_tracing(verbose: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(log_level(verbose))
        .with_target(verbose >= 2)
        .with_writer(std::io::stderr)
        .init();

    debug!("logmux started with verbosity level: {verbose}");
}

async fn execute_command(command: Option<Commands>) -> anyhow::Result<()> {
    match command {
        Some(Commands::Query {
            lstreams,
            from,
            to,
            query,
            max_lines,
            external_ssh,
            ephemeral_key_provider,
            config,
            ssh_config,
            connect_timeout,
            json,
        }) => {
            logmux::cli::run_query(QueryArgs {
                lstreams,
                from,
                to,
                query,
                max_num_lines: max_lines,
                external_ssh,
                ephemeral_key_provider,
                config,
                ssh_config,
                connect_timeout_secs: connect_timeout,
                json,
            })
            .await
        }
        Some(Commands::Resolve {
            lstreams,
            external_ssh,
            config,
            ssh_config,
        }) => {
            logmux::cli::run_resolve(ResolveArgs {
                lstreams,
                external_ssh,
                config,
                ssh_config,
            })
            .await
        }
        None => {
            let mut cmd = Cli::command();
            let _ = cmd.print_help();
            println!();
            Ok(())
        }
    }
}

fn handle_fatal_error(error: anyhow::Error) -> ! {
    error!("fatal error: {error}");
    eprintln!("Error: {error}");
    std::process::exit(1)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    if let Err(e) = execute_command(cli.command).await {
        handle_fatal_error(e);
    }
}
