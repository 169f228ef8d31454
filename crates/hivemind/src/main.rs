use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "hivemind", about = "Coordinate co-located AI CLI agents", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the terminal daemon in the foreground
    Daemon,
    /// Run the coordination engine host (spawns the roster, routes triggers)
    Run {
        /// Spawn every pane as a dry-run mock instead of a real agent CLI
        #[arg(long)]
        dry_run: bool,
    },
    /// Write a message into a recipient's trigger mailbox
    Send {
        /// Recipient role, group name, or `all`
        recipient: String,
        /// Message body
        text: String,
        /// Sender role for the message header
        #[arg(long, default_value = "operator")]
        from: String,
    },
    /// Show the pane roster as the daemon sees it
    Health,
    /// Check that the daemon is up
    Ping,
}

fn main() {
    let cli = Cli::parse();

    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("hivemind: {}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let paths = hive_paths::HivePaths::resolve()?;

    match cli.command {
        Commands::Daemon => commands::daemon::run(&paths),
        Commands::Run { dry_run } => commands::host::run(&paths, dry_run),
        Commands::Send {
            recipient,
            text,
            from,
        } => commands::send::run(&paths, &recipient, &text, &from),
        Commands::Health => commands::health::run(&paths),
        Commands::Ping => commands::ping::run(&paths),
    }
}
