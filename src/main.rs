use anyhow::Result;
use clap::{CommandFactory, Parser};
use photodrop_cli::{cli, commands, exit_code::ExitCodeError, ui};
use tracing_subscriber::EnvFilter;

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("error,photodrop_cli=info")
        } else {
            EnvFilter::new("error")
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        ui::error(&format!("Fatal error: {panic_info}"));
        ui::error("Please check your system resources and try again.");
        std::process::exit(1);
    }));

    let args: Vec<String> = std::env::args().collect();
    if args.len() == 1 {
        let mut cmd = cli::Cli::command();
        if cmd.print_help().is_err() {
            std::process::exit(1);
        }
        println!();
        return Ok(());
    }

    let cli = match cli::Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    print!("{e}");
                    std::process::exit(0);
                }
                _ => {
                    ui::error(&e.to_string());
                    std::process::exit(1);
                }
            }
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(cli.verbose))
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        cli::Commands::Auth { token } => commands::auth::execute(token).await,
        cli::Commands::Upload {
            gallery,
            files,
            order,
            used_bytes,
            limit_bytes,
            json,
        } => {
            commands::upload::execute(
                gallery,
                files,
                order,
                used_bytes,
                limit_bytes,
                cli.verbose,
                json,
            )
            .await
        }
        cli::Commands::Ls {
            gallery,
            order,
            json,
        } => commands::ls::execute(gallery, order, cli.verbose, json).await,
        cli::Commands::Config { action } => {
            use cli::ConfigSubcommand;
            use commands::config::ConfigAction;

            let config_action = match action {
                ConfigSubcommand::Get { key } => ConfigAction::Get { key },
                ConfigSubcommand::Set { key, value } => ConfigAction::Set { key, value },
                ConfigSubcommand::List => ConfigAction::List,
            };

            commands::config::execute(config_action).await
        }
    };

    handle_result(result)
}

fn handle_result(result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(exit) = e.downcast_ref::<ExitCodeError>() {
                if let Some(message) = exit.message() {
                    ui::error(message);
                }
                std::process::exit(exit.code());
            }

            if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                match io_err.kind() {
                    std::io::ErrorKind::BrokenPipe => {
                        ui::error("Connection interrupted");
                        std::process::exit(141);
                    }
                    _ => {
                        ui::error(&format!("IO Error: {e}"));
                        std::process::exit(1);
                    }
                }
            } else {
                let error_msg = format!("{:?}", e);
                if error_msg.contains("Caused by:") {
                    ui::error(&error_msg);
                } else {
                    ui::error(&format!("Error: {e}"));
                }
                std::process::exit(1);
            }
        }
    }
}
