mod config;
mod error;
mod logging;
mod server;

use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::Parser;
use mcp::ClientInfo;
use runtime::{AnthropicBackend, Backend, McpToolHost, Session, ToolHost};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use config::Config;
use error::Result;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Chat with a model that can call tools on an MCP server", long_about = None)]
#[command(version)]
struct Cli {
    /// Tool server to launch (.py, .js, or an executable)
    server: PathBuf,

    /// Arguments passed through to the server
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    server_args: Vec<String>,

    /// Config file (defaults to ./skiff.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model to use, overriding the config file
    #[arg(short, long)]
    model: Option<String>,

    /// Maximum model turns per query
    #[arg(long)]
    max_rounds: Option<NonZeroUsize>,
}

#[tokio::main]
async fn main() {
    logging::init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::discover(cli.config.as_deref())?;

    // Fail on a missing key before any child process exists.
    let api_key = config.api_key()?;
    let model = cli.model.unwrap_or_else(|| config.backend.model.clone());
    let backend = AnthropicBackend::builder(api_key, &model)
        .max_tokens(config.backend.max_tokens)
        .base_url(&config.backend.base_url)
        .build();

    let server = server::server_config(
        &cli.server,
        cli.server_args,
        config.session.request_timeout(),
    );
    let client_info = ClientInfo::new("skiff", env!("CARGO_PKG_VERSION"));
    let host = McpToolHost::connect(server, client_info).await?;

    println!("\nConnected to server with tools: {:?}", host.tool_names());
    debug!(%model, "session starting");

    let mut session = Session::new(backend, host)
        .with_max_rounds(cli.max_rounds.unwrap_or(config.session.max_rounds).get());
    if let Some(system) = &config.session.system {
        session = session.with_system(system);
    }

    let outcome = tokio::select! {
        outcome = chat_loop(&mut session) => outcome,
        _ = tokio::signal::ctrl_c() => {
            println!();
            Ok(())
        }
    };

    // Release the server on every exit path.
    if let Err(e) = session.end().shutdown().await {
        warn!(error = %e, "tool server shutdown failed");
    }

    outcome
}

async fn chat_loop<B: Backend, H: ToolHost>(session: &mut Session<B, H>) -> Result<()> {
    println!("\nMCP client started!");
    println!("Type your queries or 'quit' to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = io::stdout();

    loop {
        print!("\nQuery: ");
        stdout.flush()?;

        let Some(line) = lines.next_line().await? else {
            // EOF
            println!();
            break;
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if is_exit(input) {
            break;
        }

        match session.chat(input).await {
            Ok(answer) => {
                println!("\n{answer}");
                let usage = session.usage();
                debug!(
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "session token usage"
                );
            }
            Err(runtime::Error::RoundLimit { rounds }) => {
                eprintln!("\nCould not complete the request: the model was still calling tools after {rounds} rounds.");
            }
            Err(e) if is_fatal(&e) => return Err(e.into()),
            Err(e) => eprintln!("\nError: {e}"),
        }
    }

    Ok(())
}

fn is_exit(input: &str) -> bool {
    input.eq_ignore_ascii_case("quit") || input.eq_ignore_ascii_case("exit")
}

/// Errors that every later query would hit too.
fn is_fatal(err: &runtime::Error) -> bool {
    matches!(err, runtime::Error::Model(e) if e.is_auth())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_commands_ignore_case() {
        assert!(is_exit("quit"));
        assert!(is_exit("EXIT"));
        assert!(is_exit("Quit"));
        assert!(!is_exit("quit now"));
        assert!(!is_exit("weather"));
    }

    #[test]
    fn server_args_pass_through() {
        let cli = Cli::parse_from(["skiff", "-m", "claude-haiku", "server.py", "--port", "8"]);
        assert_eq!(cli.server, PathBuf::from("server.py"));
        assert_eq!(cli.server_args, ["--port", "8"]);
        assert_eq!(cli.model.as_deref(), Some("claude-haiku"));
    }

    #[test]
    fn max_rounds_must_be_positive() {
        let cli = Cli::parse_from(["skiff", "--max-rounds", "3", "server.py"]);
        assert_eq!(cli.max_rounds.map(NonZeroUsize::get), Some(3));
        assert!(Cli::try_parse_from(["skiff", "--max-rounds", "0", "server.py"]).is_err());
    }

    #[test]
    fn only_auth_failures_end_the_chat() {
        let auth = runtime::Error::Model(runtime::ModelError::Api {
            status: 401,
            message: "invalid x-api-key".into(),
        });
        assert!(is_fatal(&auth));

        let overloaded = runtime::Error::Model(runtime::ModelError::Api {
            status: 529,
            message: "overloaded".into(),
        });
        assert!(!is_fatal(&overloaded));
        assert!(!is_fatal(&runtime::Error::RoundLimit { rounds: 3 }));
    }
}
