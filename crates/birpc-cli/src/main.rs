//! # birpc CLI Entry Point
//!
//! Main binary for birpc peers. Serves the demo components, calls methods on
//! a running peer, and lists what a peer advertises.
//!
//! ## Usage
//!
//! ```bash
//! # Expose Calc and Echo
//! birpc serve -b 127.0.0.1:9000
//!
//! # Call a method (outputs raw JSON)
//! birpc call ws://127.0.0.1:9000 Calc.add '[2, 3]'
//!
//! # Call every peer exposing a method
//! birpc call ws://127.0.0.1:9000 Echo.echo '"hi"' --all
//!
//! # List advertised methods
//! birpc list ws://127.0.0.1:9000
//! ```

use anyhow::Result;
use argh::FromArgs;
use birpc_common::transport::WsServer;

#[derive(FromArgs)]
/// birpc - bidirectional JSON-RPC 2.0 over WebSockets
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available CLI subcommands.
///
/// - **Serve**: Accept peers and expose the demo components
/// - **Call**: Make a single RPC call (unix-friendly JSON output)
/// - **List**: Print a peer's advertised methods
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    List(ListArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// expose the demo Calc and Echo components
struct ServeArgs {
    /// address to listen on for WebSocket peers
    #[argh(option, short = 'b', long = "bind", default = "\"127.0.0.1:9000\".into()")]
    bind: String,

    /// timeout in milliseconds for calls made to connected peers
    #[argh(option, long = "timeout-ms", default = "60000")]
    timeout_ms: u64,

    /// minimum spacing in milliseconds between re-syncs of one peer
    #[argh(option, long = "resync-ms", default = "2000")]
    resync_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method on a peer
struct CallArgs {
    /// peer address (e.g., ws://127.0.0.1:9000)
    #[argh(positional)]
    url: String,

    /// method name (e.g., Calc.add)
    #[argh(positional)]
    method: String,

    /// arguments as JSON: an array for several, any other value for one
    #[argh(positional)]
    args: Option<String>,

    /// call every connected remote exposing the method
    #[argh(switch)]
    all: bool,

    /// timeout in milliseconds for discovery and for the call
    #[argh(option, long = "timeout-ms", default = "60000")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "list")]
/// list the methods a peer advertises
struct ListArgs {
    /// peer address (e.g., ws://127.0.0.1:9000)
    #[argh(positional)]
    url: String,

    /// timeout in milliseconds for discovery
    #[argh(option, long = "timeout-ms", default = "60000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call and list print raw JSON on stdout, so logs go to stderr and stay quiet
    let default_level = match cli.command {
        Commands::Serve(_) => "info",
        Commands::Call(_) | Commands::List(_) => "warn",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => {
            let config = birpc_cli::manager_config(args.timeout_ms, args.resync_ms);
            let server = WsServer::bind(&args.bind).await?;
            tracing::info!("Listening on ws://{}", server.local_addr()?);
            birpc_cli::serve(server, birpc_cli::demo_manager(config)).await
        }
        Commands::Call(args) => {
            let params = birpc_cli::parse_call_args(args.args.as_deref())?;
            let config = birpc_cli::manager_config(args.timeout_ms, 0);
            let result = birpc_cli::call(&args.url, &args.method, params, args.all, config).await?;
            println!("{}", serde_json::to_string(&result)?);
            Ok(())
        }
        Commands::List(args) => {
            let config = birpc_cli::manager_config(args.timeout_ms, 0);
            for method in birpc_cli::list(&args.url, config).await? {
                println!("{}", method);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve_defaults() {
        let args: Cli = Cli::from_args(&["birpc"], &["serve"]).unwrap();
        match args.command {
            Commands::Serve(ServeArgs {
                bind,
                timeout_ms,
                resync_ms,
            }) => {
                assert_eq!(bind, "127.0.0.1:9000");
                assert_eq!(timeout_ms, 60000);
                assert_eq!(resync_ms, 2000);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_serve_with_flags() {
        let args: Cli = Cli::from_args(
            &["birpc"],
            &["serve", "-b", "0.0.0.0:7000", "--timeout-ms", "500", "--resync-ms", "100"],
        )
        .unwrap();
        match args.command {
            Commands::Serve(ServeArgs {
                bind,
                timeout_ms,
                resync_ms,
            }) => {
                assert_eq!(bind, "0.0.0.0:7000");
                assert_eq!(timeout_ms, 500);
                assert_eq!(resync_ms, 100);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli = Cli::from_args(
            &["birpc"],
            &["call", "ws://127.0.0.1:9000", "Calc.add", "[2, 3]"],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs {
                url,
                method,
                args,
                all,
                timeout_ms,
            }) => {
                assert_eq!(url, "ws://127.0.0.1:9000");
                assert_eq!(method, "Calc.add");
                assert_eq!(args.as_deref(), Some("[2, 3]"));
                assert!(!all);
                assert_eq!(timeout_ms, 60000);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_all_without_args() {
        let args: Cli = Cli::from_args(
            &["birpc"],
            &["call", "ws://127.0.0.1:9000", "Logger.flush", "--all"],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs { args, all, .. }) => {
                assert!(args.is_none());
                assert!(all);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_list() {
        let args: Cli = Cli::from_args(&["birpc"], &["list", "ws://127.0.0.1:9000"]).unwrap();
        match args.command {
            Commands::List(ListArgs { url, timeout_ms }) => {
                assert_eq!(url, "ws://127.0.0.1:9000");
                assert_eq!(timeout_ms, 60000);
            }
            _ => panic!("Expected List command"),
        }
    }

    #[test]
    fn test_cli_call_requires_method() {
        assert!(Cli::from_args(&["birpc"], &["call", "ws://127.0.0.1:9000"]).is_err());
    }
}
