use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "dingo")]
#[command(about = "Dingo CLI: DingTalk message-bridge gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the gateway (DingTalk channel, HTTP API and /events WebSocket). Stream mode needs a stream connector; without one it exits with an error.
    Gateway {
        /// Config file path (default: DINGO_CONFIG_PATH or ~/.dingo/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP and WebSocket port (default from config or 8099)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Print inbound messages from a running gateway, one JSON object per line.
    Listen {
        /// Config file path (default: DINGO_CONFIG_PATH or ~/.dingo/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Send a message through a running gateway.
    Send {
        /// Config file path (default: DINGO_CONFIG_PATH or ~/.dingo/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Recipient user id
        #[arg(long, short)]
        target: String,

        /// Send as markdown with this title instead of plain text
        #[arg(long)]
        markdown: Option<String>,

        /// Message body
        content: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("dingo {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Listen { config }) => {
            if let Err(e) = run_listen(config).await {
                log::error!("listen failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Send {
            config,
            target,
            markdown,
            content,
        }) => {
            if let Err(e) = run_send(config, target, markdown, content).await {
                log::error!("send failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = dingo::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting gateway on {}:{} (config {})",
        config.gateway.bind,
        config.gateway.port,
        path.display()
    );
    // No stream transport ships with the CLI.
    dingo::gateway::run_gateway(config, None).await
}

/// Host to dial for a gateway bound to `bind`.
fn dial_host(bind: &str) -> &str {
    match bind.trim() {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" => "::1",
        other => other,
    }
}

async fn run_listen(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, _) = dingo::config::load_config(config_path)?;
    let ws_url = format!(
        "ws://{}:{}/events",
        dial_host(&config.gateway.bind),
        config.gateway.port
    );
    let mut request = ws_url.as_str().into_client_request()?;
    if let Some(token) = dingo::config::resolve_gateway_token(&config) {
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {}", token).parse()?);
    }

    let (mut ws, _) = tokio_tungstenite::connect_async(request).await?;
    log::info!("listening for events on {}", ws_url);
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => println!("{}", text),
            Message::Close(_) => break,
            _ => {}
        }
    }
    log::info!("event stream closed");
    Ok(())
}

async fn run_send(
    config_path: Option<std::path::PathBuf>,
    target: String,
    markdown: Option<String>,
    content: String,
) -> anyhow::Result<()> {
    let (config, _) = dingo::config::load_config(config_path)?;
    let base = format!(
        "http://{}:{}",
        dial_host(&config.gateway.bind),
        config.gateway.port
    );
    let (url, body) = match markdown {
        Some(title) => (
            format!("{}/send/markdown", base),
            serde_json::json!({ "target": target, "title": title, "content": content }),
        ),
        None => (
            format!("{}/send/text", base),
            serde_json::json!({ "target": target, "content": content }),
        ),
    };
    let mut req = reqwest::Client::new().post(&url).json(&body);
    if let Some(token) = dingo::config::resolve_gateway_token(&config) {
        req = req.bearer_auth(token);
    }
    let res = req.send().await?;
    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
        anyhow::bail!("{} {}", status, text);
    }
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_binds_dial_loopback() {
        assert_eq!(dial_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(dial_host("::"), "::1");
        assert_eq!(dial_host(" 10.0.0.5 "), "10.0.0.5");
    }
}
