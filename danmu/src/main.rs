use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::{debug, error, info, warn};

use danmu_core::{
    init_logging, Config, DouyinProtocol, KuaishouProtocol, LiveChatClient, PlatformProtocol,
    RequestSigner, ResolvedSession, RoomObserver, RoomStats, SessionResolver, StaticSession,
    StaticSigner, TerminalStatus, WebSocketTransport,
};
use danmu_providers::{DouyinRoomResolver, ScriptSigner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Platform {
    Douyin,
    Kuaishou,
}

#[derive(Parser, Debug)]
#[command(name = "danmu")]
#[command(about = "Stream live-room chat as JSON lines", long_about = None)]
struct Args {
    /// Config file (YAML, TOML or JSON)
    #[arg(long, env = "DANMU_CONFIG")]
    config: Option<String>,

    #[arg(long, value_enum)]
    platform: Platform,

    /// Room identifier as it appears in the room's URL
    #[arg(long)]
    room: String,

    /// Skip room discovery and connect to this session id
    #[arg(long)]
    session_id: Option<String>,

    /// Fixed signature token, instead of running the signer script
    #[arg(long, env = "DANMU_SIGNATURE")]
    signature: Option<String>,

    /// How often buffered events are drained and printed
    #[arg(long, default_value = "500")]
    poll_interval_ms: u64,
}

/// Logs room figures as they change.
struct LogObserver;

impl RoomObserver for LogObserver {
    fn on_room_stats(&self, stats: &RoomStats) {
        debug!(online = ?stats.online, display = ?stats.display, "room stats");
    }

    fn on_stream_ended(&self) {
        info!("broadcaster ended the stream");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = Config::load(args.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    init_logging(&config.logging)?;

    // 3. Collaborators
    let resolver: Arc<dyn SessionResolver> = match (&args.session_id, args.platform) {
        (Some(session_id), _) => Arc::new(StaticSession(ResolvedSession {
            session_id: session_id.clone(),
            cookies: config.provider.cookie.clone(),
        })),
        (None, Platform::Douyin) => Arc::new(DouyinRoomResolver::new(&config.provider)?),
        (None, Platform::Kuaishou) => {
            return Err(anyhow::anyhow!("--session-id is required for kuaishou rooms"));
        }
    };

    let signer: Option<Arc<dyn RequestSigner>> = match (&args.signature, &config.signer.script_path) {
        (Some(token), _) => Some(Arc::new(StaticSigner(token.clone()))),
        (None, Some(_)) => Some(Arc::new(ScriptSigner::from_config(&config.signer)?)),
        (None, None) => None,
    };

    let mut transport = WebSocketTransport::new(config.client.connect_timeout());
    if let Some(proxy) = &config.client.proxy_address {
        transport = transport.with_proxy(proxy)?;
    }

    let poll_interval = Duration::from_millis(args.poll_interval_ms.max(10));
    match args.platform {
        Platform::Douyin => {
            run(DouyinProtocol::new(), transport, resolver, signer, &args.room, &config, poll_interval).await
        }
        Platform::Kuaishou => {
            run(KuaishouProtocol::new(), transport, resolver, signer, &args.room, &config, poll_interval).await
        }
    }
}

async fn run<P: PlatformProtocol>(
    protocol: P,
    transport: WebSocketTransport,
    resolver: Arc<dyn SessionResolver>,
    signer: Option<Arc<dyn RequestSigner>>,
    room: &str,
    config: &Config,
    poll_interval: Duration,
) -> Result<()> {
    let mut client = LiveChatClient::new(room, protocol, transport, resolver, config.client.clone())
        .with_observer(Arc::new(LogObserver));
    if let Some(signer) = signer {
        client = client.with_signer(signer);
    }

    info!(platform = client.platform(), room, "connecting");
    client.connect().await?;

    let mut ticker = tokio::time::interval(poll_interval);
    let mut states = client.subscribe_state();
    let terminal = client.wait_terminal();
    tokio::pin!(terminal);

    let status = loop {
        tokio::select! {
            _ = ticker.tick() => print_events(&client)?,
            Ok(()) = states.changed() => {
                let state = *states.borrow_and_update();
                info!(?state, "connection state changed");
            }
            status = &mut terminal => break status,
            () = shutdown_signal() => {
                client.disconnect().await;
                break TerminalStatus::Stopped;
            }
        }
    };
    print_events(&client)?;

    let evicted = client.evicted_events();
    if evicted > 0 {
        warn!(evicted, "events were dropped because the buffer was full");
    }

    match status {
        TerminalStatus::Ended | TerminalStatus::Stopped => {
            info!(?status, "finished");
            Ok(())
        }
        other => {
            error!(?other, "client stopped");
            Err(anyhow::anyhow!("client stopped: {other:?}"))
        }
    }
}

fn print_events<P: PlatformProtocol>(
    client: &LiveChatClient<P, WebSocketTransport>,
) -> Result<()> {
    let events = client.drain_events();
    if events.is_empty() {
        return Ok(());
    }
    let mut out = std::io::stdout().lock();
    for event in &events {
        writeln!(out, "{}", serde_json::to_string(event)?)?;
    }
    out.flush()?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
