use std::io::BufRead;
use std::io::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::{mpsc, watch};

use chute::client_id::{format_client_id, generate_client_id};
use chute::{config, poller, ChuteClient, ConnectionManager, RendezvousClient};

#[derive(Parser)]
#[command(name = "chute")]
#[command(version)]
#[command(about = "Peer-to-peer point-to-point messaging client", long_about = None)]
struct Cli {
    /// Rendezvous server address (host:port); overrides CHUTE_SERVER_IP.
    #[arg(short, long)]
    server: Option<String>,

    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.debug {
        let log_level = log::LevelFilter::from_str(&cli.log_level)?;
        env_logger::Builder::new().filter(None, log_level).init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Warn)
            .init();
    }

    let server_addr = cli.server.unwrap_or_else(config::resolve_server_addr);
    let client_id = generate_client_id();

    println!("chute client starting");
    println!("client id: {}", format_client_id(&client_id));
    println!("server: {server_addr}");

    let manager = ConnectionManager::new(&client_id, &server_addr);
    let client = ChuteClient::new(&client_id, &server_addr, Arc::clone(&manager));

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let poller_handle = poller::spawn(
        Arc::clone(&client),
        RendezvousClient::new(&server_addr),
        shutdown_rx,
    );

    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager.check_rendezvous_health().await;
        });
    }

    // Stdin on its own thread; the async loop selects over the lines.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(8);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut buffer = String::new();
        loop {
            buffer.clear();
            match stdin.lock().read_line(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if line_tx.blocking_send(buffer.trim().to_owned()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    print_help();
    prompt();

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut announced_pending = String::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            _ = ticker.tick() => {
                for msg in client.messages().await {
                    println!("\nreceived: {msg}");
                    prompt();
                }
                let pending = client.pending();
                if pending != announced_pending {
                    if !pending.is_empty() {
                        println!(
                            "\nincoming connection request from {} (accept/decline)",
                            format_client_id(&pending)
                        );
                        prompt();
                    }
                    announced_pending = pending;
                }
            }
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                if line.is_empty() {
                    prompt();
                    continue;
                }
                if !run_command(&client, &line).await {
                    break;
                }
                prompt();
            }
        }
    }

    let _ = client.disconnect().await;
    if let Err(err) = client.unregister().await {
        log::warn!("unregister failed: {err}");
    }
    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(2), poller_handle).await;
    Ok(())
}

/// Runs one prompt command; returns false when the loop should exit.
async fn run_command(client: &ChuteClient, line: &str) -> bool {
    match line {
        "exit" => return false,
        "status" => {
            let status = client.status().await;
            println!("client id:  {}", format_client_id(&status.client_id));
            println!("server:     {}", status.server_addr);
            println!("connected:  {}", status.connected);
            if !status.peer_id.is_empty() {
                println!("peer:       {}", format_client_id(&status.peer_id));
            }
            println!(
                "rendezvous: {}",
                match (status.rendezvous_checked, status.rendezvous_healthy) {
                    (false, _) => "unchecked",
                    (true, true) => "healthy",
                    (true, false) => "unhealthy",
                }
            );
        }
        "messages" => {
            for msg in client.messages().await {
                println!("received: {msg}");
            }
        }
        "pending" => {
            let pending = client.pending();
            if pending.is_empty() {
                println!("no pending request");
            } else {
                println!("pending request from {}", format_client_id(&pending));
            }
        }
        "accept" => match client.accept().await {
            Ok(()) => println!("accepted"),
            Err(err) => println!("accept failed: {err}"),
        },
        "decline" => match client.decline().await {
            Ok(()) => println!("declined"),
            Err(err) => println!("decline failed: {err}"),
        },
        "disconnect" => match client.disconnect().await {
            Ok(()) => println!("disconnected"),
            Err(err) => println!("disconnect failed: {err}"),
        },
        _ if line.starts_with("connect ") => {
            let target = line.trim_start_matches("connect ");
            match client.connect(target).await {
                Ok(()) => println!("connect ok"),
                Err(err) => println!("connect failed: {err}"),
            }
        }
        _ if line.starts_with("send ") => {
            let message = line.trim_start_matches("send ");
            match client.send(message).await {
                Ok(()) => println!("sent"),
                Err(err) => println!("send failed: {err}"),
            }
        }
        _ => print_help(),
    }
    true
}

fn print_help() {
    println!("commands:");
    println!("  status");
    println!("  connect <id>");
    println!("  send <message>");
    println!("  messages");
    println!("  pending");
    println!("  accept");
    println!("  decline");
    println!("  disconnect");
    println!("  exit");
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}
