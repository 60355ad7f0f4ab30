use std::time::Duration;

use resilient_ws::StreamClient;
use resilient_ws::core::{ClientConfig, ConnectionState, Priority};
use resilient_ws::machine::StateChange;
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "basic_connect\n\
  Connects to a websocket endpoint, sends one message and prints what comes back.\n\
  Reconnects automatically when the connection drops.\n\
\n\
USAGE:\n\
  cargo run --example basic_connect -- [--url <ws-url>] [--send <text>] [--secs <N>]\n\
\n\
DEFAULTS:\n\
  --url   wss://ws.postman-echo.com/raw\n\
  --send  hello\n\
  --secs  10\n\
"
}

fn parse_args() -> (String, String, u64) {
    let mut url = "wss://ws.postman-echo.com/raw".to_string();
    let mut send = "hello".to_string();
    let mut secs = 10;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--url" => url = it.next().unwrap_or(url),
            "--send" => send = it.next().unwrap_or(send),
            "--secs" => secs = it.next().and_then(|s| s.parse().ok()).unwrap_or(secs),
            "-h" | "--help" => {
                print!("{}", usage());
                std::process::exit(0);
            }
            other => {
                eprintln!("unknown argument: {other}\n\n{}", usage());
                std::process::exit(2);
            }
        }
    }
    (url, send, secs)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (url, payload, secs) = parse_args();
    let client = StreamClient::new(ClientConfig::default())?;
    client
        .subscribe(|change: &StateChange| {
            if change.is_state_change() {
                println!("state: {} -> {} ({:?})", change.from, change.to, change.event);
            }
            if let Some(error) = &change.error {
                println!(
                    "error: {} (recoverable: {}, attempt {})",
                    error.message, error.recoverable, error.attempt
                );
            }
        })
        .await?;

    let mut messages = client.messages();
    client.connect(url.as_str()).await?;
    client
        .wait_for_state(ConnectionState::Connected, Duration::from_secs(10))
        .await?;

    let outcome = client.send(payload, Priority::Normal).await?;
    println!("send: {outcome:?}");

    let deadline = tokio::time::sleep(Duration::from_secs(secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            msg = messages.recv() => match msg {
                Ok(bytes) => println!("recv: {}", String::from_utf8_lossy(&bytes)),
                Err(err) => {
                    eprintln!("message stream ended: {err}");
                    break;
                }
            },
        }
    }

    let metrics = client.metrics().await?;
    println!(
        "sent={} received={} errors={}",
        metrics.messages_sent, metrics.messages_received, metrics.error_count
    );
    client.disconnect(None, None).await?;
    client
        .wait_for_state(ConnectionState::Disconnected, Duration::from_secs(5))
        .await?;
    client.terminate(None).await?;
    Ok(())
}
