use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::ServeArgs,
    frame::{CallRequest, CallResponse, CallStatus},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "beach-relay")]
#[command(about = "Beach Relay call server and peer tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server (default when no command is given)
    Serve(ServeArgs),

    /// Send one call to a connected peer through the relay's HTTP endpoint
    Call {
        /// Relay base URL
        #[arg(short, long, default_value = "http://localhost:21480")]
        url: String,

        /// Target peer ID
        #[arg(short, long)]
        peer: String,

        /// Method name forwarded to the peer
        #[arg(short, long)]
        method: String,

        /// Payload sent as the call's data, taken verbatim
        #[arg(short, long, default_value = "")]
        data: String,

        /// Call ID; a random one is generated when omitted
        #[arg(long)]
        call_id: Option<String>,
    },

    /// Connect as a peer and answer every call with its own payload
    Echo {
        /// Relay WebSocket base URL
        #[arg(short, long, default_value = "ws://localhost:21480")]
        url: String,

        /// Peer ID to register under
        #[arg(short, long)]
        peer: String,
    },
}

pub async fn run_call(
    url: String,
    peer: String,
    method: String,
    data: String,
    call_id: Option<String>,
) -> Result<()> {
    let call_id = call_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let request = CallRequest::new(peer, call_id, method, data.into_bytes());
    let endpoint = format!("{}/call", url.trim_end_matches('/'));
    debug!("POST {} call_id={}", endpoint, request.call_id);

    let response = reqwest::Client::new()
        .post(&endpoint)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(request.to_bytes())
        .send()
        .await
        .with_context(|| format!("failed to reach relay at {endpoint}"))?;
    let http_status = response.status();
    let body = response.bytes().await.context("failed to read relay response")?;
    let reply = CallResponse::from_bytes(&body)
        .map_err(|err| anyhow!("relay answered {http_status} with an unreadable body: {err}"))?;

    println!("{}", reply.to_text());
    if !reply.data.is_empty() {
        println!("{}", String::from_utf8_lossy(&reply.data));
    }
    if reply.status != CallStatus::Ok {
        bail!("call failed with status {}", reply.status.code());
    }
    Ok(())
}

pub async fn run_echo(url: String, peer: String) -> Result<()> {
    let ws_url = format!("{}/ws?peerId={}", url.trim_end_matches('/'), peer);
    let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after {} seconds", CONNECT_TIMEOUT.as_secs());
            return Err(anyhow!("Connection timeout - is the relay running?"));
        }
    };
    info!("echo peer {} connected to {}", peer, ws_url);
    let (mut write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        match msg? {
            Message::Binary(bytes) => {
                if let Some(reply) = echo_reply(&bytes) {
                    write.send(Message::Text(reply.into())).await?;
                }
            }
            Message::Close(frame) => {
                info!("relay closed the connection: {:?}", frame);
                break;
            }
            // Replies to calls this peer never makes.
            Message::Text(_) => {}
            _ => {}
        }
    }
    Ok(())
}

/// Reply text for one inbound request frame, or `None` when it can't be
/// decoded.
pub fn echo_reply(bytes: &[u8]) -> Option<String> {
    match CallRequest::from_bytes(bytes) {
        Ok(request) => {
            debug!(call_id = %request.call_id, method = %request.method, "echoing call");
            Some(CallResponse::ok(request.call_id, request.method, request.data).to_text())
        }
        Err(err) => {
            warn!(error = %err, "ignoring undecodable request frame");
            None
        }
    }
}
