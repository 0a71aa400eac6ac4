//! Line-delimited JSON transport
//!
//! One request per input line:
//!
//! ```json
//! {"id": 1, "channel": "vpn:connect", "data": {"serverId": "us-ny-1"}}
//! ```
//!
//! Each request is handled on its own task, so a slow `connect` does not
//! hold up `status` or `logs`. Responses echo the request `id` and may
//! arrive out of order. Engine events are interleaved as
//! `{"event": ..., "data": ...}` lines.

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use vpnd_ipc::{Dispatcher, EventFrame, Request, Response};

/// Serve requests from `input` until it closes and all requests are answered
pub async fn serve<R, W>(
    dispatcher: Dispatcher,
    input: R,
    mut output: W,
    mut events: mpsc::UnboundedReceiver<EventFrame>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut pending = JoinSet::new();
    let mut reading = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if reading => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    pending.spawn(handle_line(dispatcher.clone(), line));
                }
                Ok(None) => {
                    info!("Command input closed");
                    reading = false;
                }
                Err(e) => {
                    error!("Command input failed: {}", e);
                    reading = false;
                }
            },
            Some(done) = pending.join_next() => match done {
                Ok(response) => write_frame(&mut output, &response).await?,
                Err(e) => error!("Request task failed: {}", e),
            },
            Some(frame) = events.recv() => write_frame(&mut output, &frame).await?,
        }

        if !reading && pending.is_empty() {
            break;
        }
    }

    output.flush().await?;
    Ok(())
}

async fn handle_line(dispatcher: Dispatcher, line: String) -> Response {
    match serde_json::from_str::<Request>(&line) {
        Ok(request) => {
            debug!("Request on {}", request.channel);
            let data = dispatcher.handle(&request.channel, &request.data).await;
            Response {
                id: request.id,
                channel: request.channel,
                data,
            }
        }
        Err(e) => {
            warn!("Malformed request: {}", e);
            Response {
                id: None,
                channel: String::new(),
                data: json!({ "error": format!("Invalid request: {}", e) }),
            }
        }
    }
}

async fn write_frame<W, T>(output: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Arc;
    use vpnd_core::{DryRunSupervisor, Engine, EngineConfig, ServerCatalog};

    fn dispatcher() -> Dispatcher {
        let supervisor = Arc::new(DryRunSupervisor::new());
        let engine = Engine::new(EngineConfig::default(), ServerCatalog::defaults(), supervisor)
            .unwrap();
        Dispatcher::new(engine)
    }

    async fn run(input: &str) -> Vec<Value> {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut output = Vec::new();
        serve(dispatcher(), input.as_bytes(), &mut output, rx)
            .await
            .unwrap();

        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn by_id(frames: &[Value], id: i64) -> &Value {
        frames.iter().find(|f| f["id"] == id).unwrap()
    }

    #[tokio::test]
    async fn test_requests_answered_with_ids() {
        let frames = run(concat!(
            r#"{"id": 1, "channel": "vpn:connect", "data": {"serverId": "us-la-1"}}"#,
            "\n\n",
            r#"{"id": 2, "channel": "vpn:servers"}"#,
            "\n",
        ))
        .await;

        assert_eq!(frames.len(), 2);
        let connect = by_id(&frames, 1);
        assert_eq!(connect["channel"], "vpn:connect");
        assert_eq!(connect["data"]["success"], true);
        assert_eq!(by_id(&frames, 2)["data"]["servers"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_malformed_line_gets_error_frame() {
        let frames = run("not json\n").await;

        assert_eq!(frames.len(), 1);
        assert!(frames[0]["data"]["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid request"));
    }

    #[tokio::test]
    async fn test_events_are_forwarded() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(EventFrame {
            event: "vpn:log-update",
            data: json!({"log": "hello"}),
        })
        .unwrap();

        // Input stays open until the event has been written
        let (client, server) = tokio::io::duplex(1024);
        let (read_half, mut write_half) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let serving = tokio::spawn(serve(
            dispatcher(),
            tokio::io::BufReader::new(server_read),
            server_write,
            rx,
        ));

        let mut lines = tokio::io::BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let frame: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(frame["event"], "vpn:log-update");
        assert_eq!(frame["data"]["log"], "hello");

        write_half.shutdown().await.unwrap();
        drop(write_half);
        serving.await.unwrap().unwrap();
    }
}
