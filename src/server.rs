//! Line transport
//!
//! Reads one request per line from any `AsyncRead` and feeds it to the
//! dispatcher. Everything the bridge queues is written by a separate writer
//! loop, one line per frame, flushed after each line so the peer sees
//! responses and events as soon as they exist.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::LocalSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::config::{Config, ServerConfig};
use crate::dispatcher::Dispatcher;
use crate::engine::EngineFactory;
use crate::error::Result;
use crate::protocol::{outbound_channel, Frame, OutboundReceiver};

/// Serve one peer until it sends `close` or its input ends.
///
/// Builds the bridge and dispatcher for `factory` and drives them on a fresh
/// `LocalSet`, so it may be awaited from any single-threaded context.
pub async fn run<F, R, W>(factory: F, config: &Config, reader: R, writer: W) -> Result<()>
where
    F: EngineFactory,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (outbound, frames) = outbound_channel();
    let bridge = Bridge::new(outbound, &config.bridge);
    let dispatcher = Dispatcher::new(factory, bridge);

    LocalSet::new()
        .run_until(serve(&dispatcher, frames, reader, writer, &config.server))
        .await
}

/// Read loop plus writer loop over an existing dispatcher.
///
/// After `close` or end of input, responses still in flight are awaited for
/// up to `drain_timeout` before the writer is told to stop. Must be awaited
/// inside a `LocalSet`. Returns once the writer has written everything queued
/// before the shutdown.
pub async fn serve<F, R, W>(
    dispatcher: &Dispatcher<F>,
    frames: OutboundReceiver,
    reader: R,
    writer: W,
    config: &ServerConfig,
) -> Result<()>
where
    F: EngineFactory,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (read, write) = tokio::join!(
        read_requests(dispatcher, BufReader::new(reader), config),
        write_frames(writer, frames),
    );
    if let Err(e) = &write {
        warn!(error = %e, "Output stream failed");
    }
    read?;
    write?;
    Ok(())
}

async fn read_requests<F, R>(dispatcher: &Dispatcher<F>, mut reader: R, config: &ServerConfig) -> Result<()>
where
    F: EngineFactory,
    R: AsyncBufRead + Unpin,
{
    let limit = config.max_line_bytes;
    let mut buf = Vec::new();
    // Set once `close` arrives; replies are still read until then
    let mut deadline: Option<Instant> = None;

    let result = loop {
        let drain_by = deadline.unwrap_or_else(Instant::now);
        let read = tokio::select! {
            biased;
            _ = drain(dispatcher, drain_by), if deadline.is_some() => break Ok(()),
            read = next_line(&mut reader, &mut buf, limit) => read,
        };
        let line = match read {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!(in_flight = dispatcher.in_flight(), "Input closed, shutting down");
                dispatcher.bridge().close_input();
                drain(dispatcher, deadline.unwrap_or_else(|| Instant::now() + config.drain_timeout)).await;
                break Ok(());
            }
            Err(e) => break Err(e.into()),
        };

        if let LineRead::TooLong(len) = line {
            warn!(len, limit, "Dropping oversized line");
            continue;
        }
        let Ok(text) = std::str::from_utf8(&buf) else {
            warn!(len = buf.len(), "Dropping line that is not UTF-8");
            continue;
        };
        if dispatcher.dispatch(text).is_break() && deadline.is_none() {
            deadline = Some(Instant::now() + config.drain_timeout);
        }
    };

    dispatcher.bridge().shutdown();
    result
}

/// Wait until no deferred response is left, or `deadline` passes
async fn drain<F: EngineFactory>(dispatcher: &Dispatcher<F>, deadline: Instant) {
    if tokio::time::timeout_at(deadline, dispatcher.drained()).await.is_err() {
        warn!(dropped = dispatcher.in_flight(), "Giving up on unfinished responses");
    }
}

/// What one call to [`next_line`] read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineRead {
    /// The line is in the buffer, without its newline
    Complete,
    /// The line exceeded the limit and was discarded; carries its length
    TooLong(usize),
}

/// Read up to the next newline, keeping at most `limit` bytes.
///
/// Returns `None` at end of input. A final line without a newline still counts.
async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<Option<LineRead>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut read_any = false;
    let mut discarded: Option<usize> = None;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if !read_any {
                return Ok(None);
            }
            break;
        }
        read_any = true;

        let (chunk, consumed, done) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => (&available[..i], i + 1, true),
            None => (available, available.len(), false),
        };
        if let Some(len) = discarded.as_mut() {
            *len += chunk.len();
        } else if buf.len() + chunk.len() > limit {
            discarded = Some(buf.len() + chunk.len());
            buf.clear();
        } else {
            buf.extend_from_slice(chunk);
        }
        reader.consume(consumed);

        if done {
            break;
        }
    }

    Ok(Some(match discarded {
        Some(len) => LineRead::TooLong(len),
        None => LineRead::Complete,
    }))
}

async fn write_frames<W>(mut writer: W, mut frames: OutboundReceiver) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        match frame {
            Frame::Line(line) => {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Frame::Shutdown => {
                debug!("Writer received shutdown");
                break;
            }
        }
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeFactory;
    use serde_json::{json, Value as Json};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    /// Feed `input` to a served fake engine and collect every output line
    async fn exchange(input: String, config: Config) -> Vec<Json> {
        exchange_with(FakeFactory::default(), input, config).await
    }

    /// Feed `input` in one write to a bridge over `factory`, then end input
    async fn exchange_with<F: EngineFactory>(factory: F, input: String, config: Config) -> Vec<Json> {
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let serving = run(factory, &config, server_read, server_write);
        let talking = async move {
            client_write.write_all(input.as_bytes()).await.unwrap();
            client_write.shutdown().await.unwrap();
            let mut output = String::new();
            client_read.read_to_string(&mut output).await.unwrap();
            output
        };

        let (served, output) = tokio::join!(serving, talking);
        served.unwrap();
        output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn lines(messages: &[Json]) -> String {
        messages.iter().map(|m| format!("{}\n", m)).collect()
    }

    #[tokio::test]
    async fn test_requests_answered_in_order() {
        let input = lines(&[
            json!({"id": 1, "action": "ping"}),
            json!({"id": 2, "action": "create", "type": "VM"}),
            json!({"id": 3, "action": "run", "vmId": 1, "code": "40+2"}),
            json!({"id": 4, "action": "close"}),
        ]);
        let output = exchange(input, Config::default()).await;

        let ids: Vec<_> = output.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(output[1]["value"], 1);
        assert_eq!(output[2]["value"], 42);
        assert!(output.iter().all(|r| r["status"] == "success"));
    }

    #[tokio::test]
    async fn test_end_of_input_stops_serving() {
        let input = lines(&[json!({"id": "a", "action": "ping"})]);
        let output = exchange(input, Config::default()).await;
        assert_eq!(output.len(), 1);
        assert_eq!(output[0]["id"], "a");
    }

    #[tokio::test]
    async fn test_bad_lines_are_skipped() {
        let mut input = String::from("not json\n\n");
        input.push_str(&"x".repeat(300));
        input.push('\n');
        input.push_str(&lines(&[json!({"id": 9, "action": "ping"})]));
        // Final line without a newline
        input.push_str(&json!({"id": 10, "action": "ping"}).to_string());

        let mut config = Config::default();
        config.server.max_line_bytes = 256;
        let output = exchange(input, config).await;

        let ids: Vec<_> = output.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(9), json!(10)]);
    }

    #[tokio::test]
    async fn test_deferred_result_answered_before_close() {
        let input = lines(&[
            json!({"id": 1, "action": "create", "type": "VM"}),
            json!({"id": 2, "action": "run", "vmId": 1, "code": "later 7"}),
        ]);
        // Input stays open until the deferred value has been answered
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let config = Config::default();

        let serving = run(FakeFactory::default(), &config, server_read, server_write);
        let talking = async move {
            client_write.write_all(input.as_bytes()).await.unwrap();
            let mut reader = BufReader::new(&mut client_read);
            let mut received = Vec::new();
            for _ in 0..2 {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                received.push(serde_json::from_str::<Json>(&line).unwrap());
            }
            let close = lines(&[json!({"id": 3, "action": "close"})]);
            client_write.write_all(close.as_bytes()).await.unwrap();
            let mut rest = String::new();
            reader.read_to_string(&mut rest).await.unwrap();
            (received, rest)
        };

        let (served, (received, rest)) = tokio::join!(serving, talking);
        served.unwrap();
        assert_eq!(received[1]["id"], 2);
        assert_eq!(received[1]["value"], 7);
        let closed: Json = serde_json::from_str(rest.trim()).unwrap();
        assert_eq!(closed["id"], 3);
    }

    #[tokio::test]
    async fn test_close_waits_for_deferred_responses() {
        let input = lines(&[
            json!({"id": 1, "action": "create", "type": "VM"}),
            json!({"id": 2, "action": "run", "vmId": 1, "code": "later 5"}),
            json!({"id": 3, "action": "close"}),
        ]);
        let output = exchange(input, Config::default()).await;

        let mut ids: Vec<_> = output.iter().filter_map(|r| r["id"].as_u64()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        let deferred = output.iter().find(|r| r["id"] == 2).unwrap();
        assert_eq!(deferred["value"], 5);
    }

    #[tokio::test]
    async fn test_end_of_input_fails_waiting_remote_calls() {
        let input = lines(&[
            json!({"id": 1, "action": "create", "type": "NodeVM"}),
            json!({"id": 2, "action": "run", "vmId": 1, "code": "a=1"}),
            json!({
                "id": 3, "action": "strsetMember", "vmId": 1, "moduleId": 1,
                "member": "strf", "arg": "pyfun4", "inputEncode": true
            }),
            json!({"id": 4, "action": "callMember", "vmId": 1, "moduleId": 1, "member": "f"}),
        ]);
        let output = exchange(input, Config::default()).await;

        assert_eq!(output[3]["name"], "pyfun");
        let failed = output.iter().find(|r| r["id"] == 4).unwrap();
        assert_eq!(failed["status"], "error");
        assert_eq!(failed["error"], "Remote call failed: call 0 abandoned, input closed");
    }

    #[tokio::test]
    async fn test_unfinished_responses_dropped_after_drain_timeout() {
        let input = lines(&[
            json!({"id": 1, "action": "create", "type": "NodeVM"}),
            json!({"id": 2, "action": "run", "vmId": 1, "code": "a=1"}),
            json!({
                "id": 3, "action": "strsetMember", "vmId": 1, "moduleId": 1,
                "member": "strf", "arg": "pyfun4", "inputEncode": true
            }),
            json!({"id": 4, "action": "callMember", "vmId": 1, "moduleId": 1, "member": "f"}),
            json!({"id": 5, "action": "close"}),
        ]);
        let mut config = Config::default();
        config.server.drain_timeout = Duration::from_millis(20);

        // Input stays open, so only the timeout ends the drain
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let serving = run(FakeFactory::default(), &config, server_read, server_write);
        let talking = async move {
            client_write.write_all(input.as_bytes()).await.unwrap();
            let mut output = String::new();
            client_read.read_to_string(&mut output).await.unwrap();
            (output, client_write)
        };

        let (served, (output, _open)) = tokio::join!(serving, talking);
        served.unwrap();
        let ids: Vec<Json> = output
            .lines()
            .map(|line| serde_json::from_str::<Json>(line).unwrap()["id"].clone())
            .collect();
        assert!(ids.contains(&json!(5)));
        assert!(!ids.contains(&json!(4)));
    }

    #[cfg(feature = "quickjs")]
    #[tokio::test]
    async fn test_script_callback_applies_before_next_request() {
        use crate::engine::QuickJsFactory;

        let input = lines(&[
            json!({"id": 1, "action": "create", "type": "NodeVM"}),
            json!({
                "id": 2, "action": "run", "vmId": 1,
                "code": "globalThis.n = 0; exports.f = () => { n += 1 }; exports.g = () => n;"
            }),
            json!({"id": 3, "action": "getMember", "vmId": 1, "moduleId": 1, "member": "f"}),
            json!({"id": 4, "action": "callJsFunc", "vmId": 1, "ids": 0, "args": []}),
            json!({"id": 5, "action": "callMember", "vmId": 1, "moduleId": 1, "member": "g", "args": []}),
            json!({"id": 6, "action": "close"}),
        ]);
        let output = exchange_with(QuickJsFactory::default(), input, Config::default()).await;

        let ids: Vec<_> = output.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(4), json!(5), json!(6)]);
        assert!(output.iter().all(|r| r["status"] == "success"), "{:?}", output);
        assert_eq!(output[2]["value"], "jsfun0");
        assert_eq!(output[4]["value"], 1);
    }

    #[cfg(feature = "quickjs")]
    #[tokio::test]
    async fn test_script_awaits_remote_replies_out_of_order() {
        use crate::engine::QuickJsFactory;

        let setup = lines(&[
            json!({"id": 1, "action": "create", "type": "NodeVM"}),
            json!({
                "id": 2, "action": "run", "vmId": 1,
                "code": "exports.ask = async (cb, x) => 'got ' + await cb(x);"
            }),
            json!({
                "id": 3, "action": "strcallMember", "vmId": 1, "moduleId": 1,
                "member": "strask", "args": ["pyfun1", "strfirst"], "inputEncode": true
            }),
            json!({
                "id": 4, "action": "strcallMember", "vmId": 1, "moduleId": 1,
                "member": "strask", "args": ["pyfun2", "strsecond"], "inputEncode": true
            }),
        ]);
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let config = Config::default();

        let serving = run(QuickJsFactory::default(), &config, server_read, server_write);
        let talking = async move {
            let mut reader = BufReader::new(&mut client_read);
            async fn read_json<R: AsyncBufRead + Unpin>(reader: &mut R) -> Json {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                serde_json::from_str(&line).unwrap()
            }

            client_write.write_all(setup.as_bytes()).await.unwrap();
            let mut seen = Vec::new();
            for _ in 0..4 {
                seen.push(read_json(&mut reader).await);
            }

            // Answer the second call first
            let replies = lines(&[
                json!({"action": "ret", "cid": 1, "value": "str2"}),
                json!({"action": "ret", "cid": 0, "value": "str1"}),
            ]);
            client_write.write_all(replies.as_bytes()).await.unwrap();
            let mut answered = Vec::new();
            for _ in 0..2 {
                answered.push(read_json(&mut reader).await);
            }

            client_write
                .write_all(lines(&[json!({"id": 5, "action": "close"})]).as_bytes())
                .await
                .unwrap();
            let mut rest = String::new();
            reader.read_to_string(&mut rest).await.unwrap();
            (seen, answered, rest)
        };

        let (served, (seen, answered, rest)) = tokio::join!(serving, talking);
        served.unwrap();

        assert_eq!(seen[0]["value"], 1);
        assert_eq!(seen[1]["value"], 1);
        assert_eq!(
            seen[2],
            json!({
                "type": "event", "name": "pyfun", "ids": "pyfun1", "vmId": 1,
                "value": ["strfirst"], "cid": 0, "outputEncode": true
            })
        );
        assert_eq!(seen[3]["ids"], "pyfun2");
        assert_eq!(seen[3]["cid"], 1);

        let second = answered.iter().find(|r| r["id"] == 4).unwrap();
        assert_eq!(second["value"], "strgot 2");
        let first = answered.iter().find(|r| r["id"] == 3).unwrap();
        assert_eq!(first["value"], "strgot 1");
        assert_eq!(first["moduleId"], 1);

        let closed: Json = serde_json::from_str(rest.trim()).unwrap();
        assert_eq!(closed["id"], 5);
    }

    #[tokio::test]
    async fn test_next_line_limits() {
        let mut reader = BufReader::new(&b"abc\ndefghij\nk"[..]);
        let mut buf = Vec::new();
        assert_eq!(next_line(&mut reader, &mut buf, 4).await.unwrap(), Some(LineRead::Complete));
        assert_eq!(buf, b"abc");
        assert_eq!(next_line(&mut reader, &mut buf, 4).await.unwrap(), Some(LineRead::TooLong(7)));
        assert!(buf.is_empty());
        assert_eq!(next_line(&mut reader, &mut buf, 4).await.unwrap(), Some(LineRead::Complete));
        assert_eq!(buf, b"k");
        assert_eq!(next_line(&mut reader, &mut buf, 4).await.unwrap(), None);
    }
}
