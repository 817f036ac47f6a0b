//! Per-socket coalescing writer.
//!
//! Outbound messages are buffered per connection and flushed as one frame
//! when the batch count, batch byte budget, or delay deadline is hit —
//! whichever first. Several messages flush as one `BATCH` envelope in queue
//! order, so server-side causal order per client is preserved. Urgent
//! messages (auth outcomes, heartbeats, shutdown) flush the buffer
//! immediately rather than waiting out the batch window.

use async_trait::async_trait;
use squall_core::protocol::{self, ServerMessage};
use tokio::sync::mpsc;

use crate::config::CoalescingConfig;

/// One item in a connection's outbound queue.
#[derive(Debug)]
pub enum Outbound {
    /// Ordinary message, eligible for batching.
    Message(ServerMessage),
    /// Flushes the buffer at once.
    Urgent(ServerMessage),
    /// Flush what is queued, then close the socket.
    Close { code: u16, reason: String },
}

/// Where encoded frames go: the WebSocket in production, a vec in tests.
#[async_trait]
pub trait FrameSink: Send {
    /// Sends one binary frame; `false` ends the writer.
    async fn send_frame(&mut self, frame: Vec<u8>) -> bool;

    /// Sends a close frame; the writer exits afterwards.
    async fn send_close(&mut self, code: u16, reason: String);
}

/// Drains a connection's queue into its sink until the queue closes.
pub async fn run_writer(
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: impl FrameSink,
    config: CoalescingConfig,
) {
    let mut buffer: Vec<ServerMessage> = Vec::new();
    let mut buffered_bytes = 0_usize;

    loop {
        let Some(first) = rx.recv().await else {
            flush(&mut buffer, &mut buffered_bytes, &mut sink).await;
            return;
        };
        match first {
            Outbound::Close { code, reason } => {
                flush(&mut buffer, &mut buffered_bytes, &mut sink).await;
                sink.send_close(code, reason).await;
                return;
            }
            Outbound::Urgent(message) => {
                buffer.push(message);
                if !flush(&mut buffer, &mut buffered_bytes, &mut sink).await {
                    return;
                }
                continue;
            }
            Outbound::Message(message) => {
                buffered_bytes += approximate_len(&message);
                buffer.push(message);
            }
        }

        // Keep draining until a threshold or the delay deadline.
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_millis(config.max_delay_ms);
        while buffer.len() < config.max_batch_size && buffered_bytes < config.max_batch_bytes {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Outbound::Message(message))) => {
                    buffered_bytes += approximate_len(&message);
                    buffer.push(message);
                }
                Ok(Some(Outbound::Urgent(message))) => {
                    buffer.push(message);
                    break;
                }
                Ok(Some(Outbound::Close { code, reason })) => {
                    flush(&mut buffer, &mut buffered_bytes, &mut sink).await;
                    sink.send_close(code, reason).await;
                    return;
                }
                Ok(None) => {
                    flush(&mut buffer, &mut buffered_bytes, &mut sink).await;
                    return;
                }
                Err(_) => break, // delay deadline reached
            }
        }
        if !flush(&mut buffer, &mut buffered_bytes, &mut sink).await {
            return;
        }
    }
}

/// Encodes and ships the buffer as one frame; `true` to keep running.
async fn flush(
    buffer: &mut Vec<ServerMessage>,
    buffered_bytes: &mut usize,
    sink: &mut impl FrameSink,
) -> bool {
    *buffered_bytes = 0;
    let frame = match buffer.len() {
        0 => return true,
        1 => protocol::encode(&buffer[0]),
        _ => protocol::encode(&ServerMessage::Batch { messages: std::mem::take(buffer) }),
    };
    buffer.clear();
    match frame {
        Ok(bytes) => {
            metrics::counter!("squall_frames_sent_total").increment(1);
            sink.send_frame(bytes).await
        }
        Err(err) => {
            tracing::error!(error = %err, "outbound frame encode failed");
            true
        }
    }
}

/// Cheap size estimate for the byte budget; exact framing cost is not
/// needed, only a stable bound.
fn approximate_len(message: &ServerMessage) -> usize {
    protocol::encode(message).map_or(64, |bytes| bytes.len())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    struct CollectingSink {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        closes: Arc<Mutex<Vec<(u16, String)>>>,
    }

    #[async_trait]
    impl FrameSink for CollectingSink {
        async fn send_frame(&mut self, frame: Vec<u8>) -> bool {
            self.frames.lock().push(frame);
            true
        }

        async fn send_close(&mut self, code: u16, reason: String) {
            self.closes.lock().push((code, reason));
        }
    }

    fn sink() -> (CollectingSink, Arc<Mutex<Vec<Vec<u8>>>>, Arc<Mutex<Vec<(u16, String)>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(Mutex::new(Vec::new()));
        (
            CollectingSink { frames: frames.clone(), closes: closes.clone() },
            frames,
            closes,
        )
    }

    fn pong(n: u64) -> ServerMessage {
        ServerMessage::Pong { timestamp: n, server_time: n }
    }

    fn decode_frame(frame: &[u8]) -> ServerMessage {
        protocol::decode(frame).expect("frame decodes")
    }

    fn batch_len(message: &ServerMessage) -> usize {
        match message {
            ServerMessage::Batch { messages } => messages.len(),
            _ => 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hundred_messages_at_batch_size_fifty_means_two_frames() {
        let (sink, frames, _) = sink();
        let (tx, rx) = mpsc::channel(256);
        for i in 0..100 {
            tx.send(Outbound::Message(ServerMessage::OpAck {
                last_id: Some(i),
                failed_nodes: vec![],
            }))
            .await
            .unwrap();
        }
        drop(tx);

        run_writer(
            rx,
            sink,
            CoalescingConfig { max_batch_size: 50, max_batch_bytes: 1 << 20, max_delay_ms: 5 },
        )
        .await;

        let frames = frames.lock();
        assert_eq!(frames.len(), 2, "exactly two outbound sends");
        for frame in frames.iter() {
            assert_eq!(batch_len(&decode_frame(frame)), 50);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_message_ships_unwrapped() {
        let (sink, frames, _) = sink();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Outbound::Message(pong(1))).await.unwrap();
        drop(tx);
        run_writer(rx, sink, CoalescingConfig::default()).await;

        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        assert!(matches!(decode_frame(&frames[0]), ServerMessage::Pong { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn urgent_flushes_the_pending_batch_with_it() {
        let (sink, frames, _) = sink();
        let (tx, rx) = mpsc::channel(16);
        for i in 0..3 {
            tx.send(Outbound::Message(ServerMessage::OpAck {
                last_id: Some(i),
                failed_nodes: vec![],
            }))
            .await
            .unwrap();
        }
        tx.send(Outbound::Urgent(pong(9))).await.unwrap();
        drop(tx);

        run_writer(
            rx,
            sink,
            CoalescingConfig { max_batch_size: 100, max_batch_bytes: 1 << 20, max_delay_ms: 60_000 },
        )
        .await;

        let frames = frames.lock();
        assert_eq!(frames.len(), 1, "urgent rides the immediate flush");
        let ServerMessage::Batch { messages } = decode_frame(&frames[0]) else {
            panic!("expected batch");
        };
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[3], ServerMessage::Pong { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn byte_budget_forces_early_flush() {
        let (sink, frames, _) = sink();
        let (tx, rx) = mpsc::channel(16);
        let big = ServerMessage::Error { code: 400, message: "x".repeat(600) };
        for _ in 0..4 {
            tx.send(Outbound::Message(big.clone())).await.unwrap();
        }
        drop(tx);

        run_writer(
            rx,
            sink,
            CoalescingConfig { max_batch_size: 100, max_batch_bytes: 1_000, max_delay_ms: 60_000 },
        )
        .await;

        assert!(frames.lock().len() >= 2, "byte budget splits the stream");
    }

    #[tokio::test(start_paused = true)]
    async fn close_flushes_then_closes() {
        let (sink, frames, closes) = sink();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Outbound::Message(pong(1))).await.unwrap();
        tx.send(Outbound::Close { code: 4002, reason: "heartbeat timeout".into() })
            .await
            .unwrap();
        drop(tx);
        run_writer(rx, sink, CoalescingConfig::default()).await;

        assert_eq!(frames.lock().len(), 1);
        let closes = closes.lock();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].0, 4002);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_order_is_preserved_inside_batches() {
        let (sink, frames, _) = sink();
        let (tx, rx) = mpsc::channel(64);
        for i in 0..10 {
            tx.send(Outbound::Message(pong(i))).await.unwrap();
        }
        drop(tx);
        run_writer(
            rx,
            sink,
            CoalescingConfig { max_batch_size: 10, max_batch_bytes: 1 << 20, max_delay_ms: 5 },
        )
        .await;

        let frames = frames.lock();
        let ServerMessage::Batch { messages } = decode_frame(&frames[0]) else {
            panic!("expected batch");
        };
        let order: Vec<u64> = messages
            .iter()
            .map(|m| match m {
                ServerMessage::Pong { timestamp, .. } => *timestamp,
                _ => panic!("unexpected message"),
            })
            .collect();
        assert_eq!(order, (0..10).collect::<Vec<u64>>());
    }
}
