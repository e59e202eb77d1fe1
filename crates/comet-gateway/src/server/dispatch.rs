//! Write side of a connection
//!
//! Drains the channel's signal queue: `Ready` flushes the ring of answered
//! frames, `Frame` writes a server push, `Finish` ends the pump. After a
//! write failure the pump keeps consuming signals until `Finish` so senders
//! never block on a dead connection.

use super::conn::ConnError;
use super::Shared;
use crate::connection::{Channel, Signal};
use crate::protocol::{FrameCodec, FrameError};
use crate::round::BufferPool;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) async fn run(
    shared: Arc<Shared>,
    ch: Arc<Channel>,
    mut signals: mpsc::Receiver<Signal>,
    mut wr: OwnedWriteHalf,
    mut wb: BytesMut,
    writers: Arc<BufferPool>,
    token: CancellationToken,
) {
    let debug = shared.config.debug;
    let written = write_loop(
        &shared.codec,
        &ch,
        &mut signals,
        &mut wr,
        &mut wb,
        &token,
        debug,
    )
    .await;
    let finished = match written {
        Ok(finished) => finished,
        Err(e) => {
            if e.is_disconnect() {
                tracing::debug!(key = %ch.key(), error = %e, "Dispatch stopped");
            } else {
                tracing::warn!(key = %ch.key(), error = %e, "Dispatch failed");
            }
            false
        }
    };

    // Close the socket so the read pump stops too
    token.cancel();
    drop(wr);
    writers.put(wb);

    if !finished {
        drain(&ch, &mut signals).await;
    }
    if debug {
        tracing::debug!(key = %ch.key(), "Dispatch exited");
    }
}

/// Returns whether `Finish` was seen
async fn write_loop(
    codec: &FrameCodec,
    ch: &Channel,
    signals: &mut mpsc::Receiver<Signal>,
    wr: &mut OwnedWriteHalf,
    wb: &mut BytesMut,
    token: &CancellationToken,
    debug: bool,
) -> Result<bool, ConnError> {
    loop {
        let signal = tokio::select! {
            biased;
            signal = signals.recv() => signal,
            () = ch.closing() => return Ok(true),
            () = token.cancelled() => return Ok(false),
        };

        match signal {
            None | Some(Signal::Finish) => return Ok(true),
            Some(Signal::Frame(frame)) => {
                if debug {
                    tracing::debug!(key = %ch.key(), op = frame.operation, "Push");
                }
                codec.encode_frame(&frame, wb)?;
            }
            Some(Signal::Ready) => {
                ch.ready_consumed();
                let encoded = encode_ring(codec, ch, wb);
                ch.ring_drained();
                encoded?;
            }
        }

        if !wb.is_empty() {
            tokio::select! {
                () = token.cancelled() => return Ok(false),
                written = wr.write_all(wb) => written?,
            }
            wb.clear();
        }

        if ch.is_closing() {
            return Ok(true);
        }
    }
}

/// Move every staged frame from the ring into `wb`
fn encode_ring(codec: &FrameCodec, ch: &Channel, wb: &mut BytesMut) -> Result<(), FrameError> {
    let ring = ch.ring();
    loop {
        let encoded = {
            let Ok(mut slot) = ring.try_reserve_read() else {
                return Ok(());
            };
            let encoded = codec.encode_frame(&slot, wb);
            slot.body = Bytes::new();
            encoded
        };
        ring.commit_read();
        encoded?;
    }
}

/// Discard signals until the channel is finished
async fn drain(ch: &Channel, signals: &mut mpsc::Receiver<Signal>) {
    loop {
        let signal = tokio::select! {
            signal = signals.recv() => signal,
            () = ch.closing() => break,
        };
        match signal {
            None | Some(Signal::Finish) => break,
            Some(Signal::Ready) => {
                ch.ready_consumed();
                while ch.ring().pop().is_ok() {}
                ch.ring_drained();
            }
            Some(Signal::Frame(_)) => {}
        }
    }
}
