//! Connection lifecycle
//!
//! A connection must send `Auth` before the handshake deadline. Once the
//! handler accepts it the channel is registered in its bucket, the deadline
//! becomes the heartbeat deadline, and two pumps run until either side
//! stops: this task reads and answers frames, the dispatch task writes.

use super::{dispatch, Shared};
use crate::broadcast::Bucket;
use crate::connection::{Channel, ChannelError};
use crate::handlers::{AuthReply, HandlerError};
use crate::protocol::{Frame, FrameCodec, FrameError, Operation, Payload};
use crate::round::{Timer, TimerHandle};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a connection ended
#[derive(Debug, Error)]
pub(crate) enum ConnError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("unexpected {0} body")]
    Payload(&'static str),

    #[error("closed by peer")]
    Eof,

    #[error("handshake timed out")]
    Timeout,

    #[error("server shutting down")]
    Shutdown,
}

impl ConnError {
    /// Ordinary ways for a client to go away
    pub(crate) fn is_disconnect(&self) -> bool {
        match self {
            Self::Eof | Self::Shutdown => true,
            Self::Io(e) | Self::Frame(FrameError::Io(e)) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Read until one whole frame is buffered
async fn read_frame(
    codec: &FrameCodec,
    rd: &mut OwnedReadHalf,
    rb: &mut BytesMut,
) -> Result<Frame, ConnError> {
    loop {
        if let Some(frame) = codec.decode_frame(rb)? {
            return Ok(frame);
        }
        if rd.read_buf(rb).await? == 0 {
            if rb.is_empty() {
                return Err(ConnError::Eof);
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
    }
}

/// Encode and write one frame, leaving `wb` empty
async fn write_frame(
    codec: &FrameCodec,
    wr: &mut OwnedWriteHalf,
    wb: &mut BytesMut,
    frame: &Frame,
) -> Result<(), ConnError> {
    codec.encode_frame(frame, wb)?;
    let written = wr.write_all(wb).await;
    wb.clear();
    written.map_err(Into::into)
}

/// Discard frames until `Auth` arrives, then ask the handler
async fn handshake(
    shared: &Shared,
    ch: &Channel,
    rd: &mut OwnedReadHalf,
    rb: &mut BytesMut,
) -> Result<(Frame, AuthReply), ConnError> {
    loop {
        let frame = read_frame(&shared.codec, rd, rb).await?;
        if !frame.is(Operation::Auth) {
            tracing::warn!(
                ip = %ch.ip(),
                op = frame.operation,
                "Request operation is not auth, discarded"
            );
            continue;
        }

        let reply = shared.handler.authenticate(ch, &frame).await?;
        if reply.key.is_empty() {
            return Err(HandlerError::Unauthorized("empty connection key".to_string()).into());
        }
        return Ok((frame, reply));
    }
}

/// Serve one accepted socket until it closes
pub(crate) async fn serve(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    rn: usize,
    permit: OwnedSemaphorePermit,
) {
    let timer = Arc::clone(shared.round.timer(rn));
    let readers = Arc::clone(shared.round.reader(rn));
    let writers = Arc::clone(shared.round.writer(rn));
    let mut rb = readers.get();
    let mut wb = writers.get();

    let (ch, signals) = Channel::new(
        peer.ip().to_string(),
        shared.config.cli_proto,
        shared.config.svr_proto,
    );
    let token = shared.shutdown.child_token();
    let deadline = {
        let token = token.clone();
        timer.add(shared.config.handshake_timeout, move || {
            tracing::debug!(peer = %peer, "Connection deadline expired");
            token.cancel();
        })
    };
    let (mut rd, mut wr) = stream.into_split();

    let outcome = tokio::select! {
        () = token.cancelled() => Err(if shared.shutdown.is_cancelled() {
            ConnError::Shutdown
        } else {
            ConnError::Timeout
        }),
        auth = handshake(&shared, &ch, &mut rd, &mut rb) => auth,
    };

    let (mut frame, auth) = match outcome {
        Ok(ok) => ok,
        Err(e) => {
            if e.is_disconnect() {
                tracing::debug!(peer = %peer, error = %e, "Handshake abandoned");
            } else {
                tracing::warn!(peer = %peer, error = %e, "Handshake failed");
            }
            timer.del(deadline);
            readers.put(rb);
            writers.put(wb);
            return;
        }
    };

    let heartbeat = shared.config.client_heartbeat(auth.heartbeat);
    if !timer.set(deadline, heartbeat) {
        tracing::warn!(peer = %peer, key = %auth.key, "Handshake timed out during auth");
        readers.put(rb);
        writers.put(wb);
        return;
    }

    ch.authenticated(auth.mid, auth.key.clone());
    ch.watch(&auth.accepts);
    let bucket = Arc::clone(shared.bucket(&auth.key));
    bucket.put(&auth.room_id, &ch);
    if let Some(broker) = &shared.broker {
        if let Err(e) = broker.subscribe(&auth.key).await {
            tracing::warn!(key = %auth.key, error = %e, "Route registration failed");
        }
    }
    tracing::info!(
        peer = %peer,
        mid = auth.mid,
        key = %auth.key,
        room_id = %auth.room_id,
        heartbeat_ms = heartbeat.as_millis() as u64,
        "Connection authenticated"
    );

    frame.reply_in_place(Operation::AuthReply, auth.body.clone());
    let replied = tokio::select! {
        () = token.cancelled() => Err(ConnError::Shutdown),
        written = write_frame(&shared.codec, &mut wr, &mut wb, &frame) => written,
    };

    let session = Session {
        shared: Arc::clone(&shared),
        ch: Arc::clone(&ch),
        bucket,
        timer: Arc::clone(&timer),
        deadline,
        heartbeat,
        token: token.clone(),
    };

    let (result, dispatcher) = match replied {
        Ok(()) => {
            let dispatcher = tokio::spawn(dispatch::run(
                Arc::clone(&shared),
                Arc::clone(&ch),
                signals,
                wr,
                wb,
                writers,
                token.clone(),
            ));
            let result = tokio::select! {
                () = token.cancelled() => Ok(()),
                result = session.read_pump(&mut rd, &mut rb) => result,
            };
            (result, Some(dispatcher))
        }
        Err(e) => {
            drop(wr);
            writers.put(wb);
            (Err(e), None)
        }
    };

    match &result {
        Err(e) if !e.is_disconnect() => {
            tracing::warn!(key = %ch.key(), error = %e, "Connection failed");
        }
        _ => {}
    }

    session.close().await;
    drop(rd);
    readers.put(rb);
    if let Some(dispatcher) = dispatcher {
        if let Err(e) = dispatcher.await {
            tracing::error!(key = %ch.key(), error = %e, "Dispatch task failed");
        }
    }
    drop(permit);
    tracing::debug!(peer = %peer, key = %ch.key(), "Connection closed");
}

/// An authenticated connection
struct Session {
    shared: Arc<Shared>,
    ch: Arc<Channel>,
    bucket: Arc<Bucket>,
    timer: Arc<Timer>,
    deadline: TimerHandle,
    heartbeat: Duration,
    /// Cancelled to close the socket
    token: CancellationToken,
}

impl Session {
    async fn read_pump(&self, rd: &mut OwnedReadHalf, rb: &mut BytesMut) -> Result<(), ConnError> {
        let renew_every = self.shared.config.random_server_heartbeat();
        let mut last_renew = Instant::now();

        loop {
            let mut frame = read_frame(&self.shared.codec, rd, rb).await?;
            if self.shared.config.debug {
                tracing::debug!(
                    key = %self.ch.key(),
                    op = frame.operation,
                    seq = frame.sequence,
                    "Frame received"
                );
            }

            self.operate(&mut frame, renew_every, &mut last_renew).await?;
            self.ch.stage(frame).await?;
            self.ch.signal().await?;
        }
    }

    /// Answer one frame in place
    async fn operate(
        &self,
        frame: &mut Frame,
        renew_every: Duration,
        last_renew: &mut Instant,
    ) -> Result<(), ConnError> {
        match frame.reserved_op() {
            Some(Operation::Heartbeat) => {
                self.timer.set(self.deadline, self.heartbeat);
                frame.reply_in_place(Operation::HeartbeatReply, Bytes::new());
                if last_renew.elapsed() > renew_every {
                    self.renew_route(last_renew).await;
                }
            }
            Some(Operation::ChangeRoom) => {
                let Payload::Text(room_id) = self.shared.creator.create_body(frame)? else {
                    return Err(ConnError::Payload("ChangeRoom"));
                };
                self.bucket.change_room(&room_id, &self.ch);
                frame.operation = Operation::ChangeRoomReply.as_i32();
            }
            Some(Operation::Sub) => {
                let Payload::Ops(ops) = self.shared.creator.create_body(frame)? else {
                    return Err(ConnError::Payload("Sub"));
                };
                self.ch.watch(&ops);
                frame.operation = Operation::SubReply.as_i32();
            }
            Some(Operation::Unsub) => {
                let Payload::Ops(ops) = self.shared.creator.create_body(frame)? else {
                    return Err(ConnError::Payload("Unsub"));
                };
                self.ch.unwatch(&ops);
                frame.operation = Operation::UnsubReply.as_i32();
            }
            _ => self.shared.handler.handle_frame(&self.ch, frame).await?,
        }
        Ok(())
    }

    async fn renew_route(&self, last_renew: &mut Instant) {
        let Some(broker) = &self.shared.broker else {
            *last_renew = Instant::now();
            return;
        };
        match broker.subscribe(self.ch.key()).await {
            Ok(()) => *last_renew = Instant::now(),
            Err(e) => tracing::warn!(key = %self.ch.key(), error = %e, "Route renewal failed"),
        }
    }

    /// Tear down everything registered at authentication
    async fn close(&self) {
        self.token.cancel();
        self.timer.del(self.deadline);
        self.bucket.del(&self.ch);

        let key = self.ch.key();
        if let Some(broker) = &self.shared.broker {
            if self.bucket.channel(key).is_none() {
                if let Err(e) = broker.unsubscribe(key).await {
                    tracing::warn!(key = %key, error = %e, "Route release failed");
                }
            }
        }

        self.ch.close();
        self.shared.handler.handle_closed(&self.ch).await;
    }
}
