//! The write half of a connection. A dedicated task owns the socket's
//! write half and applies the write policy:
//!
//! - `Send`: write immediately.
//! - `Queue`: append to a FIFO; a 1 Hz tick writes the head. This is the
//!   throttling primitive for bursty traffic.
//! - `SendOrQueue`: write immediately when the queue is empty, otherwise
//!   append, preserving FIFO order with respect to queued lines.
//!
//! Lines are bare; the task appends the "\r\n" framing.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::select;
use futures_util::stream::StreamExt;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_stream::wrappers::{IntervalStream, ReceiverStream};

use crate::stream::Stream;

#[derive(Debug)]
pub(crate) enum WriteReq {
    Send(String),
    Queue(String),
    SendOrQueue(String),
}

pub(crate) fn spawn(write_half: WriteHalf<Stream>) -> mpsc::Sender<WriteReq> {
    let (snd_wr, rcv_wr) = mpsc::channel::<WriteReq>(100);
    tokio::task::spawn_local(writer_task(write_half, rcv_wr));
    snd_wr
}

async fn writer_task(mut write_half: WriteHalf<Stream>, rcv_wr: mpsc::Receiver<WriteReq>) {
    let mut rcv_wr = ReceiverStream::new(rcv_wr).fuse();
    let mut tick = IntervalStream::new(interval(Duration::from_secs(1))).fuse();
    let mut queue: VecDeque<String> = VecDeque::new();

    loop {
        select! {
            req = rcv_wr.next() => {
                match req {
                    None => {
                        // Connection is being torn down
                        return;
                    }
                    Some(WriteReq::Send(line)) => {
                        if write_line(&mut write_half, &line).await.is_err() {
                            return;
                        }
                    }
                    Some(WriteReq::Queue(line)) => {
                        queue.push_back(line);
                    }
                    Some(WriteReq::SendOrQueue(line)) => {
                        if queue.is_empty() {
                            if write_line(&mut write_half, &line).await.is_err() {
                                return;
                            }
                        } else {
                            queue.push_back(line);
                        }
                    }
                }
            }
            _ = tick.next() => {
                if let Some(line) = queue.pop_front() {
                    if write_line(&mut write_half, &line).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn write_line(write_half: &mut WriteHalf<Stream>, line: &str) -> std::io::Result<()> {
    debug!("OUT: {}", line);
    if let Err(io_err) = write_half.write_all(line.as_bytes()).await {
        debug!("IO error when writing: {:?}", io_err);
        return Err(io_err);
    }
    if let Err(io_err) = write_half.write_all(b"\r\n").await {
        debug!("IO error when writing: {:?}", io_err);
        return Err(io_err);
    }
    Ok(())
}
