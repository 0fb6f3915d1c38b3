//! Implements the keepalive task. When nothing has been read from the
//! server for the configured number of seconds it asks the main loop to
//! send a `PING`. This is a keepalive only; it never declares the
//! connection dead (a broken link surfaces as a read error).

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

pub(crate) struct Pinger {
    snd_rst: mpsc::Sender<()>,
}

#[derive(Debug)]
pub(crate) enum Event {
    SendPing,
}

async fn pinger_task(timeout_secs: u64, rcv_rst: mpsc::Receiver<()>, snd_ev: mpsc::Sender<Event>) {
    let mut rcv_rst_fused = ReceiverStream::new(rcv_rst).fuse();
    loop {
        match timeout(Duration::from_secs(timeout_secs), rcv_rst_fused.next()).await {
            Err(_) => {
                // Ignore errors: no need for another ping request when one
                // is already waiting to be processed
                let _ = snd_ev.try_send(Event::SendPing);
            }
            Ok(None) => {
                return;
            }
            Ok(Some(())) => {}
        }
    }
}

impl Pinger {
    pub(crate) fn new(timeout_secs: u64) -> (Pinger, mpsc::Receiver<Event>) {
        let (snd_ev, rcv_ev) = mpsc::channel(1);
        // No need for sending another "reset" when there's already one
        // waiting to be processed
        let (snd_rst, rcv_rst) = mpsc::channel(1);
        tokio::task::spawn_local(pinger_task(timeout_secs, rcv_rst, snd_ev));
        (Pinger { snd_rst }, rcv_ev)
    }

    pub(crate) fn reset(&mut self) {
        let _ = self.snd_rst.try_send(());
    }
}
