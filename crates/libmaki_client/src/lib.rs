#![allow(clippy::zero_prefixed_literal)]
#![allow(clippy::cognitive_complexity)]

//! The per-server connection engine: keeps one IRC server connection
//! alive (connect, login, serve, disconnect with bounded reconnect),
//! parses inbound traffic into state updates and events, and applies the
//! rate-aware outbound write policy.

mod dcc;
mod pinger;
mod sender;
mod state;
mod stream;
mod utils;

pub use dcc::{DccResumeRequest, DccSendOffer};
pub use libmaki_wire as wire;

use libmaki_config::Config;
use libmaki_logger::Logger;

use pinger::Pinger;
use sender::WriteReq;
use state::State;
use stream::{Stream, StreamError};

use futures_util::future::FutureExt;
use futures_util::stream::{Fuse, StreamExt};
use futures_util::{pin_mut, select};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{IntervalStream, ReceiverStream};

#[macro_use]
extern crate log;

//
// Public API
//

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Seconds without inbound traffic before a keepalive PING is written.
const PING_TIMEOUT_SECS: u64 = 60;

/// Seconds between WHO polls of joined channels.
const WHO_INTERVAL_SECS: u64 = 60;

/// Connection status of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything a server connection needs to get going.
#[derive(Clone)]
pub struct ServerSetup {
    /// Stable identifier of this server.
    pub name: String,

    /// The server's config file (`server` group plus channel groups).
    pub config: Config,

    /// Chat log sink for this server.
    pub logger: Logger,

    /// Number of automatic reconnect attempts after an unexpected
    /// disconnect. An explicit `connect` resets the budget.
    pub reconnect_retries: u32,

    /// Seconds between reconnect attempts.
    pub reconnect_timeout: u64,

    /// Optional CA bundle for TLS connections.
    pub ca_file: Option<PathBuf>,
}

/// Events emitted by a server connection. The instance wraps these with a
/// timestamp and the server name before handing them to subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection attempt is starting.
    Connect,
    /// The TCP connection is up and the login sequence was sent.
    Connected,
    Action {
        from: String,
        target: String,
        msg: String,
    },
    /// We are marked away now.
    Away,
    AwayMessage {
        nick: String,
        msg: String,
    },
    /// We are no longer marked away.
    Back,
    /// One ban list entry; the end is signalled by an empty mask and a -1
    /// timestamp.
    Banlist {
        chan: String,
        mask: String,
        who: String,
        when: i64,
    },
    /// Join failed: "l" full, "i" invite only, "b" banned, "k" bad key.
    CannotJoin {
        chan: String,
        reason: String,
    },
    Ctcp {
        from: String,
        target: String,
        msg: String,
    },
    DccSendOffer {
        from: String,
        offer: DccSendOffer,
    },
    DccResume {
        from: String,
        request: DccResumeRequest,
    },
    DccAccept {
        from: String,
        request: DccResumeRequest,
    },
    Error {
        domain: String,
        reason: String,
        arguments: Vec<String>,
    },
    Invite {
        from: String,
        chan: String,
        who: String,
    },
    Join {
        from: String,
        chan: String,
    },
    Kick {
        from: String,
        chan: String,
        who: String,
        msg: String,
    },
    /// One LIST entry; the end is signalled by an empty channel and a -1
    /// user count.
    List {
        chan: String,
        users: i64,
        topic: String,
    },
    Message {
        from: String,
        target: String,
        msg: String,
    },
    Mode {
        from: String,
        target: String,
        mode: String,
        parameter: String,
    },
    /// One MOTD line; empty at the end of the MOTD.
    Motd {
        msg: String,
    },
    Names {
        chan: String,
        nicks: Vec<String>,
        prefixes: Vec<String>,
    },
    Nick {
        old: String,
        new: String,
    },
    /// "n" nick, "s" server, "c" channel.
    NoSuch {
        target: String,
        kind: String,
    },
    Notice {
        from: String,
        target: String,
        msg: String,
    },
    Oper,
    Part {
        from: String,
        chan: String,
        msg: String,
    },
    Quit {
        from: String,
        msg: String,
    },
    Topic {
        from: String,
        chan: String,
        topic: String,
    },
    UserAway {
        from: String,
        away: bool,
    },
    Whois {
        nick: String,
        msg: String,
    },
}

/// One server connection. Cheap to clone; all clones drive the same
/// connection task.
#[derive(Clone)]
pub struct Client {
    /// Channel to send commands to the main loop.
    msg_chan: mpsc::Sender<Cmd>,

    serv_name: String,

    /// Reference to the state, to be able to provide getters like
    /// `get_nick` and `get_channels` without a round trip to the task.
    state: State,
}

impl Client {
    /// Create a new client. Spawns the connection task on the current
    /// `LocalSet`; the connection stays down until [`Client::connect`].
    pub fn new(setup: ServerSetup) -> (Client, mpsc::Receiver<Event>) {
        connect(setup)
    }

    /// Connect, or reset the reconnect budget when already connecting.
    pub fn connect(&mut self) {
        self.msg_chan.try_send(Cmd::Connect).unwrap()
    }

    /// Disconnect with a QUIT message and stay down until the next
    /// `connect`. Cancels a scheduled reconnect.
    pub fn disconnect(&mut self, reason: Option<String>) {
        self.msg_chan.try_send(Cmd::Disconnect(reason)).unwrap()
    }

    /// Disconnect and stop the connection task for good. Used when the
    /// server is removed or the daemon shuts down.
    pub fn quit(&mut self, reason: Option<String>) {
        debug!("quit cmd received");
        self.msg_chan.try_send(Cmd::Quit(reason)).unwrap()
    }

    /// Send a raw IRC line to the server.
    pub fn raw_msg(&mut self, msg: &str) {
        self.msg_chan.try_send(Cmd::Raw(msg.to_owned())).unwrap()
    }

    pub fn join(&mut self, chan: &str, key: Option<&str>) {
        self.msg_chan
            .try_send(Cmd::Join(chan.to_owned(), key.map(str::to_owned)))
            .unwrap()
    }

    pub fn part(&mut self, chan: &str, reason: Option<String>) {
        self.msg_chan
            .try_send(Cmd::Part(chan.to_owned(), reason))
            .unwrap()
    }

    pub fn kick(&mut self, chan: &str, who: &str, reason: Option<String>) {
        self.msg_chan
            .try_send(Cmd::Kick(chan.to_owned(), who.to_owned(), reason))
            .unwrap()
    }

    pub fn invite(&mut self, chan: &str, who: &str) {
        self.msg_chan
            .try_send(Cmd::Invite(chan.to_owned(), who.to_owned()))
            .unwrap()
    }

    /// Send a privmsg. Embedded newlines and the wire length limit split
    /// the message into multiple PRIVMSGs on the way out.
    pub fn privmsg(&mut self, target: &str, msg: &str) {
        self.msg_chan
            .try_send(Cmd::Privmsg {
                target: target.to_owned(),
                msg: msg.to_owned(),
            })
            .unwrap()
    }

    pub fn action(&mut self, target: &str, msg: &str) {
        self.msg_chan
            .try_send(Cmd::Action {
                target: target.to_owned(),
                msg: msg.to_owned(),
            })
            .unwrap()
    }

    pub fn notice(&mut self, target: &str, msg: &str) {
        self.msg_chan
            .try_send(Cmd::Notice {
                target: target.to_owned(),
                msg: msg.to_owned(),
            })
            .unwrap()
    }

    pub fn ctcp(&mut self, target: &str, msg: &str) {
        self.msg_chan
            .try_send(Cmd::Ctcp {
                target: target.to_owned(),
                msg: msg.to_owned(),
            })
            .unwrap()
    }

    pub fn mode(&mut self, target: &str, mode: &str) {
        self.msg_chan
            .try_send(Cmd::Mode {
                target: target.to_owned(),
                mode: mode.to_owned(),
            })
            .unwrap()
    }

    pub fn names(&mut self, chan: &str) {
        self.msg_chan.try_send(Cmd::Names(chan.to_owned())).unwrap()
    }

    pub fn topic(&mut self, chan: &str, topic: Option<String>) {
        self.msg_chan
            .try_send(Cmd::Topic {
                chan: chan.to_owned(),
                topic,
            })
            .unwrap()
    }

    pub fn list(&mut self, chan: Option<String>) {
        self.msg_chan.try_send(Cmd::List(chan)).unwrap()
    }

    /// Change nick. This may fail (ERR_NICKNAMEINUSE) so wait for
    /// confirmation (a NICK message back from the server).
    pub fn nick(&mut self, new_nick: &str) {
        self.msg_chan.try_send(Cmd::Nick(new_nick.to_owned())).unwrap()
    }

    /// Set away status. `None` means back.
    pub fn away(&mut self, msg: Option<&str>) {
        self.msg_chan
            .try_send(Cmd::Away(msg.map(str::to_owned)))
            .unwrap()
    }

    pub fn whois(&mut self, mask: &str) {
        self.msg_chan.try_send(Cmd::Whois(mask.to_owned())).unwrap()
    }

    //
    // State snapshots
    //

    pub fn get_serv_name(&self) -> &str {
        &self.serv_name
    }

    // FIXME: This allocates a String
    pub fn get_nick(&self) -> String {
        self.state.get_nick()
    }

    pub fn status(&self) -> ServerStatus {
        self.state.status()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.is_logged_in()
    }

    /// Names of the currently joined channels.
    pub fn get_channels(&self) -> Vec<String> {
        self.state.get_channels()
    }

    /// Nicks in a channel with the highest prefix character of each
    /// (empty string for none), in the same order.
    pub fn get_channel_nicks(&self, chan: &str) -> (Vec<String>, Vec<String>) {
        self.state.get_channel_nicks(chan)
    }

    pub fn get_channel_topic(&self, chan: &str) -> Option<String> {
        self.state.get_channel_topic(chan)
    }

    pub fn is_user_away(&self, nick: &str) -> bool {
        self.state.is_user_away(nick)
    }
}

//
// End of public API
//

#[derive(Debug)]
pub(crate) enum Cmd {
    /// Connect now; resets the reconnect budget.
    Connect,
    /// QUIT with the given reason and stay disconnected.
    Disconnect(Option<String>),
    /// QUIT and end the connection task.
    Quit(Option<String>),
    Raw(String),
    Join(String, Option<String>),
    Part(String, Option<String>),
    Kick(String, String, Option<String>),
    Invite(String, String),
    Privmsg { target: String, msg: String },
    Action { target: String, msg: String },
    Notice { target: String, msg: String },
    Ctcp { target: String, msg: String },
    Mode { target: String, mode: String },
    Names(String),
    Topic { chan: String, topic: Option<String> },
    List(Option<String>),
    Nick(String),
    Away(Option<String>),
    Whois(String),
}

fn connect(setup: ServerSetup) -> (Client, mpsc::Receiver<Event>) {
    let serv_name = setup.name.clone();

    // Channel for returning events to the owner.
    let (snd_ev, rcv_ev) = mpsc::channel::<Event>(100);

    // Channel for commands from the owner.
    let (snd_cmd, rcv_cmd) = mpsc::channel::<Cmd>(100);

    let state = State::new(&setup.name, setup.config.clone(), setup.logger.clone());
    let state_clone = state.clone();

    let task = main_loop(setup, state_clone, snd_ev, rcv_cmd);
    tokio::task::spawn_local(task);

    (
        Client {
            msg_chan: snd_cmd,
            serv_name,
            state,
        },
        rcv_ev,
    )
}

type CmdStream = Fuse<ReceiverStream<Cmd>>;

enum SessionOutcome {
    /// Connection lost unexpectedly; the reconnect policy applies.
    Lost,
    /// Explicit disconnect; stay down until the next connect command.
    Idle,
    /// End the connection task.
    Terminate,
}

enum WaitOutcome {
    TimerFired,
    ConnectNow,
    Cancelled,
    Closed,
}

async fn main_loop(
    setup: ServerSetup,
    state: State,
    mut snd_ev: mpsc::Sender<Event>,
    rcv_cmd: mpsc::Receiver<Cmd>,
) {
    let mut rcv_cmd = ReceiverStream::new(rcv_cmd).fuse();

    'idle: loop {
        // Disconnected and no reconnect pending: wait for orders
        loop {
            match rcv_cmd.next().await {
                None => return,
                Some(Cmd::Connect) => break,
                Some(Cmd::Quit(_)) => return,
                Some(Cmd::Disconnect(_)) => {}
                Some(cmd) => {
                    debug!("{}: ignoring command while disconnected: {:?}", setup.name, cmd);
                }
            }
        }

        let mut retries_left = setup.reconnect_retries;

        'connect: loop {
            snd_ev.send(Event::Connect).await.unwrap();

            match run_session(&setup, &state, &mut snd_ev, &mut rcv_cmd).await {
                SessionOutcome::Idle => continue 'idle,
                SessionOutcome::Terminate => return,
                SessionOutcome::Lost => {
                    state.connection_lost();
                    if retries_left == 0 {
                        // Finally give up
                        debug!("{}: out of reconnect attempts", setup.name);
                        continue 'idle;
                    }
                    retries_left -= 1;
                    match wait_reconnect(setup.reconnect_timeout, &mut rcv_cmd).await {
                        WaitOutcome::TimerFired => continue 'connect,
                        WaitOutcome::ConnectNow => {
                            retries_left = setup.reconnect_retries;
                            continue 'connect;
                        }
                        WaitOutcome::Cancelled => continue 'idle,
                        WaitOutcome::Closed => return,
                    }
                }
            }
        }
    }
}

/// One connection attempt: resolve, connect, log in, serve until the
/// connection dies or we are told to stop.
async fn run_session(
    setup: &ServerSetup,
    state: &State,
    snd_ev: &mut mpsc::Sender<Event>,
    rcv_cmd: &mut CmdStream,
) -> SessionOutcome {
    state.set_connecting();

    let (host, port, tls) = match state.connect_params() {
        Some(params) => params,
        None => {
            warn!("{}: no address configured", setup.name);
            return SessionOutcome::Lost;
        }
    };

    //
    // Resolve the address
    //

    debug!("{}: resolving {}", setup.name, host);
    let addrs = match resolve_addr(host.clone(), port, rcv_cmd).await {
        TaskResult::Done(Ok(addr_iter)) => addr_iter.collect::<Vec<_>>(),
        TaskResult::Done(Err(err)) => {
            debug!("{}: resolve error: {:?}", setup.name, err);
            return SessionOutcome::Lost;
        }
        TaskResult::Cancelled => {
            state.connection_lost();
            return SessionOutcome::Idle;
        }
        TaskResult::Return => return SessionOutcome::Terminate,
    };

    if addrs.is_empty() {
        debug!("{}: can't resolve address", setup.name);
        return SessionOutcome::Lost;
    }

    debug!("{}: address resolved: {:?}", setup.name, addrs);

    //
    // Establish the TCP (and TLS) connection
    //

    let stream = match try_connect(addrs, &host, tls, setup.ca_file.as_deref(), rcv_cmd).await {
        TaskResult::Done(Some(stream)) => stream,
        TaskResult::Done(None) => return SessionOutcome::Lost,
        TaskResult::Cancelled => {
            state.connection_lost();
            return SessionOutcome::Idle;
        }
        TaskResult::Return => return SessionOutcome::Terminate,
    };

    let (mut read_half, write_half) = tokio::io::split(stream);

    //
    // Do the business
    //

    let snd_wr = sender::spawn(write_half);
    state.introduce(snd_ev, &snd_wr);

    let (mut pinger, rcv_ping) = Pinger::new(PING_TIMEOUT_SECS);
    let mut rcv_ping = ReceiverStream::new(rcv_ping).fuse();

    let mut who_tick =
        IntervalStream::new(tokio::time::interval(Duration::from_secs(WHO_INTERVAL_SECS))).fuse();

    let mut parse_buf: Vec<u8> = Vec::with_capacity(1024);

    loop {
        let mut read_buf: [u8; 1024] = [0; 1024];

        select! {
            cmd = rcv_cmd.next() => {
                match cmd {
                    None => {
                        debug!("{}: command channel closed", setup.name);
                        // rcv_cmd is fused; it won't be polled again
                    }
                    Some(Cmd::Connect) => {
                        // Already connected
                    }
                    Some(Cmd::Disconnect(msg)) => {
                        state.disconnect(msg.as_deref().unwrap_or(""), snd_ev, &snd_wr);
                        return SessionOutcome::Idle;
                    }
                    Some(Cmd::Quit(msg)) => {
                        state.disconnect(msg.as_deref().unwrap_or(""), snd_ev, &snd_wr);
                        // Dropping snd_wr lets the writer drain the QUIT
                        // and stop.
                        return SessionOutcome::Terminate;
                    }
                    Some(cmd) => {
                        state.handle_cmd(cmd, snd_ev, &snd_wr);
                    }
                }
            }
            // It's fine to fuse() the read_half here because we restart with
            // a new stream when this one ends, so we never poll it again
            // after it terminates.
            bytes = read_half.read(&mut read_buf).fuse() => {
                match bytes {
                    Err(io_err) => {
                        debug!("{}: error when reading from socket: {:?}", setup.name, io_err);
                        return SessionOutcome::Lost;
                    }
                    Ok(0) => {
                        debug!("{}: connection closed on the remote end", setup.name);
                        return SessionOutcome::Lost;
                    }
                    Ok(bytes) => {
                        pinger.reset();
                        parse_buf.extend_from_slice(&read_buf[0..bytes]);
                        while let Some(result) = wire::parse_irc_msg(&mut parse_buf) {
                            match result {
                                Err(err) => {
                                    debug!("{}: wire error: {}", setup.name, err);
                                }
                                Ok(msg) => {
                                    debug!("{}: parsed msg: {:?}", setup.name, msg);
                                    if let wire::Cmd::PING { ref server } = msg.cmd {
                                        // Answered right here, never
                                        // delivered upward
                                        let _ = snd_wr.try_send(
                                            WriteReq::Send(wire::pong(server)),
                                        );
                                        continue;
                                    }
                                    state.update(msg, snd_ev, &snd_wr);
                                }
                            }
                        }
                    }
                }
            }
            ping_ev = rcv_ping.next() => {
                match ping_ev {
                    None => {
                        debug!("{}: pinger task ended unexpectedly", setup.name);
                    }
                    Some(pinger::Event::SendPing) => {
                        state.send_keepalive(&snd_wr);
                    }
                }
            }
            _ = who_tick.next() => {
                state.periodic_who(&snd_wr);
            }
        }
    }
}

enum TaskResult<A> {
    Done(A),
    /// The user asked to disconnect while we were connecting.
    Cancelled,
    /// The task should end (quit command or closed channel).
    Return,
}

async fn wait_reconnect(secs: u64, rcv_cmd: &mut CmdStream) -> WaitOutcome {
    let delay = tokio::time::sleep(Duration::from_secs(secs)).fuse();
    pin_mut!(delay);

    loop {
        select! {
            () = delay => {
                return WaitOutcome::TimerFired;
            }
            cmd = rcv_cmd.next() => {
                match cmd {
                    None => return WaitOutcome::Closed,
                    Some(Cmd::Connect) => return WaitOutcome::ConnectNow,
                    Some(Cmd::Disconnect(_)) => return WaitOutcome::Cancelled,
                    Some(Cmd::Quit(_)) => return WaitOutcome::Closed,
                    Some(_) => continue,
                }
            }
        }
    }
}

async fn resolve_addr(
    host: String,
    port: u16,
    rcv_cmd: &mut CmdStream,
) -> TaskResult<Result<std::vec::IntoIter<SocketAddr>, std::io::Error>> {
    let mut addr_iter_task =
        tokio::task::spawn_blocking(move || (host.as_str(), port).to_socket_addrs()).fuse();

    loop {
        select! {
            addr_iter = addr_iter_task => {
                match addr_iter {
                    Err(join_err) => {
                        debug!("DNS task failed: {:?}", join_err);
                        return TaskResult::Done(Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            join_err,
                        )));
                    }
                    Ok(ret) => {
                        return TaskResult::Done(ret);
                    }
                }
            }
            cmd = rcv_cmd.next() => {
                match cmd {
                    None => return TaskResult::Return,
                    Some(Cmd::Disconnect(_)) => return TaskResult::Cancelled,
                    Some(Cmd::Quit(_)) => return TaskResult::Return,
                    Some(_) => continue,
                }
            }
        }
    }
}

async fn try_connect(
    addrs: Vec<SocketAddr>,
    host: &str,
    use_tls: bool,
    ca_file: Option<&Path>,
    rcv_cmd: &mut CmdStream,
) -> TaskResult<Option<Stream>> {
    let connect_task = async move {
        for addr in addrs {
            debug!("connecting to {}", addr);
            let mb_stream = if use_tls {
                Stream::new_tls(addr, host, ca_file).await
            } else {
                Stream::new_tcp(addr).await
            };
            match mb_stream {
                Err(StreamError::Io(err)) => {
                    debug!("connect error: {:?}", err);
                }
                Err(StreamError::Tls(err)) => {
                    debug!("TLS error: {:?}", err);
                }
                Ok(stream) => {
                    return Some(stream);
                }
            }
        }

        None
    };

    let connect_task = connect_task.fuse();
    pin_mut!(connect_task);

    loop {
        select! {
            stream = connect_task => {
                return TaskResult::Done(stream);
            }
            cmd = rcv_cmd.next() => {
                match cmd {
                    None => return TaskResult::Return,
                    Some(Cmd::Disconnect(_)) => return TaskResult::Cancelled,
                    Some(Cmd::Quit(_)) => return TaskResult::Return,
                    Some(_) => continue,
                }
            }
        }
    }
}
