//! Per-server state and the inbound message dispatcher.
//!
//! Everything a server connection knows lives here: the user registry
//! (reference counted, shared between channel rosters), channels with
//! per-user prefix masks, the ISUPPORT dialect and the away status.
//! `update` turns one parsed message into state mutations, chat log lines
//! and events; the outbound helpers implement the send path policies.

use crate::dcc;
use crate::sender::WriteReq;
use crate::utils;
use crate::{Cmd, Event, ServerStatus, VERSION};

use libmaki_common::{irc_eq, irc_fold, ChanName};
use libmaki_config::{os_user_name, Config};
use libmaki_logger::Logger;
use libmaki_wire as wire;
use libmaki_wire::support::Support;
use libmaki_wire::{Cmd as WireCmd, Msg, Pfx, CTCP};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc::Sender;

/// A user as seen on one server. Shared between the server registry and
/// channel rosters; mutable fields go through interior mutability so that
/// a nick change or away update is visible everywhere at once.
#[derive(Clone)]
pub struct User {
    inner: Rc<RefCell<UserInner>>,
}

struct UserInner {
    nick: String,
    user: Option<String>,
    host: Option<String>,
    away: bool,
    away_message: Option<String>,
}

impl User {
    fn new(nick: &str) -> User {
        User {
            inner: Rc::new(RefCell::new(UserInner {
                nick: nick.to_owned(),
                user: None,
                host: None,
                away: false,
                away_message: None,
            })),
        }
    }

    pub fn nick(&self) -> String {
        self.inner.borrow().nick.clone()
    }

    fn set_nick(&self, nick: &str) {
        self.inner.borrow_mut().nick = nick.to_owned();
    }

    fn set_user(&self, user: &str) {
        self.inner.borrow_mut().user = Some(user.to_owned());
    }

    fn set_host(&self, host: &str) {
        self.inner.borrow_mut().host = Some(host.to_owned());
    }

    pub fn away(&self) -> bool {
        self.inner.borrow().away
    }

    fn set_away(&self, away: bool) {
        self.inner.borrow_mut().away = away;
    }

    fn set_away_message(&self, msg: Option<String>) {
        self.inner.borrow_mut().away_message = msg;
    }

    fn away_message(&self) -> Option<String> {
        self.inner.borrow().away_message.clone()
    }

    /// `nick!user@host` when user and host are known, just the nick
    /// otherwise.
    pub fn from(&self) -> String {
        let inner = self.inner.borrow();
        match (&inner.user, &inner.host) {
            (Some(user), Some(host)) => format!("{}!{}@{}", inner.nick, user, host),
            _ => inner.nick.clone(),
        }
    }
}

struct UserEntry {
    user: User,
    refs: usize,
}

/// Per-channel state. Roster keys are folded nicks; `users` and
/// `prefixes` always hold the same key set.
struct Channel {
    name: ChanName,
    joined: bool,
    topic: Option<String>,
    users: HashMap<String, User>,
    prefixes: HashMap<String, u32>,
    /// NAMES replies accumulated since the last RPL_ENDOFNAMES:
    /// (nick, highest prefix character).
    pending_names: Vec<(String, String)>,
}

impl Channel {
    fn new(name: ChanName) -> Channel {
        Channel {
            name,
            joined: false,
            topic: None,
            users: HashMap::new(),
            prefixes: HashMap::new(),
            pending_names: Vec::new(),
        }
    }

    fn has_user(&self, nick: &str) -> bool {
        self.users.contains_key(&irc_fold(nick))
    }

    fn get_user(&self, nick: &str) -> Option<&User> {
        self.users.get(&irc_fold(nick))
    }

    fn add_user(&mut self, user: User) {
        let key = irc_fold(&user.nick());
        self.users.insert(key.clone(), user);
        self.prefixes.entry(key).or_insert(0);
    }

    /// Re-key a roster entry, preserving the prefix mask. Fails silently
    /// when the new nick is already present.
    fn rename_user(&mut self, old_nick: &str, new_nick: &str) -> bool {
        let old_key = irc_fold(old_nick);
        let new_key = irc_fold(new_nick);
        if old_key != new_key && self.users.contains_key(&new_key) {
            return false;
        }
        match self.users.remove(&old_key) {
            None => false,
            Some(user) => {
                let mask = self.prefixes.remove(&old_key).unwrap_or(0);
                self.users.insert(new_key.clone(), user);
                self.prefixes.insert(new_key, mask);
                true
            }
        }
    }

    fn remove_user(&mut self, nick: &str) -> Option<User> {
        let key = irc_fold(nick);
        self.prefixes.remove(&key);
        self.users.remove(&key)
    }

    fn remove_all_users(&mut self) -> Vec<User> {
        self.prefixes.clear();
        self.pending_names.clear();
        self.users.drain().map(|(_, user)| user).collect()
    }

    fn user_count(&self) -> usize {
        self.users.len()
    }

    fn get_prefix(&self, nick: &str, pos: usize) -> bool {
        match self.prefixes.get(&irc_fold(nick)) {
            Some(mask) => mask & (1 << pos) != 0,
            None => false,
        }
    }

    fn set_prefix(&mut self, nick: &str, pos: usize, set: bool) {
        if let Some(mask) = self.prefixes.get_mut(&irc_fold(nick)) {
            if set {
                *mask |= 1 << pos;
            } else {
                *mask &= !(1 << pos);
            }
        }
    }

    fn set_prefix_mask(&mut self, nick: &str, new_mask: u32) {
        if let Some(mask) = self.prefixes.get_mut(&irc_fold(nick)) {
            *mask = new_mask;
        }
    }
}

#[derive(Clone)]
pub(crate) struct State {
    inner: Rc<RefCell<StateInner>>,
}

impl State {
    pub(crate) fn new(serv_name: &str, config: Config, logger: Logger) -> State {
        State {
            inner: Rc::new(RefCell::new(StateInner::new(serv_name, config, logger))),
        }
    }

    pub(crate) fn update(
        &self,
        msg: Msg,
        snd_ev: &mut Sender<Event>,
        snd_wr: &Sender<WriteReq>,
    ) {
        self.inner.borrow_mut().update(msg, snd_ev, snd_wr);
        if self.inner.borrow_mut().take_join_scheduled() {
            tokio::task::spawn_local(delayed_join(self.clone(), snd_wr.clone()));
        }
    }

    pub(crate) fn handle_cmd(
        &self,
        cmd: Cmd,
        snd_ev: &mut Sender<Event>,
        snd_wr: &Sender<WriteReq>,
    ) {
        self.inner.borrow_mut().handle_cmd(cmd, snd_ev, snd_wr);
    }

    pub(crate) fn introduce(&self, snd_ev: &mut Sender<Event>, snd_wr: &Sender<WriteReq>) {
        self.inner.borrow_mut().introduce(snd_ev, snd_wr);
    }

    pub(crate) fn disconnect(
        &self,
        msg: &str,
        snd_ev: &mut Sender<Event>,
        snd_wr: &Sender<WriteReq>,
    ) {
        self.inner.borrow_mut().disconnect(msg, snd_ev, snd_wr);
    }

    pub(crate) fn connection_lost(&self) {
        self.inner.borrow_mut().connection_lost();
    }

    pub(crate) fn set_connecting(&self) {
        self.inner.borrow_mut().status = ServerStatus::Connecting;
    }

    pub(crate) fn send_keepalive(&self, snd_wr: &Sender<WriteReq>) {
        let epoch = time::OffsetDateTime::now_utc().unix_timestamp();
        let _ = snd_wr.try_send(WriteReq::Send(wire::ping(&epoch.to_string())));
    }

    pub(crate) fn periodic_who(&self, snd_wr: &Sender<WriteReq>) {
        self.inner.borrow().periodic_who(snd_wr);
    }

    pub(crate) fn connect_params(&self) -> Option<(String, u16, bool)> {
        let inner = self.inner.borrow();
        let address = inner.config.get_str("server", "address")?;
        let port = inner.config.get_int("server", "port");
        let port = if (1..=65535).contains(&port) {
            port as u16
        } else {
            6667
        };
        let ssl = inner.config.get_bool("server", "ssl");
        Some((address, port, ssl))
    }

    //
    // Snapshot getters, safe to call from other tasks on the same thread
    //

    pub(crate) fn get_nick(&self) -> String {
        self.inner.borrow().me.nick()
    }

    pub(crate) fn status(&self) -> ServerStatus {
        self.inner.borrow().status
    }

    pub(crate) fn is_logged_in(&self) -> bool {
        self.inner.borrow().logged_in
    }

    pub(crate) fn get_channels(&self) -> Vec<String> {
        let inner = self.inner.borrow();
        let mut chans: Vec<String> = inner
            .channels
            .values()
            .filter(|chan| chan.joined)
            .map(|chan| chan.name.display().to_owned())
            .collect();
        chans.sort_unstable_by_key(|name| irc_fold(name));
        chans
    }

    pub(crate) fn get_channel_topic(&self, chan: &str) -> Option<String> {
        let inner = self.inner.borrow();
        inner.channels.get(&irc_fold(chan))?.topic.clone()
    }

    pub(crate) fn get_channel_nicks(&self, chan: &str) -> (Vec<String>, Vec<String>) {
        let inner = self.inner.borrow();
        let chan = match inner.channels.get(&irc_fold(chan)) {
            Some(chan) => chan,
            None => return (Vec::new(), Vec::new()),
        };

        let mut nicks: Vec<String> = chan.users.values().map(|user| user.nick()).collect();
        nicks.sort_unstable_by_key(|nick| irc_fold(nick));

        let prefixes = nicks
            .iter()
            .map(|nick| {
                (0..32)
                    .find(|pos| chan.get_prefix(nick, *pos))
                    .and_then(|pos| inner.support.prefix_char(pos))
                    .map(|c| c.to_string())
                    .unwrap_or_default()
            })
            .collect();

        (nicks, prefixes)
    }

    pub(crate) fn is_user_away(&self, nick: &str) -> bool {
        let inner = self.inner.borrow();
        inner
            .users
            .get(&irc_fold(nick))
            .map(|entry| entry.user.away())
            .unwrap_or(false)
    }
}

/// Joins every channel whose `autojoin` or `joined` flag is set, three
/// seconds after login so that NickServ identification wins the race.
async fn delayed_join(state: State, snd_wr: Sender<WriteReq>) {
    tokio::time::sleep(Duration::from_secs(3)).await;
    if state.status() != ServerStatus::Connected {
        return;
    }
    for line in state.inner.borrow().join_lines() {
        let _ = snd_wr.try_send(WriteReq::Send(line));
    }
}

struct StateInner {
    serv_name: String,
    config: Config,
    logger: Logger,

    status: ServerStatus,
    logged_in: bool,

    /// Our own identity on this server. Always present in `users`.
    me: User,

    /// Server-wide user registry. An entry lives as long as something
    /// references it: channel rosters and the in-flight message sender.
    users: HashMap<String, UserEntry>,

    /// Channels, keyed by folded name. Contains every configured channel,
    /// joined or not.
    channels: HashMap<String, Channel>,

    support: Support,

    /// Away message to restore after a reconnect. Set by the away command,
    /// cleared by back.
    away_wanted: Option<String>,

    /// Set when RPL_ENDOFMOTD asks for the delayed channel join.
    join_scheduled: bool,
}

impl StateInner {
    fn new(serv_name: &str, config: Config, logger: Logger) -> StateInner {
        let mut state = StateInner {
            serv_name: serv_name.to_owned(),
            config,
            logger,
            status: ServerStatus::Disconnected,
            logged_in: false,
            me: User::new(""),
            users: HashMap::new(),
            channels: HashMap::new(),
            support: Support::default(),
            away_wanted: None,
            join_scheduled: false,
        };

        let nick = state
            .config
            .get_str("server", "nick")
            .unwrap_or_else(os_user_name);
        state.me = state.add_user(&nick);

        // Every config group except "server" describes a channel
        for group in state.config.groups() {
            if group != "server" {
                state
                    .channels
                    .insert(irc_fold(&group), Channel::new(ChanName::new(group)));
            }
        }

        state
    }

    //
    // User registry
    //

    fn add_user(&mut self, nick: &str) -> User {
        let key = irc_fold(nick);
        match self.users.get_mut(&key) {
            Some(entry) => {
                entry.refs += 1;
                entry.user.clone()
            }
            None => {
                let user = User::new(nick);
                self.users.insert(
                    key,
                    UserEntry {
                        user: user.clone(),
                        refs: 1,
                    },
                );
                user
            }
        }
    }

    fn get_user(&self, nick: &str) -> Option<User> {
        self.users.get(&irc_fold(nick)).map(|entry| entry.user.clone())
    }

    fn release_user(&mut self, nick: &str) {
        let key = irc_fold(nick);
        if let Some(entry) = self.users.get_mut(&key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                self.users.remove(&key);
            }
        }
    }

    /// Atomically re-key a user. The new nick must be free.
    fn rename_user(&mut self, old_nick: &str, new_nick: &str) -> bool {
        let old_key = irc_fold(old_nick);
        let new_key = irc_fold(new_nick);
        if old_key != new_key && self.users.contains_key(&new_key) {
            return false;
        }
        match self.users.remove(&old_key) {
            None => false,
            Some(entry) => {
                entry.user.set_nick(new_nick);
                self.users.insert(new_key, entry);
                true
            }
        }
    }

    //
    // Channel helpers
    //

    fn channel_add_user(&mut self, chan_key: &str, nick: &str) {
        let present = match self.channels.get(chan_key) {
            Some(chan) => chan.has_user(nick),
            None => return,
        };
        if present {
            return;
        }
        let user = self.add_user(nick);
        if let Some(chan) = self.channels.get_mut(chan_key) {
            chan.add_user(user);
        } else {
            self.release_user(nick);
        }
    }

    fn channel_remove_user(&mut self, chan_key: &str, nick: &str) {
        let removed = match self.channels.get_mut(chan_key) {
            Some(chan) => chan.remove_user(nick),
            None => None,
        };
        if let Some(user) = removed {
            self.release_user(&user.nick());
        }
    }

    /// Remove a channel entirely, releasing its roster from the registry.
    fn drop_channel(&mut self, chan_key: &str) {
        if let Some(mut chan) = self.channels.remove(chan_key) {
            for user in chan.remove_all_users() {
                self.release_user(&user.nick());
            }
        }
    }

    fn is_channel(&self, target: &str) -> bool {
        self.support.is_channel(target)
    }

    fn log(&self, target: &str, line: &str) {
        self.logger.write(target, line);
    }

    fn take_join_scheduled(&mut self) -> bool {
        std::mem::replace(&mut self.join_scheduled, false)
    }

    fn join_lines(&self) -> Vec<String> {
        self.channels
            .values()
            .filter(|chan| {
                chan.joined || self.config.get_bool(chan.name.display(), "autojoin")
            })
            .map(|chan| {
                let key = self.config.get_str(chan.name.display(), "key");
                wire::join(chan.name.display(), key.as_deref())
            })
            .collect()
    }

    fn periodic_who(&self, snd_wr: &Sender<WriteReq>) {
        for chan in self.channels.values() {
            if chan.joined && chan.user_count() <= 100 {
                let _ = snd_wr.try_send(WriteReq::Send(wire::who(chan.name.display())));
            }
        }
    }

    //
    // Connection lifecycle
    //

    /// Start the login sequence on a fresh connection: re-key ourselves to
    /// the configured nick and introduce us to the server.
    fn introduce(&mut self, snd_ev: &mut Sender<Event>, snd_wr: &Sender<WriteReq>) {
        let nick = self
            .config
            .get_str("server", "nick")
            .unwrap_or_else(os_user_name);
        let username = self
            .config
            .get_str("server", "user")
            .unwrap_or_else(|| nick.clone());
        let realname = self
            .config
            .get_str("server", "name")
            .unwrap_or_else(|| nick.clone());

        let old_nick = self.me.nick();
        self.release_user(&old_nick);
        self.me = self.add_user(&nick);

        let _ = snd_wr.try_send(WriteReq::Send(wire::nick(&nick)));
        let _ = snd_wr.try_send(WriteReq::Send(wire::user(&username, &realname)));

        self.status = ServerStatus::Connected;
        self.logged_in = false;

        snd_ev.try_send(Event::Connected).unwrap();
        snd_ev
            .try_send(Event::Nick {
                old: String::new(),
                new: nick,
            })
            .unwrap();
    }

    /// Explicit disconnect: best-effort QUIT, a "you quit" log line in
    /// every joined channel, joined flags cleared.
    fn disconnect(&mut self, msg: &str, snd_ev: &mut Sender<Event>, snd_wr: &Sender<WriteReq>) {
        if msg.is_empty() {
            let _ = snd_wr.try_send(WriteReq::Send(wire::quit(None)));
        } else {
            let _ = snd_wr.try_send(WriteReq::Send(wire::quit(Some(msg))));
        }

        let joined: Vec<String> = self
            .channels
            .values()
            .filter(|chan| chan.joined)
            .map(|chan| chan.name.display().to_owned())
            .collect();
        for chan_name in &joined {
            if msg.is_empty() {
                self.log(chan_name, "« You quit.");
            } else {
                self.log(chan_name, &format!("« You quit ({}).", msg));
            }
        }
        for chan in self.channels.values_mut() {
            chan.joined = false;
        }

        snd_ev
            .try_send(Event::Quit {
                from: self.me.from(),
                msg: msg.to_owned(),
            })
            .unwrap();

        self.status = ServerStatus::Disconnected;
        self.logged_in = false;
    }

    /// Unexpected connection loss. Joined flags are kept so the reconnect
    /// path can rejoin.
    fn connection_lost(&mut self) {
        self.status = ServerStatus::Disconnected;
        self.logged_in = false;
    }

    //
    // Outbound path
    //

    fn nickserv(&mut self, snd_wr: &Sender<WriteReq>) {
        let initial_nick = match self.config.get_str("server", "nick") {
            Some(nick) => nick,
            None => return,
        };
        let password = match self.config.get_str("server", "nickserv") {
            Some(password) => password,
            None => return,
        };

        if !irc_eq(&self.me.nick(), &initial_nick) {
            if self.config.get_bool("server", "nickserv_ghost") {
                let _ = snd_wr.try_send(WriteReq::Send(format!(
                    "PRIVMSG NickServ :GHOST {} {}",
                    initial_nick, password
                )));
            }
            let _ = snd_wr.try_send(WriteReq::Send(wire::nick(&initial_nick)));
        }

        let _ = snd_wr.try_send(WriteReq::Send(format!(
            "PRIVMSG NickServ :IDENTIFY {}",
            password
        )));
    }

    fn login_commands(&mut self, snd_wr: &Sender<WriteReq>) {
        for command in self.config.get_list("server", "commands") {
            let _ = snd_wr.try_send(WriteReq::Send(command));
        }
    }

    /// The PRIVMSG send path: split at embedded newlines, split each piece
    /// to the wire budget on UTF-8 boundaries, and throttle through the
    /// queue as soon as one split happened.
    fn send_privmsg(
        &mut self,
        target: &str,
        text: &str,
        snd_ev: &mut Sender<Event>,
        snd_wr: &Sender<WriteReq>,
    ) {
        let budget = utils::privmsg_budget(&self.me.nick(), target);

        // The first piece may go out directly; everything after a split is
        // throttled through the queue.
        let mut queued = false;

        for line in text.split(['\n', '\r']) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let mut rest = line;
            while rest.len() > budget {
                let (piece, tail) = utils::split_at_boundary(rest, budget);
                self.send_privmsg_piece(target, piece, queued, snd_ev, snd_wr);
                queued = true;
                rest = tail;
            }
            self.send_privmsg_piece(target, rest, queued, snd_ev, snd_wr);
            queued = true;
        }
    }

    fn send_privmsg_piece(
        &mut self,
        target: &str,
        msg: &str,
        queued: bool,
        snd_ev: &mut Sender<Event>,
        snd_wr: &Sender<WriteReq>,
    ) {
        let line = wire::privmsg(target, msg);
        let req = if queued {
            WriteReq::Queue(line)
        } else {
            WriteReq::SendOrQueue(line)
        };
        let _ = snd_wr.try_send(req);

        self.log(target, &format!("<{}> {}", self.me.nick(), msg));
        snd_ev
            .try_send(Event::Message {
                from: self.me.from(),
                target: target.to_owned(),
                msg: msg.to_owned(),
            })
            .unwrap();
    }

    fn handle_cmd(&mut self, cmd: Cmd, snd_ev: &mut Sender<Event>, snd_wr: &Sender<WriteReq>) {
        match cmd {
            Cmd::Raw(line) => {
                let _ = snd_wr.try_send(WriteReq::Send(line));
            }
            Cmd::Join(chan, key) => {
                if let Some(ref key) = key {
                    if !key.is_empty() {
                        // Only user-provided keys are persisted
                        self.config.set_str(&chan, "key", key);
                    }
                }
                let _ = snd_wr.try_send(WriteReq::Send(wire::join(&chan, key.as_deref())));
            }
            Cmd::Part(chan, msg) => {
                let _ = snd_wr.try_send(WriteReq::Send(wire::part(&chan, msg.as_deref())));
            }
            Cmd::Kick(chan, who, msg) => {
                let _ = snd_wr.try_send(WriteReq::Send(wire::kick(&chan, &who, msg.as_deref())));
            }
            Cmd::Invite(chan, who) => {
                let _ = snd_wr.try_send(WriteReq::Send(wire::invite(&who, &chan)));
            }
            Cmd::Privmsg { target, msg } => {
                self.send_privmsg(&target, &msg, snd_ev, snd_wr);
            }
            Cmd::Action { target, msg } => {
                let _ = snd_wr.try_send(WriteReq::SendOrQueue(wire::action(&target, &msg)));
                self.log(&target, &format!("{} {}", self.me.nick(), msg));
                snd_ev
                    .try_send(Event::Action {
                        from: self.me.from(),
                        target,
                        msg,
                    })
                    .unwrap();
            }
            Cmd::Notice { target, msg } => {
                let _ = snd_wr.try_send(WriteReq::SendOrQueue(wire::notice(&target, &msg)));
                self.log(&target, &format!("-{}- {}", self.me.nick(), msg));
                snd_ev
                    .try_send(Event::Notice {
                        from: self.me.from(),
                        target,
                        msg,
                    })
                    .unwrap();
            }
            Cmd::Ctcp { target, msg } => {
                let _ = snd_wr.try_send(WriteReq::SendOrQueue(wire::ctcp(&target, &msg)));
                self.log(&target, &format!("={}= {}", self.me.nick(), msg));
                snd_ev
                    .try_send(Event::Ctcp {
                        from: self.me.from(),
                        target,
                        msg,
                    })
                    .unwrap();
            }
            Cmd::Mode { target, mode } => {
                let _ = snd_wr.try_send(WriteReq::Send(wire::mode(&target, &mode)));
            }
            Cmd::Names(chan) => {
                let _ = snd_wr.try_send(WriteReq::Send(wire::names(&chan)));
            }
            Cmd::Topic { chan, topic } => {
                let _ = snd_wr.try_send(WriteReq::Send(wire::topic(&chan, topic.as_deref())));
            }
            Cmd::List(chan) => {
                let _ = snd_wr.try_send(WriteReq::Send(wire::list(chan.as_deref())));
            }
            Cmd::Nick(nick) => {
                let _ = snd_wr.try_send(WriteReq::Send(wire::nick(&nick)));
            }
            Cmd::Away(Some(msg)) => {
                self.away_wanted = Some(msg.clone());
                self.me.set_away_message(Some(msg.clone()));
                let _ = snd_wr.try_send(WriteReq::Send(wire::away(Some(&msg))));
            }
            Cmd::Away(None) => {
                self.away_wanted = None;
                let _ = snd_wr.try_send(WriteReq::Send(wire::away(None)));
            }
            Cmd::Whois(mask) => {
                let _ = snd_wr.try_send(WriteReq::Send(wire::whois(&mask)));
            }
            Cmd::Connect | Cmd::Disconnect(_) | Cmd::Quit(_) => {
                // Handled by the main loop
            }
        }
    }

    //
    // Inbound dispatch
    //

    fn update(&mut self, msg: Msg, snd_ev: &mut Sender<Event>, snd_wr: &Sender<WriteReq>) {
        let Msg { pfx, cmd } = msg;

        // Only prefix-bearing lines carry state; PING is answered by the
        // transport before we ever get here.
        let pfx = match pfx {
            Some(pfx) => pfx,
            None => {
                debug!("dropping line without prefix: {:?}", cmd);
                return;
            }
        };

        let raw_pfx = pfx.raw();
        for pattern in self.config.get_list("server", "ignores") {
            if let Ok(pattern) = glob::Pattern::new(&pattern) {
                if pattern.matches(&raw_pfx) {
                    debug!("{}: ignoring message from {}", self.serv_name, raw_pfx);
                    return;
                }
            }
        }

        // Upsert the sender; the reference is released at the end of
        // dispatch, so only rosters keep users alive.
        let user = match &pfx {
            Pfx::User { nick, user, host } => {
                let sender = self.add_user(nick);
                if let Some(user) = user {
                    sender.set_user(user);
                }
                if let Some(host) = host {
                    sender.set_host(host);
                }
                sender
            }
            Pfx::Server(name) | Pfx::Ambiguous(name) => self.add_user(name),
        };

        match cmd {
            WireCmd::Reply { num, params } => {
                self.handle_numeric(num, params, snd_ev, snd_wr);
            }
            WireCmd::PRIVMSG {
                target,
                msg,
                is_notice,
                ctcp,
            } => {
                if is_notice {
                    self.handle_notice(&user, &target, &msg, snd_ev);
                } else {
                    self.handle_privmsg(&user, &target, &msg, ctcp, snd_ev, snd_wr);
                }
            }
            WireCmd::JOIN { chan } => {
                self.handle_join(&user, chan, snd_ev);
            }
            WireCmd::PART { chan, msg } => {
                self.handle_part(&user, chan, msg, snd_ev);
            }
            WireCmd::QUIT { msg } => {
                self.handle_quit(&user, msg, snd_ev);
            }
            WireCmd::KICK { chan, who, msg } => {
                self.handle_kick(&user, chan, who, msg, snd_ev);
            }
            WireCmd::NICK { nick } => {
                self.handle_nick(&user, &nick, snd_ev, snd_wr);
            }
            WireCmd::MODE {
                target,
                modes,
                params,
            } => {
                self.handle_mode(Some(&user), &target, &modes, &params, snd_ev);
            }
            WireCmd::INVITE { who, chan } => {
                self.log(&chan, &format!("• {} invites {}.", user.nick(), who));
                snd_ev
                    .try_send(Event::Invite {
                        from: user.from(),
                        chan,
                        who,
                    })
                    .unwrap();
            }
            WireCmd::TOPIC { chan, topic } => {
                self.handle_topic(Some(&user), chan.display().to_owned(), topic, snd_ev);
            }
            WireCmd::PING { server } => {
                // Normally answered by the transport; answer anyway
                let _ = snd_wr.try_send(WriteReq::Send(wire::pong(&server)));
            }
            WireCmd::PONG { .. } => {}
            WireCmd::ERROR { msg } => {
                debug!("server error: {}", msg);
            }
            WireCmd::Other { cmd, .. } => {
                debug!("unhandled message type {:?}", cmd);
            }
        }

        // Balance the upsert at the top; `user` may have been renamed in
        // the meantime.
        let nick = user.nick();
        self.release_user(&nick);
    }

    fn handle_numeric(
        &mut self,
        num: u16,
        params: Vec<String>,
        snd_ev: &mut Sender<Event>,
        snd_wr: &Sender<WriteReq>,
    ) {
        match num {
            // RPL_ISUPPORT
            005 => {
                if params.len() > 1 {
                    self.support.parse_tokens(&params[1..]);
                }
            }

            // RPL_AWAY
            301 => {
                if params.len() >= 3 {
                    snd_ev
                        .try_send(Event::AwayMessage {
                            nick: params[1].clone(),
                            msg: params[2].clone(),
                        })
                        .unwrap();
                }
            }

            // RPL_UNAWAY
            305 => {
                self.me.set_away(false);
                self.me.set_away_message(None);
                snd_ev.try_send(Event::Back).unwrap();
                snd_ev
                    .try_send(Event::UserAway {
                        from: self.me.from(),
                        away: false,
                    })
                    .unwrap();
            }

            // RPL_NOWAWAY
            306 => {
                self.me.set_away(true);
                snd_ev.try_send(Event::Away).unwrap();
                snd_ev
                    .try_send(Event::UserAway {
                        from: self.me.from(),
                        away: true,
                    })
                    .unwrap();
            }

            // WHOIS replies; 318 ends the sequence
            311 | 312 | 313 | 317 | 318 | 319 => {
                if params.len() >= 2 {
                    let text = if num == 318 {
                        String::new()
                    } else {
                        params[2..].join(" ")
                    };
                    snd_ev
                        .try_send(Event::Whois {
                            nick: params[1].clone(),
                            msg: text,
                        })
                        .unwrap();
                }
            }

            // RPL_WHOREPLY: <chan> <user> <host> <server> <nick> <flags> …
            352 => {
                if params.len() >= 7 {
                    if let Some(user) = self.get_user(&params[5]) {
                        let away = params[6].starts_with('G');
                        if user.away() != away {
                            user.set_away(away);
                            snd_ev
                                .try_send(Event::UserAway {
                                    from: user.from(),
                                    away,
                                })
                                .unwrap();
                        }
                    }
                }
            }

            // RPL_ENDOFWHO
            315 => {}

            // RPL_LIST / RPL_LISTEND (sentinel: empty channel, -1 count)
            322 => {
                if params.len() >= 3 {
                    snd_ev
                        .try_send(Event::List {
                            chan: params[1].clone(),
                            users: params[2].parse().unwrap_or(0),
                            topic: params.get(3).cloned().unwrap_or_default(),
                        })
                        .unwrap();
                }
            }
            323 => {
                snd_ev
                    .try_send(Event::List {
                        chan: String::new(),
                        users: -1,
                        topic: String::new(),
                    })
                    .unwrap();
            }

            // RPL_CHANNELMODEIS: a MODE with an empty sender
            324 => {
                if params.len() >= 3 {
                    let target = params[1].clone();
                    let modes = params[2].clone();
                    let args: Vec<String> = params[3..].to_vec();
                    self.handle_mode(None, &target, &modes, &args, snd_ev);
                }
            }

            // RPL_TOPIC
            332 => {
                if params.len() >= 3 {
                    self.handle_topic(None, params[1].clone(), params[2].clone(), snd_ev);
                }
            }

            // RPL_INVITING
            341 => {
                if params.len() >= 3 {
                    let who = params[1].clone();
                    let chan = params[2].clone();
                    self.log(&chan, &format!("• You successfully invite {}.", who));
                    snd_ev
                        .try_send(Event::Invite {
                            from: String::new(),
                            chan,
                            who,
                        })
                        .unwrap();
                }
            }

            // RPL_NAMREPLY: accumulate until RPL_ENDOFNAMES
            353 => {
                if params.len() >= 3 {
                    let chan_name = params[params.len() - 2].clone();
                    let names = params[params.len() - 1].clone();
                    let chan_key = irc_fold(&chan_name);
                    if self.channels.contains_key(&chan_key) {
                        for entry in names.split_whitespace() {
                            let (bare, mask, first) = {
                                let (bare, mask, first) =
                                    self.support.strip_nick_prefixes(entry);
                                (bare.to_owned(), mask, first)
                            };
                            self.channel_add_user(&chan_key, &bare);
                            if let Some(chan) = self.channels.get_mut(&chan_key) {
                                chan.set_prefix_mask(&bare, mask);
                                chan.pending_names.push((
                                    bare,
                                    first.map(|c| c.to_string()).unwrap_or_default(),
                                ));
                            }
                        }
                    }
                }
            }

            // RPL_ENDOFNAMES: emit one names event for the whole listing
            366 => {
                if params.len() >= 2 {
                    let chan_name = params[1].clone();
                    let chan_key = irc_fold(&chan_name);
                    let (chan_name, pending) = match self.channels.get_mut(&chan_key) {
                        Some(chan) => (
                            chan.name.display().to_owned(),
                            std::mem::take(&mut chan.pending_names),
                        ),
                        None => (chan_name, Vec::new()),
                    };
                    let (nicks, prefixes) = pending.into_iter().unzip();
                    snd_ev
                        .try_send(Event::Names {
                            chan: chan_name,
                            nicks,
                            prefixes,
                        })
                        .unwrap();
                }
            }

            // RPL_BANLIST / RPL_ENDOFBANLIST (sentinel: -1 timestamp)
            367 => {
                if params.len() >= 3 {
                    snd_ev
                        .try_send(Event::Banlist {
                            chan: params[1].clone(),
                            mask: params[2].clone(),
                            who: params.get(3).cloned().unwrap_or_default(),
                            when: params
                                .get(4)
                                .and_then(|s| s.parse().ok())
                                .unwrap_or(0),
                        })
                        .unwrap();
                }
            }
            368 => {
                if params.len() >= 2 {
                    snd_ev
                        .try_send(Event::Banlist {
                            chan: params[1].clone(),
                            mask: String::new(),
                            who: String::new(),
                            when: -1,
                        })
                        .unwrap();
                }
            }

            // RPL_MOTD
            372 => {
                snd_ev
                    .try_send(Event::Motd {
                        msg: params.last().cloned().unwrap_or_default(),
                    })
                    .unwrap();
            }

            // RPL_ENDOFMOTD / ERR_NOMOTD: we are logged in now
            376 | 422 => {
                self.logged_in = true;
                self.nickserv(snd_wr);
                self.join_scheduled = true;
                self.login_commands(snd_wr);
                let away = self.away_wanted.clone().or_else(|| self.me.away_message());
                if let Some(msg) = away {
                    let _ = snd_wr.try_send(WriteReq::Send(wire::away(Some(&msg))));
                }
                snd_ev
                    .try_send(Event::Motd { msg: String::new() })
                    .unwrap();
            }

            // RPL_YOUREOPER
            381 => {
                snd_ev.try_send(Event::Oper).unwrap();
            }

            // ERR_NOSUCHNICK / ERR_NOSUCHSERVER / ERR_NOSUCHCHANNEL
            401 | 402 | 403 => {
                if params.len() >= 2 {
                    let target = params[1].clone();
                    let (reason, kind) = match num {
                        401 => ("nick", "n"),
                        402 => ("server", "s"),
                        _ => ("channel", "c"),
                    };
                    snd_ev
                        .try_send(Event::Error {
                            domain: "no_such".to_owned(),
                            reason: reason.to_owned(),
                            arguments: vec![target.clone()],
                        })
                        .unwrap();
                    snd_ev
                        .try_send(Event::NoSuch {
                            target,
                            kind: kind.to_owned(),
                        })
                        .unwrap();
                }
            }

            // ERR_NICKNAMEINUSE: before login, append an underscore and
            // retry; after login this is informational only.
            433 => {
                if !self.logged_in {
                    let old_nick = self.me.nick();
                    let new_nick = format!("{}_", old_nick);
                    snd_ev
                        .try_send(Event::Nick {
                            old: old_nick.clone(),
                            new: new_nick.clone(),
                        })
                        .unwrap();
                    self.rename_user(&old_nick, &new_nick);
                    let _ = snd_wr.try_send(WriteReq::Send(wire::nick(&self.me.nick())));
                } else {
                    snd_ev
                        .try_send(Event::Error {
                            domain: "nick".to_owned(),
                            reason: "in_use".to_owned(),
                            arguments: vec![params.get(1).cloned().unwrap_or_default()],
                        })
                        .unwrap();
                }
            }

            // ERR_CHANNELISFULL / ERR_INVITEONLYCHAN / ERR_BANNEDFROMCHAN /
            // ERR_BADCHANNELKEY
            471 | 473 | 474 | 475 => {
                if params.len() >= 2 {
                    let chan = params[1].clone();
                    let (reason, kind) = match num {
                        471 => ("full", "l"),
                        473 => ("invite", "i"),
                        474 => ("banned", "b"),
                        _ => ("key", "k"),
                    };
                    snd_ev
                        .try_send(Event::Error {
                            domain: "cannot_join".to_owned(),
                            reason: reason.to_owned(),
                            arguments: vec![chan.clone()],
                        })
                        .unwrap();
                    snd_ev
                        .try_send(Event::CannotJoin {
                            chan,
                            reason: kind.to_owned(),
                        })
                        .unwrap();
                }
            }

            // ERR_CHANOPRIVSNEEDED
            482 => {
                if params.len() >= 2 {
                    snd_ev
                        .try_send(Event::Error {
                            domain: "privilege".to_owned(),
                            reason: "channel_operator".to_owned(),
                            arguments: vec![params[1].clone()],
                        })
                        .unwrap();
                }
            }

            _ => {
                debug!("unhandled numeric reply {}", num);
            }
        }
    }

    fn handle_privmsg(
        &mut self,
        user: &User,
        target: &str,
        msg: &str,
        ctcp: Option<CTCP>,
        snd_ev: &mut Sender<Event>,
        snd_wr: &Sender<WriteReq>,
    ) {
        let nick = user.nick();
        let log_target = if self.is_channel(target) {
            target.to_owned()
        } else {
            nick.clone()
        };

        match ctcp {
            Some(CTCP::Action) => {
                self.log(&log_target, &format!("{} {}", nick, msg));
                snd_ev
                    .try_send(Event::Action {
                        from: user.from(),
                        target: target.to_owned(),
                        msg: msg.to_owned(),
                    })
                    .unwrap();
            }
            Some(ctcp) => {
                let body = if msg.is_empty() {
                    ctcp.verb().to_owned()
                } else {
                    format!("{} {}", ctcp.verb(), msg)
                };

                if irc_eq(target, &self.me.nick()) {
                    match &ctcp {
                        CTCP::Version => {
                            let _ = snd_wr.try_send(WriteReq::Send(wire::notice_ctcp(
                                &nick,
                                &format!("VERSION maki {}", VERSION),
                            )));
                        }
                        CTCP::Ping => {
                            let _ = snd_wr
                                .try_send(WriteReq::Send(wire::notice_ctcp(&nick, &body)));
                        }
                        CTCP::Dcc => {
                            self.handle_dcc(user, msg, snd_ev);
                        }
                        _ => {}
                    }
                }

                self.log(&log_target, &format!("={}= {}", nick, body));
                snd_ev
                    .try_send(Event::Ctcp {
                        from: user.from(),
                        target: target.to_owned(),
                        msg: body,
                    })
                    .unwrap();
            }
            None => {
                self.log(&log_target, &format!("<{}> {}", nick, msg));
                snd_ev
                    .try_send(Event::Message {
                        from: user.from(),
                        target: target.to_owned(),
                        msg: msg.to_owned(),
                    })
                    .unwrap();
            }
        }
    }

    fn handle_dcc(&mut self, user: &User, msg: &str, snd_ev: &mut Sender<Event>) {
        if let Some(rest) = msg.strip_prefix("SEND ") {
            if let Some(offer) = dcc::parse_send(rest) {
                snd_ev
                    .try_send(Event::DccSendOffer {
                        from: user.from(),
                        offer,
                    })
                    .unwrap();
            }
        } else if let Some(rest) = msg.strip_prefix("RESUME ") {
            if let Some(request) = dcc::parse_resume(rest) {
                snd_ev
                    .try_send(Event::DccResume {
                        from: user.from(),
                        request,
                    })
                    .unwrap();
            }
        } else if let Some(rest) = msg.strip_prefix("ACCEPT ") {
            if let Some(request) = dcc::parse_resume(rest) {
                snd_ev
                    .try_send(Event::DccAccept {
                        from: user.from(),
                        request,
                    })
                    .unwrap();
            }
        }
    }

    fn handle_notice(
        &mut self,
        user: &User,
        target: &str,
        msg: &str,
        snd_ev: &mut Sender<Event>,
    ) {
        let nick = user.nick();
        let log_target = if self.is_channel(target) {
            target.to_owned()
        } else {
            nick.clone()
        };
        self.log(&log_target, &format!("-{}- {}", nick, msg));
        snd_ev
            .try_send(Event::Notice {
                from: user.from(),
                target: target.to_owned(),
                msg: msg.to_owned(),
            })
            .unwrap();
    }

    fn handle_join(&mut self, user: &User, chan: ChanName, snd_ev: &mut Sender<Event>) {
        let nick = user.nick();
        let own = irc_eq(&nick, &self.me.nick());
        let chan_key = chan.normalized();

        if own {
            match self.channels.get_mut(&chan_key) {
                Some(existing) => {
                    existing.joined = true;
                }
                None => {
                    let mut new_chan = Channel::new(chan.clone());
                    new_chan.joined = true;
                    self.channels.insert(chan_key.clone(), new_chan);
                    if !self.config.exists(chan.display(), "autojoin") {
                        self.config.set_bool(chan.display(), "autojoin", false);
                    }
                }
            }
            self.log(chan.display(), "» You join.");
        } else {
            self.log(chan.display(), &format!("» {} joins.", nick));
        }

        self.channel_add_user(&chan_key, &nick);

        snd_ev
            .try_send(Event::Join {
                from: user.from(),
                chan: chan.display().to_owned(),
            })
            .unwrap();
    }

    /// The common tail of self-PART and self-KICK: unset `joined` and drop
    /// the channel unless configuration pins it. Config lookups use the
    /// stored channel name; the message may spell it differently.
    fn leave_channel(&mut self, chan_key: &str) {
        let chan_name = match self.channels.get_mut(chan_key) {
            Some(chan) => {
                chan.joined = false;
                chan.name.display().to_owned()
            }
            None => return,
        };
        let autojoin = self.config.get_bool(&chan_name, "autojoin");
        let key = self.config.get_str(&chan_name, "key");
        if !autojoin && key.is_none() {
            self.drop_channel(chan_key);
        }
    }

    fn handle_part(
        &mut self,
        user: &User,
        chan: ChanName,
        msg: Option<String>,
        snd_ev: &mut Sender<Event>,
    ) {
        let nick = user.nick();
        let own = irc_eq(&nick, &self.me.nick());
        let chan_key = chan.normalized();

        self.channel_remove_user(&chan_key, &nick);

        if own {
            self.leave_channel(&chan_key);
            match &msg {
                Some(msg) => self.log(chan.display(), &format!("« You part ({}).", msg)),
                None => self.log(chan.display(), "« You part."),
            }
        } else {
            match &msg {
                Some(msg) => {
                    self.log(chan.display(), &format!("« {} parts ({}).", nick, msg))
                }
                None => self.log(chan.display(), &format!("« {} parts.", nick)),
            }
        }

        snd_ev
            .try_send(Event::Part {
                from: user.from(),
                chan: chan.display().to_owned(),
                msg: msg.unwrap_or_default(),
            })
            .unwrap();
    }

    fn handle_kick(
        &mut self,
        user: &User,
        chan: ChanName,
        who: String,
        msg: Option<String>,
        snd_ev: &mut Sender<Event>,
    ) {
        let nick = user.nick();
        let own = irc_eq(&who, &self.me.nick());
        let chan_key = chan.normalized();

        self.channel_remove_user(&chan_key, &who);

        if own {
            self.leave_channel(&chan_key);
            match &msg {
                Some(msg) => {
                    self.log(chan.display(), &format!("« {} kicks you ({}).", nick, msg))
                }
                None => self.log(chan.display(), &format!("« {} kicks you.", nick)),
            }
        } else {
            match &msg {
                Some(msg) => self.log(
                    chan.display(),
                    &format!("« {} kicks {} ({}).", nick, who, msg),
                ),
                None => self.log(chan.display(), &format!("« {} kicks {}.", nick, who)),
            }
        }

        snd_ev
            .try_send(Event::Kick {
                from: user.from(),
                chan: chan.display().to_owned(),
                who,
                msg: msg.unwrap_or_default(),
            })
            .unwrap();
    }

    fn handle_quit(&mut self, user: &User, msg: Option<String>, snd_ev: &mut Sender<Event>) {
        let nick = user.nick();

        let affected: Vec<(String, String)> = self
            .channels
            .iter()
            .filter(|(_, chan)| chan.joined && chan.has_user(&nick))
            .map(|(key, chan)| (key.clone(), chan.name.display().to_owned()))
            .collect();

        for (chan_key, chan_name) in affected {
            match &msg {
                Some(msg) => self.log(&chan_name, &format!("« {} quits ({}).", nick, msg)),
                None => self.log(&chan_name, &format!("« {} quits.", nick)),
            }
            self.channel_remove_user(&chan_key, &nick);
        }

        snd_ev
            .try_send(Event::Quit {
                from: user.from(),
                msg: msg.unwrap_or_default(),
            })
            .unwrap();
    }

    fn handle_nick(
        &mut self,
        user: &User,
        new_nick: &str,
        snd_ev: &mut Sender<Event>,
        snd_wr: &Sender<WriteReq>,
    ) {
        let old_nick = user.nick();
        let from = user.from();
        let own = irc_eq(&old_nick, &self.me.nick());

        let renamed: Vec<String> = self
            .channels
            .values_mut()
            .filter(|chan| chan.joined)
            .filter_map(|chan| {
                if chan.rename_user(&old_nick, new_nick) {
                    Some(chan.name.display().to_owned())
                } else {
                    None
                }
            })
            .collect();
        for chan_name in renamed {
            if own {
                self.log(&chan_name, &format!("• You are now known as {}.", new_nick));
            } else {
                self.log(
                    &chan_name,
                    &format!("• {} is now known as {}.", old_nick, new_nick),
                );
            }
        }

        snd_ev
            .try_send(Event::Nick {
                old: from,
                new: new_nick.to_owned(),
            })
            .unwrap();

        self.rename_user(&old_nick, new_nick);

        if own {
            if let Some(initial_nick) = self.config.get_str("server", "nick") {
                if irc_eq(new_nick, &initial_nick) {
                    self.nickserv(snd_wr);
                }
            }
        }
    }

    fn handle_mode(
        &mut self,
        from: Option<&User>,
        target: &str,
        modes: &str,
        args: &[String],
        snd_ev: &mut Sender<Event>,
    ) {
        let own = match from {
            Some(user) => irc_eq(&user.nick(), &self.me.nick()),
            None => false,
        };

        let mut sign = '+';
        let mut arg_idx = 0;
        for mode_char in modes.chars() {
            if mode_char == '+' || mode_char == '-' {
                sign = mode_char;
                continue;
            }

            let param: Option<&str> =
                if self.support.mode_has_parameter(sign, mode_char) && arg_idx < args.len() {
                    let param = args[arg_idx].as_str();
                    arg_idx += 1;
                    Some(param)
                } else {
                    None
                };

            // Prefix modes toggle roster bits
            if let (Some(pos), Some(who)) = (self.support.mode_position(mode_char), param) {
                let chan_key = irc_fold(target);
                if let Some(chan) = self.channels.get_mut(&chan_key) {
                    if chan.get_user(who).is_some() {
                        chan.set_prefix(who, pos, sign == '+');
                    }
                }
            }

            let mode_str = format!("{}{}", sign, mode_char);
            let suffix = match param {
                Some(param) => format!("{} {}", mode_str, param),
                None => mode_str.clone(),
            };
            match from {
                None => self.log(target, &format!("• Mode: {}", suffix)),
                Some(user) => {
                    if own {
                        self.log(target, &format!("• You set mode: {}", suffix));
                    } else {
                        self.log(
                            target,
                            &format!("• {} sets mode: {}", user.nick(), suffix),
                        );
                    }
                }
            }

            snd_ev
                .try_send(Event::Mode {
                    from: from.map(|user| user.from()).unwrap_or_default(),
                    target: target.to_owned(),
                    mode: mode_str,
                    parameter: param.unwrap_or("").to_owned(),
                })
                .unwrap();
        }
    }

    fn handle_topic(
        &mut self,
        from: Option<&User>,
        chan: String,
        topic: String,
        snd_ev: &mut Sender<Event>,
    ) {
        let chan_key = irc_fold(&chan);
        if let Some(channel) = self.channels.get_mut(&chan_key) {
            channel.topic = Some(topic.clone());
        }

        match from {
            None => self.log(&chan, &format!("• Topic: {}", topic)),
            Some(user) => {
                if irc_eq(&user.nick(), &self.me.nick()) {
                    self.log(&chan, &format!("• You change the topic: {}", topic));
                } else {
                    self.log(
                        &chan,
                        &format!("• {} changes the topic: {}", user.nick(), topic),
                    );
                }
            }
        }

        snd_ev
            .try_send(Event::Topic {
                from: from.map(|user| user.from()).unwrap_or_default(),
                chan,
                topic,
            })
            .unwrap();
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Fixture {
        state: State,
        snd_ev: Sender<Event>,
        rcv_ev: mpsc::Receiver<Event>,
        snd_wr: Sender<WriteReq>,
        rcv_wr: mpsc::Receiver<WriteReq>,
        config: Config,
        config_path: std::path::PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.config_path);
        }
    }

    impl Fixture {
        fn new(test: &str, nick: &str) -> Fixture {
            let dir = std::env::temp_dir().join("maki_state_tests");
            let _ = std::fs::create_dir_all(&dir);
            let config_path = dir.join(test);
            let _ = std::fs::remove_file(&config_path);

            let config = Config::load(config_path.clone()).unwrap();
            config.set_str("server", "nick", nick);

            let state = State::new("srv", config.clone(), Logger::disabled());
            let (snd_ev, rcv_ev) = mpsc::channel(100);
            let (snd_wr, rcv_wr) = mpsc::channel(100);

            Fixture {
                state,
                snd_ev,
                rcv_ev,
                snd_wr,
                rcv_wr,
                config,
                config_path,
            }
        }

        /// Feed one raw line through the dispatcher, without the deferred
        /// join machinery (no runtime in tests).
        fn feed(&mut self, line: &str) {
            let msg = wire::parse_one_message(line).unwrap();
            self.state
                .inner
                .borrow_mut()
                .update(msg, &mut self.snd_ev, &self.snd_wr);
        }

        fn cmd(&mut self, cmd: Cmd) {
            self.state
                .inner
                .borrow_mut()
                .handle_cmd(cmd, &mut self.snd_ev, &self.snd_wr);
        }

        fn events(&mut self) -> Vec<Event> {
            let mut events = vec![];
            while let Ok(ev) = self.rcv_ev.try_recv() {
                events.push(ev);
            }
            events
        }

        fn outbound(&mut self) -> Vec<String> {
            let mut lines = vec![];
            while let Ok(req) = self.rcv_wr.try_recv() {
                match req {
                    WriteReq::Send(line)
                    | WriteReq::Queue(line)
                    | WriteReq::SendOrQueue(line) => lines.push(line),
                }
            }
            lines
        }

        fn user_refs(&self, nick: &str) -> Option<usize> {
            self.state
                .state_inner(|inner| inner.users.get(&irc_fold(nick)).map(|e| e.refs))
        }
    }

    impl State {
        fn state_inner<R>(&self, f: impl FnOnce(&StateInner) -> R) -> R {
            f(&self.inner.borrow())
        }
    }

    #[test]
    fn self_join_creates_channel() {
        let mut fix = Fixture::new("self_join", "alice");
        fix.feed(":alice!a@h JOIN #test");

        let inner = fix.state.inner.borrow();
        let chan = inner.channels.get("#test").unwrap();
        assert!(chan.joined);
        assert!(chan.has_user("alice"));
        drop(inner);

        let events = fix.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Join { from, chan } => {
                assert_eq!(from, "alice!a@h");
                assert_eq!(chan, "#test");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn names_accumulate_and_emit_once() {
        let mut fix = Fixture::new("names", "me");
        fix.feed(":me!a@h JOIN #c");
        fix.events();

        fix.feed(":srv.net 353 me @ #c :@alice +bob carol");
        assert!(fix.events().is_empty());
        fix.feed(":srv.net 366 me #c :End of /NAMES list");

        let events = fix.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Names {
                chan,
                nicks,
                prefixes,
            } => {
                assert_eq!(chan, "#c");
                assert_eq!(nicks, &["alice", "bob", "carol"]);
                assert_eq!(prefixes, &["@", "+", ""]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Prefix masks: alice is op (bit 0), bob has voice (bit 1)
        let inner = fix.state.inner.borrow();
        let chan = inner.channels.get("#c").unwrap();
        assert!(chan.get_prefix("alice", 0));
        assert!(!chan.get_prefix("alice", 1));
        assert!(chan.get_prefix("bob", 1));
        assert!(!chan.get_prefix("carol", 0));
        assert!(!chan.get_prefix("carol", 1));
    }

    #[test]
    fn channel_users_are_in_registry() {
        // Property: every channel roster member is in the server registry
        let mut fix = Fixture::new("registry", "me");
        fix.feed(":me!a@h JOIN #a");
        fix.feed(":me!a@h JOIN #b");
        fix.feed(":srv.net 353 me @ #a :@alice bob");
        fix.feed(":srv.net 353 me @ #b :alice carol");
        fix.feed(":bob!b@h QUIT :bye");
        fix.feed(":carol!c@h PART #b");
        fix.feed(":alice!a@h NICK :eve");

        let inner = fix.state.inner.borrow();
        for chan in inner.channels.values() {
            for user in chan.users.values() {
                assert!(
                    inner.users.contains_key(&irc_fold(&user.nick())),
                    "{} missing from registry",
                    user.nick()
                );
            }
        }
        // bob and carol are gone entirely
        assert!(!inner.users.contains_key("bob"));
        assert!(!inner.users.contains_key("carol"));
        // alice was renamed; the registry is keyed by the new nick
        assert!(!inner.users.contains_key("alice"));
        assert!(inner.users.contains_key("eve"));
    }

    #[test]
    fn nick_rename_preserves_prefix_mask() {
        let mut fix = Fixture::new("rename_prefix", "me");
        fix.feed(":me!a@h JOIN #c");
        fix.feed(":srv.net 353 me @ #c :@alice");
        fix.feed(":alice!a@h NICK :bob");

        let inner = fix.state.inner.borrow();
        let chan = inner.channels.get("#c").unwrap();
        assert!(!chan.has_user("alice"));
        assert!(chan.has_user("bob"));
        assert!(chan.get_prefix("bob", 0));
    }

    #[test]
    fn rename_to_existing_nick_fails_silently() {
        let mut fix = Fixture::new("rename_clash", "me");
        fix.feed(":me!a@h JOIN #c");
        fix.feed(":srv.net 353 me @ #c :alice bob");

        let mut inner = fix.state.inner.borrow_mut();
        let chan = inner.channels.get_mut("#c").unwrap();
        assert!(!chan.rename_user("alice", "bob"));
        assert!(chan.has_user("alice"));
        assert!(chan.has_user("bob"));
    }

    #[test]
    fn self_part_drops_unpinned_channel() {
        let mut fix = Fixture::new("self_part_plain", "me");
        fix.feed(":me!a@h JOIN #c");
        fix.feed(":me!a@h PART #c");

        assert!(fix.state.inner.borrow().channels.get("#c").is_none());
    }

    #[test]
    fn self_part_keeps_pinned_channel() {
        let mut fix = Fixture::new("self_part_pinned", "me");
        fix.config.set_bool("#c", "autojoin", true);
        fix.feed(":me!a@h JOIN #c");
        fix.feed(":me!a@h PART #c");

        let inner = fix.state.inner.borrow();
        let chan = inner.channels.get("#c").unwrap();
        assert!(!chan.joined);
        assert_eq!(chan.user_count(), 0);
    }

    #[test]
    fn self_part_matches_config_case_insensitively() {
        let mut fix = Fixture::new("self_part_case", "me");
        fix.config.set_bool("#Pin", "autojoin", true);
        fix.state = State::new("srv", fix.config.clone(), Logger::disabled());

        // The server spells the channel differently than the config group
        fix.feed(":me!a@h JOIN #pin");
        fix.feed(":me!a@h PART #PIN");

        let inner = fix.state.inner.borrow();
        let chan = inner.channels.get("#pin").expect("pinned channel kept");
        assert!(!chan.joined);
    }

    #[test]
    fn kick_of_self_behaves_like_part() {
        let mut fix = Fixture::new("self_kick", "me");
        fix.config.set_str("#c", "key", "sekrit");
        fix.state = State::new("srv", fix.config.clone(), Logger::disabled());
        fix.feed(":me!a@h JOIN #c");
        fix.feed(":op!o@h KICK #c me :behave");

        // key is set, so the channel is kept but no longer joined
        let inner = fix.state.inner.borrow();
        let chan = inner.channels.get("#c").unwrap();
        assert!(!chan.joined);
        drop(inner);

        let events = fix.events();
        match events.last().unwrap() {
            Event::Kick {
                from,
                chan,
                who,
                msg,
            } => {
                assert_eq!(from, "op!o@h");
                assert_eq!(chan, "#c");
                assert_eq!(who, "me");
                assert_eq!(msg, "behave");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn quit_removes_user_everywhere() {
        let mut fix = Fixture::new("quit", "me");
        fix.feed(":me!a@h JOIN #a");
        fix.feed(":me!a@h JOIN #b");
        fix.feed(":srv.net 353 me @ #a :alice");
        fix.feed(":srv.net 353 me @ #b :alice");
        fix.events();

        fix.feed(":alice!a@h QUIT :gone");
        let events = fix.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Quit { from, msg } => {
                assert_eq!(from, "alice!a@h");
                assert_eq!(msg, "gone");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let inner = fix.state.inner.borrow();
        assert!(!inner.channels.get("#a").unwrap().has_user("alice"));
        assert!(!inner.channels.get("#b").unwrap().has_user("alice"));
        assert!(!inner.users.contains_key("alice"));
    }

    #[test]
    fn ctcp_action_in_query() {
        let mut fix = Fixture::new("ctcp_action", "alice");
        fix.feed(":bob!u@h PRIVMSG alice :\x01ACTION waves\x01");

        let events = fix.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Action { from, target, msg } => {
                assert_eq!(from, "bob!u@h");
                assert_eq!(target, "alice");
                assert_eq!(msg, "waves");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(fix.outbound().is_empty());
    }

    #[test]
    fn ctcp_version_is_answered() {
        let mut fix = Fixture::new("ctcp_version", "alice");
        fix.feed(":bob!u@h PRIVMSG alice :\x01VERSION\x01");

        let outbound = fix.outbound();
        assert_eq!(
            outbound,
            vec![format!("NOTICE bob :\x01VERSION maki {}\x01", VERSION)]
        );

        let events = fix.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Ctcp { from, target, msg } => {
                assert_eq!(from, "bob!u@h");
                assert_eq!(target, "alice");
                assert_eq!(msg, "VERSION");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn ctcp_version_for_channel_is_not_answered() {
        let mut fix = Fixture::new("ctcp_version_chan", "alice");
        fix.feed(":bob!u@h PRIVMSG #c :\x01VERSION\x01");
        assert!(fix.outbound().is_empty());
    }

    #[test]
    fn nick_in_use_before_login_appends_underscore() {
        let mut fix = Fixture::new("nick_in_use", "newbie");
        fix.feed(":srv.net 433 * newbie :Nickname is already in use");

        assert_eq!(fix.state.get_nick(), "newbie_");
        assert_eq!(fix.outbound(), vec!["NICK newbie_".to_owned()]);

        let events = fix.events();
        match &events[0] {
            Event::Nick { old, new } => {
                assert_eq!(old, "newbie");
                assert_eq!(new, "newbie_");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn nick_in_use_after_login_is_informational() {
        let mut fix = Fixture::new("nick_in_use_late", "me");
        fix.state.inner.borrow_mut().logged_in = true;
        fix.feed(":srv.net 433 me wanted :Nickname is already in use");

        assert_eq!(fix.state.get_nick(), "me");
        assert!(fix.outbound().is_empty());
        match &fix.events()[0] {
            Event::Error { domain, reason, .. } => {
                assert_eq!(domain, "nick");
                assert_eq!(reason, "in_use");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn privmsg_multiline_split() {
        let mut fix = Fixture::new("privmsg_multiline", "alice");
        fix.cmd(Cmd::Privmsg {
            target: "#c".to_owned(),
            msg: "A\nB\n".to_owned(),
        });

        let mut lines = vec![];
        let mut kinds = vec![];
        while let Ok(req) = fix.rcv_wr.try_recv() {
            match req {
                WriteReq::Send(line) => {
                    kinds.push("send");
                    lines.push(line);
                }
                WriteReq::Queue(line) => {
                    kinds.push("queue");
                    lines.push(line);
                }
                WriteReq::SendOrQueue(line) => {
                    kinds.push("send_or_queue");
                    lines.push(line);
                }
            }
        }
        assert_eq!(
            lines,
            vec!["PRIVMSG #c :A".to_owned(), "PRIVMSG #c :B".to_owned()]
        );
        // The second line goes through the throttling queue
        assert_eq!(kinds, vec!["send_or_queue", "queue"]);

        let events = fix.events();
        assert_eq!(events.len(), 2);
        for (event, expected) in events.iter().zip(["A", "B"]) {
            match event {
                Event::Message { from, target, msg } => {
                    assert_eq!(from, "alice");
                    assert_eq!(target, "#c");
                    assert_eq!(msg, expected);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn privmsg_length_split_switches_to_queue() {
        let mut fix = Fixture::new("privmsg_long", "alice");
        let budget = utils::privmsg_budget("alice", "#c");
        let long_msg = "x".repeat(budget * 2 + 10);
        fix.cmd(Cmd::Privmsg {
            target: "#c".to_owned(),
            msg: long_msg.clone(),
        });

        let mut pieces = vec![];
        let mut queued = vec![];
        while let Ok(req) = fix.rcv_wr.try_recv() {
            match req {
                WriteReq::Queue(line) => {
                    queued.push(true);
                    pieces.push(line);
                }
                WriteReq::Send(line) | WriteReq::SendOrQueue(line) => {
                    queued.push(false);
                    pieces.push(line);
                }
            }
        }
        assert_eq!(pieces.len(), 3);
        // Everything after the first split is throttled
        assert_eq!(queued, vec![false, true, true]);

        // Each piece fits the wire limit and the concatenation is intact
        let mut body = String::new();
        for piece in &pieces {
            let payload = piece
                .strip_prefix("PRIVMSG #c :")
                .expect("piece is a PRIVMSG");
            assert!(payload.len() <= budget);
            body.push_str(payload);
        }
        assert_eq!(body, long_msg);
    }

    #[test]
    fn mode_walk_updates_prefixes() {
        let mut fix = Fixture::new("mode_walk", "me");
        fix.feed(":srv.net 005 me CHANMODES=b,k,l,imnpst PREFIX=(ov)@+ :are supported");
        fix.feed(":me!a@h JOIN #c");
        fix.feed(":srv.net 353 me @ #c :alice bob");
        fix.events();

        fix.feed(":op!o@h MODE #c +ol alice 20");

        let events = fix.events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            Event::Mode {
                mode, parameter, ..
            } => {
                assert_eq!(mode, "+o");
                assert_eq!(parameter, "alice");
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[1] {
            Event::Mode {
                mode, parameter, ..
            } => {
                assert_eq!(mode, "+l");
                assert_eq!(parameter, "20");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let inner = fix.state.inner.borrow();
        assert!(inner.channels.get("#c").unwrap().get_prefix("alice", 0));
    }

    #[test]
    fn mode_minus_l_consumes_no_parameter() {
        let mut fix = Fixture::new("mode_minus_l", "me");
        fix.feed(":srv.net 005 me CHANMODES=b,k,l,imnpst :are supported");
        fix.feed(":op!o@h MODE #c -l+k pw");

        let events = fix.events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            Event::Mode {
                mode, parameter, ..
            } => {
                assert_eq!(mode, "-l");
                assert_eq!(parameter, "");
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[1] {
            Event::Mode {
                mode, parameter, ..
            } => {
                assert_eq!(mode, "+k");
                assert_eq!(parameter, "pw");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn isupport_is_applied() {
        let mut fix = Fixture::new("isupport", "me");
        fix.feed(":srv.net 005 me CHANTYPES=#& PREFIX=(ohv)@%+ :are supported");

        let inner = fix.state.inner.borrow();
        assert_eq!(inner.support.prefix_modes(), "ohv");
        assert_eq!(inner.support.prefix_prefixes(), "@%+");
        assert_eq!(inner.support.chantypes(), "#&");
    }

    #[test]
    fn who_reply_updates_away() {
        let mut fix = Fixture::new("who_away", "me");
        fix.feed(":me!a@h JOIN #c");
        fix.feed(":srv.net 353 me @ #c :alice");
        fix.events();

        fix.feed(":srv.net 352 me #c a host srv alice G :0 Alice");
        let events = fix.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::UserAway { away, .. } => assert!(away),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(fix.state.is_user_away("alice"));

        // Unchanged state emits nothing
        fix.feed(":srv.net 352 me #c a host srv alice G :0 Alice");
        assert!(fix.events().is_empty());

        fix.feed(":srv.net 352 me #c a host srv alice H :0 Alice");
        assert_eq!(fix.events().len(), 1);
        assert!(!fix.state.is_user_away("alice"));
    }

    #[test]
    fn end_of_motd_triggers_login_actions() {
        let mut fix = Fixture::new("motd_end", "me");
        fix.config.set_str("server", "nickserv", "hunter2");
        fix.config
            .set_list("server", "commands", vec!["MODE me +i".to_owned()]);
        fix.feed(":srv.net 376 me :End of /MOTD command.");

        let inner = fix.state.inner.borrow();
        assert!(inner.logged_in);
        assert!(inner.join_scheduled);
        drop(inner);

        let outbound = fix.outbound();
        assert_eq!(
            outbound,
            vec![
                "PRIVMSG NickServ :IDENTIFY hunter2".to_owned(),
                "MODE me +i".to_owned(),
            ]
        );
        match fix.events().last().unwrap() {
            Event::Motd { msg } => assert_eq!(msg, ""),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn nickserv_ghost_when_nick_differs() {
        let mut fix = Fixture::new("nickserv_ghost", "wanted");
        fix.config.set_str("server", "nickserv", "hunter2");
        fix.config.set_bool("server", "nickserv_ghost", true);

        // The server only accepted a fallback nick
        fix.feed(":srv.net 433 * wanted :Nickname is already in use");
        fix.outbound();
        fix.events();

        fix.feed(":srv.net 422 wanted_ :MOTD File is missing");
        let outbound = fix.outbound();
        assert_eq!(
            outbound,
            vec![
                "PRIVMSG NickServ :GHOST wanted hunter2".to_owned(),
                "NICK wanted".to_owned(),
                "PRIVMSG NickServ :IDENTIFY hunter2".to_owned(),
            ]
        );
    }

    #[test]
    fn prefixless_lines_carry_no_state() {
        // PING is answered by the transport; if a prefix-less line makes
        // it here anyway, it must not turn into a bus event
        let mut fix = Fixture::new("prefixless", "me");
        fix.feed("PING :x");
        assert!(fix.events().is_empty());
    }

    #[test]
    fn ignored_senders_are_dropped() {
        let mut fix = Fixture::new("ignores", "me");
        fix.config
            .set_list("server", "ignores", vec!["*!*@spam.example".to_owned()]);

        fix.feed(":troll!x@spam.example PRIVMSG me :buy stuff");
        assert!(fix.events().is_empty());

        fix.feed(":friend!y@good.example PRIVMSG me :hi");
        assert_eq!(fix.events().len(), 1);
    }

    #[test]
    fn sender_upsert_is_balanced() {
        let mut fix = Fixture::new("balance", "me");
        fix.feed(":passerby!p@h PRIVMSG #c :hello");
        // Not in any roster, so the transient reference is gone
        assert_eq!(fix.user_refs("passerby"), None);

        fix.feed(":me!a@h JOIN #c");
        fix.feed(":srv.net 353 me @ #c :passerby");
        assert_eq!(fix.user_refs("passerby"), Some(1));
        fix.feed(":passerby!p@h PRIVMSG #c :hello again");
        assert_eq!(fix.user_refs("passerby"), Some(1));
    }

    #[test]
    fn whois_replies_and_end() {
        let mut fix = Fixture::new("whois", "me");
        fix.feed(":srv.net 311 me alice a host * :Alice A.");
        fix.feed(":srv.net 318 me alice :End of /WHOIS list");

        let events = fix.events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            Event::Whois { nick, msg } => {
                assert_eq!(nick, "alice");
                assert!(!msg.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[1] {
            Event::Whois { nick, msg } => {
                assert_eq!(nick, "alice");
                assert_eq!(msg, "");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn list_end_sentinel() {
        let mut fix = Fixture::new("list", "me");
        fix.feed(":srv.net 322 me #c 42 :A channel");
        fix.feed(":srv.net 323 me :End of /LIST");

        let events = fix.events();
        match &events[0] {
            Event::List { chan, users, topic } => {
                assert_eq!(chan, "#c");
                assert_eq!(*users, 42);
                assert_eq!(topic, "A channel");
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[1] {
            Event::List { chan, users, .. } => {
                assert_eq!(chan, "");
                assert_eq!(*users, -1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn cannot_join_reasons() {
        let mut fix = Fixture::new("cannot_join", "me");
        fix.feed(":srv.net 473 me #c :Cannot join channel (+i)");

        let events = fix.events();
        match &events[0] {
            Event::Error {
                domain,
                reason,
                arguments,
            } => {
                assert_eq!(domain, "cannot_join");
                assert_eq!(reason, "invite");
                assert_eq!(arguments, &["#c"]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[1] {
            Event::CannotJoin { chan, reason } => {
                assert_eq!(chan, "#c");
                assert_eq!(reason, "i");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn no_such_nick() {
        let mut fix = Fixture::new("no_such", "me");
        fix.feed(":srv.net 401 me ghost :No such nick/channel");

        let events = fix.events();
        match &events[1] {
            Event::NoSuch { target, kind } => {
                assert_eq!(target, "ghost");
                assert_eq!(kind, "n");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn topic_numeric_has_empty_sender() {
        let mut fix = Fixture::new("topic", "me");
        fix.feed(":me!a@h JOIN #c");
        fix.events();
        fix.feed(":srv.net 332 me #c :Welcome!");

        match fix.events().last().unwrap() {
            Event::Topic { from, chan, topic } => {
                assert_eq!(from, "");
                assert_eq!(chan, "#c");
                assert_eq!(topic, "Welcome!");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            fix.state.get_channel_topic("#c"),
            Some("Welcome!".to_owned())
        );
    }

    #[test]
    fn dcc_send_offer_is_forwarded() {
        let mut fix = Fixture::new("dcc_send", "me");
        fix.feed(":bob!u@h PRIVMSG me :\x01DCC SEND file.txt 16909060 5000 1234\x01");

        let events = fix.events();
        match &events[0] {
            Event::DccSendOffer { from, offer } => {
                assert_eq!(from, "bob!u@h");
                assert_eq!(offer.file_name, "file.txt");
                assert_eq!(offer.port, 5000);
                assert_eq!(offer.file_size, 1234);
            }
            other => panic!("unexpected event {:?}", other),
        }
        // The generic ctcp event follows
        assert!(matches!(&events[1], Event::Ctcp { .. }));
    }

    #[test]
    fn channel_getters() {
        let mut fix = Fixture::new("getters", "me");
        fix.feed(":me!a@h JOIN #c");
        fix.feed(":srv.net 353 me @ #c :@alice +bob carol");

        assert_eq!(fix.state.get_channels(), vec!["#c".to_owned()]);
        let (nicks, prefixes) = fix.state.get_channel_nicks("#c");
        assert_eq!(nicks, vec!["alice", "bob", "carol", "me"]);
        assert_eq!(prefixes, vec!["@", "+", "", ""]);
    }

    #[test]
    fn explicit_disconnect_clears_joined_flags() {
        let mut fix = Fixture::new("disconnect", "me");
        fix.feed(":me!a@h JOIN #c");
        fix.events();

        fix.state
            .inner
            .borrow_mut()
            .disconnect("bye", &mut fix.snd_ev, &fix.snd_wr);

        assert_eq!(fix.outbound(), vec!["QUIT :bye".to_owned()]);
        match &fix.events()[0] {
            Event::Quit { msg, .. } => assert_eq!(msg, "bye"),
            other => panic!("unexpected event {:?}", other),
        }
        let inner = fix.state.inner.borrow();
        let chan = inner.channels.get("#c").unwrap();
        assert!(!chan.joined);
        assert_eq!(inner.status, ServerStatus::Disconnected);
    }

    #[test]
    fn join_lines_cover_autojoin_and_joined() {
        let mut fix = Fixture::new("join_lines", "me");
        fix.config.set_bool("#conf", "autojoin", true);
        fix.config.set_str("#conf", "key", "sekrit");
        fix.state = State::new("srv", fix.config.clone(), Logger::disabled());

        fix.feed(":me!a@h JOIN #live");
        fix.state.connection_lost();

        let mut lines = fix.state.inner.borrow().join_lines();
        lines.sort();
        assert_eq!(
            lines,
            vec!["JOIN #conf sekrit".to_owned(), "JOIN #live".to_owned()]
        );
    }
}
