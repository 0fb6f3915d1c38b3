//! The root object: owns all servers by name, the global configuration,
//! the DCC transfer bookkeeping and the event bus that fans signals out
//! to subscribed front-ends.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;

use libmaki_client::{Client, Event, ServerSetup};
use libmaki_config::{fill_instance_defaults, fill_server_defaults, Config};
use libmaki_logger::Logger;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

const LOCK_FILE: &str = "maki.lock";
const CONFIG_FILE: &str = "maki.conf";

/// A bus message for front-ends. Every signal leads with the epoch
/// timestamp of the moment it was emitted.
#[derive(Debug, Clone)]
pub enum Signal {
    /// Something happened on one server.
    Server {
        time: i64,
        server: String,
        event: Event,
    },
    /// A file transfer was registered.
    DccSend {
        time: i64,
        id: u64,
        server: String,
        from: String,
        file_name: String,
        size: u64,
    },
    /// The daemon is going down.
    Shutdown { time: i64 },
}

struct ServerHandle {
    client: Client,
    config: Config,
    logger: Logger,
}

/// A registered inbound file transfer. The transfer data path is handled
/// elsewhere; the instance only tracks identity.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: u64,
    pub server: String,
    pub from: String,
    pub file_name: String,
    pub size: u64,
}

#[derive(Clone)]
pub struct Instance {
    inner: Rc<RefCell<InstanceInner>>,
}

struct InstanceInner {
    config_dir: PathBuf,
    servers_dir: PathBuf,
    logs_dir: PathBuf,

    config: Config,

    servers: HashMap<String, ServerHandle>,

    subscribers: Vec<mpsc::Sender<Signal>>,

    /// Transfer ids are monotonically increasing and never reused.
    next_dcc_id: u64,
    transfers: Vec<Transfer>,

    /// Servers that were up when the machine went to sleep, to be
    /// reconnected on resume.
    suspended: Vec<String>,
}

impl Instance {
    /// Set up the instance directories, the lock file and the global
    /// config. `config_dir`/`data_dir` default to the platform config and
    /// data directories plus `sushi`.
    pub fn new(
        config_dir: Option<PathBuf>,
        data_dir: Option<PathBuf>,
    ) -> io::Result<Instance> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => dirs::config_dir()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "can't determine the config directory")
                })?
                .join("sushi"),
        };
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => dirs::data_dir()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "can't determine the data directory")
                })?
                .join("sushi"),
        };

        let servers_dir = config_dir.join("servers");
        let logs_dir = data_dir.join("logs");
        let downloads_dir = data_dir.join("downloads");
        fs::create_dir_all(&servers_dir)?;
        fs::create_dir_all(&logs_dir)?;

        let lock_path = config_dir.join(LOCK_FILE);
        if lock_path.exists() {
            warn!("lock file {:?} exists; overwriting", lock_path);
        }
        fs::write(&lock_path, format!("{}\n", std::process::id()))?;

        let config = Config::load(config_dir.join(CONFIG_FILE))
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        fill_instance_defaults(&config, &logs_dir, &downloads_dir);

        Ok(Instance {
            inner: Rc::new(RefCell::new(InstanceInner {
                config_dir,
                servers_dir,
                logs_dir,
                config,
                servers: HashMap::new(),
                subscribers: Vec::new(),
                next_dcc_id: 0,
                transfers: Vec::new(),
                suspended: Vec::new(),
            })),
        })
    }

    pub fn config(&self) -> Config {
        self.inner.borrow().config.clone()
    }

    /// Attach a front-end to the event bus.
    pub fn subscribe(&self) -> mpsc::Receiver<Signal> {
        let (snd, rcv) = mpsc::channel(1000);
        self.inner.borrow_mut().subscribers.push(snd);
        rcv
    }

    fn emit(&self, signal: Signal) {
        self.inner
            .borrow_mut()
            .subscribers
            .retain(|snd| snd.try_send(signal.clone()).is_ok());
    }

    /// Create every server found in the servers directory; servers with
    /// `autoconnect` set connect right away.
    pub fn load_servers(&self) {
        let servers_dir = self.inner.borrow().servers_dir.clone();
        let entries = match fs::read_dir(&servers_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("can't read {:?}: {}", servers_dir, err);
                return;
            }
        };
        for entry in entries.flatten() {
            if !entry.path().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                self.add_server(name);
            }
        }
    }

    /// Create (or look up) a server by name. Loads its config, fills in
    /// defaults, spawns the connection task and the event pump.
    pub fn add_server(&self, name: &str) -> bool {
        if self.inner.borrow().servers.contains_key(name) {
            return false;
        }

        let (config_path, logs_dir, instance_config) = {
            let inner = self.inner.borrow();
            (
                inner.servers_dir.join(name),
                inner.logs_dir.clone(),
                inner.config.clone(),
            )
        };

        let config = match Config::load(config_path) {
            Ok(config) => config,
            Err(err) => {
                warn!("can't load config for {}: {}", name, err);
                return false;
            }
        };
        fill_server_defaults(&config);

        let logger = Logger::new(
            logs_dir,
            name,
            &instance_config
                .get_str("logging", "format")
                .unwrap_or_else(|| "$n".to_owned()),
            instance_config.get_bool("logging", "enabled"),
        );

        let setup = ServerSetup {
            name: name.to_owned(),
            config: config.clone(),
            logger: logger.clone(),
            reconnect_retries: instance_config.get_int("reconnect", "retries").max(0) as u32,
            reconnect_timeout: instance_config.get_int("reconnect", "timeout").max(1) as u64,
            ca_file: config.get_str("server", "ca_file").map(PathBuf::from),
        };

        let autoconnect = config.get_bool("server", "autoconnect");
        let (mut client, rcv_ev) = Client::new(setup);

        tokio::task::spawn_local(pump_events(self.clone(), name.to_owned(), rcv_ev));

        if autoconnect {
            client.connect();
        }

        self.inner.borrow_mut().servers.insert(
            name.to_owned(),
            ServerHandle {
                client,
                config,
                logger,
            },
        );

        true
    }

    pub fn client(&self, name: &str) -> Option<Client> {
        self.inner
            .borrow()
            .servers
            .get(name)
            .map(|handle| handle.client.clone())
    }

    pub fn server_config(&self, name: &str) -> Option<Config> {
        self.inner
            .borrow()
            .servers
            .get(name)
            .map(|handle| handle.config.clone())
    }

    pub fn server_logger(&self, name: &str) -> Option<Logger> {
        self.inner
            .borrow()
            .servers
            .get(name)
            .map(|handle| handle.logger.clone())
    }

    pub fn server_list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.borrow().servers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Shut the server down and delete its configuration.
    pub fn remove_server(&self, name: &str) -> bool {
        let handle = self.inner.borrow_mut().servers.remove(name);
        match handle {
            None => false,
            Some(mut handle) => {
                handle.client.quit(None);
                handle.config.delete_file();
                true
            }
        }
    }

    /// Re-key a server and move its config file. Refuses when the new
    /// name is taken. The running connection keeps its old identity until
    /// the next reconnect.
    pub fn rename_server(&self, old_name: &str, new_name: &str) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.servers.contains_key(new_name) {
            return false;
        }
        let handle = match inner.servers.remove(old_name) {
            Some(handle) => handle,
            None => return false,
        };
        let new_path = inner.servers_dir.join(new_name);
        handle.config.move_to(new_path);
        inner.servers.insert(new_name.to_owned(), handle);
        true
    }

    /// Disconnect everything, announce the shutdown and drop the lock
    /// file. The caller's message becomes the QUIT reason.
    pub fn shutdown(&self, message: &str) {
        let mut clients: Vec<Client> = {
            let inner = self.inner.borrow();
            inner
                .servers
                .values()
                .map(|handle| handle.client.clone())
                .collect()
        };
        for client in clients.iter_mut() {
            client.quit(Some(message.to_owned()));
        }

        self.emit(Signal::Shutdown { time: now_epoch() });

        let lock_path = self.inner.borrow().config_dir.join(LOCK_FILE);
        let _ = fs::remove_file(lock_path);
    }

    /// The operating system is about to sleep (reported by a platform
    /// plugin): disconnect every connected server with a descriptive QUIT
    /// and remember them for [`Instance::resume`].
    pub fn suspend(&self) {
        let mut up: Vec<(String, Client)> = {
            let inner = self.inner.borrow();
            inner
                .servers
                .iter()
                .filter(|(_, handle)| {
                    handle.client.status() != libmaki_client::ServerStatus::Disconnected
                })
                .map(|(name, handle)| (name.clone(), handle.client.clone()))
                .collect()
        };
        for (_, client) in up.iter_mut() {
            client.disconnect(Some("maki: the computer is going to sleep".to_owned()));
        }
        self.inner.borrow_mut().suspended = up.into_iter().map(|(name, _)| name).collect();
    }

    /// The operating system woke up again: reconnect everything that was
    /// up before the suspend.
    pub fn resume(&self) {
        let suspended = std::mem::take(&mut self.inner.borrow_mut().suspended);
        for name in suspended {
            if let Some(mut client) = self.client(&name) {
                client.connect();
            }
        }
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.inner.borrow().transfers.clone()
    }

    /// Route one server event to the bus, intercepting transfer
    /// bookkeeping.
    fn dispatch(&self, server: &str, event: Event) {
        match event {
            Event::DccSendOffer { from, offer } => {
                let id = {
                    let mut inner = self.inner.borrow_mut();
                    inner.next_dcc_id += 1;
                    let id = inner.next_dcc_id;
                    inner.transfers.push(Transfer {
                        id,
                        server: server.to_owned(),
                        from: from.clone(),
                        file_name: offer.file_name.clone(),
                        size: offer.file_size,
                    });
                    id
                };
                self.emit(Signal::DccSend {
                    time: now_epoch(),
                    id,
                    server: server.to_owned(),
                    from,
                    file_name: offer.file_name,
                    size: offer.file_size,
                });
            }
            Event::DccResume { from, request } | Event::DccAccept { from, request } => {
                // Forwarded to the transfer side, which is not part of the
                // core; the bookkeeping here has nothing to resume.
                debug!(
                    "dcc resume/accept from {} for {:?} ignored",
                    from, request.file_name
                );
            }
            event => {
                self.emit(Signal::Server {
                    time: now_epoch(),
                    server: server.to_owned(),
                    event,
                });
            }
        }
    }
}

/// Forwards one server's events to the instance bus.
async fn pump_events(instance: Instance, serv_name: String, rcv_ev: mpsc::Receiver<Event>) {
    let mut rcv_ev = ReceiverStream::new(rcv_ev);
    while let Some(event) = rcv_ev.next().await {
        instance.dispatch(&serv_name, event);
    }
}

pub fn now_epoch() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
