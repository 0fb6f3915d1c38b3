//! The typed command surface offered to front-end transports.
//!
//! A transport (session bus object, TCP peer) decodes its wire format into
//! [`Request`] values and encodes [`Reply`] values back; the encoding is
//! the transport's business. Commands referencing an unknown server,
//! channel or user are no-ops: front-ends query state instead of waiting
//! for acknowledgements.

use crate::instance::Instance;

/// A front-end command.
#[derive(Debug, Clone)]
pub enum Request {
    Connect { server: String },
    Quit { server: String, message: Option<String> },
    Raw { server: String, line: String },
    Join { server: String, channel: String, key: Option<String> },
    Part { server: String, channel: String, message: Option<String> },
    Kick { server: String, channel: String, who: String, message: Option<String> },
    Invite { server: String, channel: String, who: String },
    Message { server: String, target: String, text: String },
    Action { server: String, target: String, text: String },
    Notice { server: String, target: String, text: String },
    Ctcp { server: String, target: String, text: String },
    Mode { server: String, target: String, mode: String },
    Names { server: String, channel: String },
    Topic { server: String, channel: String, topic: Option<String> },
    List { server: String, channel: Option<String> },
    Nick { server: String, nick: String },
    Away { server: String, message: String },
    Back { server: String },
    Whois { server: String, mask: String },
    Ignore { server: String, pattern: String },
    Unignore { server: String, pattern: String },
    ServerGet { server: String, group: String, key: String },
    ServerSet { server: String, group: String, key: String, value: String },
    ServerRemove { server: String },
    ServerRename { server: String, new_name: String },
    ServerList,
    ConfigGet { group: String, key: String },
    ConfigSet { group: String, key: String, value: String },
    Log { server: String, target: String, lines: u64 },
    Channels { server: String },
    ChannelNicks { server: String, channel: String },
    ChannelTopic { server: String, channel: String },
    UserAway { server: String, nick: String },
    OwnNick { server: String },
    Version,
    Shutdown { message: Option<String> },
}

/// Result of a query; commands without results reply [`Reply::None`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    None,
    Bool(bool),
    Str(String),
    Lines(Vec<String>),
    NickList {
        nicks: Vec<String>,
        prefixes: Vec<String>,
    },
    Version(Vec<u64>),
}

pub fn handle(instance: &Instance, request: Request) -> Reply {
    match request {
        Request::Connect { server } => {
            if let Some(mut client) = instance.client(&server) {
                client.connect();
            }
            Reply::None
        }
        Request::Quit { server, message } => {
            if let Some(mut client) = instance.client(&server) {
                client.disconnect(message);
            }
            Reply::None
        }
        Request::Raw { server, line } => {
            if let Some(mut client) = instance.client(&server) {
                client.raw_msg(&line);
            }
            Reply::None
        }
        Request::Join {
            server,
            channel,
            key,
        } => {
            if let Some(mut client) = instance.client(&server) {
                client.join(&channel, key.as_deref());
            }
            Reply::None
        }
        Request::Part {
            server,
            channel,
            message,
        } => {
            if let Some(mut client) = instance.client(&server) {
                client.part(&channel, message);
            }
            Reply::None
        }
        Request::Kick {
            server,
            channel,
            who,
            message,
        } => {
            if let Some(mut client) = instance.client(&server) {
                client.kick(&channel, &who, message);
            }
            Reply::None
        }
        Request::Invite {
            server,
            channel,
            who,
        } => {
            if let Some(mut client) = instance.client(&server) {
                client.invite(&channel, &who);
            }
            Reply::None
        }
        Request::Message {
            server,
            target,
            text,
        } => {
            if let Some(mut client) = instance.client(&server) {
                client.privmsg(&target, &text);
            }
            Reply::None
        }
        Request::Action {
            server,
            target,
            text,
        } => {
            if let Some(mut client) = instance.client(&server) {
                client.action(&target, &text);
            }
            Reply::None
        }
        Request::Notice {
            server,
            target,
            text,
        } => {
            if let Some(mut client) = instance.client(&server) {
                client.notice(&target, &text);
            }
            Reply::None
        }
        Request::Ctcp {
            server,
            target,
            text,
        } => {
            if let Some(mut client) = instance.client(&server) {
                client.ctcp(&target, &text);
            }
            Reply::None
        }
        Request::Mode {
            server,
            target,
            mode,
        } => {
            if let Some(mut client) = instance.client(&server) {
                client.mode(&target, &mode);
            }
            Reply::None
        }
        Request::Names { server, channel } => {
            if let Some(mut client) = instance.client(&server) {
                client.names(&channel);
            }
            Reply::None
        }
        Request::Topic {
            server,
            channel,
            topic,
        } => {
            if let Some(mut client) = instance.client(&server) {
                client.topic(&channel, topic);
            }
            Reply::None
        }
        Request::List { server, channel } => {
            if let Some(mut client) = instance.client(&server) {
                client.list(channel);
            }
            Reply::None
        }
        Request::Nick { server, nick } => {
            if let Some(mut client) = instance.client(&server) {
                client.nick(&nick);
            }
            Reply::None
        }
        Request::Away { server, message } => {
            if let Some(mut client) = instance.client(&server) {
                client.away(Some(&message));
            }
            Reply::None
        }
        Request::Back { server } => {
            if let Some(mut client) = instance.client(&server) {
                client.away(None);
            }
            Reply::None
        }
        Request::Whois { server, mask } => {
            if let Some(mut client) = instance.client(&server) {
                client.whois(&mask);
            }
            Reply::None
        }
        Request::Ignore { server, pattern } => {
            if let Some(config) = instance.server_config(&server) {
                let mut ignores = config.get_list("server", "ignores");
                if !ignores.contains(&pattern) {
                    ignores.push(pattern);
                    config.set_list("server", "ignores", ignores);
                }
            }
            Reply::None
        }
        Request::Unignore { server, pattern } => {
            if let Some(config) = instance.server_config(&server) {
                let mut ignores = config.get_list("server", "ignores");
                let old_len = ignores.len();
                ignores.retain(|ignore| ignore != &pattern);
                if ignores.len() != old_len {
                    config.set_list("server", "ignores", ignores);
                }
            }
            Reply::None
        }
        Request::ServerGet { server, group, key } => {
            match instance.server_config(&server) {
                Some(config) => Reply::Str(config.get_str(&group, &key).unwrap_or_default()),
                None => Reply::None,
            }
        }
        Request::ServerSet {
            server,
            group,
            key,
            value,
        } => {
            // Setting a key on an unknown server creates it
            if instance.server_config(&server).is_none() {
                instance.add_server(&server);
            }
            if let Some(config) = instance.server_config(&server) {
                config.set_str(&group, &key, &value);
            }
            Reply::None
        }
        Request::ServerRemove { server } => {
            instance.remove_server(&server);
            Reply::None
        }
        Request::ServerRename { server, new_name } => {
            instance.rename_server(&server, &new_name);
            Reply::None
        }
        Request::ServerList => Reply::Lines(instance.server_list()),
        Request::ConfigGet { group, key } => {
            Reply::Str(instance.config().get_str(&group, &key).unwrap_or_default())
        }
        Request::ConfigSet { group, key, value } => {
            instance.config().set_str(&group, &key, &value);
            Reply::None
        }
        Request::Log {
            server,
            target,
            lines,
        } => match instance.server_logger(&server) {
            Some(logger) => Reply::Lines(logger.tail(&target, lines as usize)),
            None => Reply::None,
        },
        Request::Channels { server } => match instance.client(&server) {
            Some(client) => Reply::Lines(client.get_channels()),
            None => Reply::None,
        },
        Request::ChannelNicks { server, channel } => match instance.client(&server) {
            Some(client) => {
                let (nicks, prefixes) = client.get_channel_nicks(&channel);
                Reply::NickList { nicks, prefixes }
            }
            None => Reply::None,
        },
        Request::ChannelTopic { server, channel } => match instance.client(&server) {
            Some(client) => Reply::Str(client.get_channel_topic(&channel).unwrap_or_default()),
            None => Reply::None,
        },
        Request::UserAway { server, nick } => match instance.client(&server) {
            Some(client) => Reply::Bool(client.is_user_away(&nick)),
            None => Reply::None,
        },
        Request::OwnNick { server } => match instance.client(&server) {
            Some(client) => Reply::Str(client.get_nick()),
            None => Reply::None,
        },
        Request::Version => Reply::Version(parse_version(env!("CARGO_PKG_VERSION"))),
        Request::Shutdown { message } => {
            instance.shutdown(message.as_deref().unwrap_or(""));
            Reply::None
        }
    }
}

fn parse_version(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn version_triple() {
        assert_eq!(parse_version("1.5.0"), vec![1, 5, 0]);
        assert_eq!(parse_version("0.13.0"), vec![0, 13, 0]);
    }

    fn temp_dirs(test: &str) -> (PathBuf, PathBuf) {
        let root = std::env::temp_dir().join("maki_ipc_tests").join(test);
        let _ = std::fs::remove_dir_all(&root);
        (root.join("config"), root.join("data"))
    }

    #[test]
    fn server_lifecycle_requests() {
        let (config_dir, data_dir) = temp_dirs("lifecycle");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();

        local.block_on(&runtime, async move {
            let instance = Instance::new(Some(config_dir.clone()), Some(data_dir)).unwrap();

            // The lock file records our pid
            let lock = std::fs::read_to_string(config_dir.join("maki.lock")).unwrap();
            assert_eq!(lock.trim(), std::process::id().to_string());

            assert_eq!(handle(&instance, Request::ServerList), Reply::Lines(vec![]));

            // Setting a key on an unknown server creates it
            assert_eq!(
                handle(
                    &instance,
                    Request::ServerSet {
                        server: "example".to_owned(),
                        group: "server".to_owned(),
                        key: "address".to_owned(),
                        value: "irc.example.net".to_owned(),
                    },
                ),
                Reply::None
            );
            assert_eq!(
                handle(&instance, Request::ServerList),
                Reply::Lines(vec!["example".to_owned()])
            );
            assert_eq!(
                handle(
                    &instance,
                    Request::ServerGet {
                        server: "example".to_owned(),
                        group: "server".to_owned(),
                        key: "address".to_owned(),
                    },
                ),
                Reply::Str("irc.example.net".to_owned())
            );
            // Defaults were filled on creation
            assert!(config_dir.join("servers").join("example").is_file());

            // Rename refuses collisions and moves the config file
            handle(
                &instance,
                Request::ServerSet {
                    server: "other".to_owned(),
                    group: "server".to_owned(),
                    key: "address".to_owned(),
                    value: "irc.other.net".to_owned(),
                },
            );
            assert!(!instance.rename_server("example", "other"));
            assert!(instance.rename_server("example", "renamed"));
            assert!(config_dir.join("servers").join("renamed").is_file());
            assert!(!config_dir.join("servers").join("example").exists());

            // Commands on unknown servers are no-ops
            assert_eq!(
                handle(
                    &instance,
                    Request::Message {
                        server: "nosuch".to_owned(),
                        target: "#c".to_owned(),
                        text: "hi".to_owned(),
                    },
                ),
                Reply::None
            );

            assert_eq!(
                handle(&instance, Request::Version),
                Reply::Version(parse_version(env!("CARGO_PKG_VERSION")))
            );
        });
    }

    #[test]
    fn ignore_patterns_roundtrip() {
        let (config_dir, data_dir) = temp_dirs("ignores");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();

        local.block_on(&runtime, async move {
            let instance = Instance::new(Some(config_dir), Some(data_dir)).unwrap();
            instance.add_server("srv");

            handle(
                &instance,
                Request::Ignore {
                    server: "srv".to_owned(),
                    pattern: "*!*@spam.example".to_owned(),
                },
            );
            // Adding twice keeps one copy
            handle(
                &instance,
                Request::Ignore {
                    server: "srv".to_owned(),
                    pattern: "*!*@spam.example".to_owned(),
                },
            );

            let config = instance.server_config("srv").unwrap();
            assert_eq!(
                config.get_list("server", "ignores"),
                vec!["*!*@spam.example".to_owned()]
            );

            handle(
                &instance,
                Request::Unignore {
                    server: "srv".to_owned(),
                    pattern: "*!*@spam.example".to_owned(),
                },
            );
            assert!(config.get_list("server", "ignores").is_empty());
        });
    }
}
