#![allow(clippy::write_with_newline)]

//! IRC wire protocol message parsers and generators.
//!
//! This library is for implementing clients rather than servers or services,
//! and does not support the IRC message format in full generality. Generated
//! messages are bare lines; the transport appends the "\r\n" framing.

use std::str;

use libmaki_common::ChanName;

pub mod support;

pub fn pass(pass: &str) -> String {
    format!("PASS {}", pass)
}

pub fn quit(reason: Option<&str>) -> String {
    match reason {
        None => "QUIT".to_string(),
        Some(reason) => format!("QUIT :{}", reason),
    }
}

pub fn user(username: &str, realname: &str) -> String {
    format!("USER {} 0 * :{}", username, realname)
}

pub fn nick(arg: &str) -> String {
    format!("NICK {}", arg)
}

pub fn ping(arg: &str) -> String {
    format!("PING :{}", arg)
}

pub fn pong(arg: &str) -> String {
    format!("PONG :{}", arg)
}

pub fn join(chan: &str, key: Option<&str>) -> String {
    match key {
        Some(key) if !key.is_empty() => format!("JOIN {} {}", chan, key),
        _ => format!("JOIN {}", chan),
    }
}

pub fn part(chan: &str, reason: Option<&str>) -> String {
    match reason {
        None => format!("PART {}", chan),
        Some(reason) => format!("PART {} :{}", chan, reason),
    }
}

pub fn kick(chan: &str, who: &str, reason: Option<&str>) -> String {
    match reason {
        None => format!("KICK {} {}", chan, who),
        Some(reason) => format!("KICK {} {} :{}", chan, who, reason),
    }
}

pub fn invite(who: &str, chan: &str) -> String {
    format!("INVITE {} {}", who, chan)
}

pub fn privmsg(msgtarget: &str, msg: &str) -> String {
    format!("PRIVMSG {} :{}", msgtarget, msg)
}

pub fn notice(msgtarget: &str, msg: &str) -> String {
    format!("NOTICE {} :{}", msgtarget, msg)
}

pub fn action(msgtarget: &str, msg: &str) -> String {
    format!("PRIVMSG {} :\x01ACTION {}\x01", msgtarget, msg)
}

pub fn ctcp(msgtarget: &str, body: &str) -> String {
    format!("PRIVMSG {} :\x01{}\x01", msgtarget, body)
}

pub fn notice_ctcp(msgtarget: &str, body: &str) -> String {
    format!("NOTICE {} :\x01{}\x01", msgtarget, body)
}

pub fn away(msg: Option<&str>) -> String {
    match msg {
        None => "AWAY".to_string(),
        Some(msg) => format!("AWAY :{}", msg),
    }
}

pub fn mode(target: &str, modes: &str) -> String {
    if modes.is_empty() {
        format!("MODE {}", target)
    } else {
        format!("MODE {} {}", target, modes)
    }
}

pub fn names(chan: &str) -> String {
    format!("NAMES {}", chan)
}

pub fn topic(chan: &str, topic: Option<&str>) -> String {
    match topic {
        None => format!("TOPIC {}", chan),
        Some(topic) => format!("TOPIC {} :{}", chan, topic),
    }
}

pub fn list(chan: Option<&str>) -> String {
    match chan {
        None => "LIST".to_string(),
        Some(chan) => format!("LIST {}", chan),
    }
}

pub fn whois(mask: &str) -> String {
    format!("WHOIS {}", mask)
}

pub fn who(chan: &str) -> String {
    format!("WHO {}", chan)
}

/// Sender of a message ("prefix" in the RFC). Parsed because users of this
/// library need to distinguish a server from a user, and need the nick,
/// user and host parts separately to maintain the user registry.
///
/// (Note that the ambiguity in the RFC makes this a best-effort thing. When
/// we get a PRIVMSG from e.g. "foo" it's not possible to know whether "foo"
/// is a server or a user.)
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Pfx {
    /// Sender is a server.
    Server(String),

    /// Sender is a nick.
    User {
        nick: String,
        user: Option<String>,
        host: Option<String>,
    },

    /// Sender could be a server or a nick, it's unclear. According to the
    /// RFC something like "localhost" without '!', '@', or a character that
    /// 'servername' can have but 'nickname' cannot is undecidable.
    Ambiguous(String),
}

impl Pfx {
    /// The prefix as it appeared on the wire, for ignore-pattern matching.
    pub fn raw(&self) -> String {
        match self {
            Pfx::Server(s) | Pfx::Ambiguous(s) => s.clone(),
            Pfx::User { nick, user, host } => match (user, host) {
                (Some(user), Some(host)) => format!("{}!{}@{}", nick, user, host),
                (Some(user), None) => format!("{}!{}", nick, user),
                (None, Some(host)) => format!("{}@{}", nick, host),
                (None, None) => nick.clone(),
            },
        }
    }
}

// RFC 2812 section 2.3.1
fn parse_pfx(pfx: &str) -> Pfx {
    if let Some(excl_idx) = pfx.find('!') {
        let nick = &pfx[..excl_idx];
        let rest = &pfx[excl_idx + 1..];
        let (user, host) = match rest.find('@') {
            Some(at_idx) => (&rest[..at_idx], Some(rest[at_idx + 1..].to_owned())),
            None => (rest, None),
        };
        return Pfx::User {
            nick: nick.to_owned(),
            user: Some(user.to_owned()),
            host,
        };
    }

    if let Some(at_idx) = pfx.find('@') {
        return Pfx::User {
            nick: pfx[..at_idx].to_owned(),
            user: None,
            host: Some(pfx[at_idx + 1..].to_owned()),
        };
    }

    // Chars that nicks can have but servernames cannot
    if pfx.find(['[', ']', '\\', '`', '_', '^', '{', '|', '}']).is_some() {
        Pfx::User {
            nick: pfx.to_owned(),
            user: None,
            host: None,
        }
    } else if pfx.contains('.') {
        // Nicks can't have '.'
        Pfx::Server(pfx.to_owned())
    } else {
        Pfx::Ambiguous(pfx.to_owned())
    }
}

/// An IRC message
#[derive(Debug, PartialEq, Eq)]
pub struct Msg {
    /// Sender of the message. According to RFC 2812 it's optional:
    ///
    /// > If the prefix is missing from the message, it is assumed to have
    /// > originated from the connection from which it was received from.
    pub pfx: Option<Pfx>,
    pub cmd: Cmd,
}

/// A client-to-client protocol message embedded in a PRIVMSG or NOTICE body.
/// See <https://defs.ircdocs.horse/defs/ctcp.html>
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum CTCP {
    Version,
    Action,
    Ping,
    Dcc,
    Other(String),
}

impl CTCP {
    fn parse(s: &str) -> CTCP {
        match s {
            "VERSION" => CTCP::Version,
            "ACTION" => CTCP::Action,
            "PING" => CTCP::Ping,
            "DCC" => CTCP::Dcc,
            _ => CTCP::Other(s.to_owned()),
        }
    }

    pub fn verb(&self) -> &str {
        match self {
            CTCP::Version => "VERSION",
            CTCP::Action => "ACTION",
            CTCP::Ping => "PING",
            CTCP::Dcc => "DCC",
            CTCP::Other(verb) => verb,
        }
    }
}

/// An IRC command or reply
#[derive(Debug, PartialEq, Eq)]
pub enum Cmd {
    /// A PRIVMSG or NOTICE. Check `is_notice` field. Whether `target` is a
    /// channel depends on the server's CHANTYPES, so it stays a string here.
    PRIVMSG {
        target: String,
        msg: String,
        is_notice: bool,
        ctcp: Option<CTCP>,
    },

    JOIN {
        chan: ChanName,
    },

    PART {
        chan: ChanName,
        msg: Option<String>,
    },

    QUIT {
        msg: Option<String>,
    },

    KICK {
        chan: ChanName,
        who: String,
        msg: Option<String>,
    },

    NICK {
        nick: String,
    },

    MODE {
        target: String,
        modes: String,
        params: Vec<String>,
    },

    INVITE {
        who: String,
        chan: String,
    },

    TOPIC {
        chan: ChanName,
        topic: String,
    },

    PING {
        server: String,
    },

    PONG {
        server: String,
    },

    ERROR {
        msg: String,
    },

    /// An IRC message other than the ones listed above.
    Other {
        cmd: String,
        params: Vec<String>,
    },

    /// Numeric replies are kept generic as there are just too many replies
    /// and we only need to handle a subset of them.
    Reply {
        num: u16,
        params: Vec<String>,
    },
}

/// An intermediate type used during parsing.
enum MsgType<'a> {
    Cmd(&'a str),
    Num(u16),
}

static CRLF: [u8; 2] = [b'\r', b'\n'];

/// Decode a line of bytes. IRC has no charset; we require UTF-8 and fall
/// back to ISO-8859-1 when validation fails (every byte maps to the code
/// point of the same value, so the fallback itself cannot fail).
pub fn decode_line(bytes: &[u8]) -> String {
    match str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => bytes.iter().map(|b| *b as char).collect(),
    }
}

/// Try to read an IRC message off a buffer. Drops the consumed bytes when a
/// complete line was found. Otherwise the buffer is left unchanged.
pub fn parse_irc_msg(buf: &mut Vec<u8>) -> Option<Result<Msg, String>> {
    let crlf_idx = buf.windows(2).position(|sub| sub == CRLF)?;

    let msg_owned: String = decode_line(&buf[0..crlf_idx]);
    let ret = parse_one_message(&msg_owned);
    buf.drain(0..crlf_idx + 2);

    Some(ret)
}

// NB. 'msg' does not contain the '\r\n' suffix.
pub fn parse_one_message(mut msg: &str) -> Result<Msg, String> {
    let pfx: Option<Pfx> = {
        if let Some(':') = msg.chars().next() {
            let ws_idx = msg
                .find(' ')
                .ok_or(format!("Can't find prefix terminator (' ') in msg: {:?}", msg))?;
            let pfx = &msg[1..ws_idx]; // consume ':'
            msg = &msg[ws_idx + 1..]; // consume ' '
            Some(parse_pfx(pfx))
        } else {
            None
        }
    };

    let msg_ty: MsgType = {
        let ws_idx = msg.find(' ').ok_or(format!(
            "Can't find message type terminator (' ') in msg: {:?}",
            msg
        ))?;
        let cmd = &msg[..ws_idx];
        msg = &msg[ws_idx + 1..]; // consume ' '
        match cmd.parse::<u16>() {
            Ok(num) => MsgType::Num(num),
            Err(_) => MsgType::Cmd(cmd),
        }
    };

    let params = parse_params(msg);
    let cmd = match msg_ty {
        MsgType::Cmd("PRIVMSG") | MsgType::Cmd("NOTICE") if params.len() == 2 => {
            let is_notice = matches!(msg_ty, MsgType::Cmd("NOTICE"));
            let target = params[0];
            let mut msg = params[1];

            let mut ctcp: Option<CTCP> = None;
            if !msg.is_empty() && msg.as_bytes()[0] == 0x01 {
                // Drop 0x01
                msg = &msg[1..];
                // Parse message type
                for (byte_idx, byte) in msg.as_bytes().iter().enumerate() {
                    if *byte == 0x01 {
                        let ctcp_type = &msg[0..byte_idx];
                        ctcp = Some(CTCP::parse(ctcp_type));
                        msg = &msg[byte_idx + 1..];
                        break;
                    } else if *byte == b' ' {
                        let ctcp_type = &msg[0..byte_idx];
                        ctcp = Some(CTCP::parse(ctcp_type));
                        msg = &msg[byte_idx + 1..];
                        if !msg.is_empty() && msg.as_bytes()[msg.len() - 1] == 0x01 {
                            msg = &msg[..msg.len() - 1];
                        }
                        break;
                    }
                }
            }

            Cmd::PRIVMSG {
                target: target.to_owned(),
                msg: msg.to_owned(),
                is_notice,
                ctcp,
            }
        }
        MsgType::Cmd("JOIN") if !params.is_empty() => {
            // Some servers send the channel as a trailing argument
            let chan = params[0].split(' ').next().unwrap_or(params[0]);
            Cmd::JOIN {
                chan: ChanName::new(chan.to_owned()),
            }
        }
        MsgType::Cmd("PART") if params.len() == 1 || params.len() == 2 => Cmd::PART {
            chan: ChanName::new(params[0].to_owned()),
            msg: params.get(1).map(|s| (*s).to_owned()),
        },
        MsgType::Cmd("QUIT") if params.len() <= 1 => Cmd::QUIT {
            msg: params.first().map(|s| (*s).to_owned()),
        },
        MsgType::Cmd("KICK") if params.len() == 2 || params.len() == 3 => Cmd::KICK {
            chan: ChanName::new(params[0].to_owned()),
            who: params[1].to_owned(),
            msg: params.get(2).map(|s| (*s).to_owned()),
        },
        MsgType::Cmd("NICK") if params.len() == 1 => Cmd::NICK {
            nick: params[0].to_owned(),
        },
        MsgType::Cmd("MODE") if params.len() >= 2 => Cmd::MODE {
            target: params[0].to_owned(),
            modes: params[1].to_owned(),
            params: params[2..].iter().map(|s| (*s).to_owned()).collect(),
        },
        MsgType::Cmd("INVITE") if params.len() == 2 => Cmd::INVITE {
            who: params[0].to_owned(),
            chan: params[1].to_owned(),
        },
        MsgType::Cmd("TOPIC") if params.len() == 2 => Cmd::TOPIC {
            chan: ChanName::new(params[0].to_owned()),
            topic: params[1].to_owned(),
        },
        MsgType::Cmd("PING") if params.len() == 1 => Cmd::PING {
            server: params[0].to_owned(),
        },
        MsgType::Cmd("PONG") if !params.is_empty() => Cmd::PONG {
            server: params[0].to_owned(),
        },
        MsgType::Cmd("ERROR") if params.len() == 1 => Cmd::ERROR {
            msg: params[0].to_owned(),
        },
        MsgType::Num(n) => Cmd::Reply {
            num: n,
            params: params.into_iter().map(|s| s.to_owned()).collect(),
        },
        MsgType::Cmd(cmd) => Cmd::Other {
            cmd: cmd.to_owned(),
            params: params.into_iter().map(|s| s.to_owned()).collect(),
        },
    };

    Ok(Msg { pfx, cmd })
}

fn parse_params(chrs: &str) -> Vec<&str> {
    // Spec:
    //
    //     params     =  *14( SPACE middle ) [ SPACE ":" trailing ]
    //                =/ 14( SPACE middle ) [ SPACE [ ":" ] trailing ]
    //
    //     nospcrlfcl =  %x01-09 / %x0B-0C / %x0E-1F / %x21-39 / %x3B-FF
    //                     ; any octet except NUL, CR, LF, " " and ":"
    //     middle     =  nospcrlfcl *( ":" / nospcrlfcl )
    //     trailing   =  *( ":" / " " / nospcrlfcl )

    let mut params = Vec::new();
    let mut char_indices = chrs.char_indices();

    while let Some((idx, c)) = char_indices.next() {
        if c == ':' {
            params.push(&chrs[idx + 1..]); // skip ':'
            break;
        }

        if params.len() == 14 {
            params.push(&chrs[idx..]);
            break;
        }

        if c == ' ' {
            continue;
        }

        loop {
            match char_indices.next() {
                Some((idx_, c)) => {
                    if c == ' ' {
                        params.push(&chrs[idx..idx_]);
                        break;
                    }
                }
                None => {
                    params.push(&chrs[idx..]);
                    break;
                }
            }
        }
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params("p1 p2 p3"), vec!["p1", "p2", "p3"]);
        let empty: Vec<&str> = vec![];
        assert_eq!(parse_params(""), empty);
        assert_eq!(parse_params(":foo bar baz "), vec!["foo bar baz "]);
        assert_eq!(parse_params(":"), vec![""]);
        assert_eq!(parse_params("x:"), vec!["x:"]);
        assert_eq!(parse_params("x:y"), vec!["x:y"]);
        assert_eq!(parse_params("aaa://aaa"), vec!["aaa://aaa"]);

        let params = parse_params("1 2 3 4 5 6 7 8 9 10 11 12 13 14 blah blah blah");
        assert_eq!(params.len(), 15);
        assert_eq!(params[params.len() - 1], "blah blah blah");
    }

    #[test]
    fn test_privmsg_parsing() {
        let mut buf = vec![];
        write!(
            &mut buf,
            ":nick!~nick@unaffiliated/nick PRIVMSG maki :a b c\r\n"
        )
        .unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap(),
            Msg {
                pfx: Some(Pfx::User {
                    nick: "nick".to_owned(),
                    user: Some("~nick".to_owned()),
                    host: Some("unaffiliated/nick".to_owned()),
                }),
                cmd: Cmd::PRIVMSG {
                    target: "maki".to_owned(),
                    msg: "a b c".to_owned(),
                    is_notice: false,
                    ctcp: None,
                },
            }
        );
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_notice_parsing() {
        let mut buf = vec![];
        write!(
            &mut buf,
            ":barjavel.freenode.net NOTICE * :*** Looking up your hostname...\r\n"
        )
        .unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap(),
            Msg {
                pfx: Some(Pfx::Server("barjavel.freenode.net".to_owned())),
                cmd: Cmd::PRIVMSG {
                    target: "*".to_owned(),
                    msg: "*** Looking up your hostname...".to_owned(),
                    is_notice: true,
                    ctcp: None,
                },
            }
        );
    }

    #[test]
    fn test_numeric_parsing() {
        let mut buf = vec![];
        write!(
            &mut buf,
            ":barjavel.freenode.net 001 maki :Welcome to the freenode Internet Relay Chat Network maki\r\n"
        ).unwrap();
        write!(
            &mut buf,
            ":barjavel.freenode.net 005 maki_test CHANTYPES=# EXCEPTS INVEX \
             CHANMODES=eIbq,k,flj,CFLMPQScgimnprstz CHANLIMIT=#:120 PREFIX=(ov)@+ \
             CASEMAPPING=rfc1459 :are supported by this server\r\n"
        )
        .unwrap();

        let mut msgs = vec![];
        while let Some(Ok(msg)) = parse_irc_msg(&mut buf) {
            assert_eq!(
                msg.pfx,
                Some(Pfx::Server("barjavel.freenode.net".to_owned()))
            );
            msgs.push(msg);
        }

        assert_eq!(msgs.len(), 2);
        match &msgs[1].cmd {
            Cmd::Reply { num: 5, params } => {
                assert_eq!(params[0], "maki_test");
                assert_eq!(params[1], "CHANTYPES=#");
            }
            other => panic!("expected 005 reply, got {:?}", other),
        }
    }

    #[test]
    fn test_part_kick_parsing() {
        let mut buf = vec![];
        write!(&mut buf, ":maki!~maki@123.123.123.123 PART #haskell\r\n").unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap(),
            Msg {
                pfx: Some(Pfx::User {
                    nick: "maki".to_owned(),
                    user: Some("~maki".to_owned()),
                    host: Some("123.123.123.123".to_owned()),
                }),
                cmd: Cmd::PART {
                    chan: ChanName::new("#haskell".to_owned()),
                    msg: None,
                },
            }
        );

        let mut buf = vec![];
        write!(&mut buf, ":op!o@h KICK #chan victim :bye\r\n").unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap().cmd,
            Cmd::KICK {
                chan: ChanName::new("#chan".to_owned()),
                who: "victim".to_owned(),
                msg: Some("bye".to_owned()),
            }
        );
    }

    #[test]
    fn test_join_parsing() {
        let mut buf = vec![];
        write!(&mut buf, ":maki!~maki@192.168.0.1 JOIN :#haskell\r\n").unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap().cmd,
            Cmd::JOIN {
                chan: ChanName::new("#haskell".to_owned()),
            }
        );
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_mode_parsing() {
        let mut buf = vec![];
        write!(&mut buf, ":op!o@h MODE #chan +ov alice bob\r\n").unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap().cmd,
            Cmd::MODE {
                target: "#chan".to_owned(),
                modes: "+ov".to_owned(),
                params: vec!["alice".to_owned(), "bob".to_owned()],
            }
        );

        let mut buf = vec![];
        write!(&mut buf, ":srv.net MODE maki :+i\r\n").unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap().cmd,
            Cmd::MODE {
                target: "maki".to_owned(),
                modes: "+i".to_owned(),
                params: vec![],
            }
        );
    }

    // Example from https://tools.ietf.org/id/draft-oakley-irc-ctcp-01.html
    #[test]
    fn test_ctcp_action_parsing() {
        let mut buf = vec![];
        write!(
            &mut buf,
            ":dan!u@localhost PRIVMSG #ircv3 :\x01ACTION writes some specs!\x01\r\n"
        )
        .unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap().cmd,
            Cmd::PRIVMSG {
                target: "#ircv3".to_owned(),
                msg: "writes some specs!".to_owned(),
                is_notice: false,
                ctcp: Some(CTCP::Action),
            }
        );
        assert_eq!(buf.len(), 0);

        // From https://modern.ircdocs.horse/ctcp.html:
        //
        // > The final <delim> MUST be sent, but parsers SHOULD accept incoming
        // > messages which lack it (particularly for CTCP ACTION).
        let mut buf = vec![];
        write!(&mut buf, ":a!b@c PRIVMSG target :\x01ACTION msg contents\r\n").unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap().cmd,
            Cmd::PRIVMSG {
                target: "target".to_owned(),
                msg: "msg contents".to_owned(),
                is_notice: false,
                ctcp: Some(CTCP::Action),
            }
        );
    }

    #[test]
    fn test_ctcp_version_parsing() {
        let mut buf = vec![];
        write!(&mut buf, ":a!b@c PRIVMSG target :\x01VERSION\x01\r\n").unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap().cmd,
            Cmd::PRIVMSG {
                target: "target".to_owned(),
                msg: "".to_owned(),
                is_notice: false,
                ctcp: Some(CTCP::Version),
            }
        );
    }

    #[test]
    fn test_ctcp_dcc_parsing() {
        let mut buf = vec![];
        write!(
            &mut buf,
            ":a!b@c PRIVMSG maki :\x01DCC SEND file.txt 2907707975 3078 24999\x01\r\n"
        )
        .unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap().cmd,
            Cmd::PRIVMSG {
                target: "maki".to_owned(),
                msg: "SEND file.txt 2907707975 3078 24999".to_owned(),
                is_notice: false,
                ctcp: Some(CTCP::Dcc),
            }
        );
    }

    #[test]
    fn test_error_parsing() {
        let mut buf = vec![];
        write!(
            &mut buf,
            "ERROR :Closing Link: 212.252.143.51 (Excess Flood)\r\n"
        )
        .unwrap();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap(),
            Msg {
                pfx: None,
                cmd: Cmd::ERROR {
                    msg: "Closing Link: 212.252.143.51 (Excess Flood)".to_owned(),
                },
            },
        );
    }

    #[test]
    fn test_pong_echoes_token() {
        // A `PING :x` must be answered with `PONG :x`
        let mut buf = b"PING :x\r\n".to_vec();
        match parse_irc_msg(&mut buf).unwrap().unwrap().cmd {
            Cmd::PING { server } => assert_eq!(pong(&server), "PONG :x"),
            other => panic!("expected PING, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_pfx() {
        use Pfx::*;
        assert_eq!(parse_pfx("xyz"), Ambiguous("xyz".to_string()));
        assert_eq!(parse_pfx("xy.z"), Server("xy.z".to_string()));
        assert_eq!(
            parse_pfx("xyz[m]"),
            User {
                nick: "xyz[m]".to_string(),
                user: None,
                host: None,
            }
        );
        assert_eq!(
            parse_pfx("alice!alice@x.y.im"),
            User {
                nick: "alice".to_string(),
                user: Some("alice".to_string()),
                host: Some("x.y.im".to_string()),
            }
        );
    }

    #[test]
    fn test_pfx_raw_roundtrip() {
        for pfx in [
            "nick!user@host",
            "nick!user",
            "nick@host",
            "srv.example.net",
            "nick",
        ] {
            assert_eq!(parse_pfx(pfx).raw(), pfx);
        }
    }

    #[test]
    fn test_latin1_fallback() {
        // "für" in ISO-8859-1: 0xFC is not valid UTF-8
        let mut buf = b":a!b@c PRIVMSG #de :f\xFCr dich\r\n".to_vec();
        assert_eq!(
            parse_irc_msg(&mut buf).unwrap().unwrap().cmd,
            Cmd::PRIVMSG {
                target: "#de".to_owned(),
                msg: "für dich".to_owned(),
                is_notice: false,
                ctcp: None,
            }
        );
    }
}
