//! Server dialect advertised via RPL_ISUPPORT (numeric 005).
//!
//! Only the tokens the client needs are recognised: CHANMODES, CHANTYPES and
//! PREFIX. The PREFIX token `(modes)prefixes` binds prefix characters to
//! mode letters pairwise by position; both strings are equal-length.

/// ISUPPORT state of one server, with RFC 2812 defaults until the server
/// says otherwise.
#[derive(Debug, Clone)]
pub struct Support {
    chanmodes: Option<String>,
    chantypes: String,
    prefix_modes: String,
    prefix_prefixes: String,
}

impl Default for Support {
    fn default() -> Support {
        Support {
            chanmodes: None,
            chantypes: "#&".to_owned(),
            prefix_modes: "ov".to_owned(),
            prefix_prefixes: "@+".to_owned(),
        }
    }
}

impl Support {
    /// Digest the parameters of a 005 reply (everything after the client
    /// nick). `KEY=VAL` tokens are scanned; the trailing human-readable
    /// "are supported by this server" argument is not a token.
    pub fn parse_tokens<S: AsRef<str>>(&mut self, params: &[S]) {
        for param in params {
            let param = param.as_ref();
            let (key, val) = match param.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };

            match key {
                "CHANMODES" => self.chanmodes = Some(val.to_owned()),
                "CHANTYPES" => self.chantypes = val.to_owned(),
                "PREFIX" => {
                    if let Some(rest) = val.strip_prefix('(') {
                        if let Some((modes, prefixes)) = rest.split_once(')') {
                            self.prefix_modes = modes.to_owned();
                            self.prefix_prefixes = prefixes.to_owned();
                        }
                    }
                }
                _ => {}
            }
        }
    }

    pub fn chanmodes(&self) -> Option<&str> {
        self.chanmodes.as_deref()
    }

    pub fn chantypes(&self) -> &str {
        &self.chantypes
    }

    pub fn prefix_modes(&self) -> &str {
        &self.prefix_modes
    }

    pub fn prefix_prefixes(&self) -> &str {
        &self.prefix_prefixes
    }

    /// Is `target` a channel name on this server?
    pub fn is_channel(&self, target: &str) -> bool {
        match target.chars().next() {
            Some(c) => self.chantypes.contains(c),
            None => false,
        }
    }

    /// Does `mode` consume a parameter under `sign`? CHANMODES is four
    /// comma-separated groups (RFC 2811): A and B always take a parameter,
    /// C only when setting, D never. Prefix modes always take a parameter.
    pub fn mode_has_parameter(&self, sign: char, mode: char) -> bool {
        if self.prefix_modes.contains(mode) {
            return true;
        }

        let chanmodes = match self.chanmodes {
            Some(ref chanmodes) => chanmodes,
            None => return false,
        };

        let mut group = 0;
        for c in chanmodes.chars() {
            if c == ',' {
                group += 1;
                continue;
            }
            if c == mode {
                return match group {
                    0 | 1 => true,
                    2 => sign == '+',
                    _ => false,
                };
            }
        }

        false
    }

    /// Position of a mode letter in the PREFIX modes string.
    pub fn mode_position(&self, mode: char) -> Option<usize> {
        self.prefix_modes.chars().position(|c| c == mode)
    }

    /// Position of a prefix character in the PREFIX prefixes string.
    pub fn prefix_position(&self, prefix: char) -> Option<usize> {
        self.prefix_prefixes.chars().position(|c| c == prefix)
    }

    /// The prefix character at a given position, used to render a prefix
    /// mask bit back into its display character.
    pub fn prefix_char(&self, pos: usize) -> Option<char> {
        self.prefix_prefixes.chars().nth(pos)
    }

    /// Strip all recognised prefix characters off the front of a NAMES
    /// entry. Returns the bare nick, the prefix bitmask (bit i set for the
    /// i-th prefix character) and the first (highest) prefix character.
    pub fn strip_nick_prefixes<'a>(&self, nick: &'a str) -> (&'a str, u32, Option<char>) {
        let mut rest = nick;
        let mut mask = 0u32;
        let mut first = None;

        while let Some(c) = rest.chars().next() {
            match self.prefix_position(c) {
                Some(pos) => {
                    if first.is_none() {
                        first = Some(c);
                    }
                    mask |= 1 << pos;
                    rest = &rest[c.len_utf8()..];
                }
                None => break,
            }
        }

        (rest, mask, first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prefix_two_and_three() {
        let mut support = Support::default();
        support.parse_tokens(&["PREFIX=(ov)@+"]);
        assert_eq!(support.prefix_modes(), "ov");
        assert_eq!(support.prefix_prefixes(), "@+");

        support.parse_tokens(&["PREFIX=(ohv)@%+"]);
        assert_eq!(support.prefix_modes(), "ohv");
        assert_eq!(support.prefix_prefixes(), "@%+");
    }

    #[test]
    fn parse_chanmodes_and_chantypes() {
        let mut support = Support::default();
        support.parse_tokens(&[
            "CHANTYPES=#",
            "EXCEPTS",
            "CHANMODES=eIbq,k,flj,CFLMPQScgimnprstz",
            "are supported by this server",
        ]);
        assert_eq!(support.chantypes(), "#");
        assert_eq!(support.chanmodes(), Some("eIbq,k,flj,CFLMPQScgimnprstz"));
        assert!(support.is_channel("#maki"));
        assert!(!support.is_channel("&maki"));
        assert!(!support.is_channel("maki"));
    }

    #[test]
    fn mode_parameter_rule() {
        let mut support = Support::default();
        support.parse_tokens(&["CHANMODES=b,k,l,imnpst"]);

        // A group: always
        assert!(support.mode_has_parameter('+', 'b'));
        assert!(support.mode_has_parameter('-', 'b'));
        // B group: always
        assert!(support.mode_has_parameter('+', 'k'));
        assert!(support.mode_has_parameter('-', 'k'));
        // C group: only when setting
        assert!(support.mode_has_parameter('+', 'l'));
        assert!(!support.mode_has_parameter('-', 'l'));
        // D group: never
        assert!(!support.mode_has_parameter('+', 'i'));
        assert!(!support.mode_has_parameter('-', 'i'));
        // Prefix modes: always
        assert!(support.mode_has_parameter('+', 'o'));
        assert!(support.mode_has_parameter('-', 'v'));
        // Unknown mode
        assert!(!support.mode_has_parameter('+', 'X'));
    }

    #[test]
    fn strip_prefixes() {
        let mut support = Support::default();
        support.parse_tokens(&["PREFIX=(ohv)@%+"]);

        assert_eq!(support.strip_nick_prefixes("@alice"), ("alice", 1, Some('@')));
        assert_eq!(support.strip_nick_prefixes("+bob"), ("bob", 0b100, Some('+')));
        assert_eq!(support.strip_nick_prefixes("carol"), ("carol", 0, None));
        // Multiple prefixes (multi-prefix style listing)
        assert_eq!(
            support.strip_nick_prefixes("@+dave"),
            ("dave", 0b101, Some('@'))
        );
    }
}
