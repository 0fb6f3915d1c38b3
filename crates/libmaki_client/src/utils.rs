/// Byte budget for one PRIVMSG body to `target`. The IRC wire limit is 512
/// bytes including the framing; the server prepends our full prefix when
/// relaying, so assume the worst-case user (9) and host (63) lengths:
///
/// `:nick!user@host PRIVMSG target :msg\r\n`
pub(crate) fn privmsg_budget(nick: &str, target: &str) -> usize {
    let mut budget = 512usize;
    budget = budget.saturating_sub(1); // :
    budget = budget.saturating_sub(nick.len());
    budget = budget.saturating_sub(1); // !
    budget = budget.saturating_sub(9); // user
    budget = budget.saturating_sub(1); // @
    budget = budget.saturating_sub(63); // host
    budget = budget.saturating_sub(1); // " "
    budget = budget.saturating_sub(7); // PRIVMSG
    budget = budget.saturating_sub(1); // " "
    budget = budget.saturating_sub(target.len());
    budget = budget.saturating_sub(1); // " "
    budget = budget.saturating_sub(1); // :
    budget = budget.saturating_sub(2); // \r\n
    budget.max(1)
}

/// Split off a prefix of at most `max` bytes, on a UTF-8 character
/// boundary. Never returns an empty prefix for a non-empty input: a single
/// character wider than `max` is returned whole.
pub(crate) fn split_at_boundary(s: &str, max: usize) -> (&str, &str) {
    if s.len() <= max {
        return (s, "");
    }

    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }

    if idx == 0 {
        // First character alone exceeds the budget; take it anyway so the
        // caller makes progress.
        let first_len = s.chars().next().map(char::len_utf8).unwrap_or(s.len());
        s.split_at(first_len)
    } else {
        s.split_at(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_ascii() {
        assert_eq!(split_at_boundary("hello world", 5), ("hello", " world"));
        assert_eq!(split_at_boundary("hello", 5), ("hello", ""));
        assert_eq!(split_at_boundary("hello", 10), ("hello", ""));
    }

    #[test]
    fn split_respects_char_boundaries() {
        // 'ü' is two bytes; a split at byte 1 would be inside it
        let s = "üüü";
        let (head, tail) = split_at_boundary(s, 3);
        assert_eq!(head, "ü");
        assert_eq!(tail, "üü");

        let (head, tail) = split_at_boundary(s, 4);
        assert_eq!(head, "üü");
        assert_eq!(tail, "ü");
    }

    #[test]
    fn split_makes_progress() {
        // max smaller than the first char still returns it whole
        let s = "語り";
        let (head, tail) = split_at_boundary(s, 1);
        assert_eq!(head, "語");
        assert_eq!(tail, "り");
    }

    #[test]
    fn split_roundtrip() {
        let mut msg = "0123456789abcdef0123456789abcdef0123456789";
        let mut pieces = vec![];
        loop {
            let (head, tail) = split_at_boundary(msg, 16);
            pieces.push(head);
            if tail.is_empty() {
                break;
            }
            msg = tail;
        }
        assert!(pieces.iter().all(|p| p.len() <= 16));
        assert_eq!(
            pieces.concat(),
            "0123456789abcdef0123456789abcdef0123456789"
        );
    }

    #[test]
    fn budget_leaves_room_for_the_frame() {
        let nick = "maki";
        let target = "#chan";
        let budget = privmsg_budget(nick, target);
        // :nick!9@63 PRIVMSG target :msg\r\n must fit in 512
        let frame = 1 + nick.len() + 1 + 9 + 1 + 63 + 1 + 7 + 1 + target.len() + 1 + 1 + 2;
        assert_eq!(budget + frame, 512);
    }
}
