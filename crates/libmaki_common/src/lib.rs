//! Types shared by the maki crates: case-insensitive IRC names.
//!
//! IRC channel names and nicks are case-insensitive (RFC 2812 section 2.2).
//! `ChanName` keeps the original spelling for display while comparing,
//! hashing and map lookups are done on the folded form.

use std::borrow::Borrow;
use std::hash::{Hash, Hasher};

/// Fold an IRC name for comparisons. ASCII folding is enough for the servers
/// we care about; full RFC 1459 folding (`{|}` vs `[\]`) is not applied.
pub fn irc_fold(s: &str) -> String {
    s.to_ascii_lowercase()
}

/// Case-insensitive comparison of two IRC names.
pub fn irc_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// An owned channel name. Comparison and hashing ignore ASCII case.
#[derive(Debug, Clone)]
pub struct ChanName(String);

impl ChanName {
    pub fn new(name: String) -> ChanName {
        ChanName(name)
    }

    /// The name as the server sent it.
    pub fn display(&self) -> &str {
        &self.0
    }

    /// The folded form, usable as a map key.
    pub fn normalized(&self) -> String {
        irc_fold(&self.0)
    }
}

impl AsRef<ChanNameRef> for ChanName {
    fn as_ref(&self) -> &ChanNameRef {
        ChanNameRef::new(&self.0)
    }
}

impl Borrow<ChanNameRef> for ChanName {
    fn borrow(&self) -> &ChanNameRef {
        ChanNameRef::new(&self.0)
    }
}

impl PartialEq for ChanName {
    fn eq(&self, other: &ChanName) -> bool {
        irc_eq(&self.0, &other.0)
    }
}

impl Eq for ChanName {}

impl Hash for ChanName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        ChanNameRef::new(&self.0).hash(state)
    }
}

/// A borrowed channel name, the `str` to `ChanName`'s `String`.
#[derive(Debug)]
#[repr(transparent)]
pub struct ChanNameRef(str);

impl ChanNameRef {
    pub fn new(name: &str) -> &ChanNameRef {
        // Safe because of repr(transparent)
        unsafe { &*(name as *const str as *const ChanNameRef) }
    }

    pub fn display(&self) -> &str {
        &self.0
    }

    pub fn normalized(&self) -> String {
        irc_fold(&self.0)
    }
}

impl ToOwned for ChanNameRef {
    type Owned = ChanName;

    fn to_owned(&self) -> ChanName {
        ChanName(self.0.to_owned())
    }
}

impl PartialEq for ChanNameRef {
    fn eq(&self, other: &ChanNameRef) -> bool {
        irc_eq(&self.0, &other.0)
    }
}

impl Eq for ChanNameRef {}

impl Hash for ChanNameRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.0.as_bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
    }
}

impl PartialEq<ChanNameRef> for ChanName {
    fn eq(&self, other: &ChanNameRef) -> bool {
        irc_eq(&self.0, &other.0)
    }
}
