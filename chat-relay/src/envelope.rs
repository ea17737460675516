use std::fmt;

/// One outbound line as clients see it: `[<address>]<name>:<body>`.
///
/// Envelopes are built, formatted and handed to the broadcaster; nothing
/// keeps them around afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub addr: &'a str,
    pub name: &'a str,
    pub body: &'a str,
}

impl<'a> Envelope<'a> {
    pub fn new(addr: &'a str, name: &'a str, body: &'a str) -> Self {
        Self { addr, name, body }
    }

    pub fn announcement(addr: &'a str, name: &'a str, kind: Announcement) -> Self {
        Self::new(addr, name, kind.body())
    }
}

impl fmt::Display for Envelope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}:{}", self.addr, self.name, self.body)
    }
}

/// Membership changes announced to the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    Joined,
    Left,
    /// Reply line for the `who` command.
    Online,
}

impl Announcement {
    pub fn body(self) -> &'static str {
        match self {
            Announcement::Joined => "joined",
            Announcement::Left => "left",
            Announcement::Online => "online",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_address_name_and_body() {
        let line = Envelope::new("127.0.0.1:5555", "alice", "hello").to_string();
        assert_eq!(line, "[127.0.0.1:5555]alice:hello");
    }

    #[test]
    fn announcements_share_the_envelope() {
        let addr = "10.0.0.2:4000";
        let joined = Envelope::announcement(addr, addr, Announcement::Joined).to_string();
        let left = Envelope::announcement(addr, addr, Announcement::Left).to_string();
        assert_eq!(joined, "[10.0.0.2:4000]10.0.0.2:4000:joined");
        assert_eq!(left, "[10.0.0.2:4000]10.0.0.2:4000:left");
    }

    #[test]
    fn body_is_not_escaped() {
        let line = Envelope::new("a", "b", "x:[y]").to_string();
        assert_eq!(line, "[a]b:x:[y]");
    }
}
