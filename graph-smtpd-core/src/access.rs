//! Sender and source allow-lists.

use std::net::{IpAddr, SocketAddr};

/// A sorted list of permitted values. An empty list permits everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowList {
    entries: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries: Vec<String> = entries.into_iter().map(Into::into).collect();
        entries.sort_unstable();

        Self { entries }
    }

    /// A list of peer addresses. Entries that parse as IP addresses are
    /// stored in canonical form, so `2001:0db8::1` and `::ffff:127.0.0.1`
    /// match the peers `2001:db8::1` and `127.0.0.1`. Anything else is kept
    /// verbatim.
    pub fn addresses<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(entries.into_iter().map(|entry| {
            let entry = entry.into();
            entry
                .parse::<IpAddr>()
                .map_or(entry, |ip| ip.to_canonical().to_string())
        }))
    }

    /// Exact, case-sensitive membership. Always true for an empty list.
    pub fn permits(&self, candidate: &str) -> bool {
        self.entries.is_empty()
            || self
                .entries
                .binary_search_by(|entry| entry.as_str().cmp(candidate))
                .is_ok()
    }

    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

impl<S: Into<String>> FromIterator<S> for AllowList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[derive(Clone, Debug, Default)]
pub struct AccessControl {
    senders: AllowList,
    sources: AllowList,
}

impl AccessControl {
    pub const fn new(senders: AllowList, sources: AllowList) -> Self {
        Self { senders, sources }
    }

    pub fn check_sender(&self, sender: &str) -> bool {
        self.senders.permits(sender)
    }

    /// Check a peer address such as `192.0.2.7:51234` or `[2001:db8::1]:25`.
    ///
    /// The port is dropped and the address compared in canonical form. A
    /// peer string that is not an address at all is denied whenever the
    /// list is non-empty.
    pub fn check_source(&self, remote: &str) -> bool {
        if self.sources.is_empty() {
            return true;
        }

        peer_ip(remote).is_some_and(|ip| self.sources.permits(&ip.to_string()))
    }

    pub const fn senders(&self) -> &AllowList {
        &self.senders
    }

    pub const fn sources(&self) -> &AllowList {
        &self.sources
    }
}

fn peer_ip(remote: &str) -> Option<IpAddr> {
    remote
        .parse::<SocketAddr>()
        .map(|addr| addr.ip())
        .or_else(|_| remote.parse::<IpAddr>())
        .ok()
        .map(|ip| ip.to_canonical())
}
