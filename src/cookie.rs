// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DNS cookies (RFC 7873): a short shared secret exchanged as an EDNS
//! option that lets a resolver recognise replies from the same server
//! instance without a full transaction-security handshake.

use parking_lot::Mutex;

/// Where a server's cookie negotiation currently stands.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub enum CookieState {
    #[default]
    Unknown,
    Learned,
    NotSupported,
}

/// A server's cookie record: the client half this resolver generated, the
/// server half last learned, and which outgoing interface it was bound to
/// when learned.
#[derive(Clone, Debug)]
pub struct Cookie {
    pub state: CookieState,
    pub client_bytes: [u8; 8],
    pub server_bytes: [u8; 16],
    pub server_bytes_len: u8,
    pub bound_interface: Vec<u8>,
}

/// Outcome of applying a server cookie option to a stored record.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum CookieUpdate {
    /// Client half matched; state is now `Learned` (or stays `Learned`).
    Accepted,
    /// Client half did not match stored value; caller must drop the reply.
    Mismatch,
}

impl Cookie {
    /// Creates a fresh record with a random client half and no server
    /// half learned yet.
    #[must_use]
    pub fn new(rng: &Mutex<fastrand::Rng>) -> Self {
        let mut client_bytes = [0u8; 8];
        {
            let mut rng = rng.lock();
            rng.fill(&mut client_bytes);
        }
        Self {
            state: CookieState::Unknown,
            client_bytes,
            server_bytes: [0u8; 16],
            server_bytes_len: 0,
            bound_interface: Vec::new(),
        }
    }

    /// Rebuilds a record for TTL re-initialisation, keeping the client
    /// half and dropping everything else.
    #[must_use]
    pub fn reinit_preserving_client_bytes(&self) -> Self {
        Self {
            state: CookieState::Unknown,
            client_bytes: self.client_bytes,
            server_bytes: [0u8; 16],
            server_bytes_len: 0,
            bound_interface: Vec::new(),
        }
    }

    /// Marks this server as not supporting cookies at all. Sticky: only
    /// cleared by TTL-expiry re-init.
    pub fn mark_not_supported(&mut self) {
        self.state = CookieState::NotSupported;
    }

    /// Applies a cookie option `client || server` observed on a reply
    /// from `interface`.
    ///
    /// If the bound interface has changed and the new one is unknown
    /// (zero length), the state resets to `Unknown` for renewal before
    /// the client half is checked.
    pub fn set_server_cookie(&mut self, interface: &[u8], client: [u8; 8], server: &[u8]) -> CookieUpdate {
        if self.state == CookieState::NotSupported {
            return CookieUpdate::Mismatch;
        }

        if interface != self.bound_interface.as_slice() && interface.is_empty() {
            self.state = CookieState::Unknown;
        }

        if client != self.client_bytes {
            return CookieUpdate::Mismatch;
        }

        let len = server.len().min(self.server_bytes.len());
        self.server_bytes[..len].copy_from_slice(&server[..len]);
        for b in &mut self.server_bytes[len..] {
            *b = 0;
        }
        self.server_bytes_len = len as u8;
        self.bound_interface.clear();
        self.bound_interface.extend_from_slice(interface);
        self.state = CookieState::Learned;
        CookieUpdate::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rng() -> Mutex<fastrand::Rng> {
        Mutex::new(fastrand::Rng::with_seed(1))
    }

    #[test]
    fn learns_on_matching_client_half() {
        let rng = rng();
        let mut cookie = Cookie::new(&rng);
        let client = cookie.client_bytes;
        let server = [7u8; 16];
        let outcome = cookie.set_server_cookie(b"eth0", client, &server);
        assert_eq!(outcome, CookieUpdate::Accepted);
        assert_eq!(cookie.state, CookieState::Learned);
        assert_eq!(&cookie.server_bytes, &server);
    }

    #[test]
    fn mismatched_client_half_is_rejected_and_leaves_state_unmodified() {
        let rng = rng();
        let mut cookie = Cookie::new(&rng);
        let client = cookie.client_bytes;
        cookie.set_server_cookie(b"eth0", client, &[1u8; 16]);
        assert_eq!(cookie.state, CookieState::Learned);

        let mut other_client = client;
        other_client[0] ^= 0xFF;
        let outcome = cookie.set_server_cookie(b"eth0", other_client, &[2u8; 16]);
        assert_eq!(outcome, CookieUpdate::Mismatch);
        assert_eq!(cookie.state, CookieState::Learned);
        assert_eq!(cookie.server_bytes, [1u8; 16]);
    }

    #[test]
    fn ttl_reinit_preserves_client_bytes_only() {
        let rng = rng();
        let mut cookie = Cookie::new(&rng);
        let client = cookie.client_bytes;
        cookie.set_server_cookie(b"eth0", client, &[9u8; 16]);
        let reinit = cookie.reinit_preserving_client_bytes();
        assert_eq!(reinit.client_bytes, client);
        assert_eq!(reinit.state, CookieState::Unknown);
        assert_eq!(reinit.server_bytes_len, 0);
    }

    #[test]
    fn not_supported_is_sticky_across_updates() {
        let rng = rng();
        let mut cookie = Cookie::new(&rng);
        cookie.mark_not_supported();
        let client = cookie.client_bytes;
        // A reply cannot clear NotSupported; only TTL re-init does.
        assert_eq!(cookie.state, CookieState::NotSupported);
        let outcome = cookie.set_server_cookie(b"eth0", client, &[1u8; 16]);
        assert_eq!(outcome, CookieUpdate::Mismatch);
        assert_eq!(cookie.state, CookieState::NotSupported);
    }

    #[test]
    fn not_supported_is_cleared_by_ttl_reinit() {
        let rng = rng();
        let mut cookie = Cookie::new(&rng);
        cookie.mark_not_supported();
        let reinit = cookie.reinit_preserving_client_bytes();
        assert_eq!(reinit.state, CookieState::Unknown);
    }
}
