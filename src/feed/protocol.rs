//! The TCPTS handshake.
//!
//! ```text
//! server -> client   TCPTS 0.1
//! server -> client   <challenge>
//! client -> server   hex(sha224(challenge ++ secret))
//! server -> client   Authenticated | Wrong reply!
//! client -> server   raw MPEG-TS bytes ...
//! ```
//!
//! Lines end in CRLF. Both sides are pure state machines here; the socket
//! handling lives in [`listener`](super::listener) and
//! [`client`](super::client).

use rand::RngCore;
use sha2::{Digest, Sha224};
use tokio_util::codec::LinesCodec;

pub const BANNER: &str = "TCPTS 0.1";
pub const AUTHENTICATED: &str = "Authenticated";
pub const WRONG_REPLY: &str = "Wrong reply!";
pub const DEFAULT_PORT: u16 = 3333;

/// Longest handshake line accepted from a peer.
pub const MAX_LINE_LENGTH: usize = 1024;

/// Codec for the line-based handshake phase.
pub fn line_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_LENGTH)
}

/// `line` as handed to the codec so that it goes out CRLF-terminated.
pub fn wire_line(line: &str) -> String {
    format!("{line}\r")
}

/// A fresh random challenge.
pub fn new_challenge() -> String {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    hex::encode(Sha224::digest(nonce))
}

/// The reply a client holding `secret` gives to `challenge`.
pub fn challenge_response(challenge: &str, secret: &str) -> String {
    let mut hasher = Sha224::new();
    hasher.update(challenge.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStep {
    /// Reply matched; send [`AUTHENTICATED`] and switch to raw mode.
    Accept,
    /// Reply did not match; send [`WRONG_REPLY`] and close.
    Reject,
    /// Nothing further is expected; close.
    Unexpected,
}

/// Server half of one session.
#[derive(Debug)]
pub struct ServerHandshake {
    challenge: String,
    expected: String,
    answered: bool,
}

impl ServerHandshake {
    pub fn new(secret: &str) -> Self {
        Self::with_challenge(new_challenge(), secret)
    }

    pub fn with_challenge(challenge: impl Into<String>, secret: &str) -> Self {
        let challenge = challenge.into();
        let expected = challenge_response(&challenge, secret);
        Self {
            challenge,
            expected,
            answered: false,
        }
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    /// The two greeting lines.
    pub fn greeting(&self) -> [&str; 2] {
        [BANNER, &self.challenge]
    }

    pub fn on_line(&mut self, line: &str) -> ServerStep {
        if self.answered {
            return ServerStep::Unexpected;
        }
        self.answered = true;
        if line.trim() == self.expected {
            ServerStep::Accept
        } else {
            ServerStep::Reject
        }
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    AwaitBanner,
    AwaitChallenge,
    AwaitVerdict,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientStep {
    /// Keep reading.
    Continue,
    /// Send this line.
    Reply(String),
    /// The server accepted us; start sending data.
    Authenticated,
    /// The server refused the secret.
    Rejected(String),
    /// The server spoke something other than TCPTS.
    ProtocolError(String),
}

/// Client half of one session.
#[derive(Debug)]
pub struct ClientHandshake {
    secret: String,
    state: ClientState,
}

impl ClientHandshake {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            state: ClientState::AwaitBanner,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ClientState::Authenticated
    }

    pub fn on_line(&mut self, line: &str) -> ClientStep {
        let line = line.trim();
        match self.state {
            ClientState::AwaitBanner if line == BANNER => {
                self.state = ClientState::AwaitChallenge;
                ClientStep::Continue
            }
            ClientState::AwaitBanner => {
                ClientStep::ProtocolError(format!("unexpected banner {line:?}"))
            }
            ClientState::AwaitChallenge => {
                self.state = ClientState::AwaitVerdict;
                ClientStep::Reply(challenge_response(line, &self.secret))
            }
            ClientState::AwaitVerdict if line == AUTHENTICATED => {
                self.state = ClientState::Authenticated;
                ClientStep::Authenticated
            }
            ClientState::AwaitVerdict => ClientStep::Rejected(line.to_string()),
            ClientState::Authenticated => {
                ClientStep::ProtocolError(format!("unexpected line after handshake {line:?}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_secret_and_challenge() {
        let mut server = ServerHandshake::with_challenge("deadbeef", "abc");
        let reply = challenge_response("deadbeef", "abc");
        assert_eq!(reply, hex::encode(Sha224::digest(b"deadbeefabc")));
        assert_eq!(server.on_line(&reply), ServerStep::Accept);
    }

    #[test]
    fn wrong_reply_is_rejected() {
        let mut server = ServerHandshake::with_challenge("deadbeef", "abc");
        let reply = challenge_response("deadbeef", "abd");
        assert_eq!(server.on_line(&reply), ServerStep::Reject);
    }

    #[test]
    fn second_line_is_unexpected() {
        let mut server = ServerHandshake::with_challenge("deadbeef", "abc");
        server.on_line("whatever");
        assert_eq!(server.on_line("again"), ServerStep::Unexpected);
    }

    #[test]
    fn challenges_are_sha224_hex_and_fresh() {
        let a = new_challenge();
        let b = new_challenge();
        assert_eq!(a.len(), 56);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn client_and_server_agree() {
        let mut server = ServerHandshake::new("s3cret");
        let mut client = ClientHandshake::new("s3cret");
        let [banner, challenge] = server.greeting();
        assert_eq!(client.on_line(banner), ClientStep::Continue);
        let ClientStep::Reply(reply) = client.on_line(challenge) else {
            panic!("client must reply to the challenge");
        };
        assert_eq!(server.on_line(&reply), ServerStep::Accept);
        assert_eq!(client.on_line(AUTHENTICATED), ClientStep::Authenticated);
        assert!(client.is_authenticated());
    }

    #[test]
    fn client_rejects_foreign_banner() {
        let mut client = ClientHandshake::new("x");
        assert!(matches!(client.on_line("HTTP/1.1 400"), ClientStep::ProtocolError(_)));
    }

    #[test]
    fn client_sees_rejection() {
        let mut client = ClientHandshake::new("x");
        client.on_line(BANNER);
        client.on_line("deadbeef");
        assert_eq!(client.on_line(WRONG_REPLY), ClientStep::Rejected(WRONG_REPLY.into()));
    }
}
