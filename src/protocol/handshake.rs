//! RTMP handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version) -------->|
//!   |------- C1 (1536 bytes: time+random) >|
//!   |<------ S0 (1 byte: version) ---------|
//!   |<------ S1 (1536 bytes: time+random) -|
//!   |<------ S2 (1536 bytes: echo C1) -----|
//!   |------- C2 (1536 bytes: echo S1) ---->|
//! ```
//!
//! Only the plain handshake is implemented: bytes 4..8 of C1/S1 are zero
//! and the random block is not digested. Input is consumed only once a
//! whole packet group is buffered, so callers can feed partial reads.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Instant;

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Handshake role (client or server)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Initial,
    /// Client waits for S0S1S2, server waits for C0C1
    WaitingForPeerPacket,
    /// Server waits for C2
    WaitingForPeerResponse,
    Done,
}

/// Handshake state machine
#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
    epoch: Instant,
}

impl Handshake {
    pub fn new(role: HandshakeRole) -> Self {
        Self {
            role,
            state: HandshakeState::Initial,
            epoch: Instant::now(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Bytes that must be buffered before the next call to [`process`](Self::process) can progress
    pub fn bytes_needed(&self) -> usize {
        match (self.state, self.role) {
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Client) => 1 + HANDSHAKE_SIZE * 2,
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Server) => 1 + HANDSHAKE_SIZE,
            (HandshakeState::WaitingForPeerResponse, _) => HANDSHAKE_SIZE,
            _ => 0,
        }
    }

    /// Produce C0+C1 for a client; a server produces nothing and starts waiting
    pub fn generate_initial(&mut self) -> Option<Bytes> {
        if self.state != HandshakeState::Initial {
            return None;
        }
        self.state = HandshakeState::WaitingForPeerPacket;

        match self.role {
            HandshakeRole::Client => {
                let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
                buf.put_u8(RTMP_VERSION);
                buf.put_slice(&generate_packet(self.elapsed_ms()));
                Some(buf.freeze())
            }
            HandshakeRole::Server => None,
        }
    }

    /// Consume peer bytes and return the reply to send, if any
    ///
    /// Client: S0S1S2 -> C2 (done). Server: C0C1 -> S0S1S2, then C2 -> done.
    /// Returns `Ok(None)` without consuming anything while input is short.
    pub fn process(&mut self, data: &mut BytesMut) -> Result<Option<Bytes>> {
        if data.len() < self.bytes_needed() {
            return Ok(None);
        }

        match (self.state, self.role) {
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Client) => {
                check_version(data.get_u8())?;
                let s1 = data.split_to(HANDSHAKE_SIZE);
                // S2 echoes C1; the plain handshake does not verify it
                data.advance(HANDSHAKE_SIZE);

                self.state = HandshakeState::Done;
                Ok(Some(self.echo(&s1)))
            }
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Server) => {
                check_version(data.get_u8())?;
                let c1 = data.split_to(HANDSHAKE_SIZE);

                let mut response = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);
                response.put_u8(RTMP_VERSION);
                response.put_slice(&generate_packet(self.elapsed_ms()));
                response.put_slice(&self.echo(&c1));

                self.state = HandshakeState::WaitingForPeerResponse;
                Ok(Some(response.freeze()))
            }
            (HandshakeState::WaitingForPeerResponse, HandshakeRole::Server) => {
                data.advance(HANDSHAKE_SIZE);
                self.state = HandshakeState::Done;
                Ok(None)
            }
            _ => Err(HandshakeError::InvalidState.into()),
        }
    }

    fn elapsed_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// C2/S2: peer time, our time, peer random block
    fn echo(&self, peer_packet: &[u8]) -> Bytes {
        let mut echo = BytesMut::from(peer_packet);
        echo[4..8].copy_from_slice(&self.elapsed_ms().to_be_bytes());
        echo.freeze()
    }
}

fn check_version(version: u8) -> Result<()> {
    if version != RTMP_VERSION {
        return Err(HandshakeError::InvalidVersion(version).into());
    }
    Ok(())
}

/// C1/S1: time(4) + zero(4) + random(1528)
fn generate_packet(time: u32) -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    packet[0..4].copy_from_slice(&time.to_be_bytes());

    // Not cryptographic; the plain handshake only needs filler bytes
    let mut seed = (time as u64) ^ 0x9E37_79B9_7F4A_7C15;
    for chunk in packet[8..].chunks_mut(8) {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let bytes = seed.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }

    packet
}
