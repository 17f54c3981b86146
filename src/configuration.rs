//! Cluster membership configuration: the set of servers, their network
//! addresses, and their replication roles.

use std::fmt;

use crate::utils::{Result, SkiffError};
use crate::ServerId;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use serde::{Deserialize, Serialize};

/// Version byte prefixed to every encoded configuration.
const ENCODING_VERSION: u8 = 1;

/// Role a server plays within the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum Role {
    /// Replicates the log, does not participate in quorum.
    Standby,

    /// Replicates the log, does participate in quorum.
    Voter,

    /// Does not replicate the log, or participate in quorum.
    Idle,
}

impl Role {
    /// Wire code of this role in the stable binary encoding.
    pub(crate) fn code(&self) -> u8 {
        match self {
            Role::Standby => 0,
            Role::Voter => 1,
            Role::Idle => 2,
        }
    }

    /// Parses a wire code back into a role.
    pub(crate) fn from_code(code: u8) -> Result<Role> {
        match code {
            0 => Ok(Role::Standby),
            1 => Ok(Role::Voter),
            2 => Ok(Role::Idle),
            _ => Err(SkiffError::BadRole),
        }
    }

    /// True if a server with this role receives log replication traffic.
    pub fn replicates(&self) -> bool {
        matches!(self, Role::Standby | Role::Voter)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Standby => write!(f, "Standby"),
            Role::Voter => write!(f, "Voter"),
            Role::Idle => write!(f, "Idle"),
        }
    }
}

/// A single server in the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Server ID, must be greater than zero.
    pub id: ServerId,

    /// Server network address, opaque to the engine.
    pub address: String,

    /// Server role.
    pub role: Role,
}

/// The set of servers currently part of the cluster, with unique IDs and
/// unique addresses. Kept sorted by ID so that encoding is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    servers: Vec<Server>,
}

impl Configuration {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Configuration { servers: vec![] }
    }

    /// Adds a server to the configuration. The ID must be non-zero and both
    /// the ID and the address must not already be in use.
    pub fn add(
        &mut self,
        id: ServerId,
        address: impl Into<String>,
        role: Role,
    ) -> Result<()> {
        if id == 0 {
            return Err(SkiffError::BadId);
        }
        let address = address.into();
        if self.servers.iter().any(|s| s.id == id) {
            return Err(SkiffError::DuplicateId);
        }
        if self.servers.iter().any(|s| s.address == address) {
            return Err(SkiffError::DuplicateAddress);
        }

        let pos = self.servers.partition_point(|s| s.id < id);
        self.servers.insert(pos, Server { id, address, role });
        Ok(())
    }

    /// Removes the server with the given ID from the configuration.
    pub fn remove(&mut self, id: ServerId) -> Result<()> {
        match self.servers.iter().position(|s| s.id == id) {
            Some(pos) => {
                self.servers.remove(pos);
                Ok(())
            }
            None => Err(SkiffError::BadId),
        }
    }

    /// Looks up the server with the given ID.
    pub fn get(&self, id: ServerId) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Mutable lookup, used when changing a member's role in place.
    pub(crate) fn get_mut(&mut self, id: ServerId) -> Option<&mut Server> {
        self.servers.iter_mut().find(|s| s.id == id)
    }

    /// Iterates over all member servers in ID order.
    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter()
    }

    /// Number of servers in the configuration.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// True if the configuration holds no servers.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// True if the given server is a voting member.
    pub fn is_voter(&self, id: ServerId) -> bool {
        self.get(id).is_some_and(|s| s.role == Role::Voter)
    }

    /// Number of voting members.
    pub fn n_voters(&self) -> usize {
        self.servers
            .iter()
            .filter(|s| s.role == Role::Voter)
            .count()
    }

    /// Strict majority of the voting members.
    pub fn quorum(&self) -> usize {
        self.n_voters() / 2 + 1
    }

    /// Encodes the configuration into the stable binary layout: a version
    /// byte, a varint server count, then for each server its 64-bit
    /// little-endian ID, one role byte, and its NUL-terminated address.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(ENCODING_VERSION);
        put_uvarint(&mut buf, self.servers.len() as u64);
        for server in &self.servers {
            buf.put_u64_le(server.id);
            buf.put_u8(server.role.code());
            buf.put_slice(server.address.as_bytes());
            buf.put_u8(0);
        }
        buf.freeze()
    }

    /// Decodes a configuration from its stable binary layout.
    pub fn decode(mut buf: &[u8]) -> Result<Configuration> {
        if buf.remaining() < 1 {
            return Err(SkiffError::Malformed("empty configuration".into()));
        }
        let version = buf.get_u8();
        if version != ENCODING_VERSION {
            return Err(SkiffError::Malformed(format!(
                "unknown configuration encoding version {}",
                version
            )));
        }

        let n = get_uvarint(&mut buf)?;
        let mut configuration = Configuration::new();
        for _ in 0..n {
            if buf.remaining() < 9 {
                return Err(SkiffError::Malformed(
                    "truncated server record".into(),
                ));
            }
            let id = buf.get_u64_le();
            let role = Role::from_code(buf.get_u8())?;
            let nul = buf
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| {
                    SkiffError::Malformed("unterminated address".into())
                })?;
            let address = std::str::from_utf8(&buf[..nul])
                .map_err(|e| SkiffError::Malformed(e.to_string()))?
                .to_owned();
            buf.advance(nul + 1);
            configuration.add(id, address, role)?;
        }

        Ok(configuration)
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, s) in self.servers.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}@{}: {}", s.id, s.address, s.role)?;
        }
        write!(f, "}}")
    }
}

/// Appends an unsigned LEB128 varint to the buffer.
fn put_uvarint(buf: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

/// Reads an unsigned LEB128 varint off the front of the buffer.
fn get_uvarint(buf: &mut &[u8]) -> Result<u64> {
    let mut v: u64 = 0;
    let mut shift = 0;
    loop {
        if buf.remaining() < 1 {
            return Err(SkiffError::Malformed("truncated varint".into()));
        }
        if shift >= 64 {
            return Err(SkiffError::Malformed("varint overflow".into()));
        }
        let byte = buf.get_u8();
        v |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
    }
}
