//! Named-command framing
//!
//! Application traffic with an open-ended set of verbs is framed as a 4-byte
//! big-endian dispatch id, a 4-byte big-endian body length and the body. The
//! id is a keyed SipHash-2-4 of the command name folded to 32 bits, so both
//! ends agree on ids without a shared table. A registry refuses names whose
//! ids collide.

use std::{collections::HashMap, hash::Hasher, sync::Arc};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use siphasher::sip::SipHasher24;
use tracing::{debug, warn};

use crate::error::{CodecError, FleetError, FleetResult, RegistryError};

const DISPATCH_KEY_0: u64 = 0x1234_0000;
const DISPATCH_KEY_1: u64 = 0x0000_5678;

/// Length of the id + body length header.
pub const COMMAND_HEADER_LEN: usize = 8;

/// 32-bit dispatch id for a command name.
pub fn dispatch_id(name: &str) -> u32 {
    let mut hasher = SipHasher24::new_with_keys(DISPATCH_KEY_0, DISPATCH_KEY_1);
    hasher.write(name.as_bytes());
    let h = hasher.finish();
    ((h >> 32) ^ (h & 0xffff_ffff)) as u32
}

pub fn encode_command(id: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(COMMAND_HEADER_LEN + body.len());
    buf.put_u32(id);
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

/// Decode one command frame from the front of `input`.
///
/// Returns `(id, body, consumed)`; a short buffer yields
/// [`CodecError::Incomplete`] and the caller keeps the bytes.
pub fn decode_command(input: &[u8]) -> Result<(u32, Bytes, usize), CodecError> {
    let available = input.len();
    if available < COMMAND_HEADER_LEN {
        return Err(CodecError::Incomplete {
            needed: COMMAND_HEADER_LEN,
            available,
        });
    }
    let mut cursor = input;
    let id = cursor.get_u32();
    let len = cursor.get_u32() as usize;
    let total = COMMAND_HEADER_LEN + len;
    if available < total {
        return Err(CodecError::Incomplete {
            needed: total,
            available,
        });
    }
    Ok((id, Bytes::copy_from_slice(&cursor[..len]), total))
}

type CommandFn = Arc<dyn Fn(Bytes) -> anyhow::Result<()> + Send + Sync>;

struct CommandEntry {
    name: String,
    handler: CommandFn,
}

/// Name -> id -> handler table for named commands.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<u32, CommandEntry>,
    ids: HashMap<String, u32>,
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.ids)
            .finish()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw-body handler.
    pub fn register<F>(&mut self, name: &str, handler: F) -> Result<u32, RegistryError>
    where
        F: Fn(Bytes) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(name, dispatch_id(name), Arc::new(handler))
    }

    /// Register a handler whose body is a bincode-encoded `T`.
    pub fn register_typed<T, F>(&mut self, name: &str, handler: F) -> Result<u32, RegistryError>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(name, move |body: Bytes| {
            let value: T = bincode::deserialize(&body).map_err(CodecError::Body)?;
            handler(value)
        })
    }

    fn insert(&mut self, name: &str, id: u32, handler: CommandFn) -> Result<u32, RegistryError> {
        if let Some(existing) = self.handlers.get(&id) {
            if existing.name == name {
                return Err(RegistryError::Duplicate(name.to_string()));
            }
            warn!(
                command = name,
                existing = %existing.name,
                id,
                "Dispatch id collision"
            );
            return Err(RegistryError::Collision {
                name: name.to_string(),
                existing: existing.name.clone(),
                id,
            });
        }
        debug!(command = name, id, "Registered command");
        self.handlers.insert(
            id,
            CommandEntry {
                name: name.to_string(),
                handler,
            },
        );
        self.ids.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        match self.ids.remove(name) {
            Some(id) => self.handlers.remove(&id).is_some(),
            None => false,
        }
    }

    pub fn dispatch_id_of(&self, name: &str) -> Result<u32, RegistryError> {
        self.ids
            .get(name)
            .copied()
            .ok_or_else(|| RegistryError::UnknownName(name.to_string()))
    }

    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.handlers.get(&id).map(|entry| entry.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Frame a bincode-encoded value under a registered command name.
    pub fn encode_typed<T: Serialize>(&self, name: &str, value: &T) -> FleetResult<Bytes> {
        let id = self.dispatch_id_of(name)?;
        let body = bincode::serialize(value).map_err(CodecError::Body)?;
        Ok(encode_command(id, &body))
    }

    /// Decode one frame from `input` and run its handler.
    ///
    /// Returns the bytes consumed together with the handler's outcome. Short
    /// frames and unknown ids are returned as errors without running any
    /// handler; stream callers keep the buffer on `Incomplete`.
    pub fn process(&self, input: &[u8]) -> FleetResult<(usize, anyhow::Result<()>)> {
        let (id, body, consumed) = decode_command(input)?;
        let entry = self
            .handlers
            .get(&id)
            .ok_or(FleetError::Registry(RegistryError::UnknownCommand(id)))?;
        Ok((consumed, (entry.handler)(body)))
    }
}
