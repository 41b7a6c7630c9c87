use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::util::buf::{put_len_prefixed, try_get_len_prefixed};


/// An endpoint address in the mesh: an instance number plus a variable-length
///  octet string (typically a hardware address handed in by a gate).
///
/// An address with empty bytes is the *promiscuous wildcard* for its instance:
///  a listener registered under it receives all frames of that instance that
///  are not otherwise deliverable.
///
/// Ordering is `(instance, bytes)`, so route maps iterate in a stable sorted
///  order and the wildcard sorts first within its instance.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MeshAddr {
    pub instance: u32,
    pub bytes: Bytes,
}

impl MeshAddr {
    pub fn new(instance: u32, bytes: impl Into<Bytes>) -> MeshAddr {
        MeshAddr {
            instance,
            bytes: bytes.into(),
        }
    }

    /// The promiscuous wildcard for an instance.
    pub fn wildcard(instance: u32) -> MeshAddr {
        MeshAddr {
            instance,
            bytes: Bytes::new(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Broadcast is all-ones of whatever width the gate uses. The wildcard is
    ///  not a broadcast.
    pub fn is_broadcast(&self) -> bool {
        !self.bytes.is_empty() && self.bytes.iter().all(|&b| b == 0xff)
    }

    /// The wildcard that promiscuous listeners for this address's instance
    ///  are registered under.
    pub fn wildcard_of(&self) -> MeshAddr {
        MeshAddr::wildcard(self.instance)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.instance);
        put_len_prefixed(buf, &self.bytes);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MeshAddr> {
        let instance = buf.try_get_u32()?;
        let bytes = try_get_len_prefixed(buf)?;
        Ok(MeshAddr { instance, bytes })
    }
}

impl Debug for MeshAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_wildcard() {
            return write!(f, "[{}:*]", self.instance);
        }
        write!(f, "[{}:", self.instance)?;
        for b in self.bytes.iter() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "]")
    }
}
