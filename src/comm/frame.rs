use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::comm::address::MeshAddr;


/// Every message on the wire is framed as `type: u8, special: u8, size: u16`
///  followed by `size` payload bytes. All integers are network byte order.
pub const FRAME_HEADER_LEN: usize = 4;

/// Fixed part of a packet payload before the frame buffer itself.
pub const PACKET_FIXED_LEN: usize = 20;

/// Serialized size of one route entry before the address bytes.
pub const ROUTE_ENTRY_FIXED_LEN: usize = 14;

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Packet = 1,
    RouteSet = 2,
    RouteDiff = 3,
    Ping = 4,
    Pong = 5,
    RouteRequest = 6,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub special: u8,
    pub size: u16,
}
impl FrameHeader {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.frame_type.into());
        buf.put_u8(self.special);
        buf.put_u16(self.size);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        let raw_type = buf.try_get_u8()?;
        let frame_type = FrameType::try_from(raw_type)
            .map_err(|_| anyhow!("unknown frame type {}", raw_type))?;
        let special = buf.try_get_u8()?;
        let size = buf.try_get_u16()?;
        Ok(FrameHeader { frame_type, special, size })
    }
}


/// A user frame as carried between peers. `dof/ds` and `sof/ss` are
///  offset/length of the destination and source address bytes inside `buf`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PacketData {
    pub id: u32,
    pub ttl: u16,
    pub instance: u32,
    pub dof: u16,
    pub ds: u16,
    pub sof: u16,
    pub ss: u16,
    pub buf: Bytes,
}
impl PacketData {
    pub fn len(&self) -> u16 {
        self.buf.len() as u16
    }

    pub fn dest_addr(&self) -> MeshAddr {
        let from = self.dof as usize;
        let to = from + self.ds as usize;
        MeshAddr::new(self.instance, self.buf.slice(from..to))
    }

    /// Bounds checks on the address windows. Violations reset the connection
    ///  on the receive path; gate-originated frames are checked again by the
    ///  forwarder because they never pass the decoder. A zero-length
    ///  destination is well-formed here - the forwarder drops it silently.
    pub fn is_well_formed(&self) -> bool {
        let s = self.buf.len();
        self.dof as usize + self.ds as usize <= s
            && self.sof as usize + self.ss as usize <= s
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.id);
        buf.put_u16(self.ttl);
        buf.put_u32(self.instance);
        buf.put_u16(self.dof);
        buf.put_u16(self.ds);
        buf.put_u16(self.sof);
        buf.put_u16(self.ss);
        buf.put_u16(self.len());
        buf.put_slice(&self.buf);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PacketData> {
        let id = buf.try_get_u32()?;
        let ttl = buf.try_get_u16()?;
        let instance = buf.try_get_u32()?;
        let dof = buf.try_get_u16()?;
        let ds = buf.try_get_u16()?;
        let sof = buf.try_get_u16()?;
        let ss = buf.try_get_u16()?;
        let s = buf.try_get_u16()? as usize;
        if buf.remaining() < s {
            bail!("packet buffer truncated: {} bytes announced, {} present", s, buf.remaining());
        }

        let packet = PacketData {
            id,
            ttl,
            instance,
            dof,
            ds,
            sof,
            ss,
            buf: buf.copy_to_bytes(s),
        };
        if !packet.is_well_formed() {
            bail!("packet address window out of bounds (dof={} ds={} sof={} ss={} s={})",
                packet.dof, packet.ds, packet.sof, packet.ss, s);
        }
        Ok(packet)
    }
}


/// One entry of a route set or diff. `ping == 0` withdraws the address.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RouteEntry {
    pub ping: u32,
    pub dist: u32,
    pub addr: MeshAddr,
}
impl RouteEntry {
    pub fn withdrawal(addr: MeshAddr) -> RouteEntry {
        RouteEntry { ping: 0, dist: 0, addr }
    }

    pub fn is_withdrawal(&self) -> bool {
        self.ping == 0
    }

    pub fn serialized_len(&self) -> usize {
        ROUTE_ENTRY_FIXED_LEN + self.addr.bytes.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ping);
        buf.put_u32(self.dist);
        self.addr.ser(buf);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RouteEntry> {
        let ping = buf.try_get_u32()?;
        let dist = buf.try_get_u32()?;
        let addr = MeshAddr::try_deser(buf)?;
        Ok(RouteEntry { ping, dist, addr })
    }
}


#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Packet(PacketData),
    RouteSet(Vec<RouteEntry>),
    RouteDiff(Vec<RouteEntry>),
    Ping { nonce: u8 },
    Pong { nonce: u8 },
    RouteRequest,
}
impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Packet(_) => FrameType::Packet,
            Frame::RouteSet(_) => FrameType::RouteSet,
            Frame::RouteDiff(_) => FrameType::RouteDiff,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::RouteRequest => FrameType::RouteRequest,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::Packet(p) => PACKET_FIXED_LEN + p.buf.len(),
            Frame::RouteSet(entries) | Frame::RouteDiff(entries) => {
                entries.iter().map(|e| e.serialized_len()).sum()
            }
            Frame::Ping { .. } | Frame::Pong { .. } | Frame::RouteRequest => 0,
        }
    }

    /// Serializes header plus payload. Callers keep frames below the u16
    ///  payload limit (packets are bounded by the MTU, route reports are
    ///  chunked before they get here).
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let size: u16 = self.payload_len().try_into()
            .map_err(|_| anyhow!("frame payload exceeds u16 size field"))?;
        let special = match self {
            Frame::Ping { nonce } | Frame::Pong { nonce } => *nonce,
            _ => 0,
        };
        FrameHeader { frame_type: self.frame_type(), special, size }.ser(buf);

        match self {
            Frame::Packet(p) => p.ser(buf),
            Frame::RouteSet(entries) | Frame::RouteDiff(entries) => {
                for e in entries {
                    e.ser(buf);
                }
            }
            Frame::Ping { .. } | Frame::Pong { .. } | Frame::RouteRequest => {}
        }
        Ok(())
    }

    /// Decodes a payload whose length the header already announced. The
    ///  payload buffer must hold exactly `header.size` bytes.
    pub fn try_deser_payload(header: &FrameHeader, payload: &mut impl Buf) -> anyhow::Result<Frame> {
        debug_assert_eq!(payload.remaining(), header.size as usize);

        let frame = match header.frame_type {
            FrameType::Packet => Frame::Packet(PacketData::try_deser(payload)?),
            FrameType::RouteSet => Frame::RouteSet(Self::try_deser_entries(payload)?),
            FrameType::RouteDiff => Frame::RouteDiff(Self::try_deser_entries(payload)?),
            FrameType::Ping => Frame::Ping { nonce: header.special },
            FrameType::Pong => Frame::Pong { nonce: header.special },
            FrameType::RouteRequest => Frame::RouteRequest,
        };
        if payload.has_remaining() {
            bail!("{} trailing bytes after {:?} payload", payload.remaining(), header.frame_type);
        }
        Ok(frame)
    }

    fn try_deser_entries(buf: &mut impl Buf) -> anyhow::Result<Vec<RouteEntry>> {
        let mut entries = Vec::new();
        while buf.has_remaining() {
            entries.push(RouteEntry::try_deser(buf)?);
        }
        Ok(entries)
    }
}
