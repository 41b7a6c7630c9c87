use rustc_hash::{FxHashMap, FxHashSet};

use crate::comm::address::MeshAddr;


/// A local endpoint adapter handing frames to and from the host OS. Gate
///  implementations live outside this crate; the mesh core only needs the
///  surface below.
///
/// Gates share the forwarder's id space with connections: gate `g` appears
///  as next hop `-(g+1)`, so every next hop is one signed integer.
pub trait Gate: Send {
    /// Gates that are not ready neither contribute local routes nor receive
    ///  frames.
    fn is_ready(&self) -> bool;

    /// Addresses attached locally behind this gate. A wildcard here
    ///  registers the gate as a promiscuous listener for its instance.
    fn local_addrs(&self) -> &[MeshAddr];

    /// Instances (as wildcard addresses) this gate wants broadcasts for.
    fn instances(&self) -> &FxHashSet<MeshAddr>;

    fn send_frame(&mut self, instance: u32, dof: u16, ds: u16, sof: u16, ss: u16, buf: &[u8]);
}


pub fn gate_to_hop(gate_id: i32) -> i32 {
    -(gate_id + 1)
}

pub fn hop_to_gate(hop: i32) -> i32 {
    -(hop + 1)
}


#[derive(Default)]
pub struct GateRegistry {
    gates: FxHashMap<i32, Box<dyn Gate>>,
}

impl GateRegistry {
    pub fn new() -> GateRegistry {
        Default::default()
    }

    pub fn insert(&mut self, id: i32, gate: Box<dyn Gate>) {
        debug_assert!(id >= 0);
        self.gates.insert(id, gate);
    }

    pub fn remove(&mut self, id: i32) -> Option<Box<dyn Gate>> {
        self.gates.remove(&id)
    }

    pub fn get_mut(&mut self, id: i32) -> Option<&mut Box<dyn Gate>> {
        self.gates.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &Box<dyn Gate>)> {
        self.gates.iter().map(|(&id, g)| (id, g))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (i32, &mut Box<dyn Gate>)> {
        self.gates.iter_mut().map(|(&id, g)| (id, g))
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case(0, -1)]
    #[case(1, -2)]
    #[case(41, -42)]
    fn test_gate_hop_encoding(#[case] gate_id: i32, #[case] hop: i32) {
        assert_eq!(gate_to_hop(gate_id), hop);
        assert_eq!(hop_to_gate(hop), gate_id);
    }
}
