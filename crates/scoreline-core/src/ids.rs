use std::collections::BTreeMap;

use crate::{
    compiler::CompileError,
    model::{
        BufferGroupId, BufferId, BusGroupId, BusId, BusRole, CalculationRate, FIRST_NODE_ID,
        NodeId,
    },
    session::Session,
    time::Offset,
};

/// Hands out contiguous index blocks from a bounded range.
#[derive(Debug, Clone)]
pub struct BlockAllocator {
    next: u32,
    limit: u32,
}

impl BlockAllocator {
    /// Allocates from `[minimum, limit)`.
    #[must_use]
    pub fn new(minimum: u32, limit: u32) -> Self {
        Self {
            next: minimum,
            limit,
        }
    }

    /// First index of a fresh block of `count`, or `None` when exhausted.
    pub fn allocate(&mut self, count: u32) -> Option<u32> {
        let start = self.next;
        let end = start.checked_add(count)?;
        if end > self.limit {
            return None;
        }
        self.next = end;
        Some(start)
    }

    #[must_use]
    pub fn allocated(&self) -> u32 {
        self.next
    }
}

/// Engine-facing integers for every session entity, rebuilt per compile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMapping {
    nodes: BTreeMap<NodeId, i32>,
    buses: BTreeMap<BusId, i32>,
    bus_groups: BTreeMap<BusGroupId, i32>,
    buffers: BTreeMap<BufferId, i32>,
    buffer_groups: BTreeMap<BufferGroupId, i32>,
}

impl IdMapping {
    pub fn build(session: &Session) -> Result<Self, CompileError> {
        let mut mapping = Self::default();
        mapping.map_nodes(session)?;
        mapping.map_buses(session)?;
        mapping.map_buffers(session)?;
        Ok(mapping)
    }

    fn map_nodes(&mut self, session: &Session) -> Result<(), CompileError> {
        self.nodes.insert(NodeId::ROOT, 0);
        let mut next = FIRST_NODE_ID;
        for state in session
            .states()
            .filter(|state| state.offset() > Offset::NEG_INFINITY)
        {
            for node in state.start_nodes() {
                self.nodes.insert(*node, to_wire(next)?);
                next += 1;
            }
        }
        Ok(())
    }

    fn map_buses(&mut self, session: &Session) -> Result<(), CompileError> {
        let options = session.options();
        let hardware = options.output_bus_channel_count + options.input_bus_channel_count;
        let mut audio =
            BlockAllocator::new(hardware, options.audio_bus_channel_count.max(hardware));
        let mut control = BlockAllocator::new(0, options.control_bus_channel_count);
        for group in session.bus_groups() {
            let count = u32::try_from(group.buses().len())
                .map_err(|_| CompileError::Exhausted("bus"))?;
            let start = match (group.role(), group.rate()) {
                (BusRole::HardwareOutput, _) => 0,
                (BusRole::HardwareInput, _) => options.output_bus_channel_count,
                (BusRole::Private, CalculationRate::Audio) => audio
                    .allocate(count)
                    .ok_or(CompileError::Exhausted("audio bus"))?,
                (BusRole::Private, CalculationRate::Control) => control
                    .allocate(count)
                    .ok_or(CompileError::Exhausted("control bus"))?,
            };
            self.bus_groups.insert(group.id(), to_wire(start)?);
            for (index, bus) in (start..).zip(group.buses()) {
                self.buses.insert(*bus, to_wire(index)?);
            }
        }
        Ok(())
    }

    fn map_buffers(&mut self, session: &Session) -> Result<(), CompileError> {
        let mut allocator = BlockAllocator::new(0, session.options().buffer_count);
        for buffer in session.buffers() {
            let index = allocator
                .allocate(1)
                .ok_or(CompileError::Exhausted("buffer"))?;
            self.buffers.insert(buffer.id(), to_wire(index)?);
        }
        for group in session.buffer_groups() {
            let first = group
                .buffers()
                .first()
                .and_then(|buffer| self.buffers.get(buffer))
                .copied()
                .ok_or(CompileError::Unmapped(format!("buffer group {}", group.id())))?;
            self.buffer_groups.insert(group.id(), first);
        }
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Result<i32, CompileError> {
        self.nodes
            .get(&id)
            .copied()
            .ok_or_else(|| CompileError::Unmapped(format!("node {id}")))
    }

    pub fn bus(&self, id: BusId) -> Result<i32, CompileError> {
        self.buses
            .get(&id)
            .copied()
            .ok_or_else(|| CompileError::Unmapped(format!("bus {id}")))
    }

    pub fn bus_group(&self, id: BusGroupId) -> Result<i32, CompileError> {
        self.bus_groups
            .get(&id)
            .copied()
            .ok_or_else(|| CompileError::Unmapped(format!("bus group {id}")))
    }

    pub fn buffer(&self, id: BufferId) -> Result<i32, CompileError> {
        self.buffers
            .get(&id)
            .copied()
            .ok_or_else(|| CompileError::Unmapped(format!("buffer {id}")))
    }

    pub fn buffer_group(&self, id: BufferGroupId) -> Result<i32, CompileError> {
        self.buffer_groups
            .get(&id)
            .copied()
            .ok_or_else(|| CompileError::Unmapped(format!("buffer group {id}")))
    }
}

fn to_wire(value: u32) -> Result<i32, CompileError> {
    i32::try_from(value).map_err(|_| CompileError::Exhausted("integer id"))
}
