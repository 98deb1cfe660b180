use tracing::debug;

use super::{Session, SessionError};
use crate::{
    events::EventList,
    model::{Bus, BusGroup, BusGroupId, BusId, BusRole, CalculationRate},
    time::Offset,
};

impl Session {
    pub(super) fn register_bus_group(
        &mut self,
        count: u32,
        rate: CalculationRate,
        role: BusRole,
    ) -> BusGroupId {
        let group = self.next_bus_group_id();
        let buses: Vec<BusId> = (0..count)
            .map(|_| {
                let id = self.next_bus_id();
                self.buses.insert(
                    id,
                    Bus {
                        id,
                        group,
                        rate,
                        events: EventList::new(),
                    },
                );
                id
            })
            .collect();
        self.bus_groups.insert(
            group,
            BusGroup {
                id: group,
                rate,
                role,
                buses,
            },
        );
        group
    }

    /// Adds a single bus; it occupies a group of one.
    pub fn add_bus(&mut self, rate: CalculationRate) -> BusId {
        let group = self.add_bus_group(1, rate);
        self.bus_groups
            .get(&group)
            .and_then(|group| group.buses.first().copied())
            .unwrap_or(BusId(0))
    }

    pub fn add_bus_group(&mut self, count: u32, rate: CalculationRate) -> BusGroupId {
        let group = self.register_bus_group(count.max(1), rate, BusRole::Private);
        debug!(%group, count, ?rate, "bus group added");
        group
    }

    #[must_use]
    pub fn bus(&self, id: BusId) -> Option<&Bus> {
        self.buses.get(&id)
    }

    #[must_use]
    pub fn bus_group(&self, id: BusGroupId) -> Option<&BusGroup> {
        self.bus_groups.get(&id)
    }

    pub fn buses(&self) -> impl Iterator<Item = &Bus> {
        self.buses.values()
    }

    pub fn bus_groups(&self) -> impl Iterator<Item = &BusGroup> {
        self.bus_groups.values()
    }

    #[must_use]
    pub fn audio_output_bus_group(&self) -> BusGroupId {
        self.audio_output_buses
    }

    #[must_use]
    pub fn audio_input_bus_group(&self) -> BusGroupId {
        self.audio_input_buses
    }

    /// Records a control-bus value at the active or explicit offset.
    pub fn set_bus(
        &mut self,
        bus: BusId,
        value: f64,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        let offset = self.resolve_offset(offset)?;
        let target = self
            .buses
            .get_mut(&bus)
            .ok_or(SessionError::BusNotFound(bus))?;
        if target.rate != CalculationRate::Control {
            return Err(SessionError::NotControlRate(bus));
        }
        target.events.set(offset, value);
        Ok(())
    }

    /// Sets every bus of a control-rate group to the same value.
    pub fn fill_bus_group(
        &mut self,
        group: BusGroupId,
        value: f64,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        let buses = self
            .bus_groups
            .get(&group)
            .ok_or(SessionError::BusGroupNotFound(group))?
            .buses
            .clone();
        for bus in buses {
            self.set_bus(bus, value, offset)?;
        }
        Ok(())
    }

    /// Value in effect at the offset; buses start at zero.
    pub fn bus_value(&self, bus: BusId, offset: Option<Offset>) -> Result<f64, SessionError> {
        let offset = self.resolve_offset(offset)?;
        let target = self.buses.get(&bus).ok_or(SessionError::BusNotFound(bus))?;
        Ok(target
            .events
            .get(offset)
            .map_or(0.0, |(_, value)| *value))
    }

    pub fn bus_group_values(
        &self,
        group: BusGroupId,
        offset: Option<Offset>,
    ) -> Result<Vec<f64>, SessionError> {
        let target = self
            .bus_groups
            .get(&group)
            .ok_or(SessionError::BusGroupNotFound(group))?;
        target
            .buses
            .iter()
            .map(|bus| self.bus_value(*bus, offset))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_groups_exist_from_the_start() {
        let session = Session::default();
        let outputs = session
            .bus_group(session.audio_output_bus_group())
            .expect("output group should exist");
        assert_eq!(outputs.buses().len(), 8);
        assert_eq!(outputs.role(), BusRole::HardwareOutput);
        assert_eq!(outputs.rate(), CalculationRate::Audio);
    }

    #[test]
    fn bus_values_hold_until_changed() {
        let mut session = Session::default();
        let bus = session.add_bus(CalculationRate::Control);
        session
            .set_bus(bus, 0.5, Some(Offset::from(2.0)))
            .expect("bus should be set");

        let value = |offset: f64| {
            session
                .bus_value(bus, Some(Offset::from(offset)))
                .expect("lookup should succeed")
        };
        assert!((value(1.0) - 0.0).abs() < f64::EPSILON);
        assert!((value(9.0) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn audio_buses_reject_values() {
        let mut session = Session::default();
        let bus = session.add_bus(CalculationRate::Audio);
        assert!(matches!(
            session.set_bus(bus, 1.0, Some(Offset::ZERO)),
            Err(SessionError::NotControlRate(_))
        ));
    }

    #[test]
    fn group_fill_sets_every_member() {
        let mut session = Session::default();
        let group = session.add_bus_group(3, CalculationRate::Control);
        session
            .fill_bus_group(group, 0.25, Some(Offset::from(1.0)))
            .expect("fill should succeed");
        assert_eq!(
            session
                .bus_group_values(group, Some(Offset::from(1.0)))
                .expect("lookup should succeed"),
            vec![0.25, 0.25, 0.25]
        );
    }
}
