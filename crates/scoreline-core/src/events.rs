use serde::{Deserialize, Serialize};

use crate::time::Offset;

/// Offset-sorted values; at most one value per offset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventList<T> {
    events: Vec<(Offset, T)>,
}

impl<T> Default for EventList<T> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

impl<T> EventList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, offset: Offset, value: T) {
        match self
            .events
            .binary_search_by(|(existing, _)| existing.cmp(&offset))
        {
            Ok(index) => self.events[index].1 = value,
            Err(index) => self.events.insert(index, (offset, value)),
        }
    }

    /// Nearest event at or before `offset`.
    #[must_use]
    pub fn get(&self, offset: Offset) -> Option<(Offset, &T)> {
        let index = self.events.partition_point(|(existing, _)| *existing <= offset);
        index
            .checked_sub(1)
            .map(|index| (self.events[index].0, &self.events[index].1))
    }

    #[must_use]
    pub fn at(&self, offset: Offset) -> Option<&T> {
        self.events
            .binary_search_by(|(existing, _)| existing.cmp(&offset))
            .ok()
            .map(|index| &self.events[index].1)
    }

    #[must_use]
    pub fn last(&self) -> Option<(Offset, &T)> {
        self.events.last().map(|(offset, value)| (*offset, value))
    }

    /// Moves every event at or after `offset` into a new list.
    pub fn split_off(&mut self, offset: Offset) -> Self {
        let index = self.events.partition_point(|(existing, _)| *existing < offset);
        Self {
            events: self.events.split_off(index),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Offset, &T)> {
        self.events.iter().map(|(offset, value)| (*offset, value))
    }

    pub fn offsets(&self) -> impl Iterator<Item = Offset> + '_ {
        self.events.iter().map(|(offset, _)| *offset)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }
}
