use crate::base::value::Value;

/// State of one previous-value slot.
///
/// Every operator-bearing instruction owns one slot. The slot starts out undefined,
/// becomes assigned when an operator stores a live value, and becomes empty when an
/// optional value is omitted in a way that, per the operator rules, empties it.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) enum PreviousValue {
    #[default]
    Undefined,
    Empty,
    Assigned(Value),
}

impl PreviousValue {
    /// The slot state corresponding to a field value: absent values empty the slot.
    pub(crate) fn from_option(value: &Option<Value>) -> Self {
        match value {
            None => PreviousValue::Empty,
            Some(v) => PreviousValue::Assigned(v.clone()),
        }
    }
}

/// Previous-value storage for all instructions of a template repository.
///
/// A flat arena indexed by the slot number assigned to each instruction when the
/// repository is built. Keeping the slots out of the instruction tree leaves the
/// tree immutable after build and makes a full reset one pass over a vector.
#[derive(Debug, PartialEq)]
pub(crate) struct Dictionary {
    slots: Vec<PreviousValue>,
}

impl Dictionary {
    pub(crate) fn new(slot_count: usize) -> Self {
        Self {
            slots: vec![PreviousValue::Undefined; slot_count],
        }
    }

    /// Extend the arena after more templates were registered. Existing slots keep their state.
    pub(crate) fn resize(&mut self, slot_count: usize) {
        self.slots.resize(slot_count, PreviousValue::Undefined);
    }

    pub(crate) fn get(&self, slot: usize) -> &PreviousValue {
        &self.slots[slot]
    }

    pub(crate) fn set(&mut self, slot: usize, value: PreviousValue) {
        self.slots[slot] = value;
    }

    /// Return every slot to the undefined state. Idempotent.
    pub(crate) fn reset(&mut self) {
        self.slots.fill(PreviousValue::Undefined);
    }
}
