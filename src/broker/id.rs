//! Request identifiers.

/// Identifier of an in-flight request.
///
/// The low 16 bits select a slot in the broker table; the next 15 bits hold a
/// serial number so an identifier kept after its request finished does not
/// resolve to the slot's next occupant.
///
/// `RequestId::default()` (raw `0`) is never handed out by the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RequestId(u32);

pub(crate) const MAX_SLOTS: usize = 0x1_0000;
const SERIAL_MASK: u32 = 0x7FFF;

impl RequestId {
    pub(crate) fn compose(slot: usize, serial: u32) -> Self {
        Self((slot as u32 & 0xFFFF) | ((serial & SERIAL_MASK) << 16))
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub(crate) fn slot(&self) -> usize {
        (self.0 & 0xFFFF) as usize
    }
}

/// Advance a serial, skipping zero so a composed id is never `0`.
pub(crate) fn next_serial(serial: u32) -> u32 {
    let next = (serial + 1) & SERIAL_MASK;
    if next == 0 {
        1
    } else {
        next
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{:08x}", self.0)
    }
}
