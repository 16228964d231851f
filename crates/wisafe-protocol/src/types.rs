//! Common types used in the protocol.

use std::fmt;

use crate::constants::*;

/// A 24-bit mesh device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    /// The gateway's own id.
    pub const GATEWAY: DeviceId = DeviceId(GATEWAY_DEVICE_ID);

    /// Create an id, keeping the low 24 bits.
    pub const fn new(raw: u32) -> Self {
        DeviceId(raw & 0x00ff_ffff)
    }

    /// Assemble from three little-endian bytes.
    pub fn from_le_bytes(bytes: [u8; DEVICE_ID_BYTES]) -> Self {
        DeviceId(u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16)
    }

    /// The three little-endian bytes.
    pub fn to_le_bytes(self) -> [u8; DEVICE_ID_BYTES] {
        [self.0 as u8, (self.0 >> 8) as u8, (self.0 >> 16) as u8]
    }

    /// The raw value.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// True for [`DeviceId::GATEWAY`].
    pub fn is_gateway(self) -> bool {
        self == Self::GATEWAY
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}", self.0)
    }
}

impl From<u32> for DeviceId {
    fn from(raw: u32) -> Self {
        DeviceId::new(raw)
    }
}

/// Occupancy of the 64 network SID slots.
///
/// On the wire the map is 8 bytes; SID `n` is bit `n % 8` of byte `n / 8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SidMap(u64);

impl SidMap {
    /// A map with no SIDs set.
    pub const EMPTY: SidMap = SidMap(0);

    /// Create from the raw bitmap.
    pub const fn from_bits(bits: u64) -> Self {
        SidMap(bits)
    }

    /// Create from wire bytes.
    pub fn from_bytes(bytes: [u8; SID_MAP_BYTES]) -> Self {
        SidMap(u64::from_le_bytes(bytes))
    }

    /// Create from a wire slice. Returns `None` if it is not 8 bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; SID_MAP_BYTES] = slice.try_into().ok()?;
        Some(Self::from_bytes(bytes))
    }

    /// Wire bytes.
    pub fn to_bytes(self) -> [u8; SID_MAP_BYTES] {
        self.0.to_le_bytes()
    }

    /// The raw bitmap.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// True if `sid` is occupied. SIDs past the map are never occupied.
    pub fn contains(self, sid: u8) -> bool {
        (sid as usize) < SID_COUNT && self.0 & (1 << sid) != 0
    }

    /// Mark `sid` occupied.
    pub fn insert(&mut self, sid: u8) {
        if (sid as usize) < SID_COUNT {
            self.0 |= 1 << sid;
        }
    }

    /// Mark `sid` free.
    pub fn remove(&mut self, sid: u8) {
        if (sid as usize) < SID_COUNT {
            self.0 &= !(1 << sid);
        }
    }

    /// Number of occupied SIDs.
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// True if no SID is occupied.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Joined to a network: the radio module plus at least one other SID.
    pub fn in_network(self) -> bool {
        self.count() > 1
    }

    /// SIDs present in both maps.
    pub fn intersection(self, other: SidMap) -> SidMap {
        SidMap(self.0 & other.0)
    }

    /// SIDs in `self` but not in `other`.
    pub fn difference(self, other: SidMap) -> SidMap {
        SidMap(self.0 & !other.0)
    }

    /// Occupied SIDs in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0..SID_COUNT as u8).filter(move |&sid| self.contains(sid))
    }
}

impl FromIterator<u8> for SidMap {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        let mut map = SidMap::EMPTY;
        for sid in iter {
            map.insert(sid);
        }
        map
    }
}

impl fmt::Display for SidMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Fault flag bits carried in a fault report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FaultFlag {
    /// Device is calibrated. A fault when clear.
    Calibrated = 0,
    /// Device reports a general fault.
    Faulty = 1,
    /// Device is on its base. A fault when clear.
    OnBase = 2,
    /// Detector battery low.
    SdBattery = 3,
    /// Mains power failed.
    AcFailed = 4,
    /// Radio module battery low.
    RmBattery = 5,
    /// Unassigned.
    Unused6 = 6,
    /// Unassigned.
    Unused7 = 7,
}

impl FaultFlag {
    /// All flags in bit order.
    pub const ALL: [FaultFlag; 8] = [
        FaultFlag::Calibrated,
        FaultFlag::Faulty,
        FaultFlag::OnBase,
        FaultFlag::SdBattery,
        FaultFlag::AcFailed,
        FaultFlag::RmBattery,
        FaultFlag::Unused6,
        FaultFlag::Unused7,
    ];

    /// Bit position in the flags byte.
    pub const fn bit(self) -> u8 {
        self as u8
    }

    /// Whether `flags` has this bit set.
    pub fn is_set(self, flags: u8) -> bool {
        flags & (1 << self.bit()) != 0
    }

    /// Whether `flags` indicates a fault for this bit.
    pub fn is_fault(self, flags: u8) -> bool {
        match self {
            FaultFlag::Calibrated | FaultFlag::OnBase => !self.is_set(flags),
            _ => self.is_set(flags),
        }
    }
}
