//! The fixed table of characteristics this crate knows how to talk to.
//!
//! Standard GATT characteristics live in the Bluetooth base UUID
//! `0000xxxx-0000-1000-8000-00805f9b34fb`. The Flowtime headband adds a
//! vendor service `0000ff10-1212-abcd-1523-785feabcd123` with notification
//! streams for wear status, raw EEG and heart rate plus a command
//! characteristic.

use uuid::Uuid;

const fn base_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
}

const fn flowtime_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_1212_abcd_1523_785f_eabc_d123 | ((short as u128) << 96))
}

pub const DEVICE_NAME: Uuid = base_uuid(0x2a00);
pub const MODEL_NUMBER: Uuid = base_uuid(0x2a01);
pub const CONNECTION_PARAMETERS: Uuid = base_uuid(0x2a04);
pub const BATTERY_LEVEL: Uuid = base_uuid(0x2a19);
pub const MAC_ADDRESS: Uuid = base_uuid(0x2a24);
pub const SERIAL_NUMBER: Uuid = base_uuid(0x2a25);
pub const FIRMWARE_VERSION: Uuid = base_uuid(0x2a26);
pub const HARDWARE_VERSION: Uuid = base_uuid(0x2a27);
pub const MANUFACTURER_NAME: Uuid = base_uuid(0x2a29);

/// Advertised by Flowtime headbands; use it as the scan service filter.
pub const FLOWTIME_SERVICE: Uuid = flowtime_uuid(0xff10);
pub const FLOWTIME_COMMAND: Uuid = flowtime_uuid(0xff21);
pub const FLOWTIME_EEG: Uuid = flowtime_uuid(0xff31);
pub const FLOWTIME_WEAR: Uuid = flowtime_uuid(0xff32);
pub const FLOWTIME_HEART_RATE: Uuid = flowtime_uuid(0xff51);

/// Number of raw samples in one EEG notification frame.
pub const EEG_FRAME_LEN: usize = 20;

/// How the payload of a characteristic is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Utf8String,
    UInt8,
    FixedBytes(usize),
    /// Six bytes, least significant octet first.
    MacAddressBe6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

impl Access {
    const R: Access = Access { read: true, write: false, notify: false };
    const RW: Access = Access { read: true, write: true, notify: false };
    const RN: Access = Access { read: true, write: false, notify: true };
    const N: Access = Access { read: false, write: false, notify: true };
    const W: Access = Access { read: false, write: true, notify: false };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicSpec {
    pub uuid: Uuid,
    pub kind: Kind,
    pub access: Access,
}

const fn spec(uuid: Uuid, kind: Kind, access: Access) -> CharacteristicSpec {
    CharacteristicSpec { uuid, kind, access }
}

pub const KNOWN_CHARACTERISTICS: &[CharacteristicSpec] = &[
    spec(DEVICE_NAME, Kind::Utf8String, Access::RW),
    spec(MODEL_NUMBER, Kind::Utf8String, Access::R),
    spec(CONNECTION_PARAMETERS, Kind::Utf8String, Access::R),
    spec(BATTERY_LEVEL, Kind::UInt8, Access::RN),
    spec(MAC_ADDRESS, Kind::MacAddressBe6, Access::R),
    spec(SERIAL_NUMBER, Kind::Utf8String, Access::R),
    spec(FIRMWARE_VERSION, Kind::Utf8String, Access::R),
    spec(HARDWARE_VERSION, Kind::Utf8String, Access::R),
    spec(MANUFACTURER_NAME, Kind::Utf8String, Access::R),
    spec(FLOWTIME_COMMAND, Kind::UInt8, Access::W),
    spec(FLOWTIME_EEG, Kind::FixedBytes(EEG_FRAME_LEN), Access::N),
    spec(FLOWTIME_WEAR, Kind::UInt8, Access::N),
    spec(FLOWTIME_HEART_RATE, Kind::UInt8, Access::N),
];

/// Look up a characteristic in the known table.
pub fn lookup(uuid: Uuid) -> Option<&'static CharacteristicSpec> {
    KNOWN_CHARACTERISTICS.iter().find(|spec| spec.uuid == uuid)
}
