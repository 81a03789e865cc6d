//! Sensor link: BLE connection, sample stream and command writes

mod gatt;
mod link;

pub use gatt::{GattConfig, GattSensorLink};
pub use link::{
    CommandWriter, LinkEvent, LinkState, SampleStream, SensorConnection, SensorHandle, SensorLink,
};
