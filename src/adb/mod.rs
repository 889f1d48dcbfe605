//! ADB (Android Debug Bridge) module for device interaction.

mod channel;
mod connection;
mod device;
pub mod input;
mod screenshot;

pub use channel::{parse_wm_size, AdbChannel, CommandOutput, DeviceChannel};
pub use connection::{
    parse_device_list, remote_address, AdbConnection, AdbError, ConnectionType, DeviceInfo,
};
pub use device::{DeviceCommand, ADB_KEYBOARD_IME, KEYCODE_A, KEYCODE_CTRL_LEFT, KEYCODE_DEL};
pub use screenshot::{decode_screencap, Screenshot};
