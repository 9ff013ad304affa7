//! Host-based tests for the BLE OTA firmware
//! These tests run on the development machine, not on the ESP32

pub mod sim_flash;

pub use sim_flash::{SimError, SimFlash, IMAGE_MAGIC};
