pub mod settings;

pub use settings::{DeviceSettings, NetworkSettings, Settings, TransferSettings};
