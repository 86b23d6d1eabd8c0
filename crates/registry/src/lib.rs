//! Server-scope stream registry for the robot camera WebRTC stream
//! controller. Owns `name -> StreamState` plus peer-connection bookkeeping
//! (see [`server::Registry`]) and the periodic camera-removal sweep (see
//! [`monitor::CameraMonitor`]).

pub mod error;
pub mod log_throttle;
pub mod monitor;
pub mod server;

pub use error::RegistryError;
pub use monitor::CameraMonitor;
pub use server::Registry;
