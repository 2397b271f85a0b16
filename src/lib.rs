//! Polling client for the Mars Hydro / iFresh cloud API: token lifecycle, device
//! discovery, per-device refresh with reading normalization, and light/fan commands.

pub mod models {
    pub mod marshydro;
}

pub mod client;
pub mod config;
pub mod coordinator;
pub mod normalize;
pub mod session;
pub mod transport;
pub mod services {
    pub mod poller;
}
