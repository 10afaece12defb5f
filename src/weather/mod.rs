//! LocalWeatherReader and RemoteWeatherReader (§4.4): periodic pollers
//! that normalize units and write latest-reading snapshots to the
//! broker, with the remote source additionally maintaining a bounded
//! time-series and a local/remote correlation snapshot.

pub mod local;
pub mod remote;

pub use local::{LocalSensor, LocalWeatherReader};
pub use remote::{RemoteWeatherClient, RemoteWeatherReader};
