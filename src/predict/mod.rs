mod error;
mod ground_station;
mod pass_finder;
mod propagation;
mod source;
mod tle_loader;
mod types;

pub use ground_station::StationLocation;
pub use pass_finder::PredictOptions;
pub use source::PassSource;
pub use tle_loader::TleLoader;
pub use types::{Pass, SatelliteProfile, SignalType};
