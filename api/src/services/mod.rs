pub mod analysis;
pub mod classify;
pub mod fetcher;
pub mod gpx;
pub mod open_meteo;
pub mod provider;
pub mod resample;
pub mod summary;
pub mod timing;
pub mod yr;
