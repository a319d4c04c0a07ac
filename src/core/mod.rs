pub mod dataset;
pub mod domain;
pub mod error;
pub mod params;
pub mod path;
pub mod spatial;
