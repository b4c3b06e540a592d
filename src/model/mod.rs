pub mod layers;
pub mod network;
pub mod optimizer;
pub mod params;
pub mod persistence;
pub mod trainer;
