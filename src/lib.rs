// src/lib.rs

pub mod atlas;
pub mod coef_matrix;
pub mod config;
pub mod driver;
pub mod energy;
pub mod equilibrium;
pub mod error;
pub mod evolver;
pub mod exchange;
pub mod field_init;
pub mod grid;
pub mod llb;
pub mod params;
pub mod region_map;
pub mod state;
pub mod thermal;
pub mod vec3;
pub mod visualisation;
pub mod zeeman;
