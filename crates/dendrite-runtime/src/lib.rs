//! Simulation runtime for dendrite-generated programs.
//!
//! Generated code lowers each model part to an instance/population type
//! pair implementing the protocols in [`part`], and links against this
//! crate for everything else: the event queue and scheduler
//! ([`simulator`]), numeric integration ([`integrator`]), connection
//! formation ([`connect`], [`kdtree`]), population membership
//! ([`population`]), stream I/O ([`holders`]), and fixed-point arithmetic
//! ([`fixed`]).

pub mod connect;
pub mod delay;
pub mod error;
pub mod event;
pub mod fixed;
pub mod holders;
pub mod integrator;
pub mod kdtree;
pub mod matrix;
pub mod part;
pub mod population;
pub mod simulator;
pub mod types;

pub use connect::{ConnectIterator, ConnectMatrix, ConnectPopulation};
pub use delay::DelayBuffer;
pub use error::{Error, Result};
pub use event::{EventSpike, EventStep, SpikeTarget};
pub use holders::{Holders, InputHolder, OutputHolder};
pub use integrator::Integrator;
pub use kdtree::KdTree;
pub use matrix::{Matrix, MatrixSparse};
pub use part::{same_instance, Instance, InstanceRef, Population, PopulationRef};
pub use population::{Members, ResizePlan};
pub use simulator::Simulator;
pub use types::Real;
