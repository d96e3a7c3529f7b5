extern crate self as gradnet;

pub mod engine;
pub mod error;
pub mod graph;
pub mod init;
pub mod io;
pub mod model;
pub mod nn;
pub mod params;
pub mod tensor;
pub mod train;

pub use engine::spec::TensorEngine;
pub use model::Model;
pub use params::store::ParameterStore;
pub use tensor::{Context, DType, Shape, Tensor};
