pub mod context;
pub mod dtype;
pub mod host_tensor;
pub mod shape;

pub use context::{Context, DeviceType};
pub use dtype::DType;
pub use host_tensor::{Tensor, TensorData};
pub use shape::Shape;
