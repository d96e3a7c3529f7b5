pub mod spec;

pub use spec::{Bindings, ExecMode, ForwardArtifacts, TensorEngine};
