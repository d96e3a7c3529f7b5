pub mod parameter;
pub mod store;

pub use parameter::{DtypeSource, GradReq, ParamData, ParamRef, ParamSpec, Parameter, StorageKind};
pub use store::{LoadOptions, ParameterStore};
