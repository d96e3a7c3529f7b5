pub mod data;
pub mod loss;
pub mod metric;
pub mod optim;
pub mod trainer;

pub use data::{Batch, DataSource, TensorDataset};
pub use loss::Loss;
pub use metric::{Accuracy, Mape, Metric};
pub use optim::{AdamW, Optimizer, ParamMults, Sgd};
pub use trainer::{BatchErrorPolicy, EpochRecord, FitReport, TrainOptions, Trainer};
