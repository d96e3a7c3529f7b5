pub mod layers;
pub mod shape;

pub use layers::{
    Activation, AvgPooling2d, BuildContext, Conv2d, Dense, Dropout, Flatten, GlobalPooling2d,
    GlobalPooling3d, Layer, MaxPooling2d,
};
