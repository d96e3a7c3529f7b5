use gradnet::error::ConfigError;
use gradnet::graph::{ActivationKind, PoolKind};
use gradnet::nn::{
    Conv2d, Dense, Dropout, Flatten, GlobalPooling2d, GlobalPooling3d, MaxPooling2d,
};
use gradnet::tensor::{Context, Shape};
use gradnet::train::{Accuracy, Loss, Metric, Sgd};
use gradnet::Model;

fn compile(model: &mut Model) -> anyhow::Result<()> {
    let metrics: Vec<Box<dyn Metric>> = vec![Box::new(Accuracy::new())];
    model.compile(
        Box::new(Sgd::new(0.1)),
        Loss::CategoricalCrossEntropy,
        metrics,
    )
}

#[test]
fn conv_valid_padding_shrinks_by_kernel_minus_one() {
    let mut model = Model::new(Shape::new([1, 28, 28]), Context::cpu());
    model.add(Conv2d::new(20, [5, 5])).unwrap();
    compile(&mut model).unwrap();
    assert_eq!(model.output_shape().unwrap().dims(), &[20, 24, 24]);
}

#[test]
fn conv_then_pool_halves_spatial_extent() {
    let mut model = Model::new(Shape::new([1, 28, 28]), Context::cpu());
    model.add(Conv2d::new(20, [5, 5])).unwrap();
    model.add(MaxPooling2d::new([2, 2], [2, 2])).unwrap();
    compile(&mut model).unwrap();
    assert_eq!(model.output_shape().unwrap().dims(), &[20, 12, 12]);
}

#[test]
fn lenet_style_stack_reaches_expected_head() {
    // The classic two conv/pool rounds, then flatten into dense layers.
    let mut model = Model::new(Shape::new([1, 28, 28]), Context::cpu());
    model
        .add(Conv2d::new(20, [5, 5]).with_activation(ActivationKind::Relu))
        .unwrap();
    model.add(MaxPooling2d::new([2, 2], [2, 2])).unwrap();
    model
        .add(Conv2d::new(20, [5, 5]).with_activation(ActivationKind::Relu))
        .unwrap();
    model.add(MaxPooling2d::new([2, 2], [2, 2])).unwrap();
    model.add(Flatten::new()).unwrap();
    model.add(Dropout::new(0.5)).unwrap();
    model
        .add(Dense::new(128).with_activation(ActivationKind::Relu))
        .unwrap();
    model.add(Dense::new(10)).unwrap();
    compile(&mut model).unwrap();

    assert_eq!(model.output_shape().unwrap().dims(), &[10]);
    // 12x12 -> conv 5x5 -> 8x8 -> pool -> 4x4, times 20 channels.
    let store = model.parameters().unwrap();
    let flat_weight = store.get("dense1_weight", Default::default()).unwrap();
    assert_eq!(
        flat_weight.read().shape().unwrap().dims(),
        &[128, 20 * 4 * 4]
    );
    // Second conv consumes the first conv's 20 channels.
    let conv2_weight = store.get("conv2d2_weight", Default::default()).unwrap();
    assert_eq!(conv2_weight.read().shape().unwrap().dims(), &[20, 20, 5, 5]);
}

#[test]
fn global_pooling_collapses_spatial_axes() {
    let mut model = Model::new(Shape::new([3, 10, 10]), Context::cpu());
    model.add(GlobalPooling2d::new(PoolKind::Avg)).unwrap();
    compile(&mut model).unwrap();
    assert_eq!(model.output_shape().unwrap().dims(), &[3, 1, 1]);

    let mut model3d = Model::new(Shape::new([3, 4, 10, 10]), Context::cpu());
    model3d.add(GlobalPooling3d::new(PoolKind::Max)).unwrap();
    compile(&mut model3d).unwrap();
    assert_eq!(model3d.output_shape().unwrap().dims(), &[3, 1, 1, 1]);
}

#[test]
fn pooling_rejects_rank_it_cannot_handle() {
    let mut model = Model::new(Shape::new([64]), Context::cpu());
    model.add(MaxPooling2d::new([2, 2], [2, 2])).unwrap();
    let err = compile(&mut model).unwrap_err();
    let root = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ConfigError>());
    assert!(matches!(root, Some(ConfigError::IncompatibleInput { .. })));
}

#[test]
fn oversized_kernel_is_a_configuration_error() {
    let mut model = Model::new(Shape::new([1, 3, 3]), Context::cpu());
    model.add(Conv2d::new(4, [5, 5])).unwrap();
    let err = compile(&mut model).unwrap_err();
    let root = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ConfigError>());
    assert!(matches!(root, Some(ConfigError::IncompatibleInput { .. })));
}

#[test]
fn add_after_compile_is_rejected() {
    let mut model = Model::new(Shape::new([4]), Context::cpu());
    model.add(Dense::new(2)).unwrap();
    compile(&mut model).unwrap();
    let err = model.add(Dense::new(2)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::ModelFrozen)
    ));
}

#[test]
fn recompile_with_same_settings_is_a_no_op() {
    let mut model = Model::new(Shape::new([4]), Context::cpu());
    model.add(Dense::new(2)).unwrap();
    compile(&mut model).unwrap();
    compile(&mut model).unwrap();

    let metrics: Vec<Box<dyn Metric>> = Vec::new();
    let err = model
        .compile(Box::new(Sgd::new(0.1)), Loss::MeanSquaredError, metrics)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::RecompileMismatch { .. })
    ));
}

#[test]
fn summary_lists_layers_and_parameter_counts() {
    let mut model = Model::new(Shape::new([4]), Context::cpu());
    model.add(Dense::new(3)).unwrap();
    model.add(Dense::new(2)).unwrap();
    compile(&mut model).unwrap();
    let summary = model.summary().unwrap();
    assert!(summary.contains("dense1"));
    assert!(summary.contains("dense2"));
    // 4*3 + 3 + 3*2 + 2 = 23 trainable scalars.
    assert!(summary.contains("total parameters: 23"));
}
