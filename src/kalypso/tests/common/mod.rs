//! Shared setup for the protocol integration tests.
#![allow(dead_code)]

use add_sub::ModelRepository;
use dispatcher::{Builder, Frontend};
use kalypso_contract::Tensor;
/// Frontend serving the default `add_sub` repository, not yet live.
pub fn frontend() -> Frontend {
    let mut builder = Builder::new();
    for info in ModelRepository::default().model_infos().unwrap() {
        builder = builder.register_model(info);
    }
    builder.build()
}

/// `INPUT0` and `INPUT1` of shape `[1, 4]`.
pub fn add_sub_inputs(input0: &[f32], input1: &[f32]) -> Vec<Tensor> {
    vec![
        Tensor::from_slice("INPUT0", vec![1, 4], input0).unwrap(),
        Tensor::from_slice("INPUT1", vec![1, 4], input1).unwrap(),
    ]
}

pub fn values(outputs: &[Tensor], name: &str) -> Vec<f32> {
    outputs
        .iter()
        .find(|t| t.name() == name)
        .unwrap_or_else(|| panic!("no output {}", name))
        .to_vec::<f32>()
        .unwrap()
}
