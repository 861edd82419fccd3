use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{Architecture, BuildSpec, ImageClassifier, Mode};

fn images(batch: usize) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1.0, (batch, 3, 32, 32), &Device::Cpu)?)
}

#[test]
fn forward_produces_class_scores() -> Result<()> {
    let model = Architecture::ResNet20.build(&BuildSpec::default())?;
    let scores = model.forward(&images(2)?)?;

    assert_eq!(scores.dims(), &[2, 10]);
    assert_eq!(scores.dtype(), DType::F32);
    assert_eq!(model.name(), "resnet20");
    Ok(())
}

#[test]
fn parameter_blob_restores_identical_outputs() -> Result<()> {
    let mut source = Architecture::ResNet20.build(&BuildSpec::default())?;
    let inputs = images(4)?;

    // one train-mode pass moves the running statistics away from their init
    source.forward(&inputs)?;
    source.set_mode(Mode::Eval);
    let expected = source.forward(&inputs)?.to_vec2::<f32>()?;

    let blob = source.export_parameters()?;
    assert!(!blob.is_empty());

    let mut restored = Architecture::ResNet20.build(&BuildSpec::default())?;
    restored.import_parameters(&blob)?;
    restored.set_mode(Mode::Eval);
    let actual = restored.forward(&inputs)?.to_vec2::<f32>()?;

    assert_eq!(expected, actual);
    assert_eq!(restored.export_parameters()?, blob);
    Ok(())
}

#[test]
fn import_rejects_other_architecture() -> Result<()> {
    let small = Architecture::ResNet20.build(&BuildSpec::default())?;
    let mut large = Architecture::ResNet32.build(&BuildSpec::default())?;

    let blob = small.export_parameters()?;
    assert!(large.import_parameters(&blob).is_err());
    Ok(())
}

#[test]
fn eval_mode_uses_running_statistics() -> Result<()> {
    let mut model = Architecture::ResNet20.build(&BuildSpec::default())?;
    let inputs = images(2)?;

    model.set_mode(Mode::Eval);
    let first = model.forward(&inputs)?.to_vec2::<f32>()?;
    let second = model.forward(&inputs)?.to_vec2::<f32>()?;
    assert_eq!(first, second, "eval forward must not update state");

    model.set_mode(Mode::Train);
    assert_eq!(model.mode(), Mode::Train);
    let train = model.forward(&inputs)?.to_vec2::<f32>()?;
    assert_ne!(first, train);
    Ok(())
}
