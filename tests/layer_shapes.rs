//! Forward shapes of every layer variant on channels first inputs.

use candle_core::{DType, Device, Module, ModuleT, Tensor};
use candle_nn::{Activation, VarBuilder, VarMap};
use conv_variants::*;
use pretty_assertions::assert_eq;

fn random_input(dims: (usize, usize, usize, usize), dev: &Device) -> candle_core::Result<Tensor> {
    Tensor::randn(0f32, 1., dims, dev)
}

#[test]
fn aa_conv_shapes() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let xs = random_input((2, 3, 6, 9), &dev)?;

    let heads = split_heads_2d(&random_input((2, 8, 6, 9), &dev)?, 4)?;
    assert_eq!(heads.dims(), &[2, 4, 6, 9, 2]);
    assert_eq!(combine_heads_2d(&heads)?.dims(), &[2, 6, 9, 8]);

    let layer = aa_conv((3, 6, 9), AaConvConfig::new(20, 3, 8, 8, 4), vb.pp("relative"))?;
    assert_eq!(layer.self_attention_2d(&xs)?.dims(), &[2, 8, 6, 9]);
    assert_eq!(layer.forward(&xs)?.dims(), &[2, 20, 6, 9]);

    let layer = aa_conv(
        (3, 6, 9),
        AaConvConfig::new(20, (3, 5), 8, 4, 2).relative(false),
        vb.pp("absolute"),
    )?;
    assert_eq!(layer.forward(&xs)?.dims(), &[2, 20, 6, 9]);
    // absolute attention does not depend on the input size
    let larger = random_input((1, 3, 7, 4), &dev)?;
    assert_eq!(layer.forward(&larger)?.dims(), &[1, 20, 7, 4]);
    Ok(())
}

#[test]
fn mix_conv_shapes() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let xs = random_input((2, 49, 12, 18), &dev)?;
    for depthwise in [false, true] {
        let config = MixConvConfig::new(53, [(3, 3), (5, 5)])
            .depthwise(depthwise)
            .activation(Some(Activation::Relu));
        let layer = mix_conv(49, config, vb.pp(format!("depthwise_{depthwise}")))?;
        assert_eq!(layer.in_splits(), &[25, 24]);
        let ys = layer.forward(&xs)?;
        assert_eq!(ys.dims(), &[2, 53, 12, 18]);
        let min = ys.flatten_all()?.min(0)?.to_scalar::<f32>()?;
        assert!(min >= 0., "relu output has negative value {min}");
    }
    Ok(())
}

#[test]
fn gates_preserve_shape() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let xs = random_input((3, 49, 36, 54), &dev)?;

    let gate = channel_gate(49, 3, vb.pp("channel"))?;
    assert_eq!(gate.attention(&xs)?.dims(), &[3, 49, 1, 1]);
    assert_eq!(gate.forward(&xs)?.dims(), &[3, 49, 36, 54]);

    let gate = spatial_gate(7, vb.pp("spatial"))?;
    assert_eq!(gate.attention(&xs)?.dims(), &[3, 1, 36, 54]);
    assert_eq!(gate.forward(&xs)?.dims(), &[3, 49, 36, 54]);
    Ok(())
}

#[test]
fn cbam_and_eca_change_channels() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let xs = random_input((3, 49, 36, 54), &dev)?;

    let block = cbam(
        49,
        CbamConfig::new(50, 2, (3, 3)).activation(Some(Activation::Relu)),
        vb.pp("cbam"),
    )?;
    assert_eq!(block.forward(&xs)?.dims(), &[3, 50, 36, 54]);

    let layer = eca_conv(
        49,
        EcaConvConfig::new(50, (3, 3))
            .eca_k_size(3)
            .activation(Some(Activation::Relu)),
        vb.pp("eca_conv"),
    )?;
    assert_eq!(layer.forward(&xs)?.dims(), &[3, 50, 36, 54]);

    let attention = eca(49, None, vb.pp("eca"))?;
    assert_eq!(attention.kernel_size(), adaptive_kernel_size(49));
    assert_eq!(attention.forward(&xs)?.dims(), &[3, 49, 36, 54]);
    Ok(())
}

#[test]
fn drop_block_zeroes_blocks_in_training() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let xs = Tensor::ones((2, 4, 36, 36), DType::F32, &dev)?;
    let layer = DropBlock::new(0.95, 3)?;

    let ys = layer.forward_t(&xs, false)?;
    assert_eq!(ys.sum_all()?.to_scalar::<f32>()?, xs.elem_count() as f32);

    let ys = layer.forward_t(&xs, true)?;
    assert_eq!(ys.dims(), xs.dims());
    let values = ys.flatten_all()?.to_vec1::<f32>()?;
    let zeros = values.iter().filter(|v| **v == 0.).count();
    assert!(zeros > 0, "no block was dropped");
    assert!(zeros < values.len() / 2, "{zeros} of {} values dropped", values.len());
    // kept values are all scaled by the same count / kept factor
    let scale = values.iter().copied().fold(0f32, f32::max);
    assert!(scale > 1.);
    assert!(values.iter().all(|v| *v == 0. || (*v - scale).abs() < 1e-6));
    Ok(())
}

#[test]
fn group_conv_shapes() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let xs = random_input((3, 48, 12, 18), &dev)?;
    let layer = group_conv2d(
        48,
        GroupConv2dConfig::new(60, (3, 3), 6).activation(Some(Activation::Relu)),
        vb,
    )?;
    assert_eq!(layer.weight().dims(), &[60, 8, 3, 3]);
    assert_eq!(layer.forward(&xs)?.dims(), &[3, 60, 12, 18]);
    Ok(())
}
