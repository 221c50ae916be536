use tch::{nn, nn::ModuleT, Tensor};

/// Two conv3x3 + batch-norm + GELU layers, optionally with a residual connection.
#[derive(Debug)]
pub struct ResidualConvBlock {
    conv1: nn::Conv2D,
    norm1: nn::BatchNorm,
    conv2: nn::Conv2D,
    norm2: nn::BatchNorm,
    same_channels: bool,
    is_res: bool,
}

impl ResidualConvBlock {
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64, is_res: bool) -> Self {
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        // Layer names follow the indices of the `nn.Sequential` used for training.
        let conv1 = nn::conv2d(&vs / "conv1" / 0, in_channels, out_channels, 3, conv_cfg);
        let norm1 = nn::batch_norm2d(&vs / "conv1" / 1, out_channels, Default::default());
        let conv2 = nn::conv2d(&vs / "conv2" / 0, out_channels, out_channels, 3, conv_cfg);
        let norm2 = nn::batch_norm2d(&vs / "conv2" / 1, out_channels, Default::default());
        Self { conv1, norm1, conv2, norm2, same_channels: in_channels == out_channels, is_res }
    }
}

impl ModuleT for ResidualConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let x1 = xs.apply(&self.conv1).apply_t(&self.norm1, train).gelu("none");
        let x2 = x1.apply(&self.conv2).apply_t(&self.norm2, train).gelu("none");
        if !self.is_res {
            return x2;
        }
        // When the channel count changes the residual comes from the first layer.
        let out = if self.same_channels { xs + x2 } else { x1 + x2 };
        out / std::f64::consts::SQRT_2
    }
}

/// Residual block followed by a 2x2 max-pooling.
#[derive(Debug)]
pub struct UnetDown {
    block: ResidualConvBlock,
}

impl UnetDown {
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64) -> Self {
        let block = ResidualConvBlock::new(&vs / "model" / 0, in_channels, out_channels, false);
        Self { block }
    }
}

impl ModuleT for UnetDown {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.block.forward_t(xs, train).max_pool2d_default(2)
    }
}

/// Concatenates the skip connection, upsamples by 2 and applies two residual blocks.
#[derive(Debug)]
pub struct UnetUp {
    upsample: nn::ConvTranspose2D,
    block1: ResidualConvBlock,
    block2: ResidualConvBlock,
}

impl UnetUp {
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64) -> Self {
        let vs = &vs / "model";
        let up_cfg = nn::ConvTransposeConfig { stride: 2, ..Default::default() };
        let upsample = nn::conv_transpose2d(&vs / 0, in_channels, out_channels, 2, up_cfg);
        let block1 = ResidualConvBlock::new(&vs / 1, out_channels, out_channels, false);
        let block2 = ResidualConvBlock::new(&vs / 2, out_channels, out_channels, false);
        Self { upsample, block1, block2 }
    }

    pub fn forward_t(&self, xs: &Tensor, skip: &Tensor, train: bool) -> Tensor {
        let xs = Tensor::cat(&[xs, skip], 1).apply(&self.upsample);
        let xs = self.block1.forward_t(&xs, train);
        self.block2.forward_t(&xs, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn block_shapes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let xs = Tensor::randn([2, 3, 8, 8], (Kind::Float, Device::Cpu));

        let res = ResidualConvBlock::new(&root / "res", 3, 16, true);
        let h = res.forward_t(&xs, false);
        assert_eq!(h.size(), vec![2, 16, 8, 8]);

        let down = UnetDown::new(&root / "down", 16, 16);
        let d = down.forward_t(&h, false);
        assert_eq!(d.size(), vec![2, 16, 4, 4]);

        let up = UnetUp::new(&root / "up", 32, 16);
        let u = up.forward_t(&d, &d, false);
        assert_eq!(u.size(), vec![2, 16, 8, 8]);
    }

    #[test]
    fn variable_names_match_checkpoint_layout() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _block = ResidualConvBlock::new(vs.root() / "init_conv", 3, 8, true);
        let variables = vs.variables();
        for name in [
            "init_conv.conv1.0.weight",
            "init_conv.conv1.0.bias",
            "init_conv.conv1.1.weight",
            "init_conv.conv1.1.running_mean",
            "init_conv.conv2.0.weight",
            "init_conv.conv2.1.running_var",
        ] {
            assert!(variables.contains_key(name), "missing {name}");
        }
    }
}
