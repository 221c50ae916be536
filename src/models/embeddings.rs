use tch::{nn, nn::Module, Tensor};

/// Two layer MLP embedding a timestep or a one-hot context into feature space.
#[derive(Debug)]
pub struct EmbedFC {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
    input_dim: i64,
}

impl EmbedFC {
    // act_fn: "gelu"
    pub fn new(vs: nn::Path, input_dim: i64, emb_dim: i64) -> Self {
        let vs = &vs / "model";
        let linear_cfg = Default::default();
        let linear_1 = nn::linear(&vs / 0, input_dim, emb_dim, linear_cfg);
        let linear_2 = nn::linear(&vs / 2, emb_dim, emb_dim, linear_cfg);
        Self { linear_1, linear_2, input_dim }
    }
}

impl Module for EmbedFC {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.view([-1, self.input_dim]).apply(&self.linear_1).gelu("none").apply(&self.linear_2)
    }
}
