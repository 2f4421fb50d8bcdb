use tch::{nn::Module, Kind, Tensor};

#[derive(Debug)]
pub struct RMSNorm {
    weight: Tensor,
    eps: f64,
}

impl RMSNorm {
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }
}

impl Module for RMSNorm {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let kind = xs.kind();
        let xs = xs.to_kind(Kind::Float);
        let variance = xs.pow_tensor_scalar(2).mean_dim(-1, true, Kind::Float);
        let xs_normed = xs * (variance + self.eps).rsqrt();
        let xs_normed = xs_normed.to_kind(kind);
        &self.weight * xs_normed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn unit_weight_normalizes_rms() {
        let norm = RMSNorm::new(Tensor::ones([4], (Kind::Float, Device::Cpu)), 1e-6);
        let xs = Tensor::randn([2, 3, 4], (Kind::Float, Device::Cpu)) * 5.0;
        let out = norm.forward(&xs);
        assert_eq!(out.size(), vec![2, 3, 4]);
        let rms = out
            .pow_tensor_scalar(2)
            .mean_dim(-1, false, Kind::Float)
            .sqrt();
        let ones = Tensor::ones([2, 3], (Kind::Float, Device::Cpu));
        assert!(rms.allclose(&ones, 1e-3, 1e-3, false));
    }

    #[test]
    fn keeps_input_kind() {
        let norm = RMSNorm::new(Tensor::ones([8], (Kind::BFloat16, Device::Cpu)), 1e-5);
        let xs = Tensor::randn([1, 8], (Kind::BFloat16, Device::Cpu));
        assert_eq!(norm.forward(&xs).kind(), Kind::BFloat16);
    }
}
