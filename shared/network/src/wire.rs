use serde::{Deserialize, Serialize};
use sluice_modeling::{BroadcastValue, CollectiveError, CollectiveOp, CollectiveResult};
use tch::{Device, Kind, TchError, Tensor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("tensors of kind {0:?} can't be sent over the wire")]
    UnsupportedKind(Kind),

    #[error("tensor payload of {found} bytes doesn't fit shape {shape:?} of {kind:?} ({expected} bytes)")]
    PayloadSize {
        kind: WireKind,
        shape: Vec<i64>,
        expected: usize,
        found: usize,
    },

    #[error("tensor shape {0:?} has a negative dimension or is too large")]
    InvalidShape(Vec<i64>),

    #[error("torch error: {0}")]
    Tch(#[from] TchError),
}

impl From<WireError> for CollectiveError {
    fn from(err: WireError) -> Self {
        CollectiveError::Tensor(err.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    Bool,
    Uint8,
    Int8,
    Int16,
    Int,
    Int64,
    Half,
    BFloat16,
    Float,
    Double,
}

impl WireKind {
    fn elt_size(self) -> usize {
        match self {
            WireKind::Bool | WireKind::Uint8 | WireKind::Int8 => 1,
            WireKind::Int16 | WireKind::Half | WireKind::BFloat16 => 2,
            WireKind::Int | WireKind::Float => 4,
            WireKind::Int64 | WireKind::Double => 8,
        }
    }
}

impl TryFrom<Kind> for WireKind {
    type Error = WireError;

    fn try_from(kind: Kind) -> Result<Self, Self::Error> {
        Ok(match kind {
            Kind::Bool => WireKind::Bool,
            Kind::Uint8 => WireKind::Uint8,
            Kind::Int8 => WireKind::Int8,
            Kind::Int16 => WireKind::Int16,
            Kind::Int => WireKind::Int,
            Kind::Int64 => WireKind::Int64,
            Kind::Half => WireKind::Half,
            Kind::BFloat16 => WireKind::BFloat16,
            Kind::Float => WireKind::Float,
            Kind::Double => WireKind::Double,
            other => return Err(WireError::UnsupportedKind(other)),
        })
    }
}

impl From<WireKind> for Kind {
    fn from(kind: WireKind) -> Self {
        match kind {
            WireKind::Bool => Kind::Bool,
            WireKind::Uint8 => Kind::Uint8,
            WireKind::Int8 => Kind::Int8,
            WireKind::Int16 => Kind::Int16,
            WireKind::Int => Kind::Int,
            WireKind::Int64 => Kind::Int64,
            WireKind::Half => Kind::Half,
            WireKind::BFloat16 => Kind::BFloat16,
            WireKind::Float => Kind::Float,
            WireKind::Double => Kind::Double,
        }
    }
}

/// A tensor's raw little-endian contents, detached from any device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireTensor {
    pub kind: WireKind,
    pub shape: Vec<i64>,
    pub bytes: Vec<u8>,
}

impl TryFrom<&Tensor> for WireTensor {
    type Error = WireError;

    fn try_from(tensor: &Tensor) -> Result<Self, Self::Error> {
        let kind = WireKind::try_from(tensor.f_kind()?)?;
        let tensor = tensor.f_to_device(Device::Cpu)?.f_contiguous()?;
        let numel = tensor.numel();
        let mut bytes = vec![0u8; numel * kind.elt_size()];
        tensor.f_copy_data_u8(&mut bytes, numel)?;
        Ok(Self {
            kind,
            shape: tensor.size(),
            bytes,
        })
    }
}

impl TryFrom<&WireTensor> for Tensor {
    type Error = WireError;

    fn try_from(wire: &WireTensor) -> Result<Self, Self::Error> {
        let expected = wire
            .shape
            .iter()
            .try_fold(wire.kind.elt_size(), |bytes, &dim| {
                usize::try_from(dim).ok().and_then(|dim| bytes.checked_mul(dim))
            })
            .ok_or_else(|| WireError::InvalidShape(wire.shape.clone()))?;
        if expected != wire.bytes.len() {
            return Err(WireError::PayloadSize {
                kind: wire.kind,
                shape: wire.shape.clone(),
                expected,
                found: wire.bytes.len(),
            });
        }
        Ok(Tensor::f_from_data_size(
            &wire.bytes,
            &wire.shape,
            wire.kind.into(),
        )?)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum WireValue {
    Tensors(Vec<(String, WireTensor)>),
    Scalar(u64),
}

impl TryFrom<&BroadcastValue> for WireValue {
    type Error = WireError;

    fn try_from(value: &BroadcastValue) -> Result<Self, Self::Error> {
        Ok(match value {
            BroadcastValue::Tensors(tensors) => WireValue::Tensors(
                tensors
                    .iter()
                    .map(|(name, tensor)| Ok((name.clone(), WireTensor::try_from(tensor)?)))
                    .collect::<Result<_, WireError>>()?,
            ),
            BroadcastValue::Scalar(value) => WireValue::Scalar(*value),
        })
    }
}

impl TryFrom<&WireValue> for BroadcastValue {
    type Error = WireError;

    fn try_from(value: &WireValue) -> Result<Self, Self::Error> {
        Ok(match value {
            WireValue::Tensors(tensors) => BroadcastValue::Tensors(
                tensors
                    .iter()
                    .map(|(name, tensor)| Ok((name.clone(), Tensor::try_from(tensor)?)))
                    .collect::<Result<_, WireError>>()?,
            ),
            WireValue::Scalar(value) => BroadcastValue::Scalar(*value),
        })
    }
}

/// A collective as a peer submits it to the coordinator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum WireOp {
    AllReduce(WireTensor),
    Broadcast {
        root: usize,
        value: Option<WireValue>,
    },
    Barrier,
}

impl TryFrom<&CollectiveOp> for WireOp {
    type Error = WireError;

    fn try_from(op: &CollectiveOp) -> Result<Self, Self::Error> {
        Ok(match op {
            CollectiveOp::AllReduce(tensor) => WireOp::AllReduce(tensor.try_into()?),
            CollectiveOp::Broadcast { root, value } => WireOp::Broadcast {
                root: *root,
                value: value.as_ref().map(WireValue::try_from).transpose()?,
            },
            CollectiveOp::Barrier => WireOp::Barrier,
        })
    }
}

impl TryFrom<&WireOp> for CollectiveOp {
    type Error = WireError;

    fn try_from(op: &WireOp) -> Result<Self, Self::Error> {
        Ok(match op {
            WireOp::AllReduce(tensor) => CollectiveOp::AllReduce(tensor.try_into()?),
            WireOp::Broadcast { root, value } => CollectiveOp::Broadcast {
                root: *root,
                value: value.as_ref().map(BroadcastValue::try_from).transpose()?,
            },
            WireOp::Barrier => CollectiveOp::Barrier,
        })
    }
}

/// The coordinator's answer to one submitted collective.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum WireResult {
    Reduced(WireTensor),
    Broadcast(WireValue),
    Barrier,
}

impl TryFrom<&CollectiveResult> for WireResult {
    type Error = WireError;

    fn try_from(result: &CollectiveResult) -> Result<Self, Self::Error> {
        Ok(match result {
            CollectiveResult::Reduced(tensor) => WireResult::Reduced(tensor.try_into()?),
            CollectiveResult::Broadcast(value) => WireResult::Broadcast(value.try_into()?),
            CollectiveResult::Barrier => WireResult::Barrier,
        })
    }
}

impl TryFrom<&WireResult> for CollectiveResult {
    type Error = WireError;

    fn try_from(result: &WireResult) -> Result<Self, Self::Error> {
        Ok(match result {
            WireResult::Reduced(tensor) => CollectiveResult::Reduced(tensor.try_into()?),
            WireResult::Broadcast(value) => CollectiveResult::Broadcast(value.try_into()?),
            WireResult::Barrier => CollectiveResult::Barrier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bfloat16_survives_postcard() {
        let tensor = Tensor::from_slice(&[1.5f32, -2.0, 0.25, 8.0])
            .view([2, 2])
            .to_kind(Kind::BFloat16);
        let wire = WireTensor::try_from(&tensor).unwrap();
        assert_eq!(wire.bytes.len(), 8);

        let bytes = postcard::to_stdvec(&wire).unwrap();
        let decoded: WireTensor = postcard::from_bytes(&bytes).unwrap();
        let back = Tensor::try_from(&decoded).unwrap();
        assert_eq!(back.kind(), Kind::BFloat16);
        assert_eq!(back.size(), vec![2, 2]);
        assert!(back.equal(&tensor));
    }

    #[test]
    fn non_contiguous_tensors_are_packed() {
        let tensor = Tensor::arange(6, (Kind::Int64, Device::Cpu))
            .view([2, 3])
            .transpose(0, 1);
        let back = Tensor::try_from(&WireTensor::try_from(&tensor).unwrap()).unwrap();
        assert!(back.equal(&tensor));
    }

    #[test]
    fn causal_masks_keep_their_kind() {
        let mask = Tensor::from_slice(&[true, false, true, true]).view([1, 1, 2, 2]);
        let op = CollectiveOp::Broadcast {
            root: 0,
            value: Some(BroadcastValue::Tensors(vec![("causal_mask".to_string(), mask)])),
        };
        let wire = WireOp::try_from(&op).unwrap();
        let CollectiveOp::Broadcast {
            root: 0,
            value: Some(BroadcastValue::Tensors(tensors)),
        } = CollectiveOp::try_from(&wire).unwrap()
        else {
            panic!("broadcast did not survive the wire");
        };
        assert_eq!(tensors[0].0, "causal_mask");
        assert_eq!(tensors[0].1.kind(), Kind::Bool);
    }

    #[test]
    fn short_payload_is_rejected() {
        let wire = WireTensor {
            kind: WireKind::Float,
            shape: vec![3],
            bytes: vec![0; 8],
        };
        assert!(matches!(
            Tensor::try_from(&wire),
            Err(WireError::PayloadSize {
                expected: 12,
                found: 8,
                ..
            })
        ));
    }

    #[test]
    fn oversized_or_negative_shapes_are_rejected() {
        for shape in [vec![i64::MAX, i64::MAX], vec![1 << 40, 1 << 40], vec![-1, 4]] {
            let wire = WireTensor {
                kind: WireKind::Double,
                shape: shape.clone(),
                bytes: vec![0; 16],
            };
            match Tensor::try_from(&wire) {
                Err(WireError::InvalidShape(found)) => assert_eq!(found, shape),
                other => panic!("expected an invalid shape for {shape:?}, got {other:?}"),
            }
        }
    }
}
