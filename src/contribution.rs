//! Per-client contributions and the layout shared by a batch.
//!
//! A [`Contribution`] is one participant's weighted update for a round. Its
//! [`Payload`] maps parameter names to tensors; every payload in a batch must
//! share the same [`PayloadLayout`].

use std::collections::BTreeMap;

use ndarray::{Array1, ArrayD, IxDyn};

use crate::error::DefenseError;

/// Named tensors of a model update, ordered by parameter name.
pub type Payload = BTreeMap<String, ArrayD<f32>>;

/// One participant's reported update for a round.
#[derive(Clone, Debug, PartialEq)]
pub struct Contribution {
    /// Non-negative weight, typically the local sample count
    pub weight: f32,
    /// Parameter name to tensor
    pub payload: Payload,
}

impl Contribution {
    /// Create a contribution from a weight and a payload.
    pub fn new(weight: f32, payload: Payload) -> Self {
        Self { weight, payload }
    }

    /// Same weight, different payload.
    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            weight: self.weight,
            payload,
        }
    }
}

/// Ordered `(name, shape)` pairs describing a payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadLayout {
    entries: Vec<(String, Vec<usize>)>,
    len: usize,
}

impl PayloadLayout {
    /// Layout of a single payload.
    pub fn of(payload: &Payload) -> Self {
        let entries: Vec<(String, Vec<usize>)> = payload
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.shape().to_vec()))
            .collect();
        let len = payload.values().map(|t| t.len()).sum();
        Self { entries, len }
    }

    /// Validate a batch and return its common layout.
    ///
    /// Fails on an empty batch, a negative or non-finite weight, any payload
    /// whose names or shapes differ from the first contribution, or a tensor
    /// holding NaN or an infinity.
    pub fn of_batch(batch: &[Contribution]) -> Result<Self, DefenseError> {
        let first = batch.first().ok_or(DefenseError::EmptyBatch)?;
        let layout = Self::of(&first.payload);
        for (index, contribution) in batch.iter().enumerate() {
            if !contribution.weight.is_finite() || contribution.weight < 0.0 {
                return Err(DefenseError::InvalidWeight {
                    index,
                    weight: contribution.weight,
                });
            }
            layout.check(&contribution.payload)?;
            if let Some((name, _)) = contribution
                .payload
                .iter()
                .find(|(_, t)| !t.iter().all(|x| x.is_finite()))
            {
                return Err(DefenseError::NonFiniteValue {
                    index,
                    name: name.clone(),
                });
            }
        }
        Ok(layout)
    }

    /// Total number of scalar coordinates.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the layout holds no coordinates.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Parameter names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Check that `payload` has exactly this layout.
    pub fn check(&self, payload: &Payload) -> Result<(), DefenseError> {
        if payload.len() != self.entries.len() {
            return Err(DefenseError::LayoutMismatch(format!(
                "expected {} tensors, got {}",
                self.entries.len(),
                payload.len()
            )));
        }
        for (name, shape) in &self.entries {
            let tensor = payload.get(name).ok_or_else(|| {
                DefenseError::LayoutMismatch(format!("missing tensor `{}`", name))
            })?;
            if tensor.shape() != shape.as_slice() {
                return Err(DefenseError::ShapeMismatch {
                    name: name.clone(),
                    expected: shape.clone(),
                    actual: tensor.shape().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Concatenate all tensors, in layout order, into one vector.
    pub fn flatten(&self, payload: &Payload) -> Result<Array1<f32>, DefenseError> {
        self.check(payload)?;
        let mut flat = Vec::with_capacity(self.len);
        for (name, _) in &self.entries {
            if let Some(tensor) = payload.get(name) {
                flat.extend(tensor.iter().copied());
            }
        }
        Ok(Array1::from(flat))
    }

    /// Split a flat vector back into named tensors.
    pub fn unflatten(&self, flat: &Array1<f32>) -> Result<Payload, DefenseError> {
        if flat.len() != self.len {
            return Err(DefenseError::Shape(format!(
                "flat vector has {} coordinates, layout needs {}",
                flat.len(),
                self.len
            )));
        }
        let mut payload = Payload::new();
        let mut offset = 0;
        for (name, shape) in &self.entries {
            let size: usize = shape.iter().product();
            let chunk = flat.slice(ndarray::s![offset..offset + size]).to_vec();
            payload.insert(name.clone(), ArrayD::from_shape_vec(IxDyn(shape), chunk)?);
            offset += size;
        }
        Ok(payload)
    }
}

/// Optional, strategy-specific context for one `defend` call.
#[derive(Clone, Copy, Debug, Default)]
pub struct AuxiliaryInfo<'a> {
    global_model: Option<&'a Payload>,
    round: Option<u64>,
}

impl<'a> AuxiliaryInfo<'a> {
    /// Empty context.
    pub fn none() -> Self {
        Self::default()
    }

    /// Attach the previous round's global model.
    pub fn with_global_model(mut self, model: &'a Payload) -> Self {
        self.global_model = Some(model);
        self
    }

    /// Attach the round index.
    pub fn with_round(mut self, round: u64) -> Self {
        self.round = Some(round);
        self
    }

    /// Previous global model, if supplied.
    pub fn global_model(&self) -> Option<&'a Payload> {
        self.global_model
    }

    /// Round index, if supplied.
    pub fn round(&self) -> Option<u64> {
        self.round
    }

    /// Previous global model, or a configuration error naming `defense`.
    pub fn require_global_model(&self, defense: &str) -> Result<&'a Payload, DefenseError> {
        self.global_model.ok_or_else(|| {
            DefenseError::config(format!(
                "`{}` requires the previous global model in the auxiliary info",
                defense
            ))
        })
    }
}
