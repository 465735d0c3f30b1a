//! Element-wise arithmetic over whole payloads.
//!
//! Callers validate layouts first; a name missing from the right-hand side
//! is reported as a layout mismatch rather than silently skipped.

use crate::contribution::Payload;
use crate::error::DefenseError;

fn zip_with(
    a: &Payload,
    b: &Payload,
    f: impl Fn(f32, f32) -> f32 + Copy,
) -> Result<Payload, DefenseError> {
    a.iter()
        .map(|(name, ta)| {
            let tb = b.get(name).ok_or_else(|| {
                DefenseError::LayoutMismatch(format!("missing tensor `{}`", name))
            })?;
            if ta.shape() != tb.shape() {
                return Err(DefenseError::ShapeMismatch {
                    name: name.clone(),
                    expected: ta.shape().to_vec(),
                    actual: tb.shape().to_vec(),
                });
            }
            let mut out = ta.clone();
            out.zip_mut_with(tb, |x, &y| *x = f(*x, y));
            Ok((name.clone(), out))
        })
        .collect()
}

/// `a - b`, tensor by tensor.
pub fn sub(a: &Payload, b: &Payload) -> Result<Payload, DefenseError> {
    zip_with(a, b, |x, y| x - y)
}

/// `a + b`, tensor by tensor.
pub fn add(a: &Payload, b: &Payload) -> Result<Payload, DefenseError> {
    zip_with(a, b, |x, y| x + y)
}

/// `a * factor`.
pub fn scale(a: &Payload, factor: f32) -> Payload {
    a.iter()
        .map(|(name, t)| (name.clone(), t.mapv(|x| x * factor)))
        .collect()
}

/// `(1 - alpha) * a + alpha * b`.
pub fn lerp(a: &Payload, b: &Payload, alpha: f32) -> Result<Payload, DefenseError> {
    zip_with(a, b, move |x, y| (1.0 - alpha) * x + alpha * y)
}
