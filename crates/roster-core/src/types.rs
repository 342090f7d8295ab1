use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Why an embedding cannot be matched or enrolled.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("expected {expected} dimensions, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("value at index {index} is not a finite number")]
    NonFinite { index: usize },
    #[error("vector has zero length")]
    ZeroNorm,
}

/// Dimensionality of every face embedding accepted by the system (ArcFace-style).
pub const EMBEDDING_DIM: usize = 512;

/// Face embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Check the vector can be compared: `dim` values, all finite, non-zero norm.
    pub fn validate(&self, dim: usize) -> Result<(), EmbeddingError> {
        if self.dim() != dim {
            return Err(EmbeddingError::Dimension {
                expected: dim,
                actual: self.dim(),
            });
        }
        if let Some(index) = self.values.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite { index });
        }
        if self.norm() == 0.0 {
            return Err(EmbeddingError::ZeroNorm);
        }
        Ok(())
    }

    /// L2 norm, accumulated in f64 so large finite values cannot overflow.
    fn norm(&self) -> f64 {
        self.values.iter().map(|&x| f64::from(x) * f64::from(x)).sum::<f64>().sqrt()
    }

    /// Return an L2-normalized copy. Zero vectors are returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        if norm > 0.0 {
            Embedding::new(self.values.iter().map(|&x| (f64::from(x) / norm) as f32).collect())
        } else {
            self.clone()
        }
    }

    /// Little-endian f32 encoding used for BLOB storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). Trailing partial values are ignored.
    pub fn from_le_bytes(bytes: &[u8]) -> Embedding {
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Embedding { values }
    }
}

/// An enrolled person. The id never changes once assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    pub name: String,
    /// Organisation-assigned identifier (employee number, badge id).
    pub external_id: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// How an attendance event was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceMethod {
    FaceBio,
}

impl AttendanceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceMethod::FaceBio => "face_bio",
        }
    }
}

/// An admitted, recorded attendance event. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: Uuid,
    pub identity_id: i64,
    pub camera_id: String,
    pub method: AttendanceMethod,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl AttendanceEvent {
    /// Calendar date (UTC) the event falls on.
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_finite_vector() {
        assert_eq!(Embedding::new(vec![0.0, 1.0, -2.5]).validate(3), Ok(()));
    }

    #[test]
    fn test_validate_rejects_wrong_dimension() {
        assert_eq!(
            Embedding::new(vec![1.0, 0.0]).validate(3),
            Err(EmbeddingError::Dimension { expected: 3, actual: 2 })
        );
    }

    #[test]
    fn test_validate_rejects_non_finite_values() {
        let inf = Embedding::new(vec![1.0, f32::INFINITY, 0.0]);
        assert_eq!(inf.validate(3), Err(EmbeddingError::NonFinite { index: 1 }));

        let nan = Embedding::new(vec![f32::NAN, 0.0, 0.0]);
        assert_eq!(nan.validate(3), Err(EmbeddingError::NonFinite { index: 0 }));

        // JSON numbers beyond f32 range deserialize to infinity.
        let parsed: Vec<f32> = serde_json::from_str("[1e39, 0.0, 0.0]").unwrap();
        assert_eq!(Embedding::new(parsed).validate(3), Err(EmbeddingError::NonFinite { index: 0 }));
    }

    #[test]
    fn test_validate_rejects_zero_vector() {
        assert_eq!(Embedding::new(vec![0.0; 3]).validate(3), Err(EmbeddingError::ZeroNorm));
    }

    #[test]
    fn test_normalized_survives_large_values() {
        let e = Embedding::new(vec![2.4e38, 3.2e38]).normalized();
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_has_unit_length() {
        let e = Embedding::new(vec![3.0, 4.0]).normalized();
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_le_bytes_preserves_values() {
        let e = Embedding::new(vec![0.25, -1.5, 3.0]);
        let bytes = e.to_le_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(Embedding::from_le_bytes(&bytes), e);
    }

    #[test]
    fn test_method_tags() {
        assert_eq!(AttendanceMethod::FaceBio.as_str(), "face_bio");
        assert_eq!(serde_json::to_string(&AttendanceMethod::FaceBio).unwrap(), "\"face_bio\"");
    }
}
