use ndarray::ArrayViewD;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub norm: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingDecoder {
    pub dim: Option<usize>,
    pub normalize: bool,
}

impl EmbeddingDecoder {
    pub fn decode(&self, slot: ArrayViewD<f32>) -> Result<Embedding, String> {
        let vector: Vec<f32> = slot.iter().copied().collect();
        if let Some(dim) = self.dim {
            if vector.len() != dim {
                return Err(format!(
                    "embedding has {} values, expected {}",
                    vector.len(),
                    dim
                ));
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if !norm.is_finite() || norm == 0. {
            return Err(format!("embedding norm is {}", norm));
        }

        let normalized = self
            .normalize
            .then(|| vector.iter().map(|v| v / norm).collect());

        Ok(Embedding {
            vector,
            norm,
            normalized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_norm_and_normalized_vector() {
        let decoder = EmbeddingDecoder {
            dim: Some(2),
            normalize: true,
        };
        let embedding = decoder.decode(arr1(&[3., 4.]).view().into_dyn()).unwrap();

        assert_eq!(embedding.norm, 5.);
        assert_eq!(embedding.normalized, Some(vec![0.6, 0.8]));
    }

    #[test]
    fn test_multi_axis_slot_is_flattened() {
        let decoder = EmbeddingDecoder {
            dim: None,
            normalize: false,
        };
        let embedding = decoder.decode(arr2(&[[1., 2.], [2., 4.]]).view().into_dyn()).unwrap();

        assert_eq!(embedding.vector, vec![1., 2., 2., 4.]);
        assert_eq!(embedding.norm, 5.);
        assert!(embedding.normalized.is_none());
    }

    #[test]
    fn test_degenerate_embeddings_are_rejected() {
        let decoder = EmbeddingDecoder {
            dim: Some(3),
            normalize: true,
        };
        assert!(decoder.decode(arr1(&[1., 2.]).view().into_dyn()).is_err());
        assert!(decoder.decode(arr1(&[0., 0., 0.]).view().into_dyn()).is_err());
        assert!(decoder
            .decode(arr1(&[f32::NAN, 1., 0.]).view().into_dyn())
            .is_err());
    }
}
