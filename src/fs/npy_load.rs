use std::path::Path;

use crate::error::{IndexError, Result};

/// Loads a 2-d f32 `.npy` file as one vector per row.
///
/// # Errors
/// `Io` when the file cannot be read, `Format` when it is not a 2-d f32
/// array (or its payload ends early).
pub fn load_npy_vectors(path: impl AsRef<Path>) -> Result<Vec<Vec<f32>>> {
    let bytes = std::fs::read(path)?;
    let npy = npyz::NpyFile::new(&bytes[..])
        .map_err(|e| IndexError::format(format!("not a npy file: {e}")))?;

    let shape = npy.shape().to_vec();
    if shape.len() != 2 {
        return Err(IndexError::format(format!(
            "expected a 2-d array, found {} dimensions",
            shape.len()
        )));
    }
    let (count, dimension) = (shape[0] as usize, shape[1] as usize);

    let mut reader = npy
        .data::<f32>()
        .map_err(|e| IndexError::format(format!("expected f32 payload: {e}")))?;

    let mut vectors = Vec::with_capacity(count);
    for row in 0..count {
        let mut vector = Vec::with_capacity(dimension);
        for col in 0..dimension {
            let value = reader
                .next()
                .ok_or_else(|| {
                    IndexError::format(format!("payload ends at row {row}, column {col}"))
                })?
                .map_err(IndexError::Io)?;
            vector.push(value);
        }
        vectors.push(vector);
    }
    Ok(vectors)
}
