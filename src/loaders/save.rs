//! Write candle tensors to a safetensors file

use anyhow::Result;
use candle_core::{DType, Tensor};
use safetensors::{serialize_to_file, Dtype as SafeDtype, View};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

/// Host copy of a tensor in safetensors layout
pub struct TensorBytes {
    dtype: SafeDtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl TensorBytes {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let flat = tensor.flatten_all()?;
        let (dtype, data) = match tensor.dtype() {
            DType::F32 => (SafeDtype::F32, bytemuck::cast_slice::<f32, u8>(&flat.to_vec1::<f32>()?).to_vec()),
            DType::F16 => (
                SafeDtype::F16,
                bytemuck::cast_slice::<half::f16, u8>(&flat.to_vec1::<half::f16>()?).to_vec(),
            ),
            DType::BF16 => (
                SafeDtype::BF16,
                bytemuck::cast_slice::<half::bf16, u8>(&flat.to_vec1::<half::bf16>()?).to_vec(),
            ),
            DType::F64 => (SafeDtype::F64, bytemuck::cast_slice::<f64, u8>(&flat.to_vec1::<f64>()?).to_vec()),
            DType::U8 => (SafeDtype::U8, flat.to_vec1::<u8>()?),
            DType::U32 => (SafeDtype::U32, bytemuck::cast_slice::<u32, u8>(&flat.to_vec1::<u32>()?).to_vec()),
            DType::I64 => (SafeDtype::I64, bytemuck::cast_slice::<i64, u8>(&flat.to_vec1::<i64>()?).to_vec()),
            other => anyhow::bail!("Unsupported dtype for safetensors: {:?}", other),
        };
        Ok(Self {
            dtype,
            shape: tensor.dims().to_vec(),
            data,
        })
    }
}

impl View for &TensorBytes {
    fn dtype(&self) -> SafeDtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Save tensors sorted by name, with `metadata` in the file header
pub fn save_safetensors(
    tensors: &HashMap<String, Tensor>,
    metadata: HashMap<String, String>,
    output_path: &Path,
) -> Result<()> {
    let mut names: Vec<&String> = tensors.keys().collect();
    names.sort();

    let mut host = Vec::with_capacity(names.len());
    for name in names {
        host.push((name.as_str(), TensorBytes::from_tensor(&tensors[name])?));
    }

    let views: Vec<(&str, &TensorBytes)> = host.iter().map(|(name, bytes)| (*name, bytes)).collect();
    serialize_to_file(views, &Some(metadata), output_path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_save_and_reload() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.safetensors");
        let device = Device::Cpu;

        let mut tensors = HashMap::new();
        tensors.insert(
            "b.weight".to_string(),
            Tensor::arange(0f32, 6.0, &device)?.reshape((2, 3))?,
        );
        tensors.insert(
            "a.weight".to_string(),
            Tensor::ones((2, 2), DType::F16, &device)?,
        );
        save_safetensors(&tensors, HashMap::new(), &path)?;

        let loaded = candle_core::safetensors::load(&path, &device)?;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["a.weight"].dtype(), DType::F16);
        assert_eq!(
            loaded["b.weight"].to_vec2::<f32>()?,
            vec![vec![0.0, 1.0, 2.0], vec![3.0, 4.0, 5.0]]
        );

        let bytes = std::fs::read(&path)?;
        let (_, header) = safetensors::SafeTensors::read_metadata(&bytes)?;
        assert!(header.metadata().as_ref().map_or(true, |m| m.is_empty()));
        Ok(())
    }
}
