//! In-memory tensor batches exchanged across the channel.
//!
//! A [`TensorBatch`] is moved into `send` or `run_inference` and never touched
//! by the sender afterwards. Each [`Tensor`] owns its bytes.

mod data_type;

pub use data_type::DataType;

/// A single named, typed, shaped tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    pub name: Option<String>,
    pub data_type: DataType,
    pub shape: Vec<u64>,
    pub data: Vec<u8>,
}

impl Tensor {
    pub fn new(name: Option<String>, data_type: DataType, shape: Vec<u64>, data: Vec<u8>) -> Self {
        Self {
            name,
            data_type,
            shape,
            data,
        }
    }

    /// Build a float32 tensor from host values.
    pub fn from_f32(name: Option<&str>, shape: Vec<u64>, values: &[f32]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(name.map(String::from), DataType::Float32, shape, data)
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Product of the dimensions; 1 for a scalar, `None` on overflow.
    pub fn element_count(&self) -> Option<u64> {
        self.shape
            .iter()
            .try_fold(1u64, |acc, &dim| acc.checked_mul(dim))
    }

    /// Byte length implied by shape and type.
    ///
    /// `None` for unknown types or when the size does not fit in `usize`.
    pub fn expected_len(&self) -> Option<usize> {
        let width = self.data_type.width()?;
        self.byte_len(width)
    }

    /// Element count times `width`, `None` on overflow.
    pub fn byte_len(&self, width: usize) -> Option<usize> {
        usize::try_from(self.element_count()?)
            .ok()
            .and_then(|n| n.checked_mul(width))
    }

    /// Whether the buffer length matches shape times element width.
    pub fn is_consistent(&self) -> bool {
        self.expected_len() == Some(self.data.len())
    }

    /// Reinterpret the buffer as little-endian f32 values.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

/// Ordered set of tensors travelling as one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TensorBatch {
    pub tensors: Vec<Tensor>,
}

impl TensorBatch {
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }

    pub fn count(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tensor> {
        self.tensors.iter()
    }

    /// Look up a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors
            .iter()
            .find(|t| t.name.as_deref() == Some(name))
    }

    /// Total bytes of tensor data.
    pub fn data_len(&self) -> usize {
        self.tensors.iter().map(|t| t.data.len()).sum()
    }

    pub fn clear(&mut self) {
        self.tensors.clear();
    }
}

impl From<Vec<Tensor>> for TensorBatch {
    fn from(tensors: Vec<Tensor>) -> Self {
        Self::new(tensors)
    }
}

impl IntoIterator for TensorBatch {
    type Item = Tensor;
    type IntoIter = std::vec::IntoIter<Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}
